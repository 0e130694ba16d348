use clap::{App, Arg};
use flux::logging;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tachyon::prelude::*;
use util::{exit_with, Echo, Sum, Total, Transport};

fn main() {
    let matches = App::new("Echo Server")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Echoes messages back to their sender and answers sums.")
        .arg(Arg::with_name("CONFIG_FILE").help("Path to the config file"))
        .arg(
            Arg::with_name("transport")
                .short("t")
                .long("transport")
                .takes_value(true)
                .possible_values(Transport::NAMES)
                .default_value("udp"),
        )
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .takes_value(true)
                .help("Overrides the configured listen address"),
        )
        .get_matches();

    let config = util::load_config(matches.value_of("CONFIG_FILE"));
    let log = util::logger(&config);
    let address = util::address(matches.value_of("address"), &config.server.address);
    let tick = Duration::from_millis(config.server.tick_interval_ms.max(1));

    match Transport::from_name(matches.value_of("transport")) {
        Transport::Udp => serve(
            Server::new(UdpServerPeer::new(config.server.clone(), &log), &log),
            address,
            tick,
            &log,
        ),
        Transport::Ws => serve(
            Server::new(WsServerPeer::new(config.server.clone(), &log), &log),
            address,
            tick,
            &log,
        ),
    }
}

fn serve<T: ServerTransport>(mut server: Server<T>, address: SocketAddr, tick: Duration, log: &logging::Logger) -> ! {
    let outbox = server.outbox();
    let echo_log = log.clone();

    let registered = server
        .register(move |peer, echo: Echo| {
            if let Err(err) = outbox.send_message(peer, &echo) {
                logging::warn!(echo_log, "Echo failed"; "peer" => peer, "error" => %err);
            }
        })
        .and_then(|()| server.register_request::<Sum, Total, _>(|_, Sum(a, b)| Total(u64::from(a) + u64::from(b))));

    if let Err(err) = registered {
        exit_with(&format!("Handler registration failed: {}", err));
    }

    let connected_log = log.clone();
    server.on_connected(move |peer, address| {
        logging::info!(connected_log, "Client connected"; "peer" => peer, "address" => %address);
    });

    let disconnected_log = log.clone();
    server.on_disconnected(move |peer| {
        logging::info!(disconnected_log, "Client disconnected"; "peer" => peer);
    });

    if !server.start(address) {
        exit_with(&format!("Failed to listen on {}", address));
    }

    logging::info!(log, "Echo server running"; "address" => ?server.local_addr());

    loop {
        server.poll();
        thread::sleep(tick);
    }
}
