use clap::{App, Arg};
use flux::logging;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tachyon::prelude::*;
use util::{exit_with, Echo, Sum, Total, Transport};

struct Plan {
    count: u32,
    interval: Duration,
    tick: Duration,
    rpc_timeout: Duration,
}

fn main() {
    let matches = App::new("Echo Client")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Sends numbered messages to an echo server and times a sum request for each.")
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
                .help("Overrides the configured server address"),
        )
        .arg(
            Arg::with_name("count")
                .short("n")
                .long("count")
                .takes_value(true)
                .default_value("10"),
        )
        .arg(
            Arg::with_name("interval")
                .short("i")
                .long("interval")
                .takes_value(true)
                .help("Milliseconds between messages")
                .default_value("1000"),
        )
        .get_matches();

    let config = util::load_config(matches.value_of("CONFIG_FILE"));
    let log = util::logger(&config);
    let address = util::address(matches.value_of("address"), &config.client.address);

    let plan = Plan {
        count: number(matches.value_of("count")),
        interval: Duration::from_millis(u64::from(number(matches.value_of("interval")))),
        tick: Duration::from_millis(config.client.tick_interval_ms.max(1)),
        rpc_timeout: config.rpc.default_timeout(),
    };

    match Transport::from_name(matches.value_of("transport")) {
        Transport::Udp => run(
            Client::new(UdpClientPeer::new(config.client.clone(), &log), &log),
            address,
            &plan,
            &log,
        ),
        Transport::Ws => run(
            Client::new(WsClientPeer::new(config.client.clone(), &log), &log),
            address,
            &plan,
            &log,
        ),
    }
}

fn number(text: Option<&str>) -> u32 {
    match text.map(str::parse) {
        Some(Ok(value)) => value,
        _ => exit_with("Expected a number"),
    }
}

fn run<T: ClientTransport>(mut client: Client<T>, address: SocketAddr, plan: &Plan, log: &logging::Logger) {
    let echoes = Arc::new(AtomicU32::new(0));
    let received = echoes.clone();
    let echo_log = log.clone();

    let registered = client.register(move |echo: Echo| {
        received.fetch_add(1, Ordering::Relaxed);
        logging::debug!(echo_log, "Echo"; "sequence" => echo.sequence, "text" => echo.text);
    });

    if let Err(err) = registered {
        exit_with(&format!("Handler registration failed: {}", err));
    }

    if !client.start(address) {
        exit_with(&format!("Failed to connect to {}", address));
    }

    while !client.is_connected() {
        if client.state() == PeerState::Stopped {
            exit_with(&format!("Could not reach {}", address));
        }

        client.poll();
        thread::sleep(plan.tick);
    }

    logging::info!(log, "Connected"; "address" => %address);

    for sequence in 0..plan.count {
        let echo = Echo {
            sequence,
            text: format!("echo #{}", sequence),
        };

        if let Err(err) = client.send(&echo) {
            logging::warn!(log, "Send failed"; "error" => %err);
        }

        let started = Instant::now();
        let mut call = client.send_async::<Sum, Total>(&Sum(sequence, sequence), plan.rpc_timeout);
        let mut reply = None;

        while started.elapsed() < plan.interval {
            client.poll();

            if reply.is_none() {
                reply = call.try_reply().map(|reply| (reply, started.elapsed()));
            }

            thread::sleep(plan.tick);
        }

        match reply {
            Some((Reply::Value(Total(total)), elapsed)) => {
                logging::info!(log, "Sum answered"; "sequence" => sequence, "total" => total,
                               "elapsed_ms" => elapsed.as_millis() as u64, "rtt_ms" => client.round_trip_time())
            }
            Some((outcome, _)) => logging::warn!(log, "Sum failed"; "sequence" => sequence, "outcome" => ?outcome),
            None => logging::warn!(log, "Sum still pending"; "sequence" => sequence),
        }

        if !client.is_connected() {
            logging::warn!(log, "Connection lost");
            break;
        }
    }

    logging::info!(log, "Done"; "sent" => plan.count, "echoed" => echoes.load(Ordering::Relaxed));

    drop(client.disconnect());
    for _ in 0..10 {
        client.poll();
        thread::sleep(plan.tick);
    }

    client.shutdown();
}
