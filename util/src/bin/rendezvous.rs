use clap::{App, Arg};
use flux::logging;
use std::thread;
use std::time::Duration;
use tachyon::prelude::*;
use util::exit_with;

fn main() {
    let matches = App::new("Rendezvous Host")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Introduces punch peers registering the same session.")
        .arg(Arg::with_name("CONFIG_FILE").help("Path to the config file"))
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .takes_value(true)
                .help("Overrides the configured rendezvous address"),
        )
        .get_matches();

    let config = util::load_config(matches.value_of("CONFIG_FILE"));
    let log = util::logger(&config);
    let address = util::address(matches.value_of("address"), &config.punch.rendezvous);
    let tick = Duration::from_millis(config.server.tick_interval_ms.max(1));

    let mut host = match RendezvousServer::new(config.server.clone(), &log) {
        Ok(host) => host,
        Err(err) => exit_with(&format!("Rendezvous setup failed: {}", err)),
    };

    if !host.start(address) {
        exit_with(&format!("Failed to listen on {}", address));
    }

    logging::info!(log, "Rendezvous host running"; "address" => ?host.local_addr());

    loop {
        host.poll();
        thread::sleep(tick);
    }
}
