use clap::{App, Arg};
use std::fs;
use tachyon::config::NetConfig;
use util::exit_with;

fn main() {
    let matches = App::new("Config Generator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Writes the default network config as TOML.")
        .arg(
            Arg::with_name("OUTPUT_FILE")
                .help("Path to write to, stdout when omitted"),
        )
        .get_matches();

    let text = match NetConfig::default().to_toml() {
        Ok(text) => text,
        Err(err) => exit_with(&format!("Config serialization failed: {}", err)),
    };

    match matches.value_of("OUTPUT_FILE") {
        Some(path) => {
            if let Err(err) = fs::write(path, text) {
                exit_with(&format!("Failed to write {}: {}", path, err));
            }
        }
        None => print!("{}", text),
    }
}
