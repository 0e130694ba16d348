//! Logging facade shared by the workspace.
//!
//! Everything logs through `slog`. Loggers are assembled by `sloggers`, either from a TOML logger
//! section or from one of the canned constructors below. Components take a parent `Logger` and
//! derive a child with their own key-value context.
pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};
pub use sloggers::types::Severity;
pub use sloggers::LoggerConfig;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::{Build, Config};

/// Builds a logger from a deserialized `sloggers` configuration.
pub fn build(config: &LoggerConfig) -> sloggers::Result<Logger> {
    config.build_logger()
}

/// Parses a `sloggers` logger section from TOML and builds it.
pub fn from_toml(text: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(text).map_err(|err| err.to_string())?;
    build(&config).map_err(|err| err.to_string())
}

/// Terminal logger writing to stderr. Falls back to a discarding logger if the terminal cannot
/// be set up.
pub fn terminal(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);

    match builder.build() {
        Ok(logger) => logger,
        Err(_) => discard(),
    }
}

/// Logger that drops every record.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml_terminal() {
        let log = from_toml(
            r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
        );

        assert!(log.is_ok());
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(from_toml("type = \"nonsense\"").is_err());
    }

    #[test]
    fn test_discard_accepts_records() {
        let log = discard().new(o!("component" => "test"));
        info!(log, "Dropped on the floor"; "value" => 42);
        trace!(log, "Also dropped");
    }
}
