pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_DEFINITION: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds a logger from a TOML logger definition.
pub fn from_toml(definition: &str) -> Result<Logger, String> {
    let config: LoggerConfig =
        serdeconv::from_toml_str(definition).map_err(|err| err.to_string())?;

    config.build_logger().map_err(|err| err.to_string())
}

/// Builds the default terminal logger writing to stderr.
pub fn root() -> Logger {
    from_toml(DEFAULT_DEFINITION).expect("Default logging definition must be valid")
}

/// Builds a logger that discards all records.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
