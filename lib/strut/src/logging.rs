pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

/// Builds the default terminal logger. Components receive a child of this
/// (or no logger at all) and must keep working either way.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .unwrap();

    config.build_logger().unwrap()
}

/// A logger that discards everything.
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}
