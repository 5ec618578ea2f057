use chrono::Local;
use log::LevelFilter;
use serde_json::json;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::sync::mpsc;

use crate::config::LoggingConfig;

/// Logging setup errors
#[derive(Debug)]
pub enum LoggingError {
    Io(std::io::Error),
    InvalidLevel(String),
    /// A global logger was installed before
    AlreadyInitialized,
}

impl fmt::Display for LoggingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggingError::Io(e) => write!(f, "Log file error: {}", e),
            LoggingError::InvalidLevel(level) => write!(f, "Unknown log level: {}", level),
            LoggingError::AlreadyInitialized => write!(f, "Logger already initialized"),
        }
    }
}

impl std::error::Error for LoggingError {}

impl From<std::io::Error> for LoggingError {
    fn from(e: std::io::Error) -> Self {
        LoggingError::Io(e)
    }
}

impl From<log::SetLoggerError> for LoggingError {
    fn from(_: log::SetLoggerError) -> Self {
        LoggingError::AlreadyInitialized
    }
}

pub fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    LevelFilter::from_str(level).map_err(|_| LoggingError::InvalidLevel(level.to_string()))
}

/// Log records delivered as JSON values
#[derive(Debug)]
pub struct LogStream {
    records: mpsc::UnboundedReceiver<serde_json::Value>,
}

impl LogStream {
    pub async fn next(&mut self) -> Option<serde_json::Value> {
        self.records.recv().await
    }

    pub fn try_next(&mut self) -> Option<serde_json::Value> {
        self.records.try_recv().ok()
    }
}

enum Output {
    Terminal(LevelFilter),
    File(PathBuf, LevelFilter),
    Stream(LevelFilter, mpsc::UnboundedSender<serde_json::Value>),
}

/// Builder for the process logger
///
/// Every output carries its own minimum level. Nothing is installed until
/// `build` is called.
#[derive(Default)]
pub struct LogBuilder {
    outputs: Vec<Output>,
}

impl LogBuilder {
    /// Create a new builder with no outputs
    pub fn new() -> Self {
        Self::default()
    }

    /// Log to stdout
    pub fn terminal(mut self, level: LevelFilter) -> Self {
        self.outputs.push(Output::Terminal(level));
        self
    }

    /// Append to a file, created if missing
    pub fn log_file(mut self, path: impl Into<PathBuf>, level: LevelFilter) -> Self {
        self.outputs.push(Output::File(path.into(), level));
        self
    }

    /// Deliver records to a `LogStream`
    pub fn stream(&mut self, level: LevelFilter) -> LogStream {
        let (tx, records) = mpsc::unbounded_channel();
        self.outputs.push(Output::Stream(level, tx));
        LogStream { records }
    }

    fn dispatch(self) -> Result<fern::Dispatch, LoggingError> {
        let mut root = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} [{}] {}: {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(LevelFilter::Trace);

        for output in self.outputs {
            root = match output {
                Output::Terminal(level) => {
                    root.chain(fern::Dispatch::new().level(level).chain(std::io::stdout()))
                }
                Output::File(path, level) => root.chain(
                    fern::Dispatch::new()
                        .level(level)
                        .chain(fern::log_file(path)?),
                ),
                Output::Stream(level, tx) => root.chain(
                    fern::Dispatch::new()
                        .level(level)
                        .chain(fern::Output::call(move |record| {
                            let _ = tx.send(json!({
                                "level": record.level().to_string(),
                                "target": record.target(),
                                "message": record.args().to_string(),
                            }));
                        })),
                ),
            };
        }
        Ok(root)
    }

    /// Install as the global logger
    pub fn build(self) -> Result<(), LoggingError> {
        self.dispatch()?.apply()?;
        Ok(())
    }
}

/// Install the logger described by `config`
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let level = parse_level(&config.level)?;
    let mut builder = LogBuilder::new();
    if config.terminal {
        builder = builder.terminal(level);
    }
    if let Some(path) = &config.file {
        builder = builder.log_file(path, level);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, Log, Record};

    fn emit(logger: &dyn Log, level: Level, message: &str) {
        logger.log(
            &Record::builder()
                .level(level)
                .target("engine")
                .args(format_args!("{}", message))
                .build(),
        );
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug").unwrap(), LevelFilter::Debug);
        assert_eq!(parse_level("WARN").unwrap(), LevelFilter::Warn);
        assert!(matches!(
            parse_level("loud"),
            Err(LoggingError::InvalidLevel(_))
        ));
    }

    #[test]
    fn test_stream_respects_its_level() {
        let mut builder = LogBuilder::new();
        let mut stream = builder.stream(LevelFilter::Info);
        let (_, logger) = builder.dispatch().unwrap().into_log();

        emit(logger.as_ref(), Level::Debug, "hidden");
        emit(logger.as_ref(), Level::Warn, "order k1 expired");

        let record = stream.try_next().unwrap();
        assert_eq!(record["level"], "WARN");
        assert_eq!(record["target"], "engine");
        assert!(record["message"].as_str().unwrap().ends_with("order k1 expired"));
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn test_file_output() {
        let path = std::env::temp_dir().join(format!("engine-log-{}.log", uuid::Uuid::new_v4()));
        let (_, logger) = LogBuilder::new()
            .log_file(&path, LevelFilter::Debug)
            .dispatch()
            .unwrap()
            .into_log();

        emit(logger.as_ref(), Level::Info, "session live");
        logger.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[INFO] engine: session live"));
        let _ = std::fs::remove_file(path);
    }
}
