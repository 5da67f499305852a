use std::fmt::Debug;
use thiserror::Error;
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("init logging error: `{0}`")]
    TryInitError(String),
}

pub struct Logging;

impl Logging {
    /// Installs the global tracing subscriber. `level` comes from the
    /// configuration (`logLevel`, forced to debug by `verbose`); RUST_LOG
    /// still wins when set in the environment.
    pub fn try_init(level: &str) -> Result<(), LoggingError> {
        let default = level
            .parse::<LevelFilter>()
            .unwrap_or(LevelFilter::INFO);

        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(default.into())
                    .from_env_lossy(),
            )
            .with_target(false)
            .try_init()
            .map_err(|_| {
                LoggingError::TryInitError(
                    "unable to set global logging subscriber".to_string(),
                )
            })
    }
}
