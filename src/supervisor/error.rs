use std::fmt::Debug;
use thiserror::Error;

/// Supervisor failures are cloneable so a burst of coalesced callers can
/// all observe the leader's outcome.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SupervisorError {
    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("fail to run app: {0}")]
    RunFailed(String),

    #[error("binary artifact `{0}` missing")]
    MissingArtifact(String),

    #[error("timed out dialing 127.0.0.1:{0}")]
    DialTimeout(String),

    #[error("app exited during startup ({0})")]
    EarlyExit(String),

    #[error("automatic restart attempts exhausted")]
    RestartExhausted,

    #[error("supervisor is shutting down")]
    ShuttingDown,
}
