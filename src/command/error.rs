use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("process not started")]
    ProcessNotStarted,

    #[error("command not found")]
    CommandNotFound,

    #[error("io error")]
    IOError(#[from] std::io::Error),

    #[error("stream pipe `{0}` not available")]
    StreamPipeError(String),

    #[error("signal error: {0}")]
    SignalError(String),
}
