use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("controller unreachable: {0}")]
    Connection(String),
    #[error("controller rejected credential: {0}")]
    Auth(String),
    #[error("{operation} exceeded deadline of {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("invalid robot configuration: {0}")]
    Configuration(String),
    #[error("malformed controller message: {0}")]
    Protocol(String),
}

impl Error {
    pub(crate) fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Error::Timeout { operation, timeout }
    }

    /// Transient errors are worth retrying, everything else propagates as is.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Connection(error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Protocol(error.to_string())
    }
}
