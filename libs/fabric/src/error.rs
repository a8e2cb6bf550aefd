use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] sonar_core::Error),

    #[error("Could not open raw ICMP socket: {0}")]
    Startup(std::io::Error),

    #[error("Could not resolve host: {0}")]
    Resolve(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("No free sequence number")]
    SequenceExhausted,

    #[error("Transport closed")]
    TransportClosed,

    #[error("{0}")]
    Custom(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a single attempt that did not end in an echo reply
///
/// Carried by value in every [`crate::Response`], so callers never have to
/// catch anything to observe a failed attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProbeError {
    #[error("Send failure: {0}")]
    SendFailure(String),

    #[error("Timeout")]
    Timeout,

    #[error("Destination Unreachable")]
    DestinationUnreachable,

    #[error("Time Exceeded")]
    TimeExceeded,

    #[error("Parameter Problem")]
    ParameterProblem,

    #[error("Redirect")]
    Redirect,

    #[error("Unrecognized ICMP type {0}")]
    UnrecognizedType(u8),

    #[error("Transport closed")]
    TransportClosed,
}

impl From<Error> for ProbeError {
    fn from(err: Error) -> Self {
        match err {
            Error::TransportClosed => Self::TransportClosed,
            other => Self::SendFailure(other.to_string()),
        }
    }
}
