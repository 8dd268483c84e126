//! Error taxonomy for the routing fabric.
//!
//! A flat enum, one variant per failure mode, with `From` impls for the
//! external collaborators' error types. No nested error trees.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => Error::NotFound(status.message().to_string()),
            tonic::Code::AlreadyExists => Error::AlreadyExists(status.message().to_string()),
            tonic::Code::Unavailable | tonic::Code::ResourceExhausted => {
                Error::Unavailable(status.message().to_string())
            }
            tonic::Code::InvalidArgument | tonic::Code::FailedPrecondition => {
                Error::Protocol(status.message().to_string())
            }
            _ => Error::Transport(status.message().to_string()),
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(msg) => tonic::Status::not_found(msg),
            Error::AlreadyExists(msg) => tonic::Status::already_exists(msg),
            Error::Unavailable(msg) => tonic::Status::unavailable(msg),
            Error::Transport(msg) => tonic::Status::unavailable(msg),
            Error::Protocol(msg) => tonic::Status::invalid_argument(msg),
            Error::Fatal(msg) => tonic::Status::internal(msg),
        }
    }
}
