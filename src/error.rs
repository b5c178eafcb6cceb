use std::{result, time::Duration};

use tonic::{Code, Status};

pub type Result<T, E = Error> = result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection configuration is ambiguous or invalid
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// Serial parameters cannot be represented by the port driver
    #[error("Unsupported serial configuration: {0}")]
    UnsupportedSerialConfig(String),
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Timed out connecting to {target} after {} ms", .timeout.as_millis())]
    ConnectTimeout { target: String, timeout: Duration },
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    /// VXI-11 `create_link` was rejected
    #[error("Failed to create device link: {0}")]
    LinkCreateFailed(String),
    #[error("Write failed: {0}")]
    Write(String),
    #[error("Timed out writing after {} ms", .0.as_millis())]
    WriteTimeout(Duration),
    #[error("Read failed: {0}")]
    Read(String),
    /// No complete message arrived before the deadline. `partial` holds
    /// whatever was buffered, for diagnostics only.
    #[error(
        "Timed out receiving after {} ms ({} bytes buffered)",
        .timeout.as_millis(),
        .partial.len()
    )]
    ReceiveTimeout { timeout: Duration, partial: Vec<u8> },
    #[error("Connection is not open")]
    NotOpen,
    #[error("Connection is already open")]
    AlreadyOpen,
    #[error("Unknown session: {0}")]
    UnknownName(String),
    #[error("Session already exists: {0}")]
    DuplicateName(String),
    #[error("Session is busy: {0}")]
    SessionBusy(String),
    #[error("Init steps requested for non-SCPI device {0}")]
    InvalidInitForNonScpiDevice(String),
    /// Device returned a response that we could not properly handle
    #[error("Bad response: {0}")]
    BadResponse(String),
    /// Non-OK status reported by a remote relay
    #[error("Relay error ({code:?}): {message}")]
    Relay { code: Code, message: String },
    /// The relay's gRPC channel or server failed
    #[error("Relay transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
impl Error {
    /// gRPC status code reported by the relay for this error
    pub fn code(&self) -> Code {
        match self {
            Self::Config(_) | Self::UnsupportedSerialConfig(_) => Code::InvalidArgument,
            Self::Connect(_) | Self::DeviceNotFound(_) | Self::LinkCreateFailed(_) => {
                Code::Unavailable
            }
            Self::Transport(_) => Code::Unavailable,
            Self::ConnectTimeout { .. } | Self::WriteTimeout(_) | Self::ReceiveTimeout { .. } => {
                Code::DeadlineExceeded
            }
            Self::NotOpen | Self::AlreadyOpen | Self::InvalidInitForNonScpiDevice(_) => {
                Code::FailedPrecondition
            }
            Self::UnknownName(_) => Code::NotFound,
            Self::DuplicateName(_) => Code::AlreadyExists,
            Self::SessionBusy(_) => Code::ResourceExhausted,
            Self::Relay { code, .. } => *code,
            Self::Write(_) | Self::Read(_) | Self::BadResponse(_) | Self::Io(_) => Code::Internal,
        }
    }

    /// Rebuild an error from a relay status for a request on session `name`.
    /// Registry errors come back as their own variants, everything else is
    /// kept as [`Error::Relay`].
    pub fn from_status(status: &Status, name: &str) -> Self {
        match status.code() {
            Code::NotFound => Self::UnknownName(name.to_string()),
            Code::AlreadyExists => Self::DuplicateName(name.to_string()),
            Code::ResourceExhausted => Self::SessionBusy(name.to_string()),
            code => Self::Relay {
                code,
                message: status.message().to_string(),
            },
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip_keeps_registry_errors() {
        let status = Status::from(Error::UnknownName("ghost".into()));
        assert_eq!(status.code(), Code::NotFound);
        assert!(matches!(
            Error::from_status(&status, "ghost"),
            Error::UnknownName(name) if name == "ghost"
        ));

        let status = Status::from(Error::ReceiveTimeout {
            timeout: Duration::from_millis(200),
            partial: b"1.2".to_vec(),
        });
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert!(matches!(
            Error::from_status(&status, "dc1"),
            Error::Relay { code: Code::DeadlineExceeded, .. }
        ));
    }
}
