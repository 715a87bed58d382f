//! Error types for the rustyperiph library
//!
//! This module defines the error types used throughout the library.

use thiserror::Error;

/// Errors raised while establishing or using a bus connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Bus I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported bus address: {0}")]
    Address(String),

    #[error("Bus authentication failed: {0}")]
    Auth(String),

    #[error("Bus connection closed")]
    Closed,
}

/// Malformed data on the wire
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unexpected end of message")]
    Truncated,

    #[error("Unsupported byte order marker: {0:#04x}")]
    ByteOrder(u8),

    #[error("Unsupported protocol version: {0}")]
    Version(u8),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid object path: {0}")]
    InvalidObjectPath(String),

    #[error("Invalid UTF-8 in string")]
    InvalidString,

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Missing required header field: {0}")]
    MissingHeaderField(&'static str),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unexpected reply signature: expected {expected}, got {actual}")]
    UnexpectedSignature { expected: String, actual: String },
}

/// An error reply sent to, or received from, a bus peer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{name}: {message}")]
pub struct MethodError {
    /// Error name, e.g. `org.bluez.Error.Failed`
    pub name: String,
    /// Free-text message
    pub message: String,
}

impl MethodError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// A characteristic write rejected by application logic
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("Application not ready")]
    NotReady,

    #[error("Write not permitted")]
    NotPermitted,

    #[error("Invalid offset: {0}")]
    InvalidOffset(usize),

    #[error("Invalid value length: {0}")]
    InvalidValueLength(usize),

    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// Top-level error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Registration failed: {name}: {message}")]
    Registration { name: String, message: String },

    #[error("Advertising capacity reached: {active} of {supported} instances in use")]
    Capacity { active: u8, supported: u8 },

    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("Remote error: {0}")]
    Method(MethodError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state for operation: {0}")]
    InvalidState(String),
}

impl Error {
    /// Name of the remote error, if this error came from a bus peer
    pub fn remote_name(&self) -> Option<&str> {
        match self {
            Error::Registration { name, .. } => Some(name),
            Error::Method(err) => Some(&err.name),
            _ => None,
        }
    }

    /// Converts a remote error reply into a registration failure
    pub fn into_registration(self) -> Self {
        match self {
            Error::Method(MethodError { name, message }) => Error::Registration { name, message },
            other => other,
        }
    }
}

impl From<MethodError> for Error {
    fn from(err: MethodError) -> Self {
        Error::Method(err)
    }
}

impl From<ProtocolError> for MethodError {
    fn from(err: ProtocolError) -> Self {
        MethodError::new(crate::bus::constants::DBUS_ERROR_INVALID_ARGS, err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Connection(ConnectionError::Io(err))
    }
}

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;
