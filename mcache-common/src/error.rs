//! # Error Model
//!
//! Purpose: Give every failure a kind and a human-readable description so
//! that callers receive errors through the same channel as successful replies.
//!
//! ## Design Principles
//! 1. **Typed Kinds**: Protocol rejections, local validation failures and
//!    transport loss are distinct variants, never stringly-typed flags.
//! 2. **Wire Fidelity**: `Display` for a kind prints the token the server
//!    would have sent (`NOT_FOUND`, `EXISTS`, ...), or the literal error line.
//! 3. **Cheap Clones**: Errors are cloned when one loss fans out to many
//!    pending requests.

use std::fmt;

use thiserror::Error;

/// Result type shared by the codec and the client.
pub type McResult<T> = Result<T, McError>;

/// Category of a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No connection, or the connection was lost while the request was pending.
    Connection,
    /// Generic `ERROR` line from the server; carries the literal line.
    Server(String),
    /// `NOT_FOUND` reply, or a fetch that matched no keys.
    NotFound,
    /// `EXISTS` reply (cas token mismatch).
    Exists,
    /// `NOT_STORED` reply (add/replace/append/prepend precondition failed).
    NotStored,
    /// `CLIENT_ERROR` from the server, or a key rejected before sending.
    Client,
    /// `SERVER_ERROR` reply to a store command.
    ServerError,
    /// Expiration above the protocol maximum.
    InvalidExpiration,
    /// Reply that does not fit the command that was sent.
    Protocol,
    /// Invalid client configuration.
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Connection => f.write_str("CONNECTION_ERROR"),
            ErrorKind::Server(line) => f.write_str(line),
            ErrorKind::NotFound => f.write_str("NOT_FOUND"),
            ErrorKind::Exists => f.write_str("EXISTS"),
            ErrorKind::NotStored => f.write_str("NOT_STORED"),
            ErrorKind::Client => f.write_str("CLIENT_ERROR"),
            ErrorKind::ServerError => f.write_str("SERVER_ERROR"),
            ErrorKind::InvalidExpiration => f.write_str("INVALID_EXPIRATION_TIME"),
            ErrorKind::Protocol => f.write_str("PROTOCOL_ERROR"),
            ErrorKind::Config => f.write_str("CONFIG_ERROR"),
        }
    }
}

/// Error delivered to a request's caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {description}")]
pub struct McError {
    pub kind: ErrorKind,
    pub description: String,
}

impl McError {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        McError {
            kind,
            description: description.into(),
        }
    }

    /// Connection is not ready; nothing was written.
    pub fn no_connection() -> Self {
        McError::new(ErrorKind::Connection, "No Connection Available.")
    }

    /// Connection went away while the request was outstanding.
    pub fn lost_connection() -> Self {
        McError::new(ErrorKind::Connection, "Lost Connection to Server")
    }

    pub fn protocol(description: impl Into<String>) -> Self {
        McError::new(ErrorKind::Protocol, description)
    }

    pub fn config(description: impl Into<String>) -> Self {
        McError::new(ErrorKind::Config, description)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_connection(&self) -> bool {
        self.kind == ErrorKind::Connection
    }
}
