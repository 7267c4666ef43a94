use std::io;

use thiserror::Error;

use crate::session::{SessionId, SessionState};
use crate::transport::message::MessageError;

/// Rejected tunnel configuration. Raised before any socket is opened.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {field} '{value}': must be a number between 1 and 65535")]
    InvalidPort { field: &'static str, value: String },

    #[error("Invalid subdomain '{0}': only lowercase letters, numbers, and hyphens are allowed")]
    InvalidSubdomain(String),

    #[error("Relay host is required")]
    MissingRelayHost,

    #[error("Invalid relay address '{0}'")]
    InvalidRelayHost(String),
}

/// Failure to obtain a response from the local target.
///
/// `code` uses errno-style names (`ECONNREFUSED`, `ECONNRESET`, ...) so the
/// relay sees the same vocabulary regardless of platform.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ForwardError {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Failed to connect to relay at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("Control channel is closed")]
    Closed,

    #[error("Control channel terminated: {0}")]
    Terminal(String),

    #[error("Failed to encode envelope")]
    Encode(#[from] MessageError),
}

impl ChannelError {
    /// The OS-level cause of a failed connect, if there was one. TLS
    /// handshake failures carry theirs further down the source chain.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            ChannelError::Connect { source, .. } => io_kind_in(source),
            _ => None,
        }
    }
}

/// First `io::Error` in `err`'s source chain, starting with `err` itself.
fn io_kind_in(err: &(dyn std::error::Error + 'static)) -> Option<io::ErrorKind> {
    let mut cause = Some(err);
    while let Some(err) = cause {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        cause = err.source();
    }
    None
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session id {0} is already registered")]
    DuplicateId(SessionId),
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Failed to build HTTP client for the local target")]
    Client(#[from] reqwest::Error),

    #[error("Failed to start local ingress server")]
    Ingress(#[source] io::Error),

    #[error("Session {id} cannot start from state {state:?}")]
    InvalidState { id: SessionId, state: SessionState },

    #[error("Background task failed")]
    Join(#[from] tokio::task::JoinError),
}

impl TunnelError {
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TunnelError::Channel(e) => e.io_kind(),
            TunnelError::Ingress(e) => Some(e.kind()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_tungstenite::tungstenite::Error as WsError;

    use super::*;

    #[derive(Debug, Error)]
    #[error("handshake failed")]
    struct Handshake(#[source] io::Error);

    #[test]
    fn test_io_kind_of_plain_io_connect_error() {
        let err = ChannelError::Connect {
            url: "ws://127.0.0.1:9".into(),
            source: WsError::Io(io::ErrorKind::ConnectionRefused.into()),
        };
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionRefused));
        assert_eq!(
            TunnelError::from(err).io_kind(),
            Some(io::ErrorKind::ConnectionRefused)
        );
    }

    #[test]
    fn test_io_kind_found_below_wrapping_errors() {
        let wrapped = Handshake(io::ErrorKind::ConnectionReset.into());
        assert_eq!(io_kind_in(&wrapped), Some(io::ErrorKind::ConnectionReset));
        assert_eq!(io_kind_in(&ChannelError::Closed), None);
    }

    #[test]
    fn test_io_kind_absent_for_protocol_errors() {
        let err = ChannelError::Connect {
            url: "ws://127.0.0.1:9".into(),
            source: WsError::ConnectionClosed,
        };
        assert_eq!(err.io_kind(), None);
    }
}
