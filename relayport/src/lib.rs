//! Expose a local HTTP server through a WebSocket relay.
//!
//! A [`TunnelSession`] binds a local ingress port, registers a subdomain
//! with the relay over one control connection, and answers every relayed
//! request by forwarding it to `localhost:<target_port>`.

pub mod channel;
pub mod config;
pub mod error;
pub mod forward;
pub mod ingress;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::{RelayScheme, TunnelConfig};
pub use error::{ChannelError, ConfigError, ForwardError, RegistryError, TunnelError};
pub use forward::{ForwardRequest, ForwardResponse, Forwarder};
pub use registry::{SessionInfo, SessionRegistry};
pub use session::{SessionId, SessionState, TunnelSession};
