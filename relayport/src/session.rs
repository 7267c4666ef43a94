//! Tunnel session - one ingress server, one control channel, one target.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use rand_core::{OsRng, RngCore};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelEvents, ControlChannel, EnvelopeSender};
use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::forward::{ForwardRequest, Forwarder};
use crate::ingress::IngressServer;
use crate::transport::message::{
    ErrorDetails, ErrorEnvelope, Outbound, RegistrationEnvelope, RejectedRequest,
    RequestEnvelope, ResponseEnvelope, headers_to_pairs, pairs_to_headers,
};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(0);

/// Process-unique session identifier. Lowercase base36, so it is also a
/// valid subdomain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        // fixed-width random prefix keeps the counter suffix unambiguous
        let prefix = to_base36(u64::from(OsRng.next_u32()), 7);
        let seq = to_base36(NEXT_SESSION.fetch_add(1, Ordering::Relaxed), 1);
        Self(format!("{prefix}{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn to_base36(mut n: u64, min_width: usize) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    while out.len() < min_width {
        out.push(b'0');
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Starting,
    Active,
    Stopping,
    Stopped,
}

#[derive(Debug)]
struct Running {
    ingress: IngressServer,
    channel: ControlChannel,
}

#[derive(Debug)]
pub struct TunnelSession {
    id: SessionId,
    config: TunnelConfig,
    forwarder: Forwarder,
    state: watch::Sender<SessionState>,
    ingress_port: OnceLock<u16>,
    running: Mutex<Option<Running>>,
}

impl TunnelSession {
    pub fn new(config: TunnelConfig) -> Result<Arc<Self>, TunnelError> {
        Self::with_id(SessionId::generate(), config)
    }

    pub fn with_id(id: SessionId, config: TunnelConfig) -> Result<Arc<Self>, TunnelError> {
        let forwarder = Forwarder::new(config.target_port())?;
        let (state, _) = watch::channel(SessionState::Created);
        Ok(Arc::new(Self {
            id,
            config,
            forwarder,
            state,
            ingress_port: OnceLock::new(),
            running: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// The public name registered with the relay.
    pub fn subdomain(&self) -> &str {
        self.config.subdomain().unwrap_or(self.id.as_str())
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Port of the local ingress server, once bound.
    pub fn ingress_port(&self) -> Option<u16> {
        self.ingress_port.get().copied()
    }

    /// Binds the ingress, connects the control channel and registers.
    /// A session can be started once; a failed start leaves it `Stopped`.
    pub async fn start(self: &Arc<Self>) -> Result<(), TunnelError> {
        let mut running = self.running.lock().await;

        let started = self.state.send_if_modified(|state| {
            if *state == SessionState::Created {
                *state = SessionState::Starting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(TunnelError::InvalidState {
                id: self.id.clone(),
                state: self.state(),
            });
        }

        let url = match self.config.relay_url() {
            Ok(url) => url,
            Err(e) => {
                self.state.send_replace(SessionState::Stopped);
                return Err(e.into());
            }
        };

        let mut ingress = match IngressServer::bind(self.forwarder.clone()).await {
            Ok(ingress) => ingress,
            Err(e) => {
                self.state.send_replace(SessionState::Stopped);
                return Err(TunnelError::Ingress(e));
            }
        };
        let _ = self.ingress_port.set(ingress.port());

        let registration = RegistrationEnvelope {
            subdomain: self.subdomain().to_string(),
            port: ingress.port(),
        };
        let (channel, events) = match ControlChannel::connect(&url, registration).await {
            Ok(connected) => connected,
            Err(e) => {
                if let Err(e) = ingress.shutdown().await {
                    warn!("Failed to stop ingress after failed connect: {}", e);
                }
                self.state.send_replace(SessionState::Stopped);
                return Err(e.into());
            }
        };

        tokio::spawn(dispatch(
            Arc::downgrade(self),
            self.forwarder.clone(),
            channel.sender(),
            events,
        ));
        *running = Some(Running { ingress, channel });
        self.state.send_replace(SessionState::Active);

        info!(
            "Tunnel {} active: {} -> localhost:{}",
            self.id,
            self.subdomain(),
            self.config.target_port()
        );
        Ok(())
    }

    /// Closes the control channel, then drains the ingress. Idempotent.
    pub async fn stop(&self) -> Result<(), TunnelError> {
        let mut running = self.running.lock().await;

        let Some(mut parts) = running.take() else {
            self.state.send_if_modified(|state| {
                let changed = *state != SessionState::Stopped;
                *state = SessionState::Stopped;
                changed
            });
            return Ok(());
        };

        info!("Stopping tunnel {}", self.id);
        self.state.send_replace(SessionState::Stopping);

        parts.channel.close().await;
        let drained = parts.ingress.shutdown().await;

        self.state.send_replace(SessionState::Stopped);
        debug!("Tunnel {} stopped", self.id);
        drained.map_err(TunnelError::from)
    }

    /// Resolves once the session reaches `Stopped`.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Stopped).await;
    }
}

async fn dispatch(
    session: Weak<TunnelSession>,
    forwarder: Forwarder,
    sender: EnvelopeSender,
    mut events: ChannelEvents,
) {
    loop {
        tokio::select! {
            biased;

            Some(request) = events.requests.recv() => match request {
                Ok(request) => {
                    tokio::spawn(answer_request(forwarder.clone(), sender.clone(), request));
                }
                Err(rejected) => reject_request(&sender, forwarder.target_port(), rejected),
            },
            terminal = &mut events.terminal => {
                if let Ok(err) = terminal {
                    if let Some(session) = session.upgrade() {
                        error!("Tunnel {} error: {}", session.id, err);
                        if let Err(e) = session.stop().await {
                            warn!("Failed to stop tunnel {}: {}", session.id, e);
                        }
                    }
                }
                break;
            }
        }
    }
}

/// Forwards one relay request and sends exactly one terminal envelope for it.
async fn answer_request(forwarder: Forwarder, sender: EnvelopeSender, request: RequestEnvelope) {
    let RequestEnvelope {
        client_id,
        method,
        path,
        headers,
        body,
    } = request;
    info!("Handling tunnel request: {} {}", method, path);

    let target_port = forwarder.target_port();
    let result = forwarder
        .forward(ForwardRequest {
            method,
            path,
            headers: headers_to_pairs(&headers),
            body: body.map(Bytes::from).unwrap_or_default(),
        })
        .await;

    let envelope = match result {
        Ok(resp) => {
            debug!("Target responded {} for client {}", resp.status, client_id);
            Outbound::Response(ResponseEnvelope::new(
                client_id.clone(),
                resp.status,
                pairs_to_headers(&resp.headers),
                &resp.body,
            ))
        }
        Err(e) => Outbound::Error(ErrorEnvelope {
            client_id: client_id.clone(),
            error: e.message,
            details: ErrorDetails {
                target_port,
                error: e.code.to_string(),
            },
        }),
    };

    if let Err(e) = sender.send(&envelope) {
        warn!("Dropping reply for client {}: {}", client_id, e);
    }
}

/// Answers a request the relay sent in a shape we cannot replay.
fn reject_request(sender: &EnvelopeSender, target_port: u16, rejected: RejectedRequest) {
    let RejectedRequest { client_id, reason } = rejected;
    let envelope = Outbound::Error(ErrorEnvelope {
        client_id: client_id.clone(),
        error: format!("Invalid request: {}", reason),
        details: ErrorDetails {
            target_port,
            error: "EINVAL".to_string(),
        },
    });
    if let Err(e) = sender.send(&envelope) {
        warn!("Dropping reply for client {}: {}", client_id, e);
    }
}
