//! Control channel - the single WebSocket connection to the relay.
//!
//! Registration is written before `connect` returns. After that a reader
//! task decodes inbound envelopes and a writer task drains outbound ones.
//! Losing the connection is reported once, through [`ChannelEvents::terminal`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::ChannelError;
use crate::transport::message::{
    Inbound, Outbound, RegistrationEnvelope, RejectedRequest, RequestEnvelope,
};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A relayed request, or one that could not be decoded but still needs
/// an answer.
pub type RelayRequest = Result<RequestEnvelope, RejectedRequest>;

/// What the owning session consumes from a connected channel.
#[derive(Debug)]
pub struct ChannelEvents {
    pub requests: mpsc::UnboundedReceiver<RelayRequest>,
    /// Resolves with the failure that ended the connection. Resolves with
    /// `Err` instead when the channel was closed locally.
    pub terminal: oneshot::Receiver<ChannelError>,
}

#[derive(Debug)]
struct ChannelState {
    open: AtomicBool,
    closing: AtomicBool,
    terminal: Mutex<Option<oneshot::Sender<ChannelError>>>,
}

impl ChannelState {
    fn terminate(&self, reason: impl Into<String>) {
        self.open.store(false, Ordering::SeqCst);
        let Some(tx) = self.terminal.lock().ok().and_then(|mut t| t.take()) else {
            return;
        };
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        let reason = reason.into();
        warn!("Control channel terminated: {}", reason);
        let _ = tx.send(ChannelError::Terminal(reason));
    }
}

/// Cheap handle for writing envelopes from concurrent tasks.
#[derive(Debug, Clone)]
pub struct EnvelopeSender {
    outbound: mpsc::UnboundedSender<WsMessage>,
    state: Arc<ChannelState>,
}

impl EnvelopeSender {
    pub fn send(&self, envelope: &Outbound) -> Result<(), ChannelError> {
        if !self.state.open.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let text = envelope.encode()?;
        self.outbound
            .send(WsMessage::Text(text.into()))
            .map_err(|_| ChannelError::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct ControlChannel {
    sender: EnvelopeSender,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl ControlChannel {
    pub async fn connect(
        url: &Url,
        registration: RegistrationEnvelope,
    ) -> Result<(Self, ChannelEvents), ChannelError> {
        info!("Connecting to relay at {}", url);

        let connect_error = |source: WsError| ChannelError::Connect {
            url: url.to_string(),
            source,
        };
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(connect_error)?;
        info!("Connected to relay");

        let (mut ws_write, ws_read) = ws_stream.split();

        let frame = Outbound::Register(registration).encode()?;
        debug!("Sending registration: {}", frame);
        ws_write
            .send(WsMessage::Text(frame.into()))
            .await
            .map_err(connect_error)?;

        let (terminal_tx, terminal_rx) = oneshot::channel();
        let state = Arc::new(ChannelState {
            open: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            terminal: Mutex::new(Some(terminal_tx)),
        });
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(ws_write, outbound_rx, state.clone()));
        let reader = tokio::spawn(read_loop(ws_read, requests_tx, state.clone()));

        let channel = Self {
            sender: EnvelopeSender {
                outbound: outbound_tx,
                state,
            },
            writer: Some(writer),
            reader: Some(reader),
        };
        let events = ChannelEvents {
            requests: requests_rx,
            terminal: terminal_rx,
        };
        Ok((channel, events))
    }

    pub fn sender(&self) -> EnvelopeSender {
        self.sender.clone()
    }

    pub fn send(&self, envelope: &Outbound) -> Result<(), ChannelError> {
        self.sender.send(envelope)
    }

    /// Closes the connection. Closing the transport is how the relay learns
    /// the tunnel is gone; a local close is never reported as terminal.
    pub async fn close(&mut self) {
        let state = &self.sender.state;
        state.closing.store(true, Ordering::SeqCst);
        state.open.store(false, Ordering::SeqCst);
        if let Ok(mut terminal) = state.terminal.lock() {
            terminal.take();
        }

        let _ = self.sender.outbound.send(WsMessage::Close(None));
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                warn!("Timed out closing control channel");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        debug!("Control channel closed");
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn write_loop(
    mut ws_write: SplitSink<WsStream, WsMessage>,
    mut outbound_rx: mpsc::UnboundedReceiver<WsMessage>,
    state: Arc<ChannelState>,
) {
    while let Some(msg) = outbound_rx.recv().await {
        let is_close = matches!(msg, WsMessage::Close(_));
        if let Err(e) = ws_write.send(msg).await {
            state.terminate(format!("WebSocket write failed: {}", e));
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = ws_write.close().await;
}

async fn read_loop(
    mut ws_read: SplitStream<WsStream>,
    requests_tx: mpsc::UnboundedSender<RelayRequest>,
    state: Arc<ChannelState>,
) {
    loop {
        match ws_read.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                handle_frame(text.as_bytes(), &requests_tx);
            }
            Some(Ok(WsMessage::Binary(data))) => {
                handle_frame(&data, &requests_tx);
            }
            Some(Ok(WsMessage::Ping(_))) => {
                // tungstenite queues the pong itself
                debug!("Received ping");
            }
            Some(Ok(WsMessage::Pong(_))) => {
                debug!("Received pong");
            }
            Some(Ok(WsMessage::Close(frame))) => {
                info!("Relay closed connection: {:?}", frame);
                state.terminate("WebSocket connection closed");
                break;
            }
            Some(Ok(WsMessage::Frame(_))) => {
                // Raw frame, ignore
            }
            Some(Err(e)) => {
                error!("WebSocket error: {}", e);
                state.terminate(format!("WebSocket error: {}", e));
                break;
            }
            None => {
                state.terminate("WebSocket connection closed unexpectedly");
                break;
            }
        }
    }
}

fn handle_frame(frame: &[u8], requests_tx: &mpsc::UnboundedSender<RelayRequest>) {
    match Inbound::decode(frame) {
        Ok(Inbound::Request(request)) => {
            debug!(
                "Received request {} {} (client {})",
                request.method, request.path, request.client_id
            );
            if requests_tx.send(Ok(request)).is_err() {
                debug!("Session no longer accepting requests");
            }
        }
        Ok(Inbound::Rejected(rejected)) => {
            warn!(
                "Undecodable request from client {}: {}",
                rejected.client_id, rejected.reason
            );
            if requests_tx.send(Err(rejected)).is_err() {
                debug!("Session no longer accepting requests");
            }
        }
        Ok(Inbound::Registered(ack)) => {
            info!(
                "Relay acknowledged registration: {}",
                ack.subdomain.as_deref().unwrap_or("<unnamed>")
            );
        }
        Ok(Inbound::Unrecognized(kind)) => {
            debug!("Ignoring message of type {:?}", kind);
        }
        Err(e) => {
            warn!("Error parsing message: {}", e);
        }
    }
}
