//! Local ingress - a plain HTTP listener on an ephemeral port that forwards
//! every request synchronously to the target.

use std::convert::Infallible;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ForwardError;
use crate::forward::{ForwardRequest, ForwardResponse, Forwarder};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Response headers that belong to the target's connection, not ours.
const CONNECTION_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding"];

#[derive(Debug)]
pub struct IngressServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl IngressServer {
    /// Binds `127.0.0.1:0` and starts serving. The OS picks the port, so
    /// two live servers never share one.
    pub async fn bind(forwarder: Forwarder) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        info!("Tunnel ingress listening on http://{}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(serve(listener, forwarder, shutdown_rx));

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting and waits for open connections to drain. Calling it
    /// again is a no-op.
    pub async fn shutdown(&mut self) -> Result<(), tokio::task::JoinError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

async fn serve(listener: TcpListener, forwarder: Forwarder, mut shutdown_rx: oneshot::Receiver<()>) {
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("Ingress accepted connection from {}", peer_addr);
                        let forwarder = forwarder.clone();
                        let service = service_fn(move |req| handle_request(forwarder.clone(), req));
                        let conn = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service);
                        let conn = graceful.watch(conn);

                        tokio::spawn(async move {
                            if let Err(e) = conn.await {
                                debug!("Ingress connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = &mut shutdown_rx => {
                break;
            }
        }
    }

    drop(listener);
    if tokio::time::timeout(DRAIN_TIMEOUT, graceful.shutdown()).await.is_err() {
        warn!("Ingress connections did not drain within {:?}", DRAIN_TIMEOUT);
    }
    debug!("Ingress stopped");
}

async fn handle_request(
    forwarder: Forwarder,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    debug!("Ingress received {} {}", parts.method, parts.uri);

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read ingress request body: {}", e);
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = parts
        .headers
        .iter()
        .map(|(k, v)| {
            (
                k.to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();

    let result = forwarder
        .forward(ForwardRequest {
            method: parts.method.to_string(),
            path,
            headers,
            body,
        })
        .await;

    Ok(match result {
        Ok(resp) => into_response(resp),
        Err(e) => bad_gateway(&e, forwarder.target_port()),
    })
}

fn into_response(resp: ForwardResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(resp.body));
    *response.status_mut() = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let headers = response.headers_mut();
    for (name, value) in resp.headers {
        if CONNECTION_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.append(name, value);
        }
    }
    response
}

fn bad_gateway(err: &ForwardError, target_port: u16) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": err.message,
        "details": {
            "targetPort": target_port,
            "error": err.code,
        },
    });

    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    if let Ok(content_type) = HeaderValue::from_str(mime::APPLICATION_JSON.as_ref()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}
