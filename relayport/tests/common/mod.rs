#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use relayport::{RelayScheme, TunnelConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, accept_async};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Serves `handler` on an ephemeral loopback port and returns the port.
pub async fn spawn_target<F, Fut>(handler: F) -> u16
where
    F: Fn(Request<Bytes>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    serve_target(listener, handler)
}

/// Like [`spawn_target`], but only on IPv6 loopback. `None` when the host
/// has no IPv6 loopback.
pub async fn spawn_ipv6_target<F, Fut>(handler: F) -> Option<u16>
where
    F: Fn(Request<Bytes>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("[::1]:0").await.ok()?;
    Some(serve_target(listener, handler))
}

fn serve_target<F, Fut>(listener: TcpListener, handler: F) -> u16
where
    F: Fn(Request<Bytes>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
                        Ok::<_, Infallible>(handler(Request::from_parts(parts, body)).await)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    port
}

/// HTTP client that never goes through a system proxy.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn text(status: u16, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap()
}

/// Relay stand-in that accepts exactly one control connection.
pub struct FakeRelay {
    listener: TcpListener,
    pub port: u16,
}

impl FakeRelay {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    pub fn config(&self, target_port: u16, subdomain: Option<&str>) -> TunnelConfig {
        TunnelConfig::new(target_port, subdomain.map(str::to_string), "127.0.0.1", self.port)
            .unwrap()
            .with_relay_scheme(RelayScheme::Ws)
    }

    pub async fn accept(&self) -> RelayConn {
        let (stream, _) = tokio::time::timeout(TIMEOUT, self.listener.accept())
            .await
            .expect("no control connection")
            .unwrap();
        RelayConn {
            ws: accept_async(stream).await.unwrap(),
        }
    }
}

pub struct RelayConn {
    ws: WebSocketStream<TcpStream>,
}

impl RelayConn {
    pub async fn send(&mut self, value: serde_json::Value) {
        self.ws
            .send(WsMessage::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn ping(&mut self, payload: &'static [u8]) {
        self.ws.send(WsMessage::Ping(payload.into())).await.unwrap();
    }

    /// Next frame of any kind, control frames included.
    pub async fn recv_frame(&mut self) -> WsMessage {
        tokio::time::timeout(TIMEOUT, self.ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection ended")
            .unwrap()
    }

    /// Next JSON envelope from the tunnel, skipping control frames.
    pub async fn recv(&mut self) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for envelope")
                .expect("connection ended")
                .unwrap();
            match msg {
                WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                WsMessage::Binary(data) => return serde_json::from_slice(&data).unwrap(),
                _ => continue,
            }
        }
    }

    /// Waits until the tunnel closes its side of the connection.
    pub async fn closed(&mut self) {
        tokio::time::timeout(TIMEOUT, async {
            while let Some(Ok(msg)) = self.ws.next().await {
                if let WsMessage::Close(_) = msg {
                    break;
                }
            }
        })
        .await
        .expect("tunnel did not close the connection");
    }

    pub async fn drop_connection(mut self) {
        let stream = self.ws.get_mut();
        let _ = tokio::io::AsyncWriteExt::shutdown(stream).await;
    }
}
