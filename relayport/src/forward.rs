//! Local forwarder - replays a request against `localhost:<target_port>`,
//! over IPv4 loopback first and IPv6 loopback second.

use std::error::Error as _;
use std::io;

use bytes::Bytes;
use http::header::{HOST, HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::error::ForwardError;

const LOOPBACK_V4: &str = "127.0.0.1";
const LOOPBACK_V6: &str = "[::1]";

/// Headers that describe the hop to us rather than the request itself.
/// `content-length` is recomputed from the buffered body.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Stateless apart from its connection pool; clone freely.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    target_port: u16,
}

impl Forwarder {
    pub fn new(target_port: u16) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            target_port,
        })
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    /// Replays `request` against the target. IPv4 loopback is tried first;
    /// a refused connection falls back to `[::1]`, where servers that bound
    /// `localhost` on an IPv6-first host end up listening.
    pub async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse, ForwardError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            ForwardError {
                code: "EINVAL",
                message: format!("Invalid HTTP method '{}'", request.method),
            }
        })?;
        let headers = self.outbound_headers(&request.headers);

        debug!("Forwarding {} {} to port {}", method, request.path, self.target_port);

        let sent = match self.send(LOOPBACK_V4, &method, &headers, &request).await? {
            Err(e) if error_code(&e) == "ECONNREFUSED" => {
                debug!("Port {} refused on IPv4, trying IPv6 loopback", self.target_port);
                match self.send(LOOPBACK_V6, &method, &headers, &request).await? {
                    // nothing on [::1] either; report the IPv4 failure
                    Err(v6) if v6.is_connect() => Err(e),
                    other => other,
                }
            }
            other => other,
        };
        let resp = sent.map_err(|e| self.forward_error(&e))?;

        let status = resp.status().as_u16();
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = resp.bytes().await.map_err(|e| self.forward_error(&e))?;

        Ok(ForwardResponse {
            status,
            headers,
            body,
        })
    }

    /// The outer error is an unusable path; the inner one is the transport.
    async fn send(
        &self,
        host: &str,
        method: &reqwest::Method,
        headers: &HeaderMap,
        request: &ForwardRequest,
    ) -> Result<Result<reqwest::Response, reqwest::Error>, ForwardError> {
        let url = self.target_url(host, &request.path)?;
        let mut req = self
            .client
            .request(method.clone(), url)
            .headers(headers.clone());
        if !request.body.is_empty() {
            req = req.body(request.body.clone());
        }
        Ok(req.send().await)
    }

    /// The `Host` header still says localhost whichever address is dialled.
    fn target_url(&self, host: &str, path: &str) -> Result<reqwest::Url, ForwardError> {
        let raw = if path.starts_with('/') {
            format!("http://{}:{}{}", host, self.target_port, path)
        } else {
            format!("http://{}:{}/{}", host, self.target_port, path)
        };
        reqwest::Url::parse(&raw).map_err(|e| ForwardError {
            code: "EINVAL",
            message: format!("Invalid request path '{path}': {e}"),
        })
    }

    fn outbound_headers(&self, headers: &[(String, String)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => debug!("Dropping unrepresentable header {}", name),
            }
        }

        let host = format!("localhost:{}", self.target_port);
        if let Ok(host) = HeaderValue::from_str(&host) {
            map.insert(HOST, host);
        }
        map
    }

    fn forward_error(&self, err: &reqwest::Error) -> ForwardError {
        let code = error_code(err);
        let message = format!(
            "{} localhost:{} ({})",
            code,
            self.target_port,
            root_cause(err)
        );
        warn!("Error forwarding request to port {}: {}", self.target_port, message);
        ForwardError { code, message }
    }
}

fn error_code(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        return "ETIMEDOUT";
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return io_error_code(io_err.kind());
        }
        if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() {
                return "ECONNRESET";
            }
        }
        source = cause.source();
    }

    if err.is_builder() { "EINVAL" } else { "EFORWARD" }
}

fn io_error_code(kind: io::ErrorKind) -> &'static str {
    match kind {
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        io::ErrorKind::ConnectionReset => "ECONNRESET",
        io::ErrorKind::ConnectionAborted => "ECONNABORTED",
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        io::ErrorKind::NotFound => "ENOTFOUND",
        io::ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
        io::ErrorKind::BrokenPipe => "EPIPE",
        _ => "EFORWARD",
    }
}

fn root_cause(err: &reqwest::Error) -> String {
    let mut last: &dyn std::error::Error = err;
    while let Some(next) = last.source() {
        last = next;
    }
    last.to_string()
}
