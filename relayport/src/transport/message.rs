use std::collections::HashMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Failed to (de)serialize envelope")]
    Serialization(#[from] serde_json::Error),
}

/// Correlation key chosen by the relay. Echoed back exactly as received,
/// whatever JSON type the relay used for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(serde_json::Value);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(serde_json::Value::String(id.into()))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            serde_json::Value::String(s) => f.write_str(s),
            other => write!(f, "{other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HeaderValue {
    One(String),
    Many(Vec<String>),
}

/// Scalars are accepted wherever a string is, so `"content-length": 0`
/// decodes the same as `"content-length": "0"`.
impl<'de> Deserialize<'de> for HeaderValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(scalar_to_string)
                .collect::<Option<Vec<_>>>()
                .map(HeaderValue::Many),
            other => scalar_to_string(other).map(HeaderValue::One),
        };
        value.ok_or_else(|| de::Error::custom("header values must be strings, numbers or booleans"))
    }
}

fn scalar_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl HeaderValue {
    pub fn values(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            HeaderValue::One(v) => std::slice::from_ref(v),
            HeaderValue::Many(vs) => vs,
        };
        values.iter().map(String::as_str)
    }
}

pub type Headers = HashMap<String, HeaderValue>;

/// Flattens an envelope header map into name/value pairs.
pub fn headers_to_pairs(headers: &Headers) -> Vec<(String, String)> {
    headers
        .iter()
        .flat_map(|(name, value)| value.values().map(move |v| (name.clone(), v.to_string())))
        .collect()
}

/// Groups name/value pairs by lowercased name; repeated names become arrays.
pub fn pairs_to_headers(pairs: &[(String, String)]) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in pairs {
        let name = name.to_ascii_lowercase();
        match headers.remove(&name) {
            None => {
                headers.insert(name, HeaderValue::One(value.clone()));
            }
            Some(HeaderValue::One(first)) => {
                headers.insert(name, HeaderValue::Many(vec![first, value.clone()]));
            }
            Some(HeaderValue::Many(mut all)) => {
                all.push(value.clone());
                headers.insert(name, HeaderValue::Many(all));
            }
        }
    }
    headers
}

// =============================================================================
// Outbound (tunnel -> relay)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Register(RegistrationEnvelope),
    Response(ResponseEnvelope),
    Error(ErrorEnvelope),
}

impl Outbound {
    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationEnvelope {
    pub subdomain: String,
    /// Ephemeral port of the local ingress server.
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub client_id: ClientId,
    pub status_code: u16,
    pub headers: Headers,
    /// Base64 of the full response body.
    pub data: String,
}

impl ResponseEnvelope {
    pub fn new(client_id: ClientId, status_code: u16, headers: Headers, body: &[u8]) -> Self {
        Self {
            client_id,
            status_code,
            headers,
            data: STANDARD.encode(body),
        }
    }

    pub fn body(&self) -> Result<Bytes, base64::DecodeError> {
        STANDARD.decode(&self.data).map(Bytes::from)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub client_id: ClientId,
    pub error: String,
    pub details: ErrorDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub target_port: u16,
    /// errno-style failure code, e.g. `ECONNREFUSED`.
    pub error: String,
}

// =============================================================================
// Inbound (relay -> tunnel)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub client_id: ClientId,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredEnvelope {
    #[serde(default)]
    pub subdomain: Option<String>,
}

/// A request that names its client but cannot be replayed. It still owes
/// the relay an `error` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRequest {
    pub client_id: ClientId,
    pub reason: String,
}

/// Every frame the relay can send decodes to one of these. Kinds this
/// client does not know about are `Unrecognized`, never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(RequestEnvelope),
    Rejected(RejectedRequest),
    Registered(RegisteredEnvelope),
    Unrecognized(Option<String>),
}

impl Inbound {
    pub fn decode(frame: &[u8]) -> Result<Self, MessageError> {
        let value: serde_json::Value = serde_json::from_slice(frame)?;
        let kind = value.get("type").and_then(|t| t.as_str()).map(str::to_owned);

        let inbound = match kind.as_deref() {
            Some("request") => Self::decode_request(value)?,
            Some("registered") => Inbound::Registered(serde_json::from_value(value)?),
            _ => Inbound::Unrecognized(kind),
        };
        Ok(inbound)
    }

    /// Without a usable `clientId` there is nobody to answer, so that case
    /// stays an error.
    fn decode_request(value: serde_json::Value) -> Result<Self, MessageError> {
        let client_id = value
            .get("clientId")
            .filter(|id| !id.is_null())
            .cloned()
            .map(ClientId);

        match (serde_json::from_value(value), client_id) {
            (Ok(request), _) => Ok(Inbound::Request(request)),
            (Err(e), Some(client_id)) => Ok(Inbound::Rejected(RejectedRequest {
                client_id,
                reason: e.to_string(),
            })),
            (Err(e), None) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_register_wire_format() {
        let envelope = Outbound::Register(RegistrationEnvelope {
            subdomain: "myapp".into(),
            port: 51234,
        });
        let value: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "type": "register", "subdomain": "myapp", "port": 51234 })
        );
    }

    #[test]
    fn test_response_wire_format() {
        let mut headers = Headers::new();
        headers.insert("content-type".into(), HeaderValue::One("application/json".into()));
        let envelope = Outbound::Response(ResponseEnvelope::new(
            ClientId::new("c1"),
            200,
            headers,
            br#"{"ok":true}"#,
        ));
        let value: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "response",
                "clientId": "c1",
                "statusCode": 200,
                "headers": { "content-type": "application/json" },
                "data": "eyJvayI6dHJ1ZX0="
            })
        );
    }

    #[test]
    fn test_error_wire_format() {
        let envelope = Outbound::Error(ErrorEnvelope {
            client_id: ClientId::new("c2"),
            error: "connect ECONNREFUSED".into(),
            details: ErrorDetails {
                target_port: 4000,
                error: "ECONNREFUSED".into(),
            },
        });
        let value: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "error",
                "clientId": "c2",
                "error": "connect ECONNREFUSED",
                "details": { "targetPort": 4000, "error": "ECONNREFUSED" }
            })
        );
    }

    #[test]
    fn test_decode_request() {
        let frame = json!({
            "type": "request",
            "clientId": "abc",
            "method": "POST",
            "path": "/echo?x=1",
            "headers": { "host": "myapp.dfanso.dev", "accept": ["a", "b"] },
            "body": "hi"
        });
        let Inbound::Request(request) = Inbound::decode(frame.to_string().as_bytes()).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(request.client_id, ClientId::new("abc"));
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/echo?x=1");
        assert_eq!(request.body.as_deref(), Some("hi"));
        assert_eq!(
            request.headers.get("accept"),
            Some(&HeaderValue::Many(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn test_decode_request_without_headers_or_body() {
        let frame = br#"{"type":"request","clientId":"c1","method":"GET","path":"/health"}"#;
        let Inbound::Request(request) = Inbound::decode(frame).unwrap() else {
            panic!("expected request");
        };
        assert!(request.headers.is_empty());
        assert_eq!(request.body, None);
    }

    #[test]
    fn test_numeric_client_id_is_echoed_verbatim() {
        let frame = br#"{"type":"request","clientId":42,"method":"GET","path":"/"}"#;
        let Inbound::Request(request) = Inbound::decode(frame).unwrap() else {
            panic!("expected request");
        };
        let response = ResponseEnvelope::new(request.client_id, 204, Headers::new(), b"");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["clientId"], json!(42));
    }

    #[test]
    fn test_unknown_kinds_are_not_errors() {
        assert_eq!(
            Inbound::decode(br#"{"type":"ping","ts":1}"#).unwrap(),
            Inbound::Unrecognized(Some("ping".into()))
        );
        assert_eq!(
            Inbound::decode(br#"{"hello":"world"}"#).unwrap(),
            Inbound::Unrecognized(None)
        );
        assert_eq!(
            Inbound::decode(br#"{"type":"registered","subdomain":"myapp"}"#).unwrap(),
            Inbound::Registered(RegisteredEnvelope {
                subdomain: Some("myapp".into())
            })
        );
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(Inbound::decode(b"not json").is_err());
        assert!(Inbound::decode(br#"{"type":"request","method":"GET"}"#).is_err());
        assert!(Inbound::decode(br#"{"type":"request","clientId":null,"method":"GET"}"#).is_err());
    }

    #[test]
    fn test_scalar_header_values_are_stringified() {
        let frame = br#"{"type":"request","clientId":"c1","method":"POST","path":"/",
            "headers":{"content-length":0,"x-flag":true,"x-list":[1,"two"]}}"#;
        let Inbound::Request(request) = Inbound::decode(frame).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(request.headers["content-length"], HeaderValue::One("0".into()));
        assert_eq!(request.headers["x-flag"], HeaderValue::One("true".into()));
        assert_eq!(
            request.headers["x-list"],
            HeaderValue::Many(vec!["1".into(), "two".into()])
        );
    }

    #[test]
    fn test_undecodable_request_with_client_id_is_rejected() {
        let frame = br#"{"type":"request","clientId":7,"method":"POST","path":"/","body":{"a":1}}"#;
        let Inbound::Rejected(rejected) = Inbound::decode(frame).unwrap() else {
            panic!("expected rejected request");
        };
        assert_eq!(rejected.client_id.to_string(), "7");
        assert!(!rejected.reason.is_empty());

        let frame = br#"{"type":"request","clientId":"c2","method":"GET","headers":{"x":{"nested":1}}}"#;
        assert!(matches!(Inbound::decode(frame).unwrap(), Inbound::Rejected(_)));
    }

    #[test]
    fn test_header_grouping() {
        let pairs = vec![
            ("Set-Cookie".to_string(), "a=1".to_string()),
            ("content-type".to_string(), "text/plain".to_string()),
            ("set-cookie".to_string(), "b=2".to_string()),
        ];
        let headers = pairs_to_headers(&pairs);
        assert_eq!(
            headers.get("set-cookie"),
            Some(&HeaderValue::Many(vec!["a=1".into(), "b=2".into()]))
        );

        let mut flattened = headers_to_pairs(&headers);
        flattened.sort();
        assert_eq!(
            flattened,
            vec![
                ("content-type".to_string(), "text/plain".to_string()),
                ("set-cookie".to_string(), "a=1".to_string()),
                ("set-cookie".to_string(), "b=2".to_string()),
            ]
        );
    }

    #[test]
    fn test_response_body_survives_base64() {
        let payloads: [&[u8]; 4] = [b"", b"\x00\xff\x10binary", "héllo".as_bytes(), &[7u8; 1025]];
        for payload in payloads {
            let envelope = ResponseEnvelope::new(ClientId::new("x"), 200, Headers::new(), payload);
            assert_eq!(envelope.body().unwrap().as_ref(), payload);
        }
    }
}
