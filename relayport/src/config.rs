use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayScheme {
    #[default]
    Wss,
    Ws,
}

impl fmt::Display for RelayScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayScheme::Wss => f.write_str("wss"),
            RelayScheme::Ws => f.write_str("ws"),
        }
    }
}

/// Validated settings of a single tunnel. Immutable once a session owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    target_port: u16,
    subdomain: Option<String>,
    relay_host: String,
    relay_port: u16,
    relay_scheme: RelayScheme,
}

impl TunnelConfig {
    pub fn new(
        target_port: u16,
        subdomain: Option<String>,
        relay_host: impl Into<String>,
        relay_port: u16,
    ) -> Result<Self, ConfigError> {
        let relay_host = relay_host.into();

        check_port("target port", target_port)?;
        check_port("relay port", relay_port)?;
        if relay_host.trim().is_empty() {
            return Err(ConfigError::MissingRelayHost);
        }
        if let Some(subdomain) = &subdomain {
            validate_subdomain(subdomain)?;
        }

        let config = Self {
            target_port,
            subdomain,
            relay_host,
            relay_port,
            relay_scheme: RelayScheme::default(),
        };
        config.relay_url()?;
        Ok(config)
    }

    pub fn with_relay_scheme(mut self, scheme: RelayScheme) -> Self {
        self.relay_scheme = scheme;
        self
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    pub fn subdomain(&self) -> Option<&str> {
        self.subdomain.as_deref()
    }

    pub fn relay_host(&self) -> &str {
        &self.relay_host
    }

    pub fn relay_port(&self) -> u16 {
        self.relay_port
    }

    pub fn relay_scheme(&self) -> RelayScheme {
        self.relay_scheme
    }

    pub fn relay_url(&self) -> Result<Url, ConfigError> {
        let raw = format!(
            "{}://{}:{}",
            self.relay_scheme, self.relay_host, self.relay_port
        );
        Url::parse(&raw).map_err(|_| ConfigError::InvalidRelayHost(self.relay_host.clone()))
    }
}

fn check_port(field: &'static str, port: u16) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::InvalidPort {
            field,
            value: port.to_string(),
        });
    }
    Ok(())
}

/// Parses a user supplied port, accepting only 1..=65535.
pub fn parse_port(field: &'static str, input: &str) -> Result<u16, ConfigError> {
    let invalid = || ConfigError::InvalidPort {
        field,
        value: input.to_string(),
    };
    match input.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid()),
        Ok(port) => Ok(port),
    }
}

/// Subdomains must match `^[a-z0-9-]+$`.
pub fn validate_subdomain(subdomain: &str) -> Result<(), ConfigError> {
    let valid = !subdomain.is_empty()
        && subdomain
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidSubdomain(subdomain.to_string()))
    }
}
