//! Server configuration loaded from environment variables

use std::collections::HashSet;
use std::env;
use std::time::Duration;

use tunnel_common::constants;

#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind to.
    pub host: String,

    /// Port for both public ingress and the control endpoint.
    pub port: u16,

    /// Tunnel domain for assigned subdomains (e.g. "tunnel.example").
    pub tunnel_domain: String,

    /// Scheme used when building a tunnel's public URL.
    pub public_scheme: String,

    /// Shared secrets accepted at the control endpoint (§4.5 admission).
    pub secret_keys: HashSet<String>,

    /// How long the forwarder waits for a response before giving up (§4.6).
    pub request_timeout: Duration,

    /// Maximum accepted request body size before returning 413 (§4.6).
    pub max_body_size: usize,

    /// Allow `X-Relay-Subdomain` to stand in for the `Host` header, for
    /// tests and local development (§6).
    pub allow_subdomain_header: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret_keys: HashSet<String> = env::var("SECRET_KEYS")
            .map_err(|_| ConfigError::MissingEnv("SECRET_KEYS"))?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if secret_keys.is_empty() {
            return Err(ConfigError::MissingEnv("SECRET_KEYS"));
        }

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
            tunnel_domain: env::var("TUNNEL_DOMAIN").unwrap_or_else(|_| "tunnel.localhost".to_string()),
            public_scheme: env::var("PUBLIC_SCHEME").unwrap_or_else(|_| "https".to_string()),
            secret_keys,
            request_timeout: Duration::from_secs(
                env::var("REQUEST_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(constants::DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            max_body_size: env::var("MAX_BODY_SIZE_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(constants::DEFAULT_MAX_BODY_SIZE),
            allow_subdomain_header: env::var("ALLOW_SUBDOMAIN_HEADER")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// The full public hostname for a subdomain (e.g. "foo.tunnel.example").
    pub fn full_domain(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.tunnel_domain)
    }

    /// The full public URL for a subdomain.
    pub fn full_url(&self, subdomain: &str) -> String {
        format!("{}://{}", self.public_scheme, self.full_domain(subdomain))
    }

    pub fn accepts_secret(&self, secret: &str) -> bool {
        self.secret_keys.contains(secret)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("invalid port number")]
    InvalidPort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_secret_checks_membership() {
        let config = Config {
            host: "0.0.0.0".to_string(),
            port: 8080,
            tunnel_domain: "tunnel.example".to_string(),
            public_scheme: "https".to_string(),
            secret_keys: ["k1".to_string()].into_iter().collect(),
            request_timeout: Duration::from_secs(30),
            max_body_size: 1024,
            allow_subdomain_header: false,
        };
        assert!(config.accepts_secret("k1"));
        assert!(!config.accepts_secret("k2"));
        assert_eq!(config.full_domain("foo"), "foo.tunnel.example");
        assert_eq!(config.full_url("foo"), "https://foo.tunnel.example");
    }
}
