//! Command-line arguments: the single-command surface for exposing a
//! local port through a reverse tunnel.

use clap::Parser;

/// Expose a local port on a public subdomain through a reverse tunnel.
#[derive(Parser, Debug)]
#[command(name = "tunnel", version, about, long_about = None)]
pub struct Cli {
    /// Local port to forward requests to. Parsed wider than `u16` so an
    /// out-of-range value (e.g. `-1`, `65536`) reaches `validate()` and is
    /// rejected with exit code 1, rather than failing inside clap's own
    /// parser with its usage-error exit code.
    pub port: i64,

    /// Tunnel server address, e.g. "tunnel.example" or "tunnel.example:9000".
    #[arg(short = 's', long = "server", env = "TUNNEL_SERVER")]
    pub server: String,

    /// Shared secret accepted by the tunnel server's control endpoint.
    #[arg(short = 'k', long = "key", env = "TUNNEL_KEY")]
    pub key: String,

    /// Request a specific subdomain instead of a random one.
    #[arg(short = 'd', long = "subdomain")]
    pub subdomain: Option<String>,

    /// Connect over ws:// instead of wss://.
    #[arg(long)]
    pub insecure: bool,

    /// Suppress informational output (tunnel banner, request log lines).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose (debug-level) logging.
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ArgsError {
    #[error("port must be between 1 and 65535")]
    InvalidPort,
    #[error("subdomain \"{0}\" is not a valid DNS label")]
    InvalidSubdomain(String),
}

impl Cli {
    /// Validates fields clap's type system can't express on its own: the
    /// port range and, if present, that the requested subdomain is a
    /// syntactically valid DNS label, so a request the client accepts is
    /// never rejected by the server only for its shape.
    pub fn validate(&self) -> Result<(), ArgsError> {
        if self.port < 1 || self.port > 65535 {
            return Err(ArgsError::InvalidPort);
        }
        if let Some(subdomain) = &self.subdomain {
            if !is_valid_dns_label(subdomain) {
                return Err(ArgsError::InvalidSubdomain(subdomain.clone()));
            }
        }
        Ok(())
    }

    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

fn is_valid_dns_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !is_alnum(bytes[0]) || !is_alnum(*bytes.last().unwrap()) {
        return false;
    }
    bytes.iter().all(|&b| is_alnum(b) || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_label_boundaries() {
        assert!(is_valid_dns_label("foo"));
        assert!(is_valid_dns_label("foo-bar9"));
        assert!(!is_valid_dns_label(""));
        assert!(!is_valid_dns_label("-foo"));
        assert!(!is_valid_dns_label("foo-"));
        assert!(!is_valid_dns_label("Foo"));
        assert!(!is_valid_dns_label(&"a".repeat(64)));
    }

    fn base_cli() -> Cli {
        Cli {
            port: 8080,
            server: "tunnel.example".to_string(),
            key: "secret".to_string(),
            subdomain: None,
            insecure: false,
            quiet: false,
            verbose: false,
        }
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut cli = base_cli();
        cli.port = 0;
        assert!(matches!(cli.validate(), Err(ArgsError::InvalidPort)));
    }

    #[test]
    fn validate_rejects_out_of_range_port() {
        let mut cli = base_cli();
        cli.port = -1;
        assert!(matches!(cli.validate(), Err(ArgsError::InvalidPort)));
        cli.port = 65536;
        assert!(matches!(cli.validate(), Err(ArgsError::InvalidPort)));
    }

    #[test]
    fn validate_rejects_bad_subdomain() {
        let mut cli = base_cli();
        cli.subdomain = Some("Not_Valid".to_string());
        assert!(matches!(cli.validate(), Err(ArgsError::InvalidSubdomain(_))));
    }

    #[test]
    fn validate_accepts_well_formed_args() {
        let cli = base_cli();
        assert!(cli.validate().is_ok());
    }
}
