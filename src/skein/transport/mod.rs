use std::sync::Arc;

use async_trait::async_trait;

use crate::skein::{config::Config, connection::Connection};

#[cfg(feature = "dns")]
pub mod dns;
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "mtls")]
pub mod mtls;
#[cfg(feature = "pipe")]
pub mod pipe;
#[cfg(feature = "pivot")]
pub mod pivot;
pub mod socket;
#[cfg(feature = "wg")]
pub mod wg;

/// Keepalive interval for stream transports. Pings only go out when the
/// outbound queue has been idle this long.
pub const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// One dialable scheme. `connect` returns a live [`Connection`] with its
/// pump loops already running; the connection's cleanup tears them down.
#[async_trait]
pub trait Backend: Send + Sync {
    fn scheme(&self) -> &'static str;
    async fn connect(&self, uri: &Uri, cfg: &Config) -> anyhow::Result<Arc<Connection>>;
}

/// Minimal URI view, enough for endpoint strings. Not a general parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub raw: String,
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl Uri {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| anyhow::anyhow!("transport: missing scheme in {:?}", raw))?;
        let scheme = scheme.to_ascii_lowercase();

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, String::new()),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
                let port: u16 = p
                    .parse()
                    .map_err(|_| anyhow::anyhow!("transport: bad port in {:?}", raw))?;
                (h.to_string(), Some(port))
            }
            _ => (authority.to_string(), None),
        };

        if host.is_empty() {
            anyhow::bail!("transport: empty host in {:?}", raw);
        }

        Ok(Self {
            raw: raw.to_string(),
            scheme,
            host,
            port,
            path,
        })
    }

    /// host:port with a scheme-appropriate fallback port.
    pub fn address(&self, default_port: u16) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(default_port))
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Schemes this build can dial, in config-table order.
pub fn supported_schemes() -> Vec<&'static str> {
    let mut out = Vec::new();
    #[cfg(feature = "mtls")]
    out.push("mtls");
    #[cfg(feature = "http")]
    {
        out.push("http");
        out.push("https");
    }
    #[cfg(feature = "dns")]
    out.push("dns");
    #[cfg(feature = "wg")]
    out.push("wg");
    #[cfg(feature = "pipe")]
    out.push("pipe");
    #[cfg(feature = "pivot")]
    out.push("pivot");
    out
}

pub fn backend_for_scheme(scheme: &str) -> Option<Box<dyn Backend>> {
    match scheme {
        #[cfg(feature = "mtls")]
        "mtls" => Some(Box::new(mtls::MtlsBackend)),
        #[cfg(feature = "http")]
        "http" | "https" => Some(Box::new(http::HttpBackend)),
        #[cfg(feature = "dns")]
        "dns" => Some(Box::new(dns::DnsBackend)),
        #[cfg(feature = "wg")]
        "wg" => Some(Box::new(wg::WgBackend)),
        #[cfg(feature = "pipe")]
        "pipe" => Some(Box::new(pipe::PipeBackend)),
        #[cfg(feature = "pivot")]
        "pivot" => Some(Box::new(pivot::PivotBackend)),
        _ => None,
    }
}

/// Dial one endpoint URI with the configured timeout.
pub async fn connect_uri(raw: &str, cfg: &Config) -> anyhow::Result<Arc<Connection>> {
    let uri = Uri::parse(raw)?;
    let backend = backend_for_scheme(&uri.scheme)
        .ok_or_else(|| anyhow::anyhow!("transport: no backend for scheme {:?}", uri.scheme))?;
    tracing::debug!(uri = %uri, scheme = %uri.scheme, "transport: dialing");
    match tokio::time::timeout(cfg.dial_timeout, backend.connect(&uri, cfg)).await {
        Ok(res) => res,
        Err(_) => anyhow::bail!("transport: dial {} timed out", uri),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_parses_scheme_host_port() {
        let u = Uri::parse("mtls://c2.example.com:8443").unwrap();
        assert_eq!(u.scheme, "mtls");
        assert_eq!(u.host, "c2.example.com");
        assert_eq!(u.port, Some(8443));
        assert_eq!(u.address(1234), "c2.example.com:8443");
    }

    #[test]
    fn uri_without_port_uses_default() {
        let u = Uri::parse("dns://tunnel.example.com").unwrap();
        assert_eq!(u.port, None);
        assert_eq!(u.address(53), "tunnel.example.com:53");
    }

    #[test]
    fn uri_keeps_path() {
        let u = Uri::parse("https://c2:8888/admin/poll").unwrap();
        assert_eq!(u.scheme, "https");
        assert_eq!(u.path, "/admin/poll");
    }

    #[test]
    fn uri_rejects_garbage() {
        assert!(Uri::parse("no-scheme-here").is_err());
        assert!(Uri::parse("mtls://").is_err());
        assert!(Uri::parse("mtls://host:70000").is_err());
    }

    #[test]
    fn scheme_table_matches_features() {
        let schemes = supported_schemes();
        #[cfg(feature = "mtls")]
        assert!(schemes.contains(&"mtls"));
        for s in schemes {
            if s == "https" {
                continue;
            }
            assert!(backend_for_scheme(s).is_some(), "no backend for {s}");
        }
    }
}
