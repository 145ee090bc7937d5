//! Route identification for pool partitioning

use std::fmt;
use url::Url;

use super::connection::PoolError;

/// Scheme of a route; only plain HTTP and HTTPS are dialed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// The (scheme, host, port) triple a pooled connection belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Route {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Derive the route of an absolute URL
    ///
    /// The port falls back to the scheme default when the URL omits it.
    pub fn from_url(url: &Url) -> Result<Self, PoolError> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(PoolError::InvalidRoute(format!("unsupported scheme: {}", other))),
        };

        let host = url
            .host_str()
            .ok_or_else(|| PoolError::InvalidRoute(format!("no host in URL: {}", url)))?;

        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Self::new(scheme, host.trim_start_matches('[').trim_end_matches(']'), port))
    }

    /// `host:port` form used both for dialing and for the Host header
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for the Host header; the port is omitted when it is the scheme default
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            self.authority()
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}
