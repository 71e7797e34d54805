use std::fmt;

use super::FetchError;

/// Target of one GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub ssl: bool,
    pub host: String,
    pub port: u16,
    /// Path including any query string; always starts with '/'.
    pub path: String,
}

impl Url {
    /// Accepts `http` and `https` URLs only.
    pub fn parse(url: &str) -> Result<Self, FetchError> {
        let parsed = url::Url::parse(url.trim()).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        Self::from_parsed(&parsed).ok_or_else(|| FetchError::InvalidUrl(url.to_string()))
    }

    fn from_parsed(parsed: &url::Url) -> Option<Self> {
        let ssl = match parsed.scheme() {
            "http" => false,
            "https" => true,
            _ => return None,
        };
        let host = parsed.host_str().filter(|host| !host.is_empty())?;
        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        Some(Self {
            ssl,
            host: host.to_string(),
            port: parsed.port_or_known_default()?,
            path,
        })
    }

    /// Resolves a redirect target: absolute URLs replace everything, rooted
    /// paths keep the host, and relative paths resolve against the current
    /// path's directory.
    pub fn resolve(&self, location: &str) -> Result<Self, FetchError> {
        let invalid = || FetchError::InvalidUrl(location.to_string());
        let base = url::Url::parse(&self.to_string()).map_err(|_| invalid())?;
        let target = base.join(location.trim()).map_err(|_| invalid())?;
        Self::from_parsed(&target).ok_or_else(invalid)
    }

    /// The `Host` header value.
    pub fn host_header(&self) -> String {
        let default_port = if self.ssl { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.ssl { "https" } else { "http" };
        write!(f, "{}://{}{}", scheme, self.host_header(), self.path)
    }
}
