//! Endpoint URLs.
//!
//! The stack accepts the `scheme://[user@]host[:port]/path[?params]` subset
//! used by XRootD data federations. Two URLs that agree on `host:port`
//! resolve to the same channel, so [`Url::host_id`] is the canonical map key.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Default port assumed when the URL does not carry one.
pub const DEFAULT_PORT: u16 = 1094;

/// Why a URL failed to parse.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum UrlParseError {
    /// The input was empty or whitespace.
    #[error("empty url")]
    Empty,
    /// No `://` separator was found.
    #[error("missing scheme separator in {0:?}")]
    MissingScheme(String),
    /// The authority section (`host[:port]`) was empty.
    #[error("missing host in {0:?}")]
    MissingHost(String),
    /// The port was present but not a valid 16-bit number.
    #[error("invalid port {port:?} in {url:?}")]
    InvalidPort {
        /// Offending port text.
        port: String,
        /// Full input.
        url: String,
    },
}

/// A parsed endpoint URL.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Url {
    scheme: String,
    username: String,
    host: String,
    port: u16,
    path: String,
    params: BTreeMap<String, String>,
}

impl Url {
    /// Parses the given string.
    pub fn parse(input: &str) -> Result<Self, UrlParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(UrlParseError::Empty);
        }

        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| UrlParseError::MissingScheme(input.to_owned()))?;

        let (authority, path_and_query) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (username, hostport) = match authority.split_once('@') {
            Some((user, host)) => (user, host),
            None => ("", authority),
        };

        if hostport.is_empty() {
            return Err(UrlParseError::MissingHost(input.to_owned()));
        }

        // Bracketed IPv6 literals keep their colons out of the port split.
        let (host, port) = if let Some(stripped) = hostport.strip_prefix('[') {
            match stripped.split_once(']') {
                Some((addr, "")) => (addr.to_owned(), DEFAULT_PORT),
                Some((addr, port)) => {
                    let port = port.strip_prefix(':').unwrap_or(port);
                    (addr.to_owned(), Self::parse_port(port, input)?)
                }
                None => return Err(UrlParseError::MissingHost(input.to_owned())),
            }
        } else {
            match hostport.split_once(':') {
                Some((host, port)) => (host.to_owned(), Self::parse_port(port, input)?),
                None => (hostport.to_owned(), DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(UrlParseError::MissingHost(input.to_owned()));
        }

        let (path, params) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_owned(), Self::parse_params(query)),
            None => (path_and_query.to_owned(), BTreeMap::new()),
        };

        Ok(Self {
            scheme: scheme.to_owned(),
            username: username.to_owned(),
            host,
            port,
            path,
            params,
        })
    }

    fn parse_port(port: &str, url: &str) -> Result<u16, UrlParseError> {
        port.parse().map_err(|_| UrlParseError::InvalidPort {
            port: port.to_owned(),
            url: url.to_owned(),
        })
    }

    fn parse_params(query: &str) -> BTreeMap<String, String> {
        query
            .split('&')
            .filter(|kv| !kv.is_empty())
            .map(|kv| match kv.split_once('=') {
                Some((k, v)) => (k.to_owned(), v.to_owned()),
                None => (kv.to_owned(), String::new()),
            })
            .collect()
    }

    /// URL scheme, e.g. `root`.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// User name embedded in the authority section, empty when absent.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Host name or address literal.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, defaulting to [`DEFAULT_PORT`].
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Path component including the leading slash, empty when absent.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query parameters in key order.
    #[must_use]
    pub const fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// The `host:port` pair identifying the channel this URL maps to.
    #[must_use]
    pub fn host_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Rebuilds this URL with a different path and query.
    #[must_use]
    pub fn with_path(&self, path: &str) -> Self {
        let mut out = self.clone();
        match path.split_once('?') {
            Some((p, query)) => {
                out.path = p.to_owned();
                out.params = Self::parse_params(query);
            }
            None => {
                out.path = path.to_owned();
                out.params.clear();
            }
        }
        out
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if !self.username.is_empty() {
            write!(f, "{}@", self.username)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)?;
        } else {
            write!(f, "{}:{}", self.host, self.port)?;
        }
        write!(f, "{}", self.path)?;
        let mut sep = '?';
        for (key, value) in &self.params {
            if value.is_empty() {
                write!(f, "{sep}{key}")?;
            } else {
                write!(f, "{sep}{key}={value}")?;
            }
            sep = '&';
        }
        Ok(())
    }
}

impl std::str::FromStr for Url {
    type Err = UrlParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_url() {
        let url = Url::parse("root://alice@mgr.example:2094//store/file.root?tried=a&lfn=x")
            .expect("valid url");
        assert_eq!(url.scheme(), "root");
        assert_eq!(url.username(), "alice");
        assert_eq!(url.host(), "mgr.example");
        assert_eq!(url.port(), 2094);
        assert_eq!(url.path(), "//store/file.root");
        assert_eq!(url.params().get("tried").map(String::as_str), Some("a"));
        assert_eq!(url.params().get("lfn").map(String::as_str), Some("x"));
    }

    #[test]
    fn default_port_applies() {
        let url = Url::parse("root://mgr.example//f").expect("valid url");
        assert_eq!(url.port(), DEFAULT_PORT);
        assert_eq!(url.host_id(), "mgr.example:1094");
    }

    #[test]
    fn same_hostport_same_host_id() {
        let a = Url::parse("root://h:1094//a").unwrap();
        let b = Url::parse("root://user@h:1094//b?q=1").unwrap();
        assert_eq!(a.host_id(), b.host_id());
    }

    #[test]
    fn ipv6_literal_keeps_colons() {
        let url = Url::parse("root://[::1]:3000//f").expect("valid url");
        assert_eq!(url.host(), "::1");
        assert_eq!(url.port(), 3000);

        let url = Url::parse("root://[fe80::1]//f").expect("valid url");
        assert_eq!(url.host(), "fe80::1");
        assert_eq!(url.port(), DEFAULT_PORT);
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(matches!(
            Url::parse("mgr.example//f"),
            Err(UrlParseError::MissingScheme(_))
        ));
    }

    #[test]
    fn rejects_empty_host() {
        assert!(matches!(
            Url::parse("root:////f"),
            Err(UrlParseError::MissingHost(_))
        ));
        assert!(matches!(
            Url::parse("root://user@:22//f"),
            Err(UrlParseError::MissingHost(_))
        ));
    }

    #[test]
    fn rejects_bad_port() {
        assert!(matches!(
            Url::parse("root://h:99999//f"),
            Err(UrlParseError::InvalidPort { .. })
        ));
        assert!(matches!(
            Url::parse("root://h:abc//f"),
            Err(UrlParseError::InvalidPort { .. })
        ));
    }

    #[test]
    fn with_path_replaces_path_and_query() {
        let url = Url::parse("root://h//old?stale=1").unwrap();
        let moved = url.with_path("//new?fresh=1");
        assert_eq!(moved.path(), "//new");
        assert!(moved.params().contains_key("fresh"));
        assert!(!moved.params().contains_key("stale"));
        assert_eq!(moved.host_id(), url.host_id());
    }

    #[test]
    fn display_round_trips() {
        let text = "root://alice@mgr.example:2094//store/f?a=1&b=2";
        let url = Url::parse(text).unwrap();
        let reparsed = Url::parse(&url.to_string()).unwrap();
        assert_eq!(url, reparsed);
    }
}
