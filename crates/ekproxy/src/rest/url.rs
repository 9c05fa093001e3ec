//! KMS endpoint URL parsing.
//!
//! Grammar: `<protocol>://<host>[:<service>]/<resource>[?<query>]`.
//!
//! Only `http` and `https` are recognised; `http` additionally requires the
//! `rest_kms_enable_not_secure_connection` knob. Every parse failure other
//! than an unsupported protocol is reported as [`EkpError::InvalidUri`] so
//! callers never learn which part of a malformed URL broke.

use common::EkpError;
use tracing::{debug, warn};

/// Supported connection protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Http,
    Https,
}

impl ConnectionKind {
    /// Resolve a lowercased protocol name against the supported set.
    pub fn from_protocol(protocol: &str) -> Result<Self, EkpError> {
        match protocol {
            "http" => Ok(ConnectionKind::Http),
            "https" => Ok(ConnectionKind::Https),
            _ => {
                warn!(protocol, "unsupported connection protocol");
                Err(EkpError::UnsupportedProtocol)
            }
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, ConnectionKind::Https)
    }

    pub fn scheme(self) -> &'static str {
        match self {
            ConnectionKind::Http => "http",
            ConnectionKind::Https => "https",
        }
    }
}

/// A parsed KMS endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestUrl {
    pub kind: ConnectionKind,
    pub host: String,
    /// Port number or service name; empty when the URL carries none. Not
    /// validated numerically here.
    pub service: String,
    pub resource: String,
    pub query: String,
    pub body: Option<String>,
}

/// Internal parse failure, collapsed to `InvalidUri` at the boundary.
enum ParseIssue {
    EmptyHost,
    Protocol(EkpError),
}

impl RestUrl {
    /// Parse `url`, enforcing the secure-only policy unless `allow_insecure`
    /// is set.
    pub fn parse(url: &str, allow_insecure: bool) -> Result<Self, EkpError> {
        match Self::parse_inner(url, allow_insecure) {
            Ok(parsed) => {
                debug!(
                    url,
                    host = %parsed.host,
                    service = %parsed.service,
                    resource = %parsed.resource,
                    query = %parsed.query,
                    scheme = parsed.kind.scheme(),
                    "parsed KMS endpoint URL"
                );
                Ok(parsed)
            }
            // Unsupported protocols surface as-is; everything else collapses
            // to InvalidUri.
            Err(ParseIssue::Protocol(e)) => Err(e),
            Err(ParseIssue::EmptyHost) => {
                warn!(url, "failed to parse KMS endpoint URL");
                Err(EkpError::InvalidUri)
            }
        }
    }

    /// Parse with an attached request body.
    pub fn parse_with_body(
        url: &str,
        body: impl Into<String>,
        allow_insecure: bool,
    ) -> Result<Self, EkpError> {
        let mut parsed = Self::parse(url, allow_insecure)?;
        parsed.body = Some(body.into());
        Ok(parsed)
    }

    fn parse_inner(url: &str, allow_insecure: bool) -> Result<Self, ParseIssue> {
        // A missing "://" leaves the whole input as the protocol name, which
        // then fails the protocol lookup.
        let (protocol, remainder) = url.split_once("://").unwrap_or((url, ""));
        let kind = ConnectionKind::from_protocol(&protocol.to_lowercase())
            .map_err(ParseIssue::Protocol)?;
        if !kind.is_secure() && !allow_insecure {
            warn!(protocol, "insecure KMS connections are not enabled");
            return Err(ParseIssue::Protocol(EkpError::UnsupportedProtocol));
        }

        // Split host+service from resource/query on the first '/' or '?'.
        let (host_service, resource, query) =
            match remainder.find(|c| c == '/' || c == '?') {
                Some(idx) if remainder.as_bytes()[idx] == b'/' => {
                    let (head, tail) = (&remainder[..idx], &remainder[idx + 1..]);
                    let (resource, query) = tail.split_once('?').unwrap_or((tail, ""));
                    (head, resource, query)
                }
                Some(idx) => (&remainder[..idx], "", &remainder[idx + 1..]),
                None => (remainder, "", ""),
            };

        let (host, service) = host_service.split_once(':').unwrap_or((host_service, ""));
        if host.is_empty() {
            return Err(ParseIssue::EmptyHost);
        }

        Ok(Self {
            kind,
            host: host.to_owned(),
            service: service.to_owned(),
            resource: resource.to_owned(),
            query: query.to_owned(),
            body: None,
        })
    }

    /// Re-serialise the parsed fields into canonical URL form.
    pub fn canonical(&self) -> String {
        let mut out = format!("{}://{}", self.kind.scheme(), self.host);
        if !self.service.is_empty() {
            out.push(':');
            out.push_str(&self.service);
        }
        out.push('/');
        out.push_str(&self.resource);
        if !self.query.is_empty() {
            out.push('?');
            out.push_str(&self.query);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_uri_with_service() {
        let url = RestUrl::parse("https://host:80/foo/bar", false).unwrap();
        assert!(url.kind.is_secure());
        assert_eq!(url.host, "host");
        assert_eq!(url.service, "80");
        assert_eq!(url.resource, "foo/bar");
        assert_eq!(url.query, "");
    }

    #[test]
    fn valid_uri_without_service() {
        let url = RestUrl::parse("https://host/foo/bar", false).unwrap();
        assert_eq!(url.host, "host");
        assert!(url.service.is_empty());
        assert_eq!(url.resource, "foo/bar");
    }

    #[test]
    fn valid_uri_with_params() {
        let url = RestUrl::parse("https://host/foo/bar?p1,p2", false).unwrap();
        assert!(url.kind.is_secure());
        assert_eq!(url.host, "host");
        assert!(url.service.is_empty());
        assert_eq!(url.resource, "foo/bar");
        assert_eq!(url.query, "p1,p2");
    }

    #[test]
    fn unknown_protocol_is_unsupported() {
        assert_eq!(
            RestUrl::parse("httpx://foo/bar", false).unwrap_err(),
            EkpError::UnsupportedProtocol
        );
    }

    #[test]
    fn missing_separator_is_unsupported_protocol() {
        assert_eq!(
            RestUrl::parse("https:/host/foo", false).unwrap_err(),
            EkpError::UnsupportedProtocol
        );
    }

    #[test]
    fn missing_host_is_invalid_uri() {
        assert_eq!(
            RestUrl::parse("https://:/bar", false).unwrap_err(),
            EkpError::InvalidUri
        );
    }

    #[test]
    fn insecure_requires_knob() {
        assert_eq!(
            RestUrl::parse("http://host/foo", false).unwrap_err(),
            EkpError::UnsupportedProtocol
        );
        let url = RestUrl::parse("http://host/foo/bar?p1,p2", true).unwrap();
        assert!(!url.kind.is_secure());
        assert_eq!(url.host, "host");
        assert_eq!(url.resource, "foo/bar");
        assert_eq!(url.query, "p1,p2");
    }

    #[test]
    fn protocol_is_case_insensitive() {
        let url = RestUrl::parse("HTTPS://host/foo", false).unwrap();
        assert!(url.kind.is_secure());
    }

    #[test]
    fn query_without_resource() {
        let url = RestUrl::parse("https://host?p1", false).unwrap();
        assert_eq!(url.host, "host");
        assert_eq!(url.resource, "");
        assert_eq!(url.query, "p1");
    }

    #[test]
    fn canonical_round_trip() {
        for raw in [
            "https://host:80/foo/bar",
            "https://host/foo/bar?p1,p2",
            "https://host/",
        ] {
            let parsed = RestUrl::parse(raw, false).unwrap();
            let reparsed = RestUrl::parse(&parsed.canonical(), false).unwrap();
            assert_eq!(parsed, reparsed, "round trip differs for {raw}");
        }
    }

    #[test]
    fn body_is_attached() {
        let url = RestUrl::parse_with_body("https://host/v1", "{}", false).unwrap();
        assert_eq!(url.body.as_deref(), Some("{}"));
    }
}
