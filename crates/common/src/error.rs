//! Common error types shared across crates.

use thiserror::Error;

/// Top-level proxy error type.
///
/// Two orthogonal classifications drive control flow:
/// - [`EkpError::can_reply_with`]: errors packaged into the caller's reply
///   instead of propagating; the caller decides whether a stale non-revocable
///   key may still be used.
/// - [`EkpError::is_retryable`]: errors eligible for another attempt inside
///   the KMS backoff wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EkpError {
    /// A requested `(domainId, baseCipherId)` tuple is unknown to the KMS.
    #[error("encryption key not found")]
    EncryptKeyNotFound,

    /// The KMS lookup completed but the result is unusable: bad status,
    /// malformed payload, or a returned key that matches no requested tuple.
    #[error("encryption keys fetch failed")]
    EncryptKeysFetchFailed,

    /// A KMS request exceeded its deadline.
    #[error("request timed out")]
    TimedOut,

    /// The transport to the KMS could not be established or broke mid-flight.
    #[error("connection failed")]
    ConnectionFailed,

    /// The KMS endpoint URL names a protocol outside the supported set, or an
    /// insecure protocol while insecure connections are disabled.
    #[error("unsupported protocol")]
    UnsupportedProtocol,

    /// The KMS endpoint URL could not be parsed.
    #[error("invalid URI")]
    InvalidUri,

    /// A connection was returned for a `(host, service)` pair the pool has
    /// never seen.
    #[error("connection pool key not found")]
    PoolKeyNotFound,

    /// A REST client knob override names an unknown knob.
    #[error("invalid REST client knob: {0}")]
    InvalidKnob(String),

    /// The configured KMS connector type has no implementation.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EkpError {
    /// Whether this error may be packaged into the client's reply rather than
    /// tearing down the handler.
    ///
    /// The proxy <-> KMS path may observe transient issues; callers should
    /// consider reusing cached non-revocable keys iff only these errors led
    /// to the refresh failure.
    pub fn can_reply_with(&self) -> bool {
        matches!(
            self,
            EkpError::EncryptKeyNotFound
                | EkpError::EncryptKeysFetchFailed
                | EkpError::TimedOut
                | EkpError::ConnectionFailed
        )
    }

    /// Whether the KMS backoff wrapper may re-attempt after this error.
    ///
    /// Narrower than [`can_reply_with`](Self::can_reply_with): a key the KMS
    /// does not know about will not appear on a retry, so `EncryptKeyNotFound`
    /// is surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EkpError::EncryptKeysFetchFailed | EkpError::TimedOut | EkpError::ConnectionFailed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replyable_set() {
        assert!(EkpError::EncryptKeyNotFound.can_reply_with());
        assert!(EkpError::EncryptKeysFetchFailed.can_reply_with());
        assert!(EkpError::TimedOut.can_reply_with());
        assert!(EkpError::ConnectionFailed.can_reply_with());
        assert!(!EkpError::InvalidUri.can_reply_with());
        assert!(!EkpError::NotImplemented("x".into()).can_reply_with());
    }

    #[test]
    fn key_not_found_is_replyable_but_not_retryable() {
        assert!(EkpError::EncryptKeyNotFound.can_reply_with());
        assert!(!EkpError::EncryptKeyNotFound.is_retryable());
    }

    #[test]
    fn retryable_is_subset_of_replyable() {
        let all = [
            EkpError::EncryptKeyNotFound,
            EkpError::EncryptKeysFetchFailed,
            EkpError::TimedOut,
            EkpError::ConnectionFailed,
            EkpError::UnsupportedProtocol,
            EkpError::InvalidUri,
            EkpError::PoolKeyNotFound,
            EkpError::Internal("x".into()),
        ];
        for e in all {
            if e.is_retryable() {
                assert!(e.can_reply_with(), "{e} retryable but not replyable");
            }
        }
    }

    #[test]
    fn display_includes_knob_name() {
        let e = EkpError::InvalidKnob("max_sockets".into());
        assert!(e.to_string().contains("max_sockets"));
    }
}
