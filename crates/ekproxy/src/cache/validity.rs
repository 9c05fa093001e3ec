//! Turns optional refresh/expiry hints from the KMS into absolute validity
//! timestamps.
//!
//! Sentinels:
//! - hint `< 0`  => never (timestamp pinned to `i64::MAX`)
//! - hint `== 0` or absent => refresh falls back to the default TTL; expiry
//!   falls back to the refresh timestamp

/// Absolute validity window for one cached cipher key, unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityTs {
    /// Timestamp after which the key is eligible for proactive KMS refresh.
    pub refresh_at: i64,
    /// Timestamp after which the key must be considered expired.
    pub expire_at: i64,
}

/// Sentinel for keys that are never refreshed (by-id entries) or never expire
/// (non-revocable keys).
pub const NEVER: i64 = i64::MAX;

fn compute_refresh_at(refresh_after_sec: Option<i64>, curr_ts: i64, default_ttl: i64) -> i64 {
    let refresh_at = match refresh_after_sec {
        // Never refresh the cipher key
        Some(interval) if interval < 0 => NEVER,
        Some(interval) if interval > 0 => curr_ts + interval,
        // Fall back to the default TTL if not specified
        _ => curr_ts + default_ttl,
    };
    debug_assert!(refresh_at > 0);
    refresh_at
}

fn compute_expire_at(expire_after_sec: Option<i64>, curr_ts: i64, refresh_at: i64) -> i64 {
    debug_assert!(refresh_at > 0);
    let expire_at = match expire_after_sec {
        // Non-revocable cipher key, never expires
        Some(interval) if interval < 0 => NEVER,
        Some(interval) if interval > 0 => curr_ts + interval,
        // None supplied, match expiry to the refresh timestamp
        _ => refresh_at,
    };
    debug_assert!(expire_at > 0);
    expire_at
}

/// Compute the absolute validity window for a cipher key from the KMS hints.
///
/// Post-conditions: both outputs are strictly positive; when both hints are
/// absent, `refresh_at == expire_at == curr_ts + default_ttl`.
pub fn cipher_key_validity(
    refresh_after_sec: Option<i64>,
    expire_after_sec: Option<i64>,
    curr_ts: i64,
    default_ttl: i64,
) -> ValidityTs {
    let refresh_at = compute_refresh_at(refresh_after_sec, curr_ts, default_ttl);
    let expire_at = compute_expire_at(expire_after_sec, curr_ts, refresh_at);
    ValidityTs {
        refresh_at,
        expire_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_000_000;
    const TTL: i64 = 600;

    #[test]
    fn both_hints_present() {
        let v = cipher_key_validity(Some(60), Some(120), NOW, TTL);
        assert_eq!(v.refresh_at, NOW + 60);
        assert_eq!(v.expire_at, NOW + 120);
    }

    #[test]
    fn negative_hints_mean_never() {
        let v = cipher_key_validity(Some(-1), Some(-1), NOW, TTL);
        assert_eq!(v.refresh_at, NEVER);
        assert_eq!(v.expire_at, NEVER);
    }

    #[test]
    fn absent_hints_fall_back_to_default_ttl() {
        let v = cipher_key_validity(None, None, NOW, TTL);
        assert_eq!(v.refresh_at, NOW + TTL);
        assert_eq!(v.expire_at, NOW + TTL);
    }

    #[test]
    fn zero_hints_behave_like_absent() {
        let v = cipher_key_validity(Some(0), Some(0), NOW, TTL);
        assert_eq!(v.refresh_at, NOW + TTL);
        assert_eq!(v.expire_at, v.refresh_at);
    }

    #[test]
    fn absent_expiry_matches_refresh() {
        let v = cipher_key_validity(Some(45), None, NOW, TTL);
        assert_eq!(v.refresh_at, NOW + 45);
        assert_eq!(v.expire_at, NOW + 45);
    }

    #[test]
    fn never_refresh_with_finite_expiry() {
        // Shape used by the by-id flow: rotation does not apply, but the
        // KMS-governed lifetime still does.
        let v = cipher_key_validity(Some(-1), Some(300), NOW, TTL);
        assert_eq!(v.refresh_at, NEVER);
        assert_eq!(v.expire_at, NOW + 300);
    }
}
