//! In-memory caches for base cipher keys and blob metadata.
//!
//! Three maps with distinct validity rules:
//! - latest-per-domain cipher keys, eligible for proactive refresh;
//! - per-`(domain, baseCipherId)` cipher keys, never refreshed (a specific
//!   key is immutable) but still bounded by the KMS-governed expiry;
//! - per-blob-domain credential metadata, bounded by both a local cache TTL
//!   and the KMS-assigned expiry.
//!
//! Entries are created on successful KMS fetches, overwritten in place by
//! fresher material, and destroyed only by the refresher sweeps. The read
//! path skips invalid entries but never removes them.

pub mod validity;

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;

use common::protocol::{
    BaseCipherKeyId, BlobDomainId, BlobMetadataDetails, EncryptDomainId, KeyMaterial,
};

use validity::NEVER;

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// One cached base cipher key.
#[derive(Debug, Clone)]
pub struct CipherKeyEntry {
    pub domain_id: EncryptDomainId,
    pub base_cipher_id: BaseCipherKeyId,
    pub base_cipher_key: KeyMaterial,
    /// Timestamp after which the entry is eligible for KMS refresh.
    pub refresh_at: i64,
    /// Timestamp after which the entry should be considered expired.
    ///
    /// Non-revocable keys carry [`NEVER`] here and may be reused by callers
    /// across transient KMS outages; revocable keys have a finite expiry.
    pub expire_at: i64,
}

impl CipherKeyEntry {
    pub fn is_valid(&self, curr_ts: i64) -> bool {
        self.expire_at > curr_ts && self.refresh_at > curr_ts
    }

    pub fn is_expired(&self, curr_ts: i64) -> bool {
        curr_ts > self.expire_at
    }
}

/// One cached blob-metadata record, stamped with its insertion time.
#[derive(Debug, Clone)]
pub struct BlobMetadataEntry {
    pub details: BlobMetadataDetails,
    pub created_at: i64,
}

impl BlobMetadataEntry {
    /// Valid iff within the local cache TTL and the KMS-assigned expiry.
    pub fn is_valid(&self, curr_ts: i64, cache_ttl: i64) -> bool {
        (curr_ts - self.created_at) < cache_ttl && curr_ts <= self.details.expire_at
    }
}

/// The proxy's cache set. Shared across request handlers and refreshers.
#[derive(Debug, Default)]
pub struct EkpCaches {
    latest: RwLock<HashMap<EncryptDomainId, CipherKeyEntry>>,
    by_id: RwLock<HashMap<(EncryptDomainId, BaseCipherKeyId), CipherKeyEntry>>,
    blob_metadata: RwLock<HashMap<BlobDomainId, BlobMetadataEntry>>,
}

impl EkpCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a valid latest-key entry for `domain_id`.
    pub fn lookup_latest(&self, domain_id: EncryptDomainId, curr_ts: i64) -> Option<CipherKeyEntry> {
        let latest = self.latest.read().unwrap();
        latest
            .get(&domain_id)
            .filter(|e| e.is_valid(curr_ts))
            .cloned()
    }

    /// Look up a valid by-id entry for `(domain_id, base_cipher_id)`.
    pub fn lookup_by_id(
        &self,
        domain_id: EncryptDomainId,
        base_cipher_id: BaseCipherKeyId,
        curr_ts: i64,
    ) -> Option<CipherKeyEntry> {
        let by_id = self.by_id.read().unwrap();
        by_id
            .get(&(domain_id, base_cipher_id))
            .filter(|e| e.is_valid(curr_ts))
            .cloned()
    }

    /// Insert the latest key for a domain.
    ///
    /// The same material is also recorded in the by-id cache: the fresh key
    /// is both "latest for the domain" and "the specific key". The by-id
    /// copy never refreshes but keeps the KMS-governed expiry.
    pub fn insert_latest(
        &self,
        domain_id: EncryptDomainId,
        base_cipher_id: BaseCipherKeyId,
        base_cipher_key: KeyMaterial,
        refresh_at: i64,
        expire_at: i64,
    ) {
        {
            let mut latest = self.latest.write().unwrap();
            latest.insert(
                domain_id,
                CipherKeyEntry {
                    domain_id,
                    base_cipher_id,
                    base_cipher_key: base_cipher_key.clone(),
                    refresh_at,
                    expire_at,
                },
            );
        }
        self.insert_by_id(domain_id, base_cipher_id, base_cipher_key, NEVER, expire_at);
    }

    /// Insert a by-id entry. Overwrites any previous entry for the tuple.
    pub fn insert_by_id(
        &self,
        domain_id: EncryptDomainId,
        base_cipher_id: BaseCipherKeyId,
        base_cipher_key: KeyMaterial,
        refresh_at: i64,
        expire_at: i64,
    ) {
        let mut by_id = self.by_id.write().unwrap();
        by_id.insert(
            (domain_id, base_cipher_id),
            CipherKeyEntry {
                domain_id,
                base_cipher_id,
                base_cipher_key,
                refresh_at,
                expire_at,
            },
        );
    }

    /// Whether the latest cache currently holds an entry for `domain_id`,
    /// valid or not.
    pub fn contains_latest(&self, domain_id: EncryptDomainId) -> bool {
        self.latest.read().unwrap().contains_key(&domain_id)
    }

    /// Look up valid blob metadata for `domain_id`.
    pub fn lookup_blob_metadata(
        &self,
        domain_id: BlobDomainId,
        curr_ts: i64,
        cache_ttl: i64,
    ) -> Option<BlobMetadataDetails> {
        let blob = self.blob_metadata.read().unwrap();
        blob.get(&domain_id)
            .filter(|e| e.is_valid(curr_ts, cache_ttl))
            .map(|e| e.details.clone())
    }

    /// Insert blob metadata, stamping the entry with the current time.
    pub fn insert_blob_metadata(&self, details: BlobMetadataDetails, curr_ts: i64) {
        let mut blob = self.blob_metadata.write().unwrap();
        blob.insert(
            details.domain_id,
            BlobMetadataEntry {
                details,
                created_at: curr_ts,
            },
        );
    }

    /// Single-pass refresher sweep over the latest cache: collect the domain
    /// ids of entries `eligible` selects, and erase entries already expired.
    pub fn sweep_latest<F>(&self, curr_ts: i64, mut eligible: F) -> Vec<EncryptDomainId>
    where
        F: FnMut(&CipherKeyEntry) -> bool,
    {
        let mut latest = self.latest.write().unwrap();
        let mut refresh_ids = Vec::new();
        latest.retain(|domain_id, entry| {
            if eligible(entry) {
                refresh_ids.push(*domain_id);
            }
            !entry.is_expired(curr_ts)
        });
        refresh_ids
    }

    /// Single-pass refresher sweep over the blob metadata cache, analogous to
    /// [`sweep_latest`](Self::sweep_latest).
    pub fn sweep_blob_metadata<F>(&self, curr_ts: i64, mut eligible: F) -> Vec<BlobDomainId>
    where
        F: FnMut(&BlobMetadataEntry) -> bool,
    {
        let mut blob = self.blob_metadata.write().unwrap();
        let mut refresh_ids = Vec::new();
        blob.retain(|domain_id, entry| {
            if eligible(entry) {
                refresh_ids.push(*domain_id);
            }
            entry.details.expire_at >= curr_ts
        });
        refresh_ids
    }

    #[cfg(test)]
    pub fn latest_len(&self) -> usize {
        self.latest.read().unwrap().len()
    }

    #[cfg(test)]
    pub fn by_id_len(&self) -> usize {
        self.by_id.read().unwrap().len()
    }

    #[cfg(test)]
    pub fn blob_metadata_len(&self) -> usize {
        self.blob_metadata.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_000_000;

    fn key(byte: u8) -> KeyMaterial {
        KeyMaterial::new(vec![byte; 32])
    }

    #[test]
    fn latest_insert_populates_both_caches() {
        let caches = EkpCaches::new();
        caches.insert_latest(1, 100, key(1), NOW + 60, NOW + 120);

        let latest = caches.lookup_latest(1, NOW).unwrap();
        assert_eq!(latest.base_cipher_id, 100);
        assert_eq!(latest.refresh_at, NOW + 60);

        let by_id = caches.lookup_by_id(1, 100, NOW).unwrap();
        assert_eq!(by_id.refresh_at, NEVER, "by-id entries never refresh");
        assert_eq!(by_id.expire_at, NOW + 120, "expiry still honored");
    }

    #[test]
    fn lookup_skips_invalid_but_retains_entry() {
        let caches = EkpCaches::new();
        caches.insert_latest(1, 100, key(1), NOW - 10, NOW + 120);

        // Past refresh_at: not served, but not removed either.
        assert!(caches.lookup_latest(1, NOW).is_none());
        assert_eq!(caches.latest_len(), 1);
    }

    #[test]
    fn insert_is_idempotent_overwrite() {
        let caches = EkpCaches::new();
        caches.insert_latest(1, 100, key(1), NOW + 60, NOW + 120);
        caches.insert_latest(1, 100, key(1), NOW + 60, NOW + 120);
        assert_eq!(caches.latest_len(), 1);
        assert_eq!(caches.by_id_len(), 1);

        // A fresher key for the same domain replaces the latest entry and
        // adds a second by-id entry.
        caches.insert_latest(1, 101, key(2), NOW + 90, NOW + 240);
        assert_eq!(caches.latest_len(), 1);
        assert_eq!(caches.by_id_len(), 2);
        assert_eq!(caches.lookup_latest(1, NOW).unwrap().base_cipher_id, 101);
    }

    #[test]
    fn sweep_latest_erases_expired_and_collects_eligible() {
        let caches = EkpCaches::new();
        caches.insert_latest(1, 100, key(1), NOW + 600, NOW + 600); // healthy
        caches.insert_latest(2, 200, key(2), NOW + 30, NOW + 600); // needs refresh soon
        caches.insert_latest(3, 300, key(3), NOW - 120, NOW - 60); // expired

        let interval = 60;
        let mut ids = caches.sweep_latest(NOW, |e| {
            let next_cycle = NOW + interval;
            next_cycle > e.expire_at || next_cycle > e.refresh_at
        });
        ids.sort_unstable();

        assert_eq!(ids, vec![2, 3], "expiring and expired entries collected");
        assert_eq!(caches.latest_len(), 2, "expired entry erased");
        assert!(!caches.contains_latest(3));
    }

    #[test]
    fn blob_metadata_double_ttl() {
        let caches = EkpCaches::new();
        let details = BlobMetadataDetails {
            domain_id: 9,
            locations: vec![],
            refresh_at: NOW + 300,
            expire_at: NOW + 50,
        };
        caches.insert_blob_metadata(details, NOW);

        let cache_ttl = 600;
        assert!(caches.lookup_blob_metadata(9, NOW, cache_ttl).is_some());
        // KMS expiry passes before the local TTL does.
        assert!(caches.lookup_blob_metadata(9, NOW + 51, cache_ttl).is_none());
        // Local TTL passes even though the KMS expiry is far out.
        let long_lived = BlobMetadataDetails {
            domain_id: 10,
            locations: vec![],
            refresh_at: NOW + 300,
            expire_at: NEVER,
        };
        caches.insert_blob_metadata(long_lived, NOW);
        assert!(caches.lookup_blob_metadata(10, NOW + 601, cache_ttl).is_none());
    }

    #[test]
    fn sweep_blob_metadata_erases_expired() {
        let caches = EkpCaches::new();
        for (domain, expire_at) in [(1, NOW + 600), (2, NOW - 1)] {
            caches.insert_blob_metadata(
                BlobMetadataDetails {
                    domain_id: domain,
                    locations: vec![],
                    refresh_at: NOW,
                    expire_at,
                },
                NOW,
            );
        }
        let ids = caches.sweep_blob_metadata(NOW, |_| false);
        assert!(ids.is_empty());
        assert_eq!(caches.blob_metadata_len(), 1, "expired entry erased");
    }
}
