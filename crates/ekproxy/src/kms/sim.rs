//! Simulated KMS connector.
//!
//! Serves randomly generated key material from process memory. Used in
//! simulation, tests, and performance runs where a real KMS would dominate
//! the measurement. Keys are stable per domain until rotated; every key ever
//! issued remains resolvable by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rand::RngCore;

use common::protocol::{BaseCipherKeyId, EncryptDomainId, KeyMaterial};
use common::protocol::{BlobMetadataDetails, BlobMetadataLocation};
use common::EkpError;

use crate::cache::unix_now;
use crate::cache::validity::NEVER;

use super::{
    KmsBlobMetadataReply, KmsBlobMetadataRequest, KmsCipherKeyDetails, KmsConnector,
    KmsLookupByDomainIdsRequest, KmsLookupByIdsRequest, KmsLookupKeysReply,
};

const SIM_KEY_LEN: usize = 32;
const SIM_BLOB_REFRESH_SECS: i64 = 3600;
const SIM_BLOB_EXPIRE_SECS: i64 = 2 * 3600;

#[derive(Debug, Default)]
struct SimDomainState {
    current_id: BaseCipherKeyId,
    keys: HashMap<BaseCipherKeyId, KeyMaterial>,
}

#[derive(Debug, Default)]
struct SimState {
    domains: HashMap<EncryptDomainId, SimDomainState>,
    next_base_cipher_id: BaseCipherKeyId,
}

/// In-memory KMS stand-in.
pub struct SimKmsConnector {
    connector_type: &'static str,
    state: Mutex<SimState>,
    /// Lifetime hints attached to every returned key; `None` omits the hint.
    refresh_after_sec: Option<i64>,
    expire_after_sec: Option<i64>,
    /// When set, every lookup fails with this error.
    inject_error: Mutex<Option<EkpError>>,
    lookups_by_ids: AtomicU64,
    lookups_by_domain_ids: AtomicU64,
    blob_lookups: AtomicU64,
}

impl SimKmsConnector {
    pub fn new(connector_type: &'static str) -> Self {
        Self {
            connector_type,
            state: Mutex::new(SimState {
                domains: HashMap::new(),
                next_base_cipher_id: 1,
            }),
            refresh_after_sec: None,
            expire_after_sec: None,
            inject_error: Mutex::new(None),
            lookups_by_ids: AtomicU64::new(0),
            lookups_by_domain_ids: AtomicU64::new(0),
            blob_lookups: AtomicU64::new(0),
        }
    }

    /// Attach a refresh hint to every returned key.
    pub fn with_refresh_after_sec(mut self, secs: i64) -> Self {
        self.refresh_after_sec = Some(secs);
        self
    }

    /// Attach an expiry hint to every returned key.
    pub fn with_expire_after_sec(mut self, secs: i64) -> Self {
        self.expire_after_sec = Some(secs);
        self
    }

    /// Rotate the latest key of `domain_id`; older keys stay resolvable by id.
    pub fn rotate_domain(&self, domain_id: EncryptDomainId) {
        let mut state = self.state.lock().unwrap();
        let next_id = state.next_base_cipher_id;
        state.next_base_cipher_id += 1;
        let domain = state.domains.entry(domain_id).or_default();
        domain.current_id = next_id;
        domain.keys.insert(next_id, generate_key());
    }

    /// Fail every subsequent lookup with `error`; `None` restores service.
    pub fn inject_error(&self, error: Option<EkpError>) {
        *self.inject_error.lock().unwrap() = error;
    }

    /// Total lookup calls served, across all three operations.
    pub fn lookup_count(&self) -> u64 {
        self.lookups_by_ids.load(Ordering::Relaxed)
            + self.lookups_by_domain_ids.load(Ordering::Relaxed)
            + self.blob_lookups.load(Ordering::Relaxed)
    }

    pub fn lookups_by_domain_ids(&self) -> u64 {
        self.lookups_by_domain_ids.load(Ordering::Relaxed)
    }

    pub fn lookups_by_ids(&self) -> u64 {
        self.lookups_by_ids.load(Ordering::Relaxed)
    }

    fn check_injected(&self) -> Result<(), EkpError> {
        match self.inject_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn details(
        &self,
        domain_id: EncryptDomainId,
        base_cipher_id: BaseCipherKeyId,
        key: KeyMaterial,
    ) -> KmsCipherKeyDetails {
        KmsCipherKeyDetails {
            domain_id,
            base_cipher_id,
            base_cipher_key: key,
            refresh_after_sec: self.refresh_after_sec,
            expire_after_sec: self.expire_after_sec,
        }
    }
}

fn generate_key() -> KeyMaterial {
    let mut bytes = vec![0u8; SIM_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    KeyMaterial::new(bytes)
}

/// Absolute timestamp for a KMS-assigned blob lifetime: negative hints mean
/// never.
fn blob_ts(curr_ts: i64, secs: i64) -> i64 {
    if secs < 0 {
        NEVER
    } else {
        curr_ts + secs
    }
}

#[async_trait]
impl KmsConnector for SimKmsConnector {
    fn connector_type(&self) -> &str {
        self.connector_type
    }

    async fn lookup_keys_by_ids(
        &self,
        req: KmsLookupByIdsRequest,
    ) -> Result<KmsLookupKeysReply, EkpError> {
        self.lookups_by_ids.fetch_add(1, Ordering::Relaxed);
        self.check_injected()?;

        let state = self.state.lock().unwrap();
        let mut reply = KmsLookupKeysReply::default();
        for info in &req.cipher_key_infos {
            let key = state
                .domains
                .get(&info.domain_id)
                .and_then(|d| d.keys.get(&info.base_cipher_id))
                .ok_or(EkpError::EncryptKeyNotFound)?;
            reply
                .cipher_key_details
                .push(self.details(info.domain_id, info.base_cipher_id, key.clone()));
        }
        Ok(reply)
    }

    async fn lookup_keys_by_domain_ids(
        &self,
        req: KmsLookupByDomainIdsRequest,
    ) -> Result<KmsLookupKeysReply, EkpError> {
        self.lookups_by_domain_ids.fetch_add(1, Ordering::Relaxed);
        self.check_injected()?;

        let mut state = self.state.lock().unwrap();
        let mut reply = KmsLookupKeysReply::default();
        for &domain_id in &req.domain_ids {
            if !state.domains.contains_key(&domain_id) {
                let next_id = state.next_base_cipher_id;
                state.next_base_cipher_id += 1;
                let domain = state.domains.entry(domain_id).or_default();
                domain.current_id = next_id;
                domain.keys.insert(next_id, generate_key());
            }
            let domain = &state.domains[&domain_id];
            let key = domain.keys[&domain.current_id].clone();
            reply
                .cipher_key_details
                .push(self.details(domain_id, domain.current_id, key));
        }
        Ok(reply)
    }

    async fn blob_metadata(
        &self,
        req: KmsBlobMetadataRequest,
    ) -> Result<KmsBlobMetadataReply, EkpError> {
        self.blob_lookups.fetch_add(1, Ordering::Relaxed);
        self.check_injected()?;

        let curr_ts = unix_now();
        let mut reply = KmsBlobMetadataReply::default();
        for &domain_id in &req.domain_ids {
            reply.metadata_details.push(BlobMetadataDetails {
                domain_id,
                locations: vec![BlobMetadataLocation {
                    location_id: domain_id,
                    path: format!("blobstore://sim/{domain_id}/"),
                }],
                refresh_at: blob_ts(curr_ts, self.refresh_after_sec.unwrap_or(SIM_BLOB_REFRESH_SECS)),
                expire_at: blob_ts(curr_ts, self.expire_after_sec.unwrap_or(SIM_BLOB_EXPIRE_SECS)),
            });
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::KmsCipherKeyInfo;

    #[tokio::test]
    async fn domain_lookup_is_stable_until_rotation() {
        let sim = SimKmsConnector::new("sim");
        let req = KmsLookupByDomainIdsRequest {
            debug_id: None,
            domain_ids: vec![1],
        };
        let first = sim.lookup_keys_by_domain_ids(req.clone()).await.unwrap();
        let second = sim.lookup_keys_by_domain_ids(req.clone()).await.unwrap();
        assert_eq!(
            first.cipher_key_details[0].base_cipher_id,
            second.cipher_key_details[0].base_cipher_id
        );

        sim.rotate_domain(1);
        let third = sim.lookup_keys_by_domain_ids(req).await.unwrap();
        assert_ne!(
            first.cipher_key_details[0].base_cipher_id,
            third.cipher_key_details[0].base_cipher_id
        );
    }

    #[tokio::test]
    async fn old_keys_stay_resolvable_by_id() {
        let sim = SimKmsConnector::new("sim");
        let latest = sim
            .lookup_keys_by_domain_ids(KmsLookupByDomainIdsRequest {
                debug_id: None,
                domain_ids: vec![5],
            })
            .await
            .unwrap();
        let old_id = latest.cipher_key_details[0].base_cipher_id;
        sim.rotate_domain(5);

        let by_id = sim
            .lookup_keys_by_ids(KmsLookupByIdsRequest {
                debug_id: None,
                cipher_key_infos: vec![KmsCipherKeyInfo {
                    domain_id: 5,
                    base_cipher_id: old_id,
                }],
            })
            .await
            .unwrap();
        assert_eq!(by_id.cipher_key_details[0].base_cipher_id, old_id);
    }

    #[tokio::test]
    async fn unknown_id_is_key_not_found() {
        let sim = SimKmsConnector::new("sim");
        let err = sim
            .lookup_keys_by_ids(KmsLookupByIdsRequest {
                debug_id: None,
                cipher_key_infos: vec![KmsCipherKeyInfo {
                    domain_id: 1,
                    base_cipher_id: 999,
                }],
            })
            .await
            .unwrap_err();
        assert_eq!(err, EkpError::EncryptKeyNotFound);
    }

    #[tokio::test]
    async fn injected_error_fails_lookups() {
        let sim = SimKmsConnector::new("sim");
        sim.inject_error(Some(EkpError::TimedOut));
        let err = sim
            .lookup_keys_by_domain_ids(KmsLookupByDomainIdsRequest {
                debug_id: None,
                domain_ids: vec![1],
            })
            .await
            .unwrap_err();
        assert_eq!(err, EkpError::TimedOut);

        sim.inject_error(None);
        assert!(sim
            .lookup_keys_by_domain_ids(KmsLookupByDomainIdsRequest {
                debug_id: None,
                domain_ids: vec![1],
            })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn blob_metadata_carries_lifetimes() {
        let sim = SimKmsConnector::new("sim").with_expire_after_sec(-1);
        let reply = sim
            .blob_metadata(KmsBlobMetadataRequest {
                debug_id: None,
                domain_ids: vec![3],
            })
            .await
            .unwrap();
        let details = &reply.metadata_details[0];
        assert_eq!(details.domain_id, 3);
        assert_eq!(details.expire_at, NEVER);
        assert!(!details.locations.is_empty());
    }
}
