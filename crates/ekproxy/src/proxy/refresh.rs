//! Recurring refresh of cached cipher keys and blob metadata.
//!
//! Each sweep walks its cache once: entries that will expire or need refresh
//! before the next sweep are collected for a batched KMS lookup, and entries
//! already expired are erased. Replyable KMS errors are swallowed (the next
//! cycle retries); anything else propagates and tears the refresher down for
//! operator visibility.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use common::protocol::BlobMetadataDetails;
use common::EkpError;

use crate::buggify::buggify_with_prob;
use crate::cache::validity::cipher_key_validity;
use crate::cache::{unix_now, CipherKeyEntry};
use crate::kms::{
    kms_request_with_backoff, KmsBlobMetadataRequest, KmsConnector, KmsLookupByDomainIdsRequest,
};

use super::state::ProxyData;

/// Eligible iff the entry is expired or refresh-due now, or will be before
/// the next sweep fires (proactive refresh).
fn cipher_key_eligible_for_refresh(
    entry: &CipherKeyEntry,
    curr_ts: i64,
    refresh_interval: i64,
) -> bool {
    if buggify_with_prob(0.01) {
        return true;
    }
    let next_cycle_ts = curr_ts + refresh_interval;
    next_cycle_ts > entry.expire_at || next_cycle_ts > entry.refresh_at
}

fn blob_metadata_eligible_for_refresh(
    details: &BlobMetadataDetails,
    curr_ts: i64,
    refresh_interval: i64,
) -> bool {
    if buggify_with_prob(0.01) {
        return true;
    }
    let next_cycle_ts = curr_ts + refresh_interval;
    next_cycle_ts > details.expire_at || next_cycle_ts > details.refresh_at
}

/// One cipher key refresh sweep.
pub async fn refresh_encryption_keys(
    data: &ProxyData,
    kms: &dyn KmsConnector,
) -> Result<(), EkpError> {
    let debug_id = Uuid::new_v4();
    let curr_ts = unix_now();
    let refresh_interval = data.cfg.encrypt_key_refresh_interval;

    let domain_ids = data
        .caches
        .sweep_latest(curr_ts, |e| {
            cipher_key_eligible_for_refresh(e, curr_ts, refresh_interval)
        });
    debug!(
        proxy_id = %data.my_id,
        debug_id = %debug_id,
        n_candidates = domain_ids.len(),
        "cipher key refresh sweep"
    );
    if domain_ids.is_empty() {
        return Ok(());
    }

    let kms_req = KmsLookupByDomainIdsRequest {
        debug_id: Some(debug_id),
        domain_ids,
    };
    let result: Result<(), EkpError> = async {
        let start = Instant::now();
        let rep = kms_request_with_backoff(
            || kms.lookup_keys_by_domain_ids(kms_req.clone()),
            || {
                for &domain_id in &kms_req.domain_ids {
                    debug!(domain_id, "cipher key refresh retry");
                }
            },
            "refresh_encryption_keys",
            data.cfg.ekp_kms_connection_retries,
        )
        .await?;
        debug!(
            proxy_id = %data.my_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            n_keys = rep.cipher_key_details.len(),
            "cipher key refresh fetched"
        );

        let insert_ts = unix_now();
        let mut refreshed = 0u64;
        for item in rep.cipher_key_details {
            // Unlike the request handlers, a domain missing from the cache is
            // not an error: it may have been erased by this very sweep. The
            // next cycle picks it up again if anyone still cares.
            if !data.caches.contains_latest(item.domain_id) {
                info!(
                    proxy_id = %data.my_id,
                    domain_id = item.domain_id,
                    "refreshed domain no longer cached, skipping"
                );
                continue;
            }
            let validity = cipher_key_validity(
                item.refresh_after_sec,
                item.expire_after_sec,
                insert_ts,
                data.cfg.encrypt_cipher_key_cache_ttl,
            );
            data.caches.insert_latest(
                item.domain_id,
                item.base_cipher_id,
                item.base_cipher_key,
                validity.refresh_at,
                validity.expire_at,
            );
            refreshed += 1;
        }
        data.metrics
            .base_cipher_keys_refreshed
            .fetch_add(refreshed, Ordering::Relaxed);
        Ok(())
    }
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.can_reply_with() => {
            warn!(proxy_id = %data.my_id, error = %e, "cipher key refresh failed");
            data.metrics
                .num_encryption_key_refresh_errors
                .fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            error!(proxy_id = %data.my_id, error = %e, "cipher key refresh failed fatally");
            Err(e)
        }
    }
}

/// One blob metadata refresh sweep.
pub async fn refresh_blob_metadata(
    data: &ProxyData,
    kms: &dyn KmsConnector,
) -> Result<(), EkpError> {
    let debug_id = Uuid::new_v4();
    let curr_ts = unix_now();
    let refresh_interval = data.cfg.blob_metadata_refresh_interval;

    let domain_ids = data.caches.sweep_blob_metadata(curr_ts, |e| {
        blob_metadata_eligible_for_refresh(&e.details, curr_ts, refresh_interval)
    });
    debug!(
        proxy_id = %data.my_id,
        debug_id = %debug_id,
        n_candidates = domain_ids.len(),
        "blob metadata refresh sweep"
    );
    if domain_ids.is_empty() {
        return Ok(());
    }

    let kms_req = KmsBlobMetadataRequest {
        debug_id: Some(debug_id),
        domain_ids,
    };
    let result: Result<(), EkpError> = async {
        let start = Instant::now();
        let rep = kms_request_with_backoff(
            || kms.blob_metadata(kms_req.clone()),
            || {
                for &domain_id in &kms_req.domain_ids {
                    debug!(domain_id, "blob metadata refresh retry");
                }
            },
            "refresh_blob_metadata",
            data.cfg.ekp_kms_connection_retries,
        )
        .await?;
        debug!(
            proxy_id = %data.my_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            n_keys = rep.metadata_details.len(),
            "blob metadata refresh fetched"
        );

        let insert_ts = unix_now();
        let refreshed = rep.metadata_details.len() as u64;
        for details in rep.metadata_details {
            data.caches.insert_blob_metadata(details, insert_ts);
        }
        data.metrics
            .blob_metadata_refreshed
            .fetch_add(refreshed, Ordering::Relaxed);
        Ok(())
    }
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.can_reply_with() => {
            warn!(proxy_id = %data.my_id, error = %e, "blob metadata refresh failed");
            data.metrics
                .num_blob_metadata_refresh_errors
                .fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            error!(proxy_id = %data.my_id, error = %e, "blob metadata refresh failed fatally");
            Err(e)
        }
    }
}

/// Drift-free ticker: fires every `period_secs` on absolute boundaries, with
/// the first firing one full period after start.
fn refresh_ticker(period_secs: i64) -> tokio::time::Interval {
    let mut ticker = interval(Duration::from_secs(period_secs.max(1) as u64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Recurring cipher key refresher. Runs until a fatal error.
pub async fn encryption_key_refresher(
    data: Arc<ProxyData>,
    kms: Arc<dyn KmsConnector>,
) -> Result<(), EkpError> {
    let mut ticker = refresh_ticker(data.cfg.encrypt_key_refresh_interval);
    // The first tick completes immediately; skip it so the initial delay
    // equals the period.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        refresh_encryption_keys(&data, kms.as_ref()).await?;
    }
}

/// Recurring blob metadata refresher. Runs until a fatal error.
pub async fn blob_metadata_refresher(
    data: Arc<ProxyData>,
    kms: Arc<dyn KmsConnector>,
) -> Result<(), EkpError> {
    let mut ticker = refresh_ticker(data.cfg.blob_metadata_refresh_interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        refresh_blob_metadata(&data, kms.as_ref()).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::validity::NEVER;
    use crate::config::Config;
    use crate::kms::{KmsLookupByDomainIdsRequest, SimKmsConnector};
    use common::protocol::{BlobMetadataLocation, KeyMaterial};

    fn setup() -> (Arc<ProxyData>, Arc<SimKmsConnector>) {
        let data = ProxyData::new(Config::default_for_tests());
        let sim = Arc::new(SimKmsConnector::new("sim"));
        (data, sim)
    }

    fn key(byte: u8) -> KeyMaterial {
        KeyMaterial::new(vec![byte; 32])
    }

    #[tokio::test]
    async fn sweep_refreshes_entries_nearing_refresh() {
        let (data, sim) = setup();
        let now = unix_now();

        // Seed the sim with a key for domain 1, then cache it as nearly due.
        let seeded = sim
            .lookup_keys_by_domain_ids(KmsLookupByDomainIdsRequest {
                debug_id: None,
                domain_ids: vec![1],
            })
            .await
            .unwrap();
        let item = &seeded.cipher_key_details[0];
        data.caches.insert_latest(
            1,
            item.base_cipher_id,
            item.base_cipher_key.clone(),
            now + 10, // due before the next sweep
            now + 3600,
        );
        // A healthy entry the sweep must leave alone.
        data.caches.insert_latest(2, 99, key(2), NEVER, NEVER);

        refresh_encryption_keys(&data, sim.as_ref()).await.unwrap();

        let refreshed = data.caches.lookup_latest(1, now).unwrap();
        assert!(refreshed.refresh_at > now + 10, "validity was extended");
        assert_eq!(
            data.metrics.base_cipher_keys_refreshed.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn sweep_erases_expired_entries() {
        let (data, sim) = setup();
        let now = unix_now();
        data.caches.insert_latest(5, 50, key(5), now - 120, now - 60);
        data.caches.insert_latest(6, 60, key(6), NEVER, NEVER);

        refresh_encryption_keys(&data, sim.as_ref()).await.unwrap();

        assert!(!data.caches.contains_latest(5), "expired entry erased");
        assert!(data.caches.contains_latest(6));
    }

    #[tokio::test]
    async fn sweep_with_no_candidates_skips_the_kms() {
        let (data, sim) = setup();
        data.caches
            .insert_latest(1, 10, key(1), NEVER, NEVER);
        refresh_encryption_keys(&data, sim.as_ref()).await.unwrap();
        assert_eq!(sim.lookups_by_domain_ids(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replyable_error_is_swallowed_and_counted() {
        let (data, sim) = setup();
        let now = unix_now();
        data.caches.insert_latest(1, 10, key(1), now + 1, now + 3600);
        sim.inject_error(Some(EkpError::TimedOut));

        tokio::spawn(async move {
            refresh_encryption_keys(&data, sim.as_ref()).await.unwrap();
            assert_eq!(
                data.metrics
                    .num_encryption_key_refresh_errors
                    .load(Ordering::Relaxed),
                1
            );
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn fatal_error_propagates() {
        let (data, sim) = setup();
        let now = unix_now();
        data.caches.insert_latest(1, 10, key(1), now + 1, now + 3600);
        sim.inject_error(Some(EkpError::Internal("kms broke".into())));

        let err = refresh_encryption_keys(&data, sim.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, EkpError::Internal(_)));
    }

    #[tokio::test]
    async fn blob_sweep_erases_expired_and_refreshes_due() {
        let (data, sim) = setup();
        let now = unix_now();
        for (domain, refresh_at, expire_at) in [
            (1, now + 10, now + 3600), // due for refresh
            (2, NEVER, now - 5),       // expired, must be erased
            (3, NEVER, NEVER),         // healthy
        ] {
            data.caches.insert_blob_metadata(
                BlobMetadataDetails {
                    domain_id: domain,
                    locations: vec![BlobMetadataLocation {
                        location_id: domain,
                        path: format!("blobstore://old/{domain}/"),
                    }],
                    refresh_at,
                    expire_at,
                },
                now,
            );
        }

        refresh_blob_metadata(&data, sim.as_ref()).await.unwrap();

        // Domain 2 was erased as expired, but being refresh-eligible it was
        // re-fetched in the same sweep; unlike the cipher refresher, blob
        // upserts do not require a surviving cache entry.
        assert_eq!(data.caches.blob_metadata_len(), 3);
        for domain in [1, 2] {
            let refreshed = data
                .caches
                .lookup_blob_metadata(domain, now, data.cfg.blob_metadata_cache_ttl)
                .unwrap();
            assert!(
                refreshed.locations[0].path.starts_with("blobstore://sim/"),
                "domain {domain} was re-fetched from the KMS"
            );
        }
        let untouched = data
            .caches
            .lookup_blob_metadata(3, now, data.cfg.blob_metadata_cache_ttl)
            .unwrap();
        assert!(untouched.locations[0].path.starts_with("blobstore://old/"));
        assert_eq!(
            data.metrics.blob_metadata_refreshed.load(Ordering::Relaxed),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_task_fires_after_one_period() {
        let (data, sim) = setup();
        let now = unix_now();
        data.caches.insert_latest(1, 10, key(1), now + 1, now + 7200);
        // Seed the sim so the refresh fetch finds the domain.
        sim.lookup_keys_by_domain_ids(KmsLookupByDomainIdsRequest {
            debug_id: None,
            domain_ids: vec![1],
        })
        .await
        .unwrap();

        let handle = tokio::spawn(encryption_key_refresher(
            data.clone(),
            sim.clone() as Arc<dyn KmsConnector>,
        ));
        // Just under one period: nothing has fired yet.
        tokio::time::sleep(Duration::from_secs(
            data.cfg.encrypt_key_refresh_interval as u64 - 1,
        ))
        .await;
        assert_eq!(sim.lookups_by_domain_ids(), 1, "only the seeding call");

        // Crossing the period boundary triggers the first sweep.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sim.lookups_by_domain_ids(), 2);

        handle.abort();
    }
}
