//! Request handlers for the three proxy endpoints.
//!
//! All three share one skeleton: dedupe the requested set, partition into
//! cache hits and misses, fetch the misses from the KMS through the backoff
//! wrapper, insert the results, reply. Replyable errors are packaged into
//! the reply; anything else propagates and tears the handler's task down.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use common::protocol::{
    BaseCipherDetails, GetBaseCipherKeysByIdsReply, GetBaseCipherKeysByIdsRequest,
    GetLatestBaseCipherKeysReply, GetLatestBaseCipherKeysRequest, GetLatestBlobMetadataReply,
    GetLatestBlobMetadataRequest,
};
use common::EkpError;

use crate::cache::unix_now;
use crate::cache::validity::cipher_key_validity;
use crate::kms::{
    kms_request_with_backoff, KmsBlobMetadataRequest, KmsCipherKeyInfo, KmsConnector,
    KmsLookupByDomainIdsRequest, KmsLookupByIdsRequest,
};

use super::state::ProxyData;

/// Render per-request debug tags into a single bounded string.
///
/// Each entry carries a short prefix: `Q` queried, `C` cache hit, `I`
/// inserted.
fn render_dbg_entries(tags: &[String], max_len: usize) -> String {
    let mut rendered = tags.join(" ");
    rendered.truncate(max_len);
    rendered
}

/// Serve base cipher keys for specific `(domainId, baseCipherId)` tuples.
///
/// Only the by-id cache participates: the queried key need not be the
/// current rotation for its domain, so the latest cache is left alone. Keys
/// fetched from the KMS are cached with a pinned refresh timestamp (a
/// specific key is immutable) while still honoring the KMS-governed expiry.
pub async fn get_cipher_keys_by_base_cipher_ids(
    data: Arc<ProxyData>,
    kms: Arc<dyn KmsConnector>,
    req: GetBaseCipherKeysByIdsRequest,
) -> Result<(), EkpError> {
    let mut dbg_tags = req.debug_id.map(|_| Vec::new());

    let deduped: HashSet<_> = req.base_cipher_infos.iter().copied().collect();
    if let Some(tags) = dbg_tags.as_mut() {
        for (domain_id, base_cipher_id) in &deduped {
            tags.push(format!("Q{domain_id}:{base_cipher_id}"));
        }
    }

    let curr_ts = unix_now();
    let mut cached_details = Vec::new();
    let mut lookup_infos = Vec::new();
    for &(domain_id, base_cipher_id) in &deduped {
        match data.caches.lookup_by_id(domain_id, base_cipher_id, curr_ts) {
            Some(entry) => {
                if let Some(tags) = dbg_tags.as_mut() {
                    tags.push(format!("C{domain_id}:{base_cipher_id}"));
                }
                cached_details.push(BaseCipherDetails {
                    domain_id: entry.domain_id,
                    base_cipher_id: entry.base_cipher_id,
                    base_cipher_key: entry.base_cipher_key,
                    refresh_at: None,
                    expire_at: None,
                });
            }
            None => lookup_infos.push(KmsCipherKeyInfo {
                domain_id,
                base_cipher_id,
            }),
        }
    }

    data.metrics
        .base_cipher_key_id_cache_hits
        .fetch_add(cached_details.len() as u64, Ordering::Relaxed);
    data.metrics
        .base_cipher_key_id_cache_misses
        .fetch_add(lookup_infos.len() as u64, Ordering::Relaxed);

    let mut reply = GetBaseCipherKeysByIdsReply::default();
    if !lookup_infos.is_empty() {
        let kms_req = KmsLookupByIdsRequest {
            debug_id: req.debug_id,
            cipher_key_infos: lookup_infos,
        };
        let fetched = fetch_keys_by_ids(&data, kms.as_ref(), &kms_req, dbg_tags.as_mut()).await;
        match fetched {
            Ok(details) => reply.base_cipher_details = details,
            Err(e) if e.can_reply_with() => {
                warn!(proxy_id = %data.my_id, error = %e, "get cipher keys by key ids failed");
                send_cipher_error_reply(&data, req.reply, e);
                return Ok(());
            }
            Err(e) => {
                error!(proxy_id = %data.my_id, error = %e, "get cipher keys by key ids failed");
                return Err(e);
            }
        }
    }

    // Append cached details to the result set.
    reply.num_hits = cached_details.len();
    reply.base_cipher_details.extend(cached_details);

    if let (Some(debug_id), Some(tags)) = (req.debug_id, dbg_tags.as_ref()) {
        debug!(
            proxy_id = %data.my_id,
            debug_id = %debug_id,
            n_keys = deduped.len(),
            entries = %render_dbg_entries(tags, data.cfg.encrypt_proxy_max_dbg_trace_length),
            "get cipher keys by key ids"
        );
    }

    let _ = req.reply.send(reply);
    Ok(())
}

async fn fetch_keys_by_ids(
    data: &ProxyData,
    kms: &dyn KmsConnector,
    kms_req: &KmsLookupByIdsRequest,
    mut dbg_tags: Option<&mut Vec<String>>,
) -> Result<Vec<BaseCipherDetails>, EkpError> {
    let start = Instant::now();
    let rep = kms_request_with_backoff(
        || kms.lookup_keys_by_ids(kms_req.clone()),
        || {
            for info in &kms_req.cipher_key_infos {
                debug!(domain_id = info.domain_id, "get cipher keys by key ids retry");
            }
        },
        "get_cipher_keys_by_key_ids",
        data.cfg.ekp_kms_connection_retries,
    )
    .await?;
    debug!(
        proxy_id = %data.my_id,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "KMS lookup by key ids"
    );

    let requested: HashSet<_> = kms_req
        .cipher_key_infos
        .iter()
        .map(|info| (info.domain_id, info.base_cipher_id))
        .collect();

    let insert_ts = unix_now();
    let mut fetched = Vec::with_capacity(rep.cipher_key_details.len());
    for item in rep.cipher_key_details {
        if !requested.contains(&(item.domain_id, item.base_cipher_id)) {
            error!(
                proxy_id = %data.my_id,
                domain_id = item.domain_id,
                "KMS returned a key matching no requested tuple"
            );
            return Err(EkpError::EncryptKeysFetchFailed);
        }

        // Rotation does not apply to a specific key; only the KMS-governed
        // lifetime is honored.
        let validity = cipher_key_validity(
            Some(-1),
            item.expire_after_sec,
            insert_ts,
            data.cfg.encrypt_cipher_key_cache_ttl,
        );
        data.caches.insert_by_id(
            item.domain_id,
            item.base_cipher_id,
            item.base_cipher_key.clone(),
            validity.refresh_at,
            validity.expire_at,
        );
        if let Some(tags) = dbg_tags.as_mut() {
            tags.push(format!(
                "I{}:{}:r{}:e{}",
                item.domain_id, item.base_cipher_id, validity.refresh_at, validity.expire_at
            ));
        }
        fetched.push(BaseCipherDetails {
            domain_id: item.domain_id,
            base_cipher_id: item.base_cipher_id,
            base_cipher_key: item.base_cipher_key,
            refresh_at: None,
            expire_at: None,
        });
    }
    Ok(fetched)
}

/// Serve the latest base cipher key for each requested encryption domain.
///
/// Freshly fetched keys are inserted into both caches and replied with their
/// validity timestamps; cache hits are echoed without them.
pub async fn get_latest_cipher_keys(
    data: Arc<ProxyData>,
    kms: Arc<dyn KmsConnector>,
    req: GetLatestBaseCipherKeysRequest,
) -> Result<(), EkpError> {
    let mut dbg_tags = req.debug_id.map(|_| Vec::new());

    let deduped: HashSet<_> = req.domain_ids.iter().copied().collect();
    if let Some(tags) = dbg_tags.as_mut() {
        for domain_id in &deduped {
            tags.push(format!("Q{domain_id}"));
        }
    }

    let curr_ts = unix_now();
    let mut cached_details = Vec::new();
    let mut lookup_domain_ids = Vec::new();
    for &domain_id in &deduped {
        match data.caches.lookup_latest(domain_id, curr_ts) {
            Some(entry) => {
                if let Some(tags) = dbg_tags.as_mut() {
                    tags.push(format!(
                        "C{domain_id}:{}:r{}:e{}",
                        entry.base_cipher_id, entry.refresh_at, entry.expire_at
                    ));
                }
                cached_details.push(BaseCipherDetails {
                    domain_id: entry.domain_id,
                    base_cipher_id: entry.base_cipher_id,
                    base_cipher_key: entry.base_cipher_key,
                    refresh_at: None,
                    expire_at: None,
                });
            }
            None => lookup_domain_ids.push(domain_id),
        }
    }

    data.metrics
        .base_cipher_domain_id_cache_hits
        .fetch_add(cached_details.len() as u64, Ordering::Relaxed);
    data.metrics
        .base_cipher_domain_id_cache_misses
        .fetch_add(lookup_domain_ids.len() as u64, Ordering::Relaxed);

    let mut reply = GetLatestBaseCipherKeysReply::default();
    if !lookup_domain_ids.is_empty() {
        let kms_req = KmsLookupByDomainIdsRequest {
            debug_id: req.debug_id,
            domain_ids: lookup_domain_ids,
        };
        match fetch_latest_keys(&data, kms.as_ref(), &kms_req, dbg_tags.as_mut()).await {
            Ok(details) => reply.base_cipher_details = details,
            Err(e) if e.can_reply_with() => {
                warn!(proxy_id = %data.my_id, error = %e, "get latest cipher keys failed");
                send_latest_error_reply(&data, req.reply, e);
                return Ok(());
            }
            Err(e) => {
                error!(proxy_id = %data.my_id, error = %e, "get latest cipher keys failed");
                return Err(e);
            }
        }
    }

    reply.num_hits = cached_details.len();
    reply.base_cipher_details.extend(cached_details);

    if let (Some(debug_id), Some(tags)) = (req.debug_id, dbg_tags.as_ref()) {
        debug!(
            proxy_id = %data.my_id,
            debug_id = %debug_id,
            n_keys = deduped.len(),
            entries = %render_dbg_entries(tags, data.cfg.encrypt_proxy_max_dbg_trace_length),
            "get latest cipher keys"
        );
    }

    let _ = req.reply.send(reply);
    Ok(())
}

async fn fetch_latest_keys(
    data: &ProxyData,
    kms: &dyn KmsConnector,
    kms_req: &KmsLookupByDomainIdsRequest,
    mut dbg_tags: Option<&mut Vec<String>>,
) -> Result<Vec<BaseCipherDetails>, EkpError> {
    let start = Instant::now();
    let rep = kms_request_with_backoff(
        || kms.lookup_keys_by_domain_ids(kms_req.clone()),
        || {
            for &domain_id in &kms_req.domain_ids {
                debug!(domain_id, "get latest cipher keys retry");
            }
        },
        "get_latest_cipher_keys",
        data.cfg.ekp_kms_connection_retries,
    )
    .await?;
    debug!(
        proxy_id = %data.my_id,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "KMS lookup by domain ids"
    );

    let requested: HashSet<_> = kms_req.domain_ids.iter().copied().collect();

    let insert_ts = unix_now();
    let mut fetched = Vec::with_capacity(rep.cipher_key_details.len());
    for item in rep.cipher_key_details {
        if !requested.contains(&item.domain_id) {
            error!(
                proxy_id = %data.my_id,
                domain_id = item.domain_id,
                "KMS returned a key for an unrequested domain"
            );
            return Err(EkpError::EncryptKeysFetchFailed);
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
            item.base_cipher_key.clone(),
            validity.refresh_at,
            validity.expire_at,
        );
        if let Some(tags) = dbg_tags.as_mut() {
            tags.push(format!(
                "I{}:{}:r{}:e{}",
                item.domain_id, item.base_cipher_id, validity.refresh_at, validity.expire_at
            ));
        }
        fetched.push(BaseCipherDetails {
            domain_id: item.domain_id,
            base_cipher_id: item.base_cipher_id,
            base_cipher_key: item.base_cipher_key,
            refresh_at: Some(validity.refresh_at),
            expire_at: Some(validity.expire_at),
        });
    }
    Ok(fetched)
}

/// Serve blob-storage credential metadata for each requested blob domain.
///
/// Cached entries must satisfy both the local cache TTL and the KMS-assigned
/// expiry to count as hits.
pub async fn get_latest_blob_metadata(
    data: Arc<ProxyData>,
    kms: Arc<dyn KmsConnector>,
    req: GetLatestBlobMetadataRequest,
) -> Result<(), EkpError> {
    let mut dbg_tags = req.debug_id.map(|_| Vec::new());

    let deduped: HashSet<_> = req.domain_ids.iter().copied().collect();
    if let Some(tags) = dbg_tags.as_mut() {
        for domain_id in &deduped {
            tags.push(format!("BMQ{domain_id}"));
        }
    }

    let curr_ts = unix_now();
    let mut reply = GetLatestBlobMetadataReply::default();
    let mut lookup_domain_ids = Vec::new();
    for &domain_id in &deduped {
        match data
            .caches
            .lookup_blob_metadata(domain_id, curr_ts, data.cfg.blob_metadata_cache_ttl)
        {
            Some(details) => {
                if let Some(tags) = dbg_tags.as_mut() {
                    tags.push(format!("BMC{domain_id}"));
                }
                reply.metadata_details.push(details);
            }
            None => lookup_domain_ids.push(domain_id),
        }
    }

    data.metrics
        .blob_metadata_cache_hits
        .fetch_add(reply.metadata_details.len() as u64, Ordering::Relaxed);

    if !lookup_domain_ids.is_empty() {
        data.metrics
            .blob_metadata_cache_misses
            .fetch_add(lookup_domain_ids.len() as u64, Ordering::Relaxed);

        let kms_req = KmsBlobMetadataRequest {
            debug_id: req.debug_id,
            domain_ids: lookup_domain_ids,
        };
        let start = Instant::now();
        let fetched = kms_request_with_backoff(
            || kms.blob_metadata(kms_req.clone()),
            || {
                for &domain_id in &kms_req.domain_ids {
                    debug!(domain_id, "get latest blob metadata retry");
                }
            },
            "get_latest_blob_metadata",
            data.cfg.ekp_kms_connection_retries,
        )
        .await;
        match fetched {
            Ok(rep) => {
                debug!(
                    proxy_id = %data.my_id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "KMS blob metadata lookup"
                );
                let insert_ts = unix_now();
                for details in rep.metadata_details {
                    if let Some(tags) = dbg_tags.as_mut() {
                        tags.push(format!("BMI{}", details.domain_id));
                    }
                    data.caches.insert_blob_metadata(details.clone(), insert_ts);
                    reply.metadata_details.push(details);
                }
            }
            Err(e) if e.can_reply_with() => {
                info!(proxy_id = %data.my_id, error = %e, "get latest blob metadata failed");
                let _ = req.reply.send(GetLatestBlobMetadataReply {
                    error: Some(e),
                    metadata_details: Vec::new(),
                });
                return Ok(());
            }
            Err(e) => {
                error!(proxy_id = %data.my_id, error = %e, "get latest blob metadata failed");
                return Err(e);
            }
        }
    }

    if let (Some(debug_id), Some(tags)) = (req.debug_id, dbg_tags.as_ref()) {
        debug!(
            proxy_id = %data.my_id,
            debug_id = %debug_id,
            n_keys = deduped.len(),
            entries = %render_dbg_entries(tags, data.cfg.encrypt_proxy_max_dbg_trace_length),
            "get latest blob metadata"
        );
    }

    let _ = req.reply.send(reply);
    Ok(())
}

fn send_cipher_error_reply(
    data: &ProxyData,
    reply: tokio::sync::oneshot::Sender<GetBaseCipherKeysByIdsReply>,
    e: EkpError,
) {
    data.metrics
        .num_response_with_errors
        .fetch_add(1, Ordering::Relaxed);
    let _ = reply.send(GetBaseCipherKeysByIdsReply {
        error: Some(e),
        ..Default::default()
    });
}

fn send_latest_error_reply(
    data: &ProxyData,
    reply: tokio::sync::oneshot::Sender<GetLatestBaseCipherKeysReply>,
    e: EkpError,
) {
    data.metrics
        .num_response_with_errors
        .fetch_add(1, Ordering::Relaxed);
    let _ = reply.send(GetLatestBaseCipherKeysReply {
        error: Some(e),
        ..Default::default()
    });
}
