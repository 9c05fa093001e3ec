//! Shared proxy state injected into request handlers and refreshers.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use uuid::Uuid;

use crate::cache::EkpCaches;
use crate::config::Config;

/// Cache and error counters, updated from handlers and refreshers.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub base_cipher_key_id_cache_hits: AtomicU64,
    pub base_cipher_key_id_cache_misses: AtomicU64,
    pub base_cipher_domain_id_cache_hits: AtomicU64,
    pub base_cipher_domain_id_cache_misses: AtomicU64,
    pub base_cipher_keys_refreshed: AtomicU64,
    pub num_response_with_errors: AtomicU64,
    pub num_encryption_key_refresh_errors: AtomicU64,
    pub blob_metadata_cache_hits: AtomicU64,
    pub blob_metadata_cache_misses: AtomicU64,
    pub blob_metadata_refreshed: AtomicU64,
    pub num_blob_metadata_refresh_errors: AtomicU64,
}

/// State shared by everything running under one proxy instance.
///
/// The proxy exclusively owns its caches; each in-flight request task holds
/// an `Arc` handle for the lifetime of that request.
#[derive(Debug)]
pub struct ProxyData {
    /// Identity of this proxy instance, for log correlation.
    pub my_id: Uuid,
    pub cfg: Config,
    pub caches: EkpCaches,
    pub metrics: CacheMetrics,
}

impl ProxyData {
    pub fn new(cfg: Config) -> Arc<Self> {
        Arc::new(Self {
            my_id: Uuid::new_v4(),
            cfg,
            caches: EkpCaches::new(),
            metrics: CacheMetrics::default(),
        })
    }
}
