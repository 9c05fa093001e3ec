//! KMS connector abstraction.
//!
//! The proxy talks to the KMS through the [`KmsConnector`] trait; concrete
//! transports are the simulated connector (tests, simulation, perf runs) and
//! the REST connector. Lookup requests and replies are plain serde types so
//! the REST transport can put them on the wire unchanged.

pub mod rest;
pub mod retry;
pub mod sim;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use common::protocol::{BaseCipherKeyId, BlobDomainId, BlobMetadataDetails, EncryptDomainId, KeyMaterial};
use common::EkpError;

use crate::config::Config;

pub use rest::RestKmsConnector;
pub use retry::kms_request_with_backoff;
pub use sim::SimKmsConnector;

/// Connector type tags accepted by the `kms_connector_type` knob.
pub const KMS_CONNECTOR_TYPE_REST: &str = "rest";
pub const KMS_CONNECTOR_TYPE_SIM: &str = "sim";
pub const KMS_CONNECTOR_TYPE_PERF: &str = "perf";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One requested `(domainId, baseCipherId)` tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KmsCipherKeyInfo {
    pub domain_id: EncryptDomainId,
    pub base_cipher_id: BaseCipherKeyId,
}

/// Lookup of specific base cipher keys by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsLookupByIdsRequest {
    pub debug_id: Option<Uuid>,
    pub cipher_key_infos: Vec<KmsCipherKeyInfo>,
}

/// Lookup of the latest base cipher key per encryption domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsLookupByDomainIdsRequest {
    pub debug_id: Option<Uuid>,
    pub domain_ids: Vec<EncryptDomainId>,
}

/// One base cipher key as returned by the KMS, with optional lifetime hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsCipherKeyDetails {
    pub domain_id: EncryptDomainId,
    pub base_cipher_id: BaseCipherKeyId,
    pub base_cipher_key: KeyMaterial,
    /// Seconds until the key should be refreshed; negative means never.
    pub refresh_after_sec: Option<i64>,
    /// Seconds until the key expires; negative means non-revocable.
    pub expire_after_sec: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KmsLookupKeysReply {
    pub cipher_key_details: Vec<KmsCipherKeyDetails>,
}

/// Lookup of blob-storage credential metadata per blob domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsBlobMetadataRequest {
    pub debug_id: Option<Uuid>,
    pub domain_ids: Vec<BlobDomainId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KmsBlobMetadataReply {
    pub metadata_details: Vec<BlobMetadataDetails>,
}

// ---------------------------------------------------------------------------
// Connector trait and activation
// ---------------------------------------------------------------------------

/// Transport-specific KMS access. One instance lives for the proxy lifetime.
#[async_trait]
pub trait KmsConnector: Send + Sync {
    /// Tag identifying the concrete transport, for logging.
    fn connector_type(&self) -> &str;

    /// Fetch specific base cipher keys by `(domainId, baseCipherId)`.
    async fn lookup_keys_by_ids(
        &self,
        req: KmsLookupByIdsRequest,
    ) -> Result<KmsLookupKeysReply, EkpError>;

    /// Fetch the latest base cipher key for each requested domain.
    async fn lookup_keys_by_domain_ids(
        &self,
        req: KmsLookupByDomainIdsRequest,
    ) -> Result<KmsLookupKeysReply, EkpError>;

    /// Fetch blob-storage credential metadata for each requested blob domain.
    async fn blob_metadata(
        &self,
        req: KmsBlobMetadataRequest,
    ) -> Result<KmsBlobMetadataReply, EkpError>;
}

/// Instantiate the connector selected by configuration.
///
/// The `simulated` flag always wins; otherwise the type tag decides. Unknown
/// tags fail with [`EkpError::NotImplemented`].
pub fn activate_kms_connector(cfg: &Config) -> Result<Arc<dyn KmsConnector>, EkpError> {
    let connector: Arc<dyn KmsConnector> = if cfg.simulated {
        Arc::new(SimKmsConnector::new(KMS_CONNECTOR_TYPE_SIM))
    } else {
        match cfg.kms_connector_type.as_str() {
            KMS_CONNECTOR_TYPE_SIM => Arc::new(SimKmsConnector::new(KMS_CONNECTOR_TYPE_SIM)),
            KMS_CONNECTOR_TYPE_PERF => Arc::new(SimKmsConnector::new(KMS_CONNECTOR_TYPE_PERF)),
            KMS_CONNECTOR_TYPE_REST => Arc::new(RestKmsConnector::new(cfg)?),
            other => {
                return Err(EkpError::NotImplemented(format!(
                    "unknown KMS connector type: {other}"
                )))
            }
        }
    };

    info!(connector_type = connector.connector_type(), "KMS connector activated");
    Ok(connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_flag_forces_sim_connector() {
        let mut cfg = Config::default_for_tests();
        cfg.simulated = true;
        cfg.kms_connector_type = KMS_CONNECTOR_TYPE_REST.into();
        let connector = activate_kms_connector(&cfg).unwrap();
        assert_eq!(connector.connector_type(), KMS_CONNECTOR_TYPE_SIM);
    }

    #[test]
    fn perf_tag_uses_sim_transport() {
        let mut cfg = Config::default_for_tests();
        cfg.kms_connector_type = KMS_CONNECTOR_TYPE_PERF.into();
        let connector = activate_kms_connector(&cfg).unwrap();
        assert_eq!(connector.connector_type(), KMS_CONNECTOR_TYPE_PERF);
    }

    #[test]
    fn unknown_tag_is_not_implemented() {
        let mut cfg = Config::default_for_tests();
        cfg.kms_connector_type = "vault".into();
        match activate_kms_connector(&cfg) {
            Err(EkpError::NotImplemented(msg)) => assert!(msg.contains("vault")),
            other => panic!(
                "expected NotImplemented, got {:?}",
                other
                    .map(|c| c.connector_type().to_string())
                    .map_err(|e| e.to_string())
            ),
        }
    }

    #[test]
    fn lookup_request_serde_round_trip() {
        let req = KmsLookupByIdsRequest {
            debug_id: Some(Uuid::nil()),
            cipher_key_infos: vec![KmsCipherKeyInfo {
                domain_id: 4,
                base_cipher_id: 77,
            }],
        };
        let json = serde_json::to_string(&req).unwrap();
        let decoded: KmsLookupByIdsRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.cipher_key_infos, req.cipher_key_infos);
    }
}
