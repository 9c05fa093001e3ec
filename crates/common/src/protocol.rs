//! Request and response types exchanged between components.
//!
//! Inbound proxy endpoints are in-process channels: each request struct
//! carries a `oneshot` sender over which exactly one reply is delivered.
//! KMS-facing wire types live with the connector in the service crate; the
//! types here are shared by both sides.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::EkpError;

/// Logical namespace for encryption keys; each domain has at most one
/// "latest" base cipher key at a given moment.
pub type EncryptDomainId = i64;

/// Identifier of a specific base cipher key within its domain.
pub type BaseCipherKeyId = u64;

/// Logical namespace for blob-storage credential metadata.
pub type BlobDomainId = i64;

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// Refcounted, immutable base cipher key bytes.
///
/// Shared between the caches and in-flight replies without copying. The
/// `Debug` impl is redacted so key bytes never reach logs or traces; the
/// serde impls use base64 for the KMS wire format.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial(Arc<[u8]>);

impl KeyMaterial {
    /// Wrap raw key bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into().into())
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the key material in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key material is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material, not even in debug builds.
        write!(f, "KeyMaterial([REDACTED; {} bytes])", self.0.len())
    }
}

impl Serialize for KeyMaterial {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.0);
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for KeyMaterial {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use base64::Engine as _;
        let encoded = String::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(Self::new(bytes))
    }
}

// ---------------------------------------------------------------------------
// Cipher key details
// ---------------------------------------------------------------------------

/// One base cipher key in a reply.
///
/// `refresh_at`/`expire_at` are populated only for keys freshly fetched by
/// the latest-keys flow; cache hits and by-id lookups echo the key without
/// validity timestamps.
#[derive(Debug, Clone)]
pub struct BaseCipherDetails {
    pub domain_id: EncryptDomainId,
    pub base_cipher_id: BaseCipherKeyId,
    pub base_cipher_key: KeyMaterial,
    /// Unix seconds after which the key should be proactively re-fetched.
    pub refresh_at: Option<i64>,
    /// Unix seconds after which the key must no longer be trusted.
    pub expire_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Blob metadata details
// ---------------------------------------------------------------------------

/// One blob-storage location within a domain's credential metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadataLocation {
    pub location_id: i64,
    pub path: String,
}

/// Blob-storage credential metadata for one blob domain.
///
/// `refresh_at`/`expire_at` are KMS-assigned absolute unix seconds; the proxy
/// additionally bounds cached copies by its own metadata cache TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMetadataDetails {
    pub domain_id: BlobDomainId,
    pub locations: Vec<BlobMetadataLocation>,
    pub refresh_at: i64,
    pub expire_at: i64,
}

// ---------------------------------------------------------------------------
// getBaseCipherKeysByIds endpoint
// ---------------------------------------------------------------------------

/// Fetch the base cipher keys matching the given `(domainId, baseCipherId)`
/// tuples.
#[derive(Debug)]
pub struct GetBaseCipherKeysByIdsRequest {
    pub debug_id: Option<Uuid>,
    pub base_cipher_infos: Vec<(EncryptDomainId, BaseCipherKeyId)>,
    pub reply: oneshot::Sender<GetBaseCipherKeysByIdsReply>,
}

#[derive(Debug, Default)]
pub struct GetBaseCipherKeysByIdsReply {
    /// Set when the KMS lookup failed with a replyable error; the details
    /// list then contains only what could be served.
    pub error: Option<EkpError>,
    pub base_cipher_details: Vec<BaseCipherDetails>,
    /// Number of requested tuples served from the cache.
    pub num_hits: usize,
}

// ---------------------------------------------------------------------------
// getLatestBaseCipherKeys endpoint
// ---------------------------------------------------------------------------

/// Fetch the latest base cipher key for each of the given encryption domains.
#[derive(Debug)]
pub struct GetLatestBaseCipherKeysRequest {
    pub debug_id: Option<Uuid>,
    pub domain_ids: Vec<EncryptDomainId>,
    pub reply: oneshot::Sender<GetLatestBaseCipherKeysReply>,
}

#[derive(Debug, Default)]
pub struct GetLatestBaseCipherKeysReply {
    pub error: Option<EkpError>,
    pub base_cipher_details: Vec<BaseCipherDetails>,
    pub num_hits: usize,
}

// ---------------------------------------------------------------------------
// getLatestBlobMetadata endpoint
// ---------------------------------------------------------------------------

/// Fetch blob-storage credential metadata for each of the given blob domains.
#[derive(Debug)]
pub struct GetLatestBlobMetadataRequest {
    pub debug_id: Option<Uuid>,
    pub domain_ids: Vec<BlobDomainId>,
    pub reply: oneshot::Sender<GetLatestBlobMetadataReply>,
}

#[derive(Debug, Default)]
pub struct GetLatestBlobMetadataReply {
    pub error: Option<EkpError>,
    pub metadata_details: Vec<BlobMetadataDetails>,
}

// ---------------------------------------------------------------------------
// haltEncryptKeyProxy endpoint
// ---------------------------------------------------------------------------

/// Stop the proxy. Acknowledged with an empty reply before shutdown.
#[derive(Debug)]
pub struct HaltEncryptKeyProxyRequest {
    pub requester_id: Uuid,
    pub reply: oneshot::Sender<()>,
}
