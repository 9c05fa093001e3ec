//! REST KMS connector.
//!
//! Serialises lookup requests as JSON and POSTs them to the configured KMS
//! endpoint over pooled connections. Transport failures map onto the
//! retryable error set so the caller-side backoff wrapper can re-attempt;
//! each attempt checks out a fresh (possibly reused) pooled connection.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header, Method, Request, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use common::EkpError;

use crate::config::Config;
use crate::rest::knobs::parse_knob_overrides;
use crate::rest::{Connect, NetConnector, PoolKey, RestClientKnobs, RestConnectionPool, RestUrl};

use super::{
    KmsBlobMetadataReply, KmsBlobMetadataRequest, KmsConnector, KmsLookupByDomainIdsRequest,
    KmsLookupByIdsRequest, KmsLookupKeysReply, KMS_CONNECTOR_TYPE_REST,
};

const EK_LOOKUP_BY_IDS_OP: &str = "get-encryption-keys-by-key-ids";
const EK_LOOKUP_BY_DOMAIN_IDS_OP: &str = "get-encryption-keys-by-domain-ids";
const BLOB_METADATA_OP: &str = "get-blob-metadata";

/// KMS connector speaking JSON-over-HTTP through the connection pool.
pub struct RestKmsConnector {
    url: RestUrl,
    knobs: RestClientKnobs,
    pool: RestConnectionPool,
    connector: Box<dyn Connect>,
    pool_key: PoolKey,
}

impl RestKmsConnector {
    pub fn new(cfg: &Config) -> Result<Self, EkpError> {
        let mut knobs = RestClientKnobs::from_config(cfg);
        if !cfg.restclient_knob_overrides.is_empty() {
            knobs.set(&parse_knob_overrides(&cfg.restclient_knob_overrides)?)?;
        }
        let connector = Box::new(NetConnector::new(knobs.connect_tries, knobs.connect_timeout));
        Self::with_connector(cfg, knobs, connector)
    }

    fn with_connector(
        cfg: &Config,
        knobs: RestClientKnobs,
        connector: Box<dyn Connect>,
    ) -> Result<Self, EkpError> {
        let url = RestUrl::parse(
            &cfg.kms_endpoint_url,
            cfg.rest_kms_enable_not_secure_connection,
        )?;
        let pool_key = (url.host.clone(), url.service.clone());
        Ok(Self {
            url,
            knobs,
            pool: RestConnectionPool::new(),
            connector,
            pool_key,
        })
    }

    fn request_uri(&self, op: &str) -> String {
        let mut uri = String::from("/");
        if !self.url.resource.is_empty() {
            uri.push_str(&self.url.resource);
            uri.push('/');
        }
        uri.push_str(op);
        if !self.url.query.is_empty() {
            uri.push('?');
            uri.push_str(&self.url.query);
        }
        uri
    }

    fn host_header(&self) -> String {
        if self.url.service.is_empty() {
            self.url.host.clone()
        } else {
            format!("{}:{}", self.url.host, self.url.service)
        }
    }

    /// POST `req` to the given operation and decode the JSON reply.
    async fn post_json<Req, Rsp>(&self, op: &str, req: &Req) -> Result<Rsp, EkpError>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let body = serde_json::to_vec(req)
            .map_err(|e| EkpError::Internal(format!("KMS request encode: {e}")))?;
        let request_timeout = Duration::from_secs(self.knobs.request_timeout_secs.max(1) as u64);

        let mut last_err = EkpError::ConnectionFailed;
        for attempt in 0..self.knobs.request_tries.max(1) {
            // A failed connection is never retried with; every attempt checks
            // out a fresh (possibly reused) one.
            let mut conn = self
                .pool
                .connect(
                    &*self.connector,
                    &self.pool_key,
                    self.url.kind.is_secure(),
                    self.knobs.max_connection_life,
                )
                .await?;

            let request = Request::builder()
                .method(Method::POST)
                .uri(self.request_uri(op))
                .header(header::HOST, self.host_header())
                .header(header::CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(body.clone())))
                .map_err(|e| EkpError::Internal(format!("KMS request build: {e}")))?;

            let response =
                match tokio::time::timeout(request_timeout, conn.sender.send_request(request)).await
                {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => {
                        warn!(op, attempt, error = %e, "KMS request failed");
                        last_err = EkpError::ConnectionFailed;
                        continue;
                    }
                    Err(_) => {
                        warn!(op, attempt, "KMS request timed out");
                        last_err = EkpError::TimedOut;
                        continue;
                    }
                };

            let status = response.status();
            let payload = match tokio::time::timeout(request_timeout, response.into_body().collect())
                .await
            {
                Ok(Ok(collected)) => collected.to_bytes(),
                Ok(Err(e)) => {
                    warn!(op, attempt, error = %e, "KMS response read failed");
                    last_err = EkpError::ConnectionFailed;
                    continue;
                }
                Err(_) => {
                    last_err = EkpError::TimedOut;
                    continue;
                }
            };

            // The exchange completed; the connection is reusable.
            self.pool.return_connection(
                &self.pool_key,
                conn,
                self.knobs.connection_pool_size.max(0) as usize,
            )?;

            debug!(op, status = status.as_u16(), bytes = payload.len(), "KMS response");
            return match status {
                s if s.is_success() => serde_json::from_slice(&payload)
                    .map_err(|_| EkpError::EncryptKeysFetchFailed),
                StatusCode::NOT_FOUND => Err(EkpError::EncryptKeyNotFound),
                _ => Err(EkpError::EncryptKeysFetchFailed),
            };
        }
        Err(last_err)
    }
}

#[async_trait::async_trait]
impl KmsConnector for RestKmsConnector {
    fn connector_type(&self) -> &str {
        KMS_CONNECTOR_TYPE_REST
    }

    async fn lookup_keys_by_ids(
        &self,
        req: KmsLookupByIdsRequest,
    ) -> Result<KmsLookupKeysReply, EkpError> {
        self.post_json(EK_LOOKUP_BY_IDS_OP, &req).await
    }

    async fn lookup_keys_by_domain_ids(
        &self,
        req: KmsLookupByDomainIdsRequest,
    ) -> Result<KmsLookupKeysReply, EkpError> {
        self.post_json(EK_LOOKUP_BY_DOMAIN_IDS_OP, &req).await
    }

    async fn blob_metadata(
        &self,
        req: KmsBlobMetadataRequest,
    ) -> Result<KmsBlobMetadataReply, EkpError> {
        self.post_json(BLOB_METADATA_OP, &req).await
    }
}
