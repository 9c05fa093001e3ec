//! The proxy event loop.
//!
//! Multiplexes the four inbound endpoints and a supervisor over in-flight
//! tasks. Every incoming request is spawned as an independent task; the loop
//! never awaits a handler inline. Halting acknowledges the requester and
//! cancels in-flight work without draining it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use common::protocol::{
    GetBaseCipherKeysByIdsRequest, GetLatestBaseCipherKeysRequest, GetLatestBlobMetadataRequest,
    HaltEncryptKeyProxyRequest,
};
use common::EkpError;

use crate::config::Config;
use crate::kms::{activate_kms_connector, KmsConnector};

use super::handlers::{
    get_cipher_keys_by_base_cipher_ids, get_latest_blob_metadata, get_latest_cipher_keys,
};
use super::refresh::{blob_metadata_refresher, encryption_key_refresher};
use super::state::ProxyData;

const ENDPOINT_CAPACITY: usize = 128;

/// Sender halves of the proxy endpoints, handed to the rest of the process.
#[derive(Clone)]
pub struct EkpEndpoints {
    pub get_base_cipher_keys_by_ids: mpsc::Sender<GetBaseCipherKeysByIdsRequest>,
    pub get_latest_base_cipher_keys: mpsc::Sender<GetLatestBaseCipherKeysRequest>,
    pub get_latest_blob_metadata: mpsc::Sender<GetLatestBlobMetadataRequest>,
    pub halt: mpsc::Sender<HaltEncryptKeyProxyRequest>,
}

/// The proxy instance: owns the caches, the KMS connector, and the receiver
/// halves of the endpoints.
pub struct EncryptKeyProxy {
    data: Arc<ProxyData>,
    kms: Arc<dyn KmsConnector>,
    by_ids_rx: mpsc::Receiver<GetBaseCipherKeysByIdsRequest>,
    latest_rx: mpsc::Receiver<GetLatestBaseCipherKeysRequest>,
    blob_rx: mpsc::Receiver<GetLatestBlobMetadataRequest>,
    halt_rx: mpsc::Receiver<HaltEncryptKeyProxyRequest>,
}

impl EncryptKeyProxy {
    /// Build a proxy instance and its endpoints, activating the KMS connector
    /// selected by configuration.
    pub fn new(cfg: Config) -> Result<(Self, EkpEndpoints), EkpError> {
        let kms = activate_kms_connector(&cfg)?;
        let data = ProxyData::new(cfg);

        let (by_ids_tx, by_ids_rx) = mpsc::channel(ENDPOINT_CAPACITY);
        let (latest_tx, latest_rx) = mpsc::channel(ENDPOINT_CAPACITY);
        let (blob_tx, blob_rx) = mpsc::channel(ENDPOINT_CAPACITY);
        let (halt_tx, halt_rx) = mpsc::channel(1);

        let endpoints = EkpEndpoints {
            get_base_cipher_keys_by_ids: by_ids_tx,
            get_latest_base_cipher_keys: latest_tx,
            get_latest_blob_metadata: blob_tx,
            halt: halt_tx,
        };
        let proxy = Self {
            data,
            kms,
            by_ids_rx,
            latest_rx,
            blob_rx,
            halt_rx,
        };
        Ok((proxy, endpoints))
    }

    /// Run the event loop until halted or a fatal error occurs.
    pub async fn run(mut self) -> Result<(), EkpError> {
        info!(
            proxy_id = %self.data.my_id,
            connector_type = self.kms.connector_type(),
            "encrypt key proxy starting"
        );

        let mut tasks: JoinSet<Result<(), EkpError>> = JoinSet::new();
        tasks.spawn(encryption_key_refresher(
            self.data.clone(),
            self.kms.clone(),
        ));
        tasks.spawn(blob_metadata_refresher(self.data.clone(), self.kms.clone()));

        let result = loop {
            tokio::select! {
                Some(req) = self.by_ids_rx.recv() => {
                    tasks.spawn(get_cipher_keys_by_base_cipher_ids(
                        self.data.clone(),
                        self.kms.clone(),
                        req,
                    ));
                }
                Some(req) = self.latest_rx.recv() => {
                    tasks.spawn(get_latest_cipher_keys(
                        self.data.clone(),
                        self.kms.clone(),
                        req,
                    ));
                }
                Some(req) = self.blob_rx.recv() => {
                    tasks.spawn(get_latest_blob_metadata(
                        self.data.clone(),
                        self.kms.clone(),
                        req,
                    ));
                }
                halt = self.halt_rx.recv() => {
                    match halt {
                        Some(req) => {
                            info!(
                                proxy_id = %self.data.my_id,
                                requester_id = %req.requester_id,
                                "encrypt key proxy halted"
                            );
                            let _ = req.reply.send(());
                        }
                        None => {
                            warn!(proxy_id = %self.data.my_id, "halt endpoint closed");
                        }
                    }
                    break Ok(());
                }
                Some(joined) = tasks.join_next() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(proxy_id = %self.data.my_id, error = %e, "proxy task failed");
                            break Err(e);
                        }
                        Err(join_err) => {
                            error!(proxy_id = %self.data.my_id, error = %join_err, "proxy task aborted");
                            break Err(EkpError::Internal(join_err.to_string()));
                        }
                    }
                }
            }
        };

        // Cancel in-flight tasks; no attempt is made to drain them.
        tasks.shutdown().await;
        info!(proxy_id = %self.data.my_id, "encrypt key proxy terminated");
        result
    }
}
