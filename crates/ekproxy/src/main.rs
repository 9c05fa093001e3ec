//! `ekproxy`: encryption key proxy binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (tracing).
//! 3. Activate the configured KMS connector and build the proxy.
//! 4. Wire Ctrl-C to the halt endpoint.
//! 5. Run the dispatcher event loop until halted.

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use common::protocol::HaltEncryptKeyProxyRequest;

use ekproxy::config::Config;
use ekproxy::proxy::EncryptKeyProxy;
use ekproxy::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        connector_type = %cfg.kms_connector_type,
        "ekproxy starting"
    );

    // -----------------------------------------------------------------------
    // 3. Proxy and endpoints
    // -----------------------------------------------------------------------
    let (ekp, endpoints) =
        EncryptKeyProxy::new(cfg).context("failed to build encrypt key proxy")?;

    // -----------------------------------------------------------------------
    // 4. Halt on Ctrl-C
    // -----------------------------------------------------------------------
    let halt = endpoints.halt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("failed to install Ctrl-C handler");
            return;
        }
        let (tx, rx) = oneshot::channel();
        let _ = halt
            .send(HaltEncryptKeyProxyRequest {
                requester_id: Uuid::new_v4(),
                reply: tx,
            })
            .await;
        let _ = rx.await;
    });

    // -----------------------------------------------------------------------
    // 5. Event loop
    // -----------------------------------------------------------------------
    ekp.run().await.context("proxy terminated with error")?;
    Ok(())
}
