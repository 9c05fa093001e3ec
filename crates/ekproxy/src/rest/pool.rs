//! Per-endpoint pool of reusable HTTP connections.
//!
//! Connections are keyed by `(host, service)` and carry an absolute
//! expiration timestamp. Checkout pops from the front of the queue,
//! discarding closed or expired handles; a fresh connection performs the
//! TCP connect, the TLS handshake when secure, and the HTTP/1 handshake.
//! Return pushes live connections to the back iff the pool is under
//! capacity, and always consumes the caller's handle.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use common::EkpError;

use crate::cache::unix_now;

/// Identity for pool sharding: `(host, service)`.
pub type PoolKey = (String, String);

/// HTTP/1 request sender over a pooled transport.
pub type HttpSender = http1::SendRequest<Full<Bytes>>;

/// A pooled connection handle with its expiration timestamp.
pub struct PooledConn {
    pub sender: HttpSender,
    /// Unix seconds after which the connection is no longer reused.
    pub expires_at: i64,
}

impl PooledConn {
    fn is_reusable(&self, curr_ts: i64) -> bool {
        !self.sender.is_closed() && self.expires_at > curr_ts
    }
}

/// Establishes new transport connections for the pool.
///
/// Production uses [`NetConnector`]; tests inject an in-memory transport.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn establish(
        &self,
        host: &str,
        service: &str,
        is_secure: bool,
    ) -> Result<HttpSender, EkpError>;
}

/// The connection pool proper.
#[derive(Default)]
pub struct RestConnectionPool {
    pools: Mutex<HashMap<PoolKey, VecDeque<PooledConn>>>,
}

impl RestConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check out a connection for `key`, reusing a pooled one when possible.
    ///
    /// Closed or expired entries encountered during checkout are discarded.
    /// When a new connection is created, the pool slot for `key` is ensured
    /// to exist before returning so a concurrent return cannot observe an
    /// unknown key.
    pub async fn connect(
        &self,
        connector: &dyn Connect,
        key: &PoolKey,
        is_secure: bool,
        max_conn_life: i64,
    ) -> Result<PooledConn, EkpError> {
        let curr_ts = unix_now();

        loop {
            let candidate = {
                let mut pools = self.pools.lock().unwrap();
                match pools.get_mut(key) {
                    Some(queue) => queue.pop_front(),
                    None => None,
                }
            };
            match candidate {
                Some(conn) if conn.is_reusable(curr_ts) => {
                    debug!(
                        host = %key.0,
                        service = %key.1,
                        expire_in = conn.expires_at - curr_ts,
                        "reusing pooled connection"
                    );
                    return Ok(conn);
                }
                Some(_) => continue, // dead or expired, drop and keep looking
                None => break,
            }
        }

        // No valid pooled connection, create a new one.
        let sender = connector.establish(&key.0, &key.1, is_secure).await?;
        let conn = PooledConn {
            sender,
            expires_at: curr_ts + max_conn_life,
        };
        self.pools.lock().unwrap().entry(key.clone()).or_default();

        debug!(host = %key.0, service = %key.1, "created new pooled connection");
        Ok(conn)
    }

    /// Return a connection after use.
    ///
    /// Fails with [`EkpError::PoolKeyNotFound`] for a key the pool has never
    /// seen. Live, unexpired connections are pushed to the back iff the
    /// queue holds fewer than `max_connections`; everything else is dropped.
    /// The handle is consumed either way.
    pub fn return_connection(
        &self,
        key: &PoolKey,
        conn: PooledConn,
        max_connections: usize,
    ) -> Result<(), EkpError> {
        let mut pools = self.pools.lock().unwrap();
        let queue = pools.get_mut(key).ok_or(EkpError::PoolKeyNotFound)?;
        if conn.is_reusable(unix_now()) && queue.len() < max_connections {
            queue.push_back(conn);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn pooled_count(&self, key: &PoolKey) -> usize {
        self.pools
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, VecDeque::len)
    }
}

/// Production connector: TCP connect, optional TLS handshake (webpki roots),
/// then HTTP/1 handshake. The connection driver is spawned onto the runtime.
pub struct NetConnector {
    tls: TlsConnector,
    connect_tries: i64,
    connect_timeout: Duration,
}

impl NetConnector {
    pub fn new(connect_tries: i64, connect_timeout_secs: i64) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            tls: TlsConnector::from(Arc::new(config)),
            connect_tries: connect_tries.max(1),
            connect_timeout: Duration::from_secs(connect_timeout_secs.max(1) as u64),
        }
    }

    async fn establish_once(
        &self,
        host: &str,
        service: &str,
        is_secure: bool,
    ) -> Result<HttpSender, EkpError> {
        let port: u16 = if service.is_empty() {
            if is_secure {
                443
            } else {
                80
            }
        } else {
            service.parse().map_err(|_| EkpError::ConnectionFailed)?
        };

        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|_| EkpError::ConnectionFailed)?;

        let (sender, driver) = if is_secure {
            let server_name =
                ServerName::try_from(host.to_owned()).map_err(|_| EkpError::ConnectionFailed)?;
            let tls = self
                .tls
                .connect(server_name, tcp)
                .await
                .map_err(|_| EkpError::ConnectionFailed)?;
            let (sender, conn) = http1::handshake(TokioIo::new(tls))
                .await
                .map_err(|_| EkpError::ConnectionFailed)?;
            (sender, tokio::spawn(async move { conn.await }))
        } else {
            let (sender, conn) = http1::handshake(TokioIo::new(tcp))
                .await
                .map_err(|_| EkpError::ConnectionFailed)?;
            (sender, tokio::spawn(async move { conn.await }))
        };

        // The driver owns the transport; it finishes when the peer or the
        // sender goes away.
        tokio::spawn(async move {
            if let Ok(Err(e)) = driver.await {
                debug!(error = %e, "pooled connection closed with error");
            }
        });

        Ok(sender)
    }
}

#[async_trait]
impl Connect for NetConnector {
    async fn establish(
        &self,
        host: &str,
        service: &str,
        is_secure: bool,
    ) -> Result<HttpSender, EkpError> {
        let mut last_err = EkpError::ConnectionFailed;
        for attempt in 0..self.connect_tries {
            match tokio::time::timeout(
                self.connect_timeout,
                self.establish_once(host, service, is_secure),
            )
            .await
            {
                Ok(Ok(sender)) => return Ok(sender),
                Ok(Err(e)) => last_err = e,
                Err(_) => last_err = EkpError::TimedOut,
            }
            warn!(host, service, attempt, error = %last_err, "connect attempt failed");
        }
        Err(last_err)
    }
}
