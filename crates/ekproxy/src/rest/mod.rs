//! REST transport primitives for the KMS connector.
//!
//! # Responsibilities
//! - Parse KMS endpoint URLs and enforce the secure-only policy.
//! - Pool connections per `(host, service)` with bounded lifetime.
//! - Hold the tunable REST client knobs and their alias table.

pub mod knobs;
pub mod pool;
pub mod url;

pub use knobs::RestClientKnobs;
pub use pool::{Connect, NetConnector, PoolKey, PooledConn, RestConnectionPool};
pub use url::{ConnectionKind, RestUrl};
