//! Tracing pipeline setup: structured JSON logs with env-based filtering.
//!
//! # Telemetry invariants
//!
//! - **No key material** must appear in any span attribute or log field.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`).

pub mod init;

pub use init::init_telemetry;
