//! Encryption key proxy: an in-process service between data-plane workers
//! that need cryptographic material and an external Key Management System.
//!
//! The proxy answers three kinds of request (latest base cipher keys per
//! encryption domain, base cipher keys by `(domainId, baseCipherId)` tuple,
//! and blob-storage credential metadata per blob domain), absorbing KMS
//! latency and outages through caching, proactive refresh, and bounded
//! retry.

pub mod buggify;
pub mod cache;
pub mod config;
pub mod kms;
pub mod proxy;
pub mod rest;
pub mod telemetry;
