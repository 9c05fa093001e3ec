//! Tunable REST client knobs.
//!
//! Seeded from [`Config`](crate::config::Config) at startup, then optionally
//! overridden by name. Each knob answers to its long name and a fixed
//! two/three-letter alias; unknown names fail with
//! [`EkpError::InvalidKnob`].

use std::collections::HashMap;

use common::EkpError;
use tracing::info;

use crate::config::Config;

/// REST client tunables, all plain integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestClientKnobs {
    /// Maximum pooled connections per `(host, service)` pair.
    pub connection_pool_size: i64,
    /// Connection establishment attempts before giving up.
    pub connect_tries: i64,
    /// Connection establishment timeout, seconds.
    pub connect_timeout: i64,
    /// Maximum lifetime of a pooled connection, seconds.
    pub max_connection_life: i64,
    /// Request attempts before giving up.
    pub request_tries: i64,
    /// Per-request timeout, seconds.
    pub request_timeout_secs: i64,
}

impl RestClientKnobs {
    /// Seed the knobs from the process configuration.
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            connection_pool_size: cfg.restclient_max_connectionpool_size,
            connect_tries: cfg.restclient_connect_tries,
            connect_timeout: cfg.restclient_connect_timeout,
            max_connection_life: cfg.restclient_max_connection_life,
            request_tries: cfg.restclient_request_tries,
            request_timeout_secs: cfg.restclient_request_timeout_secs,
        }
    }

    /// Apply named overrides. Long names and short aliases are accepted;
    /// the first unknown name fails the whole call.
    pub fn set(&mut self, overrides: &HashMap<String, i64>) -> Result<(), EkpError> {
        for (name, value) in overrides {
            let slot = match name.as_str() {
                "connection_pool_size" | "pz" => &mut self.connection_pool_size,
                "connect_tries" | "ct" => &mut self.connect_tries,
                "connect_timeout" | "cto" => &mut self.connect_timeout,
                "max_connection_life" | "mcl" => &mut self.max_connection_life,
                "request_tries" | "rt" => &mut self.request_tries,
                "request_timeout_secs" | "rtom" => &mut self.request_timeout_secs,
                _ => return Err(EkpError::InvalidKnob(name.clone())),
            };
            *slot = *value;
            info!(knob = %name, value, "REST client knob set");
        }
        Ok(())
    }

    /// Snapshot the current knob values by long name.
    pub fn get(&self) -> HashMap<String, i64> {
        HashMap::from([
            ("connection_pool_size".to_owned(), self.connection_pool_size),
            ("connect_tries".to_owned(), self.connect_tries),
            ("connect_timeout".to_owned(), self.connect_timeout),
            ("max_connection_life".to_owned(), self.max_connection_life),
            ("request_tries".to_owned(), self.request_tries),
            ("request_timeout_secs".to_owned(), self.request_timeout_secs),
        ])
    }
}

/// Parse a `name=value,name=value` override string, as carried by KMS
/// discovery configuration.
pub fn parse_knob_overrides(raw: &str) -> Result<HashMap<String, i64>, EkpError> {
    let mut overrides = HashMap::new();
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| EkpError::InvalidKnob(pair.trim().to_owned()))?;
        let value: i64 = value
            .trim()
            .parse()
            .map_err(|_| EkpError::InvalidKnob(name.trim().to_owned()))?;
        overrides.insert(name.trim().to_owned(), value);
    }
    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn knobs() -> RestClientKnobs {
        RestClientKnobs::from_config(&Config::default_for_tests())
    }

    #[test]
    fn long_and_short_names_set_the_same_knob() {
        let mut k = knobs();
        k.set(&HashMap::from([("connection_pool_size".to_owned(), 17)]))
            .unwrap();
        assert_eq!(k.connection_pool_size, 17);
        k.set(&HashMap::from([("pz".to_owned(), 23)])).unwrap();
        assert_eq!(k.connection_pool_size, 23);
    }

    #[test]
    fn unknown_name_fails() {
        let mut k = knobs();
        let err = k
            .set(&HashMap::from([("max_sockets".to_owned(), 5)]))
            .unwrap_err();
        assert_eq!(err, EkpError::InvalidKnob("max_sockets".into()));
    }

    #[test]
    fn snapshot_reflects_overrides() {
        let mut k = knobs();
        k.set(&HashMap::from([("rtom".to_owned(), 42)])).unwrap();
        assert_eq!(k.get()["request_timeout_secs"], 42);
    }

    #[test]
    fn override_string_parses() {
        let overrides = parse_knob_overrides("pz=4, request_tries=2").unwrap();
        assert_eq!(overrides["pz"], 4);
        assert_eq!(overrides["request_tries"], 2);
        assert!(parse_knob_overrides("").unwrap().is_empty());
        assert!(parse_knob_overrides("pz").is_err());
        assert!(parse_knob_overrides("pz=abc").is_err());
    }
}
