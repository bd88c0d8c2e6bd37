//! Session-level transaction configuration
//!
//! Mirrors the session variables the SQL surface exposes. A connection owns
//! one `TxnConfig`; each transaction snapshots it at begin.

use crate::{IsolationLevel, TxnMode};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Error raised for malformed session variable values
#[derive(Debug, Error)]
#[error("invalid value {value:?} for session variable {key}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
}

/// Transaction configuration derived from session variables
#[derive(Debug, Clone)]
pub struct TxnConfig {
    /// Default transaction type when none is requested explicitly
    pub mode: TxnMode,
    /// Store-level isolation
    pub isolation: IsolationLevel,
    /// Deadline for table-lock waits and for the primary commit retry loop
    pub lock_wait_timeout: Duration,
    /// Per-job deadline; zero means unbounded
    pub max_execution_time: Duration,
    /// Enables statement-level retry on write conflict for auto-commit statements
    pub txn_retry: bool,
    /// Bound on statement retries
    pub txn_retry_cnt: u32,
    /// TTL stamped on prewrite and pessimistic locks; the heartbeat runs at TTL/3
    pub lock_ttl: Duration,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            mode: TxnMode::Optimistic,
            isolation: IsolationLevel::SnapshotIsolation,
            lock_wait_timeout: Duration::from_secs(50),
            max_execution_time: Duration::ZERO,
            txn_retry: false,
            txn_retry_cnt: 0,
            lock_ttl: Duration::from_secs(3),
        }
    }
}

impl TxnConfig {
    /// Apply a map of session variables.
    ///
    /// Unknown keys are ignored (the session holds many variables this crate
    /// does not care about); known keys with malformed values are an error.
    pub fn apply_session_vars(
        &mut self,
        vars: &HashMap<String, String>,
    ) -> Result<(), ConfigError> {
        for (key, value) in vars {
            match key.as_str() {
                "txn_mode" => {
                    self.mode = TxnMode::from_session_value(value)
                        .ok_or_else(|| invalid(key, value))?;
                }
                "lock_wait_timeout" => {
                    let secs: u64 = value.parse().map_err(|_| invalid(key, value))?;
                    self.lock_wait_timeout = Duration::from_secs(secs);
                }
                "max_execution_time" => {
                    let millis: u64 = value.parse().map_err(|_| invalid(key, value))?;
                    self.max_execution_time = Duration::from_millis(millis);
                }
                "txn_retry" => {
                    self.txn_retry = match value.to_ascii_lowercase().as_str() {
                        "on" => true,
                        "off" => false,
                        _ => return Err(invalid(key, value)),
                    };
                }
                "txn_retry_cnt" => {
                    self.txn_retry_cnt = value.parse().map_err(|_| invalid(key, value))?;
                }
                "transaction_isolation" => {
                    self.isolation = IsolationLevel::from_session_value(value)
                        .ok_or_else(|| invalid(key, value))?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Heartbeat cadence for pessimistic primary locks
    pub fn heartbeat_interval(&self) -> Duration {
        self.lock_ttl / 3
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = TxnConfig::default();
        assert_eq!(config.mode, TxnMode::Optimistic);
        assert_eq!(config.lock_wait_timeout, Duration::from_secs(50));
        assert_eq!(config.max_execution_time, Duration::ZERO);
        assert!(!config.txn_retry);
        assert_eq!(config.txn_retry_cnt, 0);
    }

    #[test]
    fn test_apply_session_vars() {
        let mut config = TxnConfig::default();
        config
            .apply_session_vars(&vars(&[
                ("txn_mode", "pessimistic"),
                ("lock_wait_timeout", "1"),
                ("txn_retry", "on"),
                ("txn_retry_cnt", "2"),
                ("transaction_isolation", "READ-COMMITTED"),
                ("sql_mode", "ANSI"),
            ]))
            .unwrap();

        assert_eq!(config.mode, TxnMode::Pessimistic);
        assert_eq!(config.lock_wait_timeout, Duration::from_secs(1));
        assert!(config.txn_retry);
        assert_eq!(config.txn_retry_cnt, 2);
        assert_eq!(config.isolation, IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_malformed_value() {
        let mut config = TxnConfig::default();
        let err = config
            .apply_session_vars(&vars(&[("lock_wait_timeout", "soon")]))
            .unwrap_err();
        assert_eq!(err.key, "lock_wait_timeout");
    }

    #[test]
    fn test_heartbeat_interval() {
        let config = TxnConfig {
            lock_ttl: Duration::from_secs(3),
            ..TxnConfig::default()
        };
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
    }
}
