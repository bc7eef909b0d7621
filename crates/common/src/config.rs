//! Environment-driven configuration.
//!
//! Both binaries configure themselves from the environment and fail fast:
//! a missing flora account id or state/coordination/transaction topic id
//! aborts startup before any task is spawned. Parsing is factored over a
//! lookup function so tests can feed a plain map instead of the process
//! environment.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::epoch::clamp_origin;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {reason}")]
    InvalidVar { name: &'static str, reason: String },
}

/// Which ledger backend the process wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMode {
    /// In-memory ledger; single-machine floras and tests.
    Mock,
    /// An SDK-backed `LedgerClient` supplied by the embedding process.
    External,
}

/// Flora-wide configuration shared by petals and the consumer.
#[derive(Debug, Clone)]
pub struct FloraConfig {
    pub network: String,
    pub flora_account_id: String,
    /// Petal labels, as configured. Account bindings resolve through the
    /// bootstrap store at runtime.
    pub participants: Vec<String>,
    pub threshold: u32,
    pub threshold_fingerprint: String,
    pub block_time_ms: i64,
    pub quorum: usize,
    pub expected_petals: usize,
    /// Shared epoch origin, clamped ≤ now so no epoch sits in the future.
    pub epoch_origin_ms: i64,
    pub poll_interval_ms: u64,
    pub mirror_base_url: Option<String>,
    pub state_topic_id: String,
    pub coord_topic_id: String,
    pub txn_topic_id: String,
    pub registry_topic_id: String,
    pub discovery_topic_id: Option<String>,
    pub port: u16,
    pub db_path: String,
    pub petal_key_secret: Option<String>,
    pub publish_state_topic: bool,
    pub leader_publish: bool,
    pub ledger_mode: LedgerMode,
}

/// Per-petal identity on top of the shared flora config.
#[derive(Debug, Clone)]
pub struct PetalConfig {
    pub petal_id: String,
    pub petal_account_id: String,
    pub petal_state_topic_id: String,
    /// Consumer `/proof` endpoint base, e.g. `http://127.0.0.1:8080`.
    pub consumer_url: String,
    pub adapter_timeout_ms: u64,
    pub flora: FloraConfig,
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn required(lookup: &dyn Fn(&str) -> Option<String>, name: &'static str) -> Result<String, ConfigError> {
    match lookup(name) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

fn optional(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match optional(lookup, name) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidVar {
            name,
            reason: format!("cannot parse {raw:?}"),
        }),
    }
}

fn parse_bool_or(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match optional(lookup, name).as_deref() {
        None => Ok(default),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") => Ok(false),
        Some(other) => Err(ConfigError::InvalidVar { name, reason: format!("not a bool: {other:?}") }),
    }
}

impl FloraConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|name| std::env::var(name).ok(), now_unix_ms())
    }

    pub fn from_lookup(
        lookup: &dyn Fn(&str) -> Option<String>,
        now_ms: i64,
    ) -> Result<Self, ConfigError> {
        let quorum: usize = parse_or(lookup, "QUORUM", 2)?;
        if quorum == 0 {
            return Err(ConfigError::InvalidVar { name: "QUORUM", reason: "must be at least 1".into() });
        }
        let block_time_ms: i64 = parse_or(lookup, "BLOCK_TIME_MS", 2000)?;
        if block_time_ms <= 0 {
            return Err(ConfigError::InvalidVar {
                name: "BLOCK_TIME_MS",
                reason: "must be positive".into(),
            });
        }
        let epoch_origin_ms = clamp_origin(parse_or(lookup, "EPOCH_ORIGIN_MS", now_ms)?, now_ms);

        Ok(Self {
            network: optional(lookup, "HEDERA_NETWORK").unwrap_or_else(|| "testnet".to_string()),
            flora_account_id: required(lookup, "FLORA_ACCOUNT_ID")?,
            participants: optional(lookup, "FLORA_PARTICIPANTS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            threshold: parse_or(lookup, "FLORA_THRESHOLD", 2)?,
            threshold_fingerprint: required(lookup, "THRESHOLD_FINGERPRINT")?,
            block_time_ms,
            quorum,
            expected_petals: parse_or(lookup, "EXPECTED_PETALS", 3)?,
            epoch_origin_ms,
            poll_interval_ms: parse_or(lookup, "POLL_INTERVAL_MS", 10_000)?,
            mirror_base_url: optional(lookup, "MIRROR_BASE_URL"),
            state_topic_id: required(lookup, "FLORA_STATE_TOPIC")?,
            coord_topic_id: required(lookup, "FLORA_COORD_TOPIC")?,
            txn_topic_id: required(lookup, "FLORA_TXN_TOPIC")?,
            registry_topic_id: required(lookup, "REGISTRY_TOPIC")?,
            discovery_topic_id: optional(lookup, "DISCOVERY_TOPIC"),
            port: parse_or(lookup, "PORT", 8080)?,
            db_path: optional(lookup, "DB_PATH").unwrap_or_else(|| "flora.db".to_string()),
            petal_key_secret: optional(lookup, "PETAL_KEY_SECRET"),
            publish_state_topic: parse_bool_or(lookup, "PETAL_PUBLISH_STATE_TOPIC", true)?,
            leader_publish: parse_bool_or(lookup, "LEADER_PUBLISH", true)?,
            ledger_mode: match optional(lookup, "LEDGER_MODE").as_deref() {
                None | Some("mock") => LedgerMode::Mock,
                Some("external") => LedgerMode::External,
                Some(other) => {
                    return Err(ConfigError::InvalidVar {
                        name: "LEDGER_MODE",
                        reason: format!("expected mock|external, got {other:?}"),
                    })
                }
            },
        })
    }

    /// All topic ids the consolidated message advertises, in order.
    pub fn advertised_topics(&self) -> Vec<String> {
        let mut topics = vec![
            self.state_topic_id.clone(),
            self.coord_topic_id.clone(),
            self.txn_topic_id.clone(),
            self.registry_topic_id.clone(),
        ];
        if let Some(discovery) = &self.discovery_topic_id {
            topics.push(discovery.clone());
        }
        topics
    }
}

impl PetalConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|name| std::env::var(name).ok(), now_unix_ms())
    }

    pub fn from_lookup(
        lookup: &dyn Fn(&str) -> Option<String>,
        now_ms: i64,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            petal_id: required(lookup, "PETAL_ID")?,
            petal_account_id: required(lookup, "PETAL_ACCOUNT_ID")?,
            petal_state_topic_id: required(lookup, "PETAL_STATE_TOPIC")?,
            consumer_url: optional(lookup, "CONSUMER_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8080".to_string()),
            adapter_timeout_ms: parse_or(lookup, "ADAPTER_TIMEOUT_MS", 4000)?,
            flora: FloraConfig::from_lookup(lookup, now_ms)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<String, String> {
        [
            ("FLORA_ACCOUNT_ID", "0.0.1000"),
            ("THRESHOLD_FINGERPRINT", "tf-1"),
            ("FLORA_STATE_TOPIC", "0.0.600"),
            ("FLORA_COORD_TOPIC", "0.0.601"),
            ("FLORA_TXN_TOPIC", "0.0.602"),
            ("REGISTRY_TOPIC", "0.0.500"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn lookup(env: &HashMap<String, String>) -> impl Fn(&str) -> Option<String> + '_ {
        move |name| env.get(name).cloned()
    }

    #[test]
    fn defaults_applied() {
        let env = base_env();
        let cfg = FloraConfig::from_lookup(&lookup(&env), 1_000_000).expect("config");
        assert_eq!(cfg.block_time_ms, 2000);
        assert_eq!(cfg.quorum, 2);
        assert_eq!(cfg.expected_petals, 3);
        assert_eq!(cfg.poll_interval_ms, 10_000);
        assert_eq!(cfg.epoch_origin_ms, 1_000_000);
        assert!(cfg.publish_state_topic);
        assert!(cfg.leader_publish);
        assert_eq!(cfg.ledger_mode, LedgerMode::Mock);
    }

    #[test]
    fn missing_flora_account_is_fatal() {
        let mut env = base_env();
        env.remove("FLORA_ACCOUNT_ID");
        let err = FloraConfig::from_lookup(&lookup(&env), 0).expect_err("accepted");
        assert!(matches!(err, ConfigError::MissingVar("FLORA_ACCOUNT_ID")));
    }

    #[test]
    fn missing_topic_ids_are_fatal() {
        for var in ["FLORA_STATE_TOPIC", "FLORA_COORD_TOPIC", "FLORA_TXN_TOPIC"] {
            let mut env = base_env();
            env.remove(var);
            assert!(FloraConfig::from_lookup(&lookup(&env), 0).is_err(), "{var} not required");
        }
    }

    #[test]
    fn future_epoch_origin_is_clamped() {
        let mut env = base_env();
        env.insert("EPOCH_ORIGIN_MS".into(), "9000000".into());
        let cfg = FloraConfig::from_lookup(&lookup(&env), 1_000_000).expect("config");
        assert_eq!(cfg.epoch_origin_ms, 1_000_000);
    }

    #[test]
    fn participants_parsed_from_csv() {
        let mut env = base_env();
        env.insert("FLORA_PARTICIPANTS".into(), "petal-a, petal-b ,petal-c".into());
        let cfg = FloraConfig::from_lookup(&lookup(&env), 0).expect("config");
        assert_eq!(cfg.participants, vec!["petal-a", "petal-b", "petal-c"]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut env = base_env();
        env.insert("QUORUM".into(), "0".into());
        assert!(FloraConfig::from_lookup(&lookup(&env), 0).is_err());

        let mut env = base_env();
        env.insert("BLOCK_TIME_MS".into(), "-5".into());
        assert!(FloraConfig::from_lookup(&lookup(&env), 0).is_err());

        let mut env = base_env();
        env.insert("LEDGER_MODE".into(), "sdk".into());
        assert!(FloraConfig::from_lookup(&lookup(&env), 0).is_err());
    }

    #[test]
    fn petal_config_requires_identity() {
        let mut env = base_env();
        env.insert("PETAL_ID".into(), "petal-a".into());
        env.insert("PETAL_ACCOUNT_ID".into(), "0.0.10".into());
        env.insert("PETAL_STATE_TOPIC".into(), "0.0.100".into());
        let cfg = PetalConfig::from_lookup(&lookup(&env), 0).expect("config");
        assert_eq!(cfg.adapter_timeout_ms, 4000);
        assert_eq!(cfg.consumer_url, "http://127.0.0.1:8080");

        env.remove("PETAL_ACCOUNT_ID");
        assert!(PetalConfig::from_lookup(&lookup(&env), 0).is_err());
    }
}
