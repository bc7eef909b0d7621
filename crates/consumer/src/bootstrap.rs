//! Bootstrap state.
//!
//! The registry bootstrap itself (topic provisioning, manifest pointers)
//! is an external collaborator; what the core consumes is narrow: on
//! first boot the configured identifiers are persisted into `app_state`,
//! and on every later boot the cached values win. The epoch origin is
//! clamped so a restart can never sit in a future epoch.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use flora_common::account::normalize_participants;
use flora_common::epoch::clamp_origin;
use flora_common::FloraConfig;
use flora_store::{state_keys, HistoryStore, StoreError};

/// What the bootstrap hands the consumer core.
#[derive(Debug, Clone, Default)]
pub struct BootstrapState {
    /// Petal label → account id, when known.
    pub petal_bindings: HashMap<String, String>,
    /// Full member account ids, when every configured participant has a
    /// binding.
    pub expected_accounts: Option<Vec<String>>,
    pub epoch_origin_ms: i64,
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Load-or-create bootstrap state and reconcile `config` with it.
pub fn run_bootstrap(
    store: &HistoryStore,
    config: &mut FloraConfig,
) -> Result<BootstrapState, StoreError> {
    run_bootstrap_at(store, config, now_unix_ms())
}

pub fn run_bootstrap_at(
    store: &HistoryStore,
    config: &mut FloraConfig,
    now_ms: i64,
) -> Result<BootstrapState, StoreError> {
    // Epoch origin: first boot persists the configured value, restarts
    // reuse the cached one.
    let epoch_origin_ms = match store.get_state(state_keys::EPOCH_ORIGIN_MS)? {
        Some(raw) => match raw.parse::<i64>() {
            Ok(cached) => clamp_origin(cached, now_ms),
            Err(_) => {
                warn!(value = %raw, "cached epoch origin unreadable, using configured value");
                config.epoch_origin_ms
            }
        },
        None => {
            let origin = clamp_origin(config.epoch_origin_ms, now_ms);
            store.put_state(state_keys::EPOCH_ORIGIN_MS, &origin.to_string())?;
            info!(origin, "epoch origin persisted");
            origin
        }
    };
    config.epoch_origin_ms = epoch_origin_ms;

    // Topic ids: cache on first boot so a redeploy with a bad environment
    // is visible in the store.
    if store.get_state(state_keys::FLORA_TOPICS)?.is_none() {
        let topics = serde_json::to_string(&config.advertised_topics())?;
        store.put_state(state_keys::FLORA_TOPICS, &topics)?;
    }

    // Petal label → account bindings, when a previous run (or an operator)
    // recorded them.
    let petal_bindings: HashMap<String, String> =
        match store.get_state(state_keys::PETAL_BINDINGS)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(error = %err, "petal bindings unreadable, ignoring");
                HashMap::new()
            }),
            None => HashMap::new(),
        };

    // The full member list is only known when every configured
    // participant label resolves to an account.
    let expected_accounts = if !config.participants.is_empty()
        && config.participants.iter().all(|label| petal_bindings.contains_key(label))
    {
        Some(normalize_participants(
            config.participants.iter().filter_map(|label| petal_bindings.get(label)),
        ))
    } else {
        None
    };

    Ok(BootstrapState { petal_bindings, expected_accounts, epoch_origin_ms })
}

/// Record a petal binding for future runs.
pub fn record_binding(
    store: &HistoryStore,
    petal_id: &str,
    account_id: &str,
) -> Result<(), StoreError> {
    let mut bindings: HashMap<String, String> =
        match store.get_state(state_keys::PETAL_BINDINGS)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => HashMap::new(),
        };
    bindings.insert(petal_id.to_string(), account_id.to_string());
    store.put_state(state_keys::PETAL_BINDINGS, &serde_json::to_string(&bindings)?)
}
