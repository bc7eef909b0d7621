//! Petal roster and account-key cache.
//!
//! Tracks, per petal, what has been observed this run: account id, state
//! topic, adapter set and registry fingerprints. Account public keys are
//! fetched from the ledger through a small LRU with a 5-minute TTL.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use flora_common::{AccountKeyInfo, LedgerClient, LedgerError, ProofPayload};

/// Account keys are cached this long.
pub const KEY_CACHE_TTL: Duration = Duration::from_secs(300);
const KEY_CACHE_CAPACITY: usize = 128;

/// Everything observed about one petal this run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PetalState {
    pub petal_id: String,
    pub account_id: String,
    pub state_topic_id: String,
    pub adapters: BTreeSet<String>,
    pub fingerprints: BTreeMap<String, String>,
    pub last_epoch: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_type: Option<String>,
}

#[derive(Default)]
pub struct Roster {
    petals: HashMap<String, PetalState>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an accepted proof into the roster.
    pub fn observe(&mut self, proof: &ProofPayload) {
        let state = self.petals.entry(proof.petal_id.clone()).or_insert_with(|| PetalState {
            petal_id: proof.petal_id.clone(),
            account_id: proof.petal_account_id.clone(),
            state_topic_id: proof.petal_state_topic_id.clone(),
            adapters: BTreeSet::new(),
            fingerprints: BTreeMap::new(),
            last_epoch: -1,
            public_key: None,
            key_type: None,
        });
        state.account_id = proof.petal_account_id.clone();
        state.last_epoch = state.last_epoch.max(proof.epoch);
        for record in &proof.records {
            state.adapters.insert(record.adapter_id.clone());
        }
        for (adapter, fingerprint) in &proof.adapter_fingerprints {
            state.fingerprints.insert(adapter.clone(), fingerprint.clone());
        }
    }

    /// Sorted snapshot of all petals seen this run.
    pub fn petals(&self) -> Vec<PetalState> {
        let mut petals: Vec<PetalState> = self.petals.values().cloned().collect();
        petals.sort_by(|a, b| a.petal_id.cmp(&b.petal_id));
        petals
    }

    /// Union of every petal's adapter set.
    pub fn aggregate_adapters(&self) -> BTreeSet<String> {
        self.petals.values().flat_map(|p| p.adapters.iter().cloned()).collect()
    }

    /// Union of every petal's fingerprints (last writer wins per adapter;
    /// matching petals agree anyway).
    pub fn aggregate_fingerprints(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for petal in self.petals.values() {
            for (adapter, fingerprint) in &petal.fingerprints {
                out.insert(adapter.clone(), fingerprint.clone());
            }
        }
        out
    }
}

/// Per-account public-key cache in front of the ledger.
pub struct KeyCache {
    entries: Mutex<LruCache<String, (Instant, AccountKeyInfo)>>,
    ttl: Duration,
}

impl KeyCache {
    pub fn new(ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(KEY_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self { entries: Mutex::new(LruCache::new(capacity)), ttl }
    }

    pub async fn get(
        &self,
        ledger: &Arc<dyn LedgerClient>,
        account_id: &str,
    ) -> Result<AccountKeyInfo, LedgerError> {
        if let Some((fetched_at, info)) = self.entries.lock().get(account_id) {
            if fetched_at.elapsed() < self.ttl {
                return Ok(info.clone());
            }
        }
        let info = ledger.account_key(account_id).await?;
        self.entries.lock().put(account_id.to_string(), (Instant::now(), info.clone()));
        Ok(info)
    }
}
