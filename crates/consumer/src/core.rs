//! Consumer core.
//!
//! One process owns all shared state: the intake, the aggregator, the
//! petal roster and the published-epoch set live behind a single lock, so
//! every mutation is serialized and HTTP readers see a consistent snapshot
//! per response. Locks are never held across an `.await`; the async
//! cascade intake → aggregate → publish is a bounded channel hand-off.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use flora_common::{
    AccountKeyInfo, ConsensusEntry, FloraConfig, LedgerClient, LedgerError,
};
use flora_store::HistoryStore;

use crate::aggregator::{Aggregator, ConsensusRound, EpochMetadata};
use crate::bootstrap::BootstrapState;
use crate::intake::{IntakeError, IntakeOutcome, IntakePolicy, ProofIntake};
use crate::publisher::{LeaderPublisher, PublishStamp, PublisherTuning};
use crate::roster::{KeyCache, PetalState, Roster, KEY_CACHE_TTL};

/// Buffered consensus hand-offs between intake and publisher.
const CONSENSUS_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("fatal configuration: missing {0}")]
    MissingConfig(&'static str),
}

/// Run counters, exposed through `/status`.
#[derive(Default)]
pub struct Counters {
    pub proofs_accepted: AtomicU64,
    pub proofs_rejected: AtomicU64,
    pub chunks_buffered: AtomicU64,
    pub entries_formed: AtomicU64,
    pub publish_attempts: AtomicU64,
    pub publish_failures: AtomicU64,
    pub tail_polls: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub proofs_accepted: u64,
    pub proofs_rejected: u64,
    pub chunks_buffered: u64,
    pub entries_formed: u64,
    pub publish_attempts: u64,
    pub publish_failures: u64,
    pub tail_polls: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            proofs_accepted: self.proofs_accepted.load(Ordering::Relaxed),
            proofs_rejected: self.proofs_rejected.load(Ordering::Relaxed),
            chunks_buffered: self.chunks_buffered.load(Ordering::Relaxed),
            entries_formed: self.entries_formed.load(Ordering::Relaxed),
            publish_attempts: self.publish_attempts.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            tail_polls: self.tail_polls.load(Ordering::Relaxed),
        }
    }
}

struct Core {
    intake: ProofIntake,
    aggregator: Aggregator,
    roster: Roster,
    /// Epochs whose consolidated proof went out through the leader path.
    published_epochs: HashSet<i64>,
}

pub struct Consumer {
    pub config: FloraConfig,
    pub ledger: Arc<dyn LedgerClient>,
    pub store: Arc<HistoryStore>,
    pub counters: Counters,
    core: Mutex<Core>,
    key_cache: KeyCache,
    publisher: LeaderPublisher,
    consensus_tx: mpsc::Sender<ConsensusRound>,
    publish_in_flight: Mutex<HashSet<i64>>,
    tail_cursor: Mutex<String>,
    started_at: Instant,
}

impl Consumer {
    /// Construct the consumer. Fatal configuration faults abort here,
    /// before any task is spawned.
    pub fn new(
        config: FloraConfig,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<HistoryStore>,
        bootstrap: BootstrapState,
        tuning: PublisherTuning,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ConsensusRound>), ConsumerError> {
        if config.flora_account_id.is_empty() {
            return Err(ConsumerError::MissingConfig("flora account id"));
        }
        if config.state_topic_id.is_empty() {
            return Err(ConsumerError::MissingConfig("flora state topic id"));
        }
        if config.coord_topic_id.is_empty() {
            return Err(ConsumerError::MissingConfig("coordination topic id"));
        }
        if config.txn_topic_id.is_empty() {
            return Err(ConsumerError::MissingConfig("transaction topic id"));
        }

        let intake = ProofIntake::new(IntakePolicy {
            flora_account_id: config.flora_account_id.clone(),
            threshold_fingerprint: config.threshold_fingerprint.clone(),
            registry_topic_id: config.registry_topic_id.clone(),
            expected_petals: config.expected_petals,
            petal_bindings: bootstrap.petal_bindings.clone(),
            expected_accounts: bootstrap.expected_accounts.clone(),
        });

        let mut aggregator = Aggregator::new(config.quorum, bootstrap.expected_accounts);
        let mut published_epochs = HashSet::new();
        match store.load_entries() {
            Ok(entries) => {
                for entry in &entries {
                    if entry.consensus_timestamp.is_some() {
                        published_epochs.insert(entry.epoch);
                    }
                }
                if !entries.is_empty() {
                    info!(entries = entries.len(), "consensus history loaded");
                }
                aggregator.seed_history(entries);
            }
            Err(err) => warn!(error = %err, "history load failed, starting empty"),
        }

        let publisher = LeaderPublisher::new(
            Arc::clone(&ledger),
            config.flora_account_id.clone(),
            config.state_topic_id.clone(),
            config.threshold_fingerprint.clone(),
            config.advertised_topics(),
            tuning,
        );

        let (consensus_tx, consensus_rx) = mpsc::channel(CONSENSUS_CHANNEL_CAPACITY);
        let consumer = Arc::new(Self {
            config,
            ledger,
            store,
            counters: Counters::default(),
            core: Mutex::new(Core { intake, aggregator, roster: Roster::new(), published_epochs }),
            key_cache: KeyCache::new(KEY_CACHE_TTL),
            publisher,
            consensus_tx,
            publish_in_flight: Mutex::new(HashSet::new()),
            tail_cursor: Mutex::new("0".to_string()),
            started_at: Instant::now(),
        });
        Ok((consumer, consensus_rx))
    }

    // ── intake → aggregation ────────────────────────────────────────────

    /// Handle one `/proof` body: intake validation, roster update,
    /// aggregation, persistence and the publisher hand-off.
    pub async fn submit_proof(
        &self,
        body: &serde_json::Value,
    ) -> Result<IntakeOutcome, IntakeError> {
        let (outcome, round) = {
            let mut core = self.core.lock();
            let outcome = match core.intake.submit(body) {
                Ok(outcome) => outcome,
                Err(err) => {
                    drop(core);
                    self.counters.proofs_rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
            };
            let round = match &outcome {
                IntakeOutcome::Accepted(proof) => {
                    core.roster.observe(proof);
                    let round = core.aggregator.accept((**proof).clone());
                    if let Some(round) = &round {
                        core.intake.drop_chunks_for_epoch(round.entry.epoch);
                    }
                    round
                }
                _ => None,
            };
            (outcome, round)
        };

        match &outcome {
            IntakeOutcome::Accepted(_) | IntakeOutcome::Duplicate => {
                self.counters.proofs_accepted.fetch_add(1, Ordering::Relaxed);
            }
            IntakeOutcome::ChunkBuffered { .. } => {
                self.counters.chunks_buffered.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(round) = round {
            self.counters.entries_formed.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.store.upsert_entry(&round.entry) {
                error!(epoch = round.entry.epoch, error = %err, "history persistence failed");
            }
            if self.config.leader_publish {
                if let Err(err) = self.consensus_tx.send(round).await {
                    warn!(error = %err, "publisher channel closed, consensus not handed off");
                }
            }
        }
        Ok(outcome)
    }

    // ── leader publication ──────────────────────────────────────────────

    /// Drain consensus rounds and publish each through the leader path.
    /// Runs until the channel closes.
    pub async fn run_publisher(self: Arc<Self>, mut rx: mpsc::Receiver<ConsensusRound>) {
        while let Some(round) = rx.recv().await {
            let consumer = Arc::clone(&self);
            tokio::spawn(async move { consumer.publish_with_retry(round).await });
        }
    }

    /// Publish one round, retrying with backoff until it lands. At most
    /// one in-flight publication per epoch; re-entrant rounds coalesce.
    pub async fn publish_with_retry(self: Arc<Self>, round: ConsensusRound) {
        let epoch = round.entry.epoch;
        if !self.publish_in_flight.lock().insert(epoch) {
            return;
        }
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.counters.publish_attempts.fetch_add(1, Ordering::Relaxed);
            match self.publisher.attempt(&round).await {
                Ok(stamp) => {
                    self.stamp_published(epoch, stamp);
                    break;
                }
                Err(err) => {
                    self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                    let delay = self.publisher.tuning().backoff_for(attempt);
                    warn!(epoch, attempt, error = %err, retry_in = ?delay, "publication failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        self.publish_in_flight.lock().remove(&epoch);
    }

    fn stamp_published(&self, epoch: i64, stamp: PublishStamp) {
        let updated = {
            let mut core = self.core.lock();
            core.published_epochs.insert(epoch);
            core.aggregator.apply_metadata(
                epoch,
                EpochMetadata {
                    hcs_message: Some(stamp.hcs_message.clone()),
                    consensus_timestamp: Some(stamp.consensus_timestamp.clone()),
                    sequence_number: Some(stamp.sequence_number),
                },
            )
        };
        let persist = match updated {
            Some(entry) => self.store.upsert_entry(&entry),
            // Metadata was already backfilled in memory; make sure the row
            // carries it too.
            None => self.store.fill_metadata(
                epoch,
                &stamp.hcs_message,
                &stamp.consensus_timestamp,
                stamp.sequence_number,
            ),
        };
        if let Err(err) = persist {
            error!(epoch, error = %err, "stamped entry persistence failed");
        }
    }

    // ── log metadata ────────────────────────────────────────────────────

    /// Fold metadata observed on the log into the epoch map, the history
    /// and the store. Already-set fields are untouched.
    pub fn apply_log_metadata(&self, epoch: i64, observed: EpochMetadata) {
        let updated = self.core.lock().aggregator.apply_metadata(epoch, observed);
        if let Some(entry) = updated {
            if let Err(err) = self.store.upsert_entry(&entry) {
                error!(epoch, error = %err, "metadata persistence failed");
            }
        }
    }

    /// Oldest consolidated epoch still missing log metadata.
    pub fn oldest_unstamped_epoch(&self) -> Option<i64> {
        self.core.lock().aggregator.oldest_unstamped_epoch()
    }

    // ── read side ───────────────────────────────────────────────────────

    /// The entry `/price/latest` serves: the newest leader-published entry
    /// when leader publishing is enabled, else the newest aggregated one.
    pub fn latest_entry(&self) -> Option<ConsensusEntry> {
        let core = self.core.lock();
        if self.config.leader_publish {
            core.published_epochs
                .iter()
                .max()
                .and_then(|epoch| core.aggregator.entry(*epoch))
                .cloned()
        } else {
            core.aggregator.latest().cloned()
        }
    }

    /// Newest-first history window.
    pub fn history_window(&self, offset: usize, limit: usize) -> (usize, Vec<ConsensusEntry>) {
        let core = self.core.lock();
        let history = core.aggregator.history();
        let total = history.len();
        let default_pointer = format!("hcs://17/{}", self.config.state_topic_id);
        let items = history
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .map(|mut entry| {
                if entry.hcs_message.is_none() {
                    entry.hcs_message = Some(default_pointer.clone());
                }
                entry
            })
            .collect();
        (total, items)
    }

    pub fn roster_snapshot(&self) -> Vec<PetalState> {
        self.core.lock().roster.petals()
    }

    pub fn aggregate_adapters(
        &self,
    ) -> (std::collections::BTreeSet<String>, std::collections::BTreeMap<String, String>) {
        let core = self.core.lock();
        (core.roster.aggregate_adapters(), core.roster.aggregate_fingerprints())
    }

    /// Account key through the 5-minute cache.
    pub async fn account_key(&self, account_id: &str) -> Result<AccountKeyInfo, LedgerError> {
        self.key_cache.get(&self.ledger, account_id).await
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    // ── tail cursor ─────────────────────────────────────────────────────

    pub fn tail_cursor(&self) -> String {
        self.tail_cursor.lock().clone()
    }

    /// Advance the cursor, strictly monotonically.
    pub fn advance_tail_cursor(&self, candidate: &str) -> bool {
        let mut cursor = self.tail_cursor.lock();
        if flora_common::ledger::is_after(candidate, &cursor) {
            *cursor = candidate.to_string();
            true
        } else {
            false
        }
    }

    pub fn set_tail_cursor(&self, cursor: String) {
        *self.tail_cursor.lock() = cursor;
    }
}
