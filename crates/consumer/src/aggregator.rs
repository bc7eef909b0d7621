//! Per-epoch proof aggregation.
//!
//! The aggregator owns the epoch buckets, the epoch-metadata map and the
//! in-memory history. On every accepted proof it looks for the plurality
//! state-hash group meeting quorum, re-derives the hash from the first
//! matching proof as an integrity guard, and emits one [`ConsensusEntry`]
//! per `(epoch, stateHash)`: first quorum wins, later matching proofs
//! change nothing but metadata.
//!
//! All methods are synchronous and run under the consumer's lock; nothing
//! here suspends.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use flora_common::account::{is_account_id, normalize_participants};
use flora_common::{ConsensusEntry, ProofPayload, SourcePrice};

/// Consolidated epochs keep their proof bucket for this many later epochs,
/// so late arrivals can still be validated against the published hash.
const BUCKET_TAIL_EPOCHS: i64 = 16;

/// Log metadata for an epoch, possibly observed before the entry forms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochMetadata {
    pub hcs_message: Option<String>,
    pub consensus_timestamp: Option<String>,
    pub sequence_number: Option<u64>,
}

impl EpochMetadata {
    fn merge_into_entry(&self, entry: &mut ConsensusEntry) -> bool {
        let mut changed = false;
        if entry.hcs_message.is_none() && self.hcs_message.is_some() {
            entry.hcs_message = self.hcs_message.clone();
            changed = true;
        }
        if entry.consensus_timestamp.is_none() && self.consensus_timestamp.is_some() {
            entry.consensus_timestamp = self.consensus_timestamp.clone();
            changed = true;
        }
        if entry.sequence_number.is_none() && self.sequence_number.is_some() {
            entry.sequence_number = self.sequence_number;
            changed = true;
        }
        changed
    }

    fn fill_from(&mut self, other: &EpochMetadata) {
        if self.hcs_message.is_none() {
            self.hcs_message = other.hcs_message.clone();
        }
        if self.consensus_timestamp.is_none() {
            self.consensus_timestamp = other.consensus_timestamp.clone();
        }
        if self.sequence_number.is_none() {
            self.sequence_number = other.sequence_number;
        }
    }
}

/// A freshly formed consensus, handed to the leader publisher.
#[derive(Debug, Clone)]
pub struct ConsensusRound {
    pub entry: ConsensusEntry,
    /// The proofs that agreed on the state hash, in arrival order.
    pub matching: Vec<ProofPayload>,
}

pub struct Aggregator {
    quorum: usize,
    /// Full member account ids when the bootstrap store knows them.
    expected_accounts: Option<Vec<String>>,
    buckets: HashMap<i64, Vec<ProofPayload>>,
    metadata: HashMap<i64, EpochMetadata>,
    /// Sorted ascending by epoch at all times.
    history: Vec<ConsensusEntry>,
    emitted: HashSet<i64>,
    highest_epoch_seen: i64,
}

impl Aggregator {
    pub fn new(quorum: usize, expected_accounts: Option<Vec<String>>) -> Self {
        Self {
            quorum: quorum.max(1),
            expected_accounts,
            buckets: HashMap::new(),
            metadata: HashMap::new(),
            history: Vec::new(),
            emitted: HashSet::new(),
            highest_epoch_seen: -1,
        }
    }

    /// Seed the in-memory history from the store at startup. Entries must
    /// already be sorted ascending.
    pub fn seed_history(&mut self, entries: Vec<ConsensusEntry>) {
        for entry in &entries {
            self.emitted.insert(entry.epoch);
            self.highest_epoch_seen = self.highest_epoch_seen.max(entry.epoch);
        }
        self.history = entries;
    }

    /// Append an accepted proof and attempt aggregation. Returns the new
    /// round when this proof completes a quorum.
    pub fn accept(&mut self, proof: ProofPayload) -> Option<ConsensusRound> {
        let epoch = proof.epoch;
        self.highest_epoch_seen = self.highest_epoch_seen.max(epoch);
        self.buckets.entry(epoch).or_default().push(proof);
        self.gc_buckets();

        if self.emitted.contains(&epoch) {
            return None;
        }
        let round = self.try_aggregate(epoch)?;
        self.emitted.insert(epoch);
        let position = self.history.partition_point(|e| e.epoch < round.entry.epoch);
        self.history.insert(position, round.entry.clone());
        debug!(
            epoch,
            price = round.entry.price,
            participants = round.entry.participants.len(),
            "consensus formed"
        );
        Some(round)
    }

    fn try_aggregate(&mut self, epoch: i64) -> Option<ConsensusRound> {
        let bucket = self.buckets.get(&epoch)?;
        if bucket.len() < self.quorum {
            return None;
        }

        // Group by state hash, preserving first-occurrence order so equal
        // group sizes resolve deterministically.
        let mut groups: Vec<(&str, Vec<&ProofPayload>)> = Vec::new();
        for proof in bucket {
            match groups.iter_mut().find(|(hash, _)| *hash == proof.state_hash) {
                Some((_, members)) => members.push(proof),
                None => groups.push((&proof.state_hash, vec![proof])),
            }
        }
        // Strict `>` keeps the first group on equal sizes.
        let mut best: Option<(&str, Vec<&ProofPayload>)> = None;
        for (hash, members) in groups {
            if best.as_ref().map_or(true, |(_, b)| members.len() > b.len()) {
                best = Some((hash, members));
            }
        }
        let (state_hash, matching) = best?;
        if matching.len() < self.quorum {
            return None;
        }

        // Integrity guard: the chosen hash must re-derive from the first
        // matching proof's own fields.
        let recomputed = matching[0].expected_state_hash();
        if recomputed != state_hash {
            warn!(epoch, claimed = %state_hash, %recomputed, "state hash mismatch, dropping consensus attempt");
            return None;
        }

        let prices: Vec<f64> =
            matching.iter().flat_map(|proof| proof.record_prices()).collect();
        let price = median(&prices)?;

        let participants = resolve_participants(self.expected_accounts.as_deref(), &matching);
        let sources = matching[0]
            .records
            .iter()
            .filter_map(|record| {
                Some(SourcePrice {
                    source: record.source()?.to_string(),
                    price: record.price()?,
                })
            })
            .collect();

        let mut entry = ConsensusEntry {
            epoch,
            state_hash: state_hash.to_string(),
            price,
            timestamp: matching[0].timestamp.clone(),
            participants,
            sources,
            hcs_message: None,
            consensus_timestamp: None,
            sequence_number: None,
        };
        if let Some(meta) = self.metadata.get(&epoch) {
            meta.merge_into_entry(&mut entry);
        }
        let matching: Vec<ProofPayload> = matching.into_iter().cloned().collect();
        Some(ConsensusRound { entry, matching })
    }

    fn gc_buckets(&mut self) {
        let horizon = self.highest_epoch_seen - BUCKET_TAIL_EPOCHS;
        self.buckets.retain(|epoch, _| *epoch >= horizon || !self.emitted.contains(epoch));
    }

    /// Record log metadata for an epoch. Fields already set, on the map
    /// or on a history entry, are never overwritten. Returns the updated
    /// entry when one exists and changed, for re-persistence.
    pub fn apply_metadata(&mut self, epoch: i64, observed: EpochMetadata) -> Option<ConsensusEntry> {
        self.metadata.entry(epoch).or_default().fill_from(&observed);
        let merged = self.metadata.get(&epoch).cloned().unwrap_or_default();
        let entry = self.history.iter_mut().find(|e| e.epoch == epoch)?;
        if merged.merge_into_entry(entry) {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// The proofs that formed (or are forming) an epoch's bucket.
    pub fn proofs_for(&self, epoch: i64) -> &[ProofPayload] {
        self.buckets.get(&epoch).map(Vec::as_slice).unwrap_or_default()
    }

    /// History snapshot, ascending by epoch.
    pub fn history(&self) -> &[ConsensusEntry] {
        &self.history
    }

    pub fn entry(&self, epoch: i64) -> Option<&ConsensusEntry> {
        self.history.iter().find(|e| e.epoch == epoch)
    }

    /// Latest aggregated entry.
    pub fn latest(&self) -> Option<&ConsensusEntry> {
        self.history.last()
    }

    /// Latest entry carrying a consensus timestamp (i.e. published or
    /// backfilled from the log).
    pub fn latest_stamped(&self) -> Option<&ConsensusEntry> {
        self.history.iter().rev().find(|e| e.consensus_timestamp.is_some())
    }

    /// Oldest consolidated epoch still waiting for log metadata; the
    /// tailer's fallback target for messages without an epoch.
    pub fn oldest_unstamped_epoch(&self) -> Option<i64> {
        self.history.iter().find(|e| e.consensus_timestamp.is_none()).map(|e| e.epoch)
    }
}

/// Median of `prices`, rounded to 8 decimals. Even counts take the
/// arithmetic mean of the two middles.
pub fn median(prices: &[f64]) -> Option<f64> {
    if prices.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = prices.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    let raw = if n % 2 == 1 { sorted[n / 2] } else { (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0 };
    Some(round8(raw))
}

fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

/// §4.6 participant resolution: bootstrap account ids when known, else
/// well-formed account ids from the proofs' participant sets, else each
/// proof's `petalAccountId`. Always deduplicated and canonically sorted.
fn resolve_participants(
    expected_accounts: Option<&[String]>,
    matching: &[&ProofPayload],
) -> Vec<String> {
    if let Some(accounts) = expected_accounts {
        return normalize_participants(accounts);
    }
    let from_proofs: Vec<&str> = matching
        .iter()
        .flat_map(|proof| proof.participants.iter())
        .map(String::as_str)
        .filter(|id| is_account_id(id.trim()))
        .collect();
    if !from_proofs.is_empty() {
        return normalize_participants(from_proofs);
    }
    normalize_participants(matching.iter().map(|proof| proof.petal_account_id.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flora_common::types::{compute_state_hash, sort_records};
    use flora_common::AdapterRecord;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn record(adapter: &str, price: f64) -> AdapterRecord {
        let mut payload = serde_json::Map::new();
        payload.insert("price".into(), json!(price));
        payload.insert("source".into(), json!(adapter));
        let mut r = AdapterRecord {
            adapter_id: adapter.into(),
            entity_id: "HBAR-USD".into(),
            payload,
            timestamp: "2024-01-01T00:00:00.000Z".into(),
            source_fingerprint: String::new(),
        };
        r.source_fingerprint = r.compute_fingerprint();
        r
    }

    fn proof(petal: &str, account: &str, epoch: i64, prices: &[(&str, f64)]) -> ProofPayload {
        let mut records: Vec<AdapterRecord> =
            prices.iter().map(|(adapter, price)| record(adapter, *price)).collect();
        sort_records(&mut records);
        let mut fingerprints = BTreeMap::new();
        for r in &records {
            fingerprints.insert(r.adapter_id.clone(), r.source_fingerprint.clone());
        }
        let state_hash = compute_state_hash(&records, "tf-1", &fingerprints, "0.0.500");
        ProofPayload {
            epoch,
            state_hash,
            threshold_fingerprint: "tf-1".into(),
            petal_id: petal.into(),
            petal_account_id: account.into(),
            petal_state_topic_id: format!("topic-{petal}"),
            flora_account_id: "0.0.1000".into(),
            participants: vec!["0.0.10".into(), "0.0.11".into(), "0.0.12".into()],
            records,
            adapter_fingerprints: fingerprints,
            registry_topic_id: "0.0.500".into(),
            timestamp: "2024-01-01T00:00:00.000Z".into(),
            hcs_message: None,
            consensus_timestamp: None,
            sequence_number: None,
        }
    }

    const FEED: &[(&str, f64)] =
        &[("binance", 0.07), ("coingecko", 0.071), ("hedera", 0.072)];

    #[test]
    fn no_entry_below_quorum() {
        let mut agg = Aggregator::new(2, None);
        assert!(agg.accept(proof("petal-a", "0.0.10", 0, FEED)).is_none());
        assert_eq!(agg.history().len(), 0);
    }

    #[test]
    fn two_of_three_clean_quorum() {
        let mut agg = Aggregator::new(2, None);
        assert!(agg.accept(proof("petal-a", "0.0.10", 0, FEED)).is_none());
        let round = agg.accept(proof("petal-b", "0.0.11", 0, FEED)).expect("quorum");
        assert_eq!(round.entry.epoch, 0);
        assert_eq!(round.entry.price, 0.071);
        assert_eq!(round.matching.len(), 2);

        // The third matching proof changes nothing.
        assert!(agg.accept(proof("petal-c", "0.0.12", 0, FEED)).is_none());
        assert_eq!(agg.history().len(), 1);
    }

    #[test]
    fn split_brain_picks_the_majority_hash() {
        let mut agg = Aggregator::new(2, None);
        let outlier = proof("petal-c", "0.0.12", 5, &[("binance", 0.08)]);
        let outlier_hash = outlier.state_hash.clone();
        assert!(agg.accept(outlier).is_none());
        assert!(agg.accept(proof("petal-a", "0.0.10", 5, &[("binance", 0.07)])).is_none());
        let round =
            agg.accept(proof("petal-b", "0.0.11", 5, &[("binance", 0.07)])).expect("quorum");
        assert_eq!(round.entry.price, 0.07);
        assert_ne!(round.entry.state_hash, outlier_hash);
    }

    #[test]
    fn tampered_state_hash_is_dropped() {
        let mut agg = Aggregator::new(2, None);
        let mut a = proof("petal-a", "0.0.10", 1, FEED);
        let mut b = proof("petal-b", "0.0.11", 1, FEED);
        let forged = "ff".repeat(48);
        a.state_hash = forged.clone();
        b.state_hash = forged;
        assert!(agg.accept(a).is_none());
        assert!(agg.accept(b).is_none());
        assert_eq!(agg.history().len(), 0);
    }

    #[test]
    fn median_over_all_matching_records() {
        assert_eq!(median(&[0.07, 0.071, 0.072]), Some(0.071));
        assert_eq!(median(&[0.07, 0.072]), Some(0.071));
        assert_eq!(median(&[0.07]), Some(0.07));
        assert_eq!(median(&[1.0, 2.0]), Some(1.5));
        assert_eq!(median(&[]), None);
        // Rounding to 8 decimals.
        assert_eq!(median(&[0.123456789]), Some(0.12345679));
    }

    #[test]
    fn participants_prefer_bootstrap_accounts() {
        let mut agg =
            Aggregator::new(2, Some(vec!["0.0.21".into(), "0.0.20".into(), "0.0.22".into()]));
        agg.accept(proof("petal-a", "0.0.10", 0, FEED));
        let round = agg.accept(proof("petal-b", "0.0.11", 0, FEED)).expect("quorum");
        assert_eq!(round.entry.participants, vec!["0.0.20", "0.0.21", "0.0.22"]);
    }

    #[test]
    fn participants_fall_back_to_petal_accounts() {
        let mut agg = Aggregator::new(2, None);
        let mut a = proof("petal-a", "0.0.11", 0, FEED);
        let mut b = proof("petal-b", "0.0.10", 0, FEED);
        // Labels, not account ids: the proofs' participant sets are unusable.
        a.participants = vec!["petal-a".into(), "petal-b".into()];
        b.participants = vec!["petal-a".into(), "petal-b".into()];
        agg.accept(a);
        let round = agg.accept(b).expect("quorum");
        assert_eq!(round.entry.participants, vec!["0.0.10", "0.0.11"]);
    }

    #[test]
    fn metadata_before_entry_is_merged_at_formation() {
        let mut agg = Aggregator::new(2, None);
        agg.apply_metadata(
            0,
            EpochMetadata {
                hcs_message: Some("hcs://17/0.0.600".into()),
                consensus_timestamp: Some("1700000000.000000001".into()),
                sequence_number: Some(7),
            },
        );
        agg.accept(proof("petal-a", "0.0.10", 0, FEED));
        let round = agg.accept(proof("petal-b", "0.0.11", 0, FEED)).expect("quorum");
        assert_eq!(round.entry.sequence_number, Some(7));
        assert_eq!(round.entry.consensus_timestamp.as_deref(), Some("1700000000.000000001"));
    }

    #[test]
    fn metadata_after_entry_fills_exactly_once() {
        let mut agg = Aggregator::new(2, None);
        agg.accept(proof("petal-a", "0.0.10", 4, FEED));
        agg.accept(proof("petal-b", "0.0.11", 4, FEED)).expect("quorum");

        let updated = agg
            .apply_metadata(
                4,
                EpochMetadata {
                    hcs_message: Some("hcs://17/0.0.600".into()),
                    consensus_timestamp: Some("1700000000.000000001".into()),
                    sequence_number: Some(9),
                },
            )
            .expect("updated entry");
        assert_eq!(updated.sequence_number, Some(9));

        // A second observation cannot overwrite.
        let second = agg.apply_metadata(
            4,
            EpochMetadata {
                hcs_message: Some("hcs://17/evil".into()),
                consensus_timestamp: Some("1799999999.000000001".into()),
                sequence_number: Some(99),
            },
        );
        assert!(second.is_none());
        let entry = agg.entry(4).expect("entry");
        assert_eq!(entry.sequence_number, Some(9));
        assert_eq!(entry.hcs_message.as_deref(), Some("hcs://17/0.0.600"));
    }

    #[test]
    fn history_stays_sorted_and_latest_stamped_tracks() {
        let mut agg = Aggregator::new(1, None);
        agg.accept(proof("petal-a", "0.0.10", 3, FEED)).expect("epoch 3");
        agg.accept(proof("petal-a", "0.0.10", 1, FEED)).expect("epoch 1");
        agg.accept(proof("petal-a", "0.0.10", 2, FEED)).expect("epoch 2");
        let epochs: Vec<i64> = agg.history().iter().map(|e| e.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 3]);

        assert!(agg.latest_stamped().is_none());
        assert_eq!(agg.oldest_unstamped_epoch(), Some(1));
        agg.apply_metadata(
            2,
            EpochMetadata {
                hcs_message: None,
                consensus_timestamp: Some("1.000000001".into()),
                sequence_number: Some(1),
            },
        );
        assert_eq!(agg.latest_stamped().map(|e| e.epoch), Some(2));
        assert_eq!(agg.oldest_unstamped_epoch(), Some(1));
    }

    #[test]
    fn first_group_to_reach_quorum_wins() {
        // Aggregation runs on every accepted proof, so the first hash to
        // reach quorum consolidates before a tie can even form; the
        // insertion-order grouping keeps the choice deterministic.
        let mut agg = Aggregator::new(2, None);
        agg.accept(proof("petal-a", "0.0.10", 0, &[("binance", 0.07)]));
        agg.accept(proof("petal-b", "0.0.11", 0, &[("binance", 0.08)]));
        let round = agg
            .accept(proof("petal-c", "0.0.12", 0, &[("binance", 0.08)]))
            .expect("quorum");
        assert_eq!(round.entry.price, 0.08);

        // The late matching proof for the losing hash changes nothing.
        assert!(agg.accept(proof("petal-d", "0.0.13", 0, &[("binance", 0.07)])).is_none());
        assert_eq!(agg.history().len(), 1);
    }
}
