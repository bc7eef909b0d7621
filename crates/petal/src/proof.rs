//! Proof assembly.
//!
//! Takes one epoch's adapter records and packages the proof envelope:
//! re-stamp every record with the epoch timestamp, sort by
//! `(adapterId, entityId)`, derive the state hash, emit the payload.
//! The epoch-derived timestamp is what lets two petals hashing the same
//! adapter data agree.

use std::collections::BTreeMap;

use flora_common::account::normalize_participants;
use flora_common::epoch::epoch_timestamp;
use flora_common::types::{compute_state_hash, sort_records};
use flora_common::{AdapterRecord, ProofPayload};

/// Everything the builder needs besides the records themselves.
#[derive(Debug, Clone)]
pub struct ProofContext {
    pub epoch_origin_ms: i64,
    pub block_time_ms: i64,
    pub threshold_fingerprint: String,
    /// adapterId → registry fingerprint for the adapter set used this
    /// epoch. Must be identical across petals.
    pub adapter_fingerprints: BTreeMap<String, String>,
    pub registry_topic_id: String,
    pub flora_account_id: String,
    pub petal_id: String,
    pub petal_account_id: String,
    pub petal_state_topic_id: String,
    pub participants: Vec<String>,
}

/// Build the proof for `epoch` from this epoch's records.
pub fn build_proof(context: &ProofContext, epoch: i64, mut records: Vec<AdapterRecord>) -> ProofPayload {
    let timestamp = epoch_timestamp(context.epoch_origin_ms, epoch, context.block_time_ms);
    for record in &mut records {
        record.timestamp = timestamp.clone();
    }
    sort_records(&mut records);
    let state_hash = compute_state_hash(
        &records,
        &context.threshold_fingerprint,
        &context.adapter_fingerprints,
        &context.registry_topic_id,
    );
    ProofPayload {
        epoch,
        state_hash,
        threshold_fingerprint: context.threshold_fingerprint.clone(),
        petal_id: context.petal_id.clone(),
        petal_account_id: context.petal_account_id.clone(),
        petal_state_topic_id: context.petal_state_topic_id.clone(),
        flora_account_id: context.flora_account_id.clone(),
        participants: normalize_participants(&context.participants),
        records,
        adapter_fingerprints: context.adapter_fingerprints.clone(),
        registry_topic_id: context.registry_topic_id.clone(),
        timestamp,
        hcs_message: None,
        consensus_timestamp: None,
        sequence_number: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::build_record;

    fn context() -> ProofContext {
        let mut fingerprints = BTreeMap::new();
        for id in ["binance", "coingecko"] {
            fingerprints.insert(id.to_string(), format!("fp-{id}"));
        }
        ProofContext {
            epoch_origin_ms: 1_700_000_000_000,
            block_time_ms: 2000,
            threshold_fingerprint: "tf-1".into(),
            adapter_fingerprints: fingerprints,
            registry_topic_id: "0.0.500".into(),
            flora_account_id: "0.0.1000".into(),
            petal_id: "petal-a".into(),
            petal_account_id: "0.0.10".into(),
            petal_state_topic_id: "0.0.100".into(),
            participants: vec!["0.0.11".into(), "0.0.10".into(), "0.0.12".into()],
        }
    }

    fn records() -> Vec<AdapterRecord> {
        vec![
            build_record("coingecko", "HBAR-USD", "coingecko", 0.071),
            build_record("binance", "HBAR-USD", "binance", 0.07),
        ]
    }

    #[test]
    fn records_are_stamped_and_sorted() {
        let proof = build_proof(&context(), 3, records());
        assert_eq!(proof.records[0].adapter_id, "binance");
        assert_eq!(proof.records[1].adapter_id, "coingecko");
        for record in &proof.records {
            assert_eq!(record.timestamp, proof.timestamp);
        }
        assert_eq!(proof.timestamp, "2023-11-14T22:13:26.000Z");
    }

    #[test]
    fn state_hash_verifies() {
        let proof = build_proof(&context(), 0, records());
        assert_eq!(proof.state_hash, proof.expected_state_hash());
    }

    #[test]
    fn same_data_same_epoch_same_hash_across_petals() {
        let mut other = context();
        other.petal_id = "petal-b".into();
        other.petal_account_id = "0.0.11".into();
        other.petal_state_topic_id = "0.0.101".into();

        let a = build_proof(&context(), 5, records());
        let b = build_proof(&other, 5, records());
        assert_eq!(a.state_hash, b.state_hash);
        assert_ne!(a.petal_id, b.petal_id);
    }

    #[test]
    fn different_epoch_changes_hash() {
        let a = build_proof(&context(), 1, records());
        let b = build_proof(&context(), 2, records());
        assert_ne!(a.state_hash, b.state_hash);
    }

    #[test]
    fn participants_are_normalized() {
        let proof = build_proof(&context(), 0, records());
        assert_eq!(proof.participants, vec!["0.0.10", "0.0.11", "0.0.12"]);
    }
}
