//! Flora data model.
//!
//! Wire shapes shared by petals and the consumer:
//!
//! - [`AdapterRecord`]: one adapter's observation for one epoch
//! - [`ProofPayload`]: a petal's signed-by-content epoch submission
//! - [`ChunkedProofPayload`]: the same payload split for transport
//! - [`ConsensusEntry`]: the consolidated result of one epoch
//! - [`StateHashMessage`]: the `hcs-17` state-topic message body
//!
//! Everything that crosses the proof boundary is parsed through
//! [`parse_incoming`], which either yields a typed variant or a stable,
//! machine-readable reject reason. No field is silently coerced.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::canonical::{canonicalize, hash_canonical, sha384_hex};

// ════════════════════════════════════════════════════════════════════════════
// ADAPTER RECORD
// ════════════════════════════════════════════════════════════════════════════

/// One adapter's observation of one entity for one epoch. Immutable once
/// built; the scheduler re-stamps `timestamp` with the epoch timestamp
/// before hashing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterRecord {
    /// Registry identifier of the adapter that produced this record.
    pub adapter_id: String,
    /// The observed entity, e.g. `"HBAR-USD"`.
    pub entity_id: String,
    /// Small mapping with at least `price: number` and `source: string`.
    pub payload: serde_json::Map<String, Value>,
    /// ISO-8601, aligned to the epoch by the proof builder.
    pub timestamp: String,
    /// Hex SHA-384 of the canonicalized payload.
    pub source_fingerprint: String,
}

impl AdapterRecord {
    /// The observed price, if the payload carries a numeric `price`.
    pub fn price(&self) -> Option<f64> {
        self.payload.get("price").and_then(Value::as_f64)
    }

    /// The reporting source label, if present.
    pub fn source(&self) -> Option<&str> {
        self.payload.get("source").and_then(Value::as_str)
    }

    /// Fingerprint of the canonicalized payload.
    pub fn compute_fingerprint(&self) -> String {
        sha384_hex(canonicalize(&Value::Object(self.payload.clone())).as_bytes())
    }
}

/// Sort records the way the state hash requires: `(adapterId, entityId)`.
pub fn sort_records(records: &mut [AdapterRecord]) {
    records.sort_by(|a, b| {
        a.adapter_id
            .cmp(&b.adapter_id)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
}

// ════════════════════════════════════════════════════════════════════════════
// PROOF PAYLOAD
// ════════════════════════════════════════════════════════════════════════════

/// A petal's complete submission for one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofPayload {
    pub epoch: i64,
    /// Hex SHA-384 over the canonical hash input (see [`compute_state_hash`]).
    pub state_hash: String,
    /// Opaque commitment to the flora's membership/threshold configuration.
    pub threshold_fingerprint: String,
    pub petal_id: String,
    pub petal_account_id: String,
    pub petal_state_topic_id: String,
    pub flora_account_id: String,
    /// Sorted canonically; see `account::normalize_participants`.
    pub participants: Vec<String>,
    /// Sorted by `(adapterId, entityId)`.
    pub records: Vec<AdapterRecord>,
    /// adapterId → registry fingerprint used this epoch. BTreeMap keeps the
    /// serialized form key-ordered.
    pub adapter_fingerprints: BTreeMap<String, String>,
    pub registry_topic_id: String,
    /// Derived from the epoch, never the wall clock.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hcs_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
}

impl ProofPayload {
    /// Recompute the state hash from this proof's own fields. A proof is
    /// valid only when this equals `state_hash`.
    pub fn expected_state_hash(&self) -> String {
        compute_state_hash(
            &self.records,
            &self.threshold_fingerprint,
            &self.adapter_fingerprints,
            &self.registry_topic_id,
        )
    }

    /// Prices of all records, in record order.
    pub fn record_prices(&self) -> Vec<f64> {
        self.records.iter().filter_map(AdapterRecord::price).collect()
    }
}

/// `SHA384(canonicalize({records, thresholdFingerprint, adapterFingerprints,
/// registryTopicId}))`. Key order is handled by the canonicalizer; record
/// order must already be `(adapterId, entityId)`.
pub fn compute_state_hash(
    records: &[AdapterRecord],
    threshold_fingerprint: &str,
    adapter_fingerprints: &BTreeMap<String, String>,
    registry_topic_id: &str,
) -> String {
    let input = serde_json::json!({
        "records": serde_json::to_value(records).unwrap_or(Value::Null),
        "thresholdFingerprint": threshold_fingerprint,
        "adapterFingerprints": serde_json::to_value(adapter_fingerprints).unwrap_or(Value::Null),
        "registryTopicId": registry_topic_id,
    });
    hash_canonical(&input)
}

// ════════════════════════════════════════════════════════════════════════════
// CHUNKED PROOF PAYLOAD
// ════════════════════════════════════════════════════════════════════════════

/// One part of a proof too large for a single post. Parts are keyed by
/// `(petalId, epoch)` and reassembled once all `total_chunks` are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedProofPayload {
    pub epoch: i64,
    pub petal_id: String,
    /// 1-based part index.
    #[serde(rename = "chunk_id")]
    pub chunk_id: u32,
    #[serde(rename = "total_chunks")]
    pub total_chunks: u32,
    /// Base64 of this part's byte slice of the serialized proof.
    pub data: String,
}

/// Serialize a proof and split it into ordered base64 chunks of at most
/// `max_chunk_bytes` raw bytes each. Proofs that fit in one chunk still
/// round-trip through [`assemble_chunks`].
pub fn split_into_chunks(
    proof: &ProofPayload,
    max_chunk_bytes: usize,
) -> Result<Vec<ChunkedProofPayload>, ProofParseError> {
    let bytes = serde_json::to_vec(proof)
        .map_err(|e| ProofParseError::Invalid(format!("proof serialization failed: {e}")))?;
    let size = max_chunk_bytes.max(1);
    let parts: Vec<&[u8]> = bytes.chunks(size).collect();
    let total = parts.len() as u32;
    Ok(parts
        .into_iter()
        .enumerate()
        .map(|(i, part)| ChunkedProofPayload {
            epoch: proof.epoch,
            petal_id: proof.petal_id.clone(),
            chunk_id: i as u32 + 1,
            total_chunks: total,
            data: BASE64.encode(part),
        })
        .collect())
}

/// Reassemble a full proof from its parts, in any submission order.
pub fn assemble_chunks(parts: &[ChunkedProofPayload]) -> Result<ProofPayload, ProofParseError> {
    if parts.is_empty() {
        return Err(ProofParseError::Invalid("no chunks to assemble".into()));
    }
    let total = parts[0].total_chunks;
    if parts.len() as u32 != total {
        return Err(ProofParseError::Invalid(format!(
            "expected {total} chunks, have {}",
            parts.len()
        )));
    }
    let mut ordered: Vec<&ChunkedProofPayload> = parts.iter().collect();
    ordered.sort_by_key(|c| c.chunk_id);
    let mut bytes = Vec::new();
    for (i, chunk) in ordered.iter().enumerate() {
        if chunk.chunk_id != i as u32 + 1 || chunk.total_chunks != total {
            return Err(ProofParseError::Invalid("chunk sequence mismatch".into()));
        }
        let part = BASE64
            .decode(&chunk.data)
            .map_err(|e| ProofParseError::Invalid(format!("chunk {}: bad base64: {e}", chunk.chunk_id)))?;
        bytes.extend_from_slice(&part);
    }
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| ProofParseError::Invalid(format!("assembled chunks are not JSON: {e}")))?;
    match parse_incoming(&value)? {
        IncomingProof::Whole(proof) => Ok(*proof),
        IncomingProof::Chunk(_) => {
            Err(ProofParseError::Invalid("assembled chunks decoded to another chunk".into()))
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// VALIDATING PARSER
// ════════════════════════════════════════════════════════════════════════════

/// Reject reason for a structurally invalid proof body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofParseError {
    #[error("invalid_payload: {0}")]
    Invalid(String),
}

/// A structurally valid proof submission.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingProof {
    Whole(Box<ProofPayload>),
    Chunk(ChunkedProofPayload),
}

/// Parse a raw JSON body into a typed proof variant.
///
/// A body carrying `chunk_id`/`total_chunks`/`data` is a chunk; anything
/// else must be a whole [`ProofPayload`]. Structural and semantic checks
/// happen here; policy checks (account, fingerprint, participants) happen
/// at the intake.
pub fn parse_incoming(value: &Value) -> Result<IncomingProof, ProofParseError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ProofParseError::Invalid("body must be a JSON object".into()))?;

    if obj.contains_key("chunk_id") || obj.contains_key("total_chunks") {
        let chunk: ChunkedProofPayload = serde_json::from_value(value.clone())
            .map_err(|e| ProofParseError::Invalid(e.to_string()))?;
        validate_chunk(&chunk)?;
        return Ok(IncomingProof::Chunk(chunk));
    }

    let proof: ProofPayload = serde_json::from_value(value.clone())
        .map_err(|e| ProofParseError::Invalid(e.to_string()))?;
    validate_proof_shape(&proof)?;
    Ok(IncomingProof::Whole(Box::new(proof)))
}

fn validate_chunk(chunk: &ChunkedProofPayload) -> Result<(), ProofParseError> {
    if chunk.epoch < 0 {
        return Err(ProofParseError::Invalid("epoch must be non-negative".into()));
    }
    if chunk.petal_id.trim().is_empty() {
        return Err(ProofParseError::Invalid("petalId must be non-empty".into()));
    }
    if chunk.total_chunks == 0 {
        return Err(ProofParseError::Invalid("total_chunks must be at least 1".into()));
    }
    if chunk.chunk_id == 0 || chunk.chunk_id > chunk.total_chunks {
        return Err(ProofParseError::Invalid("chunk_id out of range".into()));
    }
    if chunk.data.is_empty() {
        return Err(ProofParseError::Invalid("chunk data must be non-empty".into()));
    }
    Ok(())
}

fn is_sha384_hex(s: &str) -> bool {
    s.len() == 96 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

fn validate_proof_shape(proof: &ProofPayload) -> Result<(), ProofParseError> {
    if proof.epoch < 0 {
        return Err(ProofParseError::Invalid("epoch must be non-negative".into()));
    }
    if !is_sha384_hex(&proof.state_hash) {
        return Err(ProofParseError::Invalid("stateHash must be lowercase hex SHA-384".into()));
    }
    for (field, value) in [
        ("petalId", &proof.petal_id),
        ("petalAccountId", &proof.petal_account_id),
        ("petalStateTopicId", &proof.petal_state_topic_id),
        ("floraAccountId", &proof.flora_account_id),
        ("thresholdFingerprint", &proof.threshold_fingerprint),
        ("registryTopicId", &proof.registry_topic_id),
        ("timestamp", &proof.timestamp),
    ] {
        if value.trim().is_empty() {
            return Err(ProofParseError::Invalid(format!("{field} must be non-empty")));
        }
    }
    if proof.records.is_empty() {
        return Err(ProofParseError::Invalid("records must be non-empty".into()));
    }
    for record in &proof.records {
        if record.adapter_id.trim().is_empty() || record.entity_id.trim().is_empty() {
            return Err(ProofParseError::Invalid("record missing adapterId/entityId".into()));
        }
        match record.price() {
            Some(p) if p.is_finite() => {}
            _ => {
                return Err(ProofParseError::Invalid(format!(
                    "record {} payload missing finite price",
                    record.adapter_id
                )))
            }
        }
        if record.source().is_none() {
            return Err(ProofParseError::Invalid(format!(
                "record {} payload missing source",
                record.adapter_id
            )));
        }
    }
    if proof.participants.is_empty() {
        return Err(ProofParseError::Invalid("participants must be non-empty".into()));
    }
    Ok(())
}

// ════════════════════════════════════════════════════════════════════════════
// CONSENSUS ENTRY
// ════════════════════════════════════════════════════════════════════════════

/// One `{source, price}` pair flattened out of the matching records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePrice {
    pub source: String,
    pub price: f64,
}

/// The consolidated result of one epoch's aggregation. `epoch` and
/// `state_hash` are immutable once emitted; log metadata is filled in
/// place exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusEntry {
    pub epoch: i64,
    pub state_hash: String,
    /// 8-decimal rounded median of all matching record prices.
    pub price: f64,
    /// Taken from the first matching proof.
    pub timestamp: String,
    /// Sorted account identifiers, never petal labels.
    pub participants: Vec<String>,
    pub sources: Vec<SourcePrice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hcs_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
}

// ════════════════════════════════════════════════════════════════════════════
// HCS-17 STATE MESSAGE
// ════════════════════════════════════════════════════════════════════════════

/// Body of a state-topic message (base64-encoded on the log).
///
/// Petals emit the minimal form (no `price`); the flora's consolidated
/// message carries `price`, `threshold_fingerprint` and `participants`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHashMessage {
    /// Protocol tag, always `"hcs-17"`.
    pub p: String,
    /// Operation, always `"state_hash"`.
    pub op: String,
    /// Memo, `"hcs17:<epoch>"`.
    pub m: String,
    pub account_id: String,
    pub state_hash: String,
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<String>>,
}

impl StateHashMessage {
    pub const PROTOCOL: &'static str = "hcs-17";
    pub const OP_STATE_HASH: &'static str = "state_hash";

    /// Minimal per-petal message for the petal's own state topic.
    pub fn petal(epoch: i64, state_hash: &str, account_id: &str, topics: Vec<String>) -> Self {
        Self {
            p: Self::PROTOCOL.to_string(),
            op: Self::OP_STATE_HASH.to_string(),
            m: format!("hcs17:{epoch}"),
            account_id: account_id.to_string(),
            state_hash: state_hash.to_string(),
            topics,
            epoch: Some(epoch),
            price: None,
            threshold_fingerprint: None,
            participants: None,
        }
    }

    /// Consolidated flora message published by the epoch leader.
    pub fn consolidated(
        entry: &ConsensusEntry,
        flora_account_id: &str,
        threshold_fingerprint: &str,
        topics: Vec<String>,
    ) -> Self {
        Self {
            p: Self::PROTOCOL.to_string(),
            op: Self::OP_STATE_HASH.to_string(),
            m: format!("hcs17:{}", entry.epoch),
            account_id: flora_account_id.to_string(),
            state_hash: entry.state_hash.clone(),
            topics,
            epoch: Some(entry.epoch),
            price: Some(entry.price),
            threshold_fingerprint: Some(threshold_fingerprint.to_string()),
            participants: Some(entry.participants.clone()),
        }
    }

    /// True for well-formed `hcs-17` state-hash messages.
    pub fn is_state_hash(&self) -> bool {
        self.p == Self::PROTOCOL && self.op == Self::OP_STATE_HASH
    }

    /// Epoch carried by the memo, when the `epoch` field is absent.
    pub fn memo_epoch(&self) -> Option<i64> {
        self.m.strip_prefix("hcs17:").and_then(|e| e.parse().ok())
    }

    /// Whether this message attests `epoch`, via field or memo.
    pub fn attests_epoch(&self, epoch: i64) -> bool {
        self.epoch == Some(epoch) || self.m == format!("hcs17:{epoch}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(adapter: &str, price: f64) -> AdapterRecord {
        let mut payload = serde_json::Map::new();
        payload.insert("price".into(), json!(price));
        payload.insert("source".into(), json!(adapter));
        let mut r = AdapterRecord {
            adapter_id: adapter.to_string(),
            entity_id: "HBAR-USD".to_string(),
            payload,
            timestamp: "2024-01-01T00:00:00.000Z".to_string(),
            source_fingerprint: String::new(),
        };
        r.source_fingerprint = r.compute_fingerprint();
        r
    }

    fn proof() -> ProofPayload {
        let mut records = vec![record("coingecko", 0.071), record("binance", 0.07)];
        sort_records(&mut records);
        let mut fingerprints = BTreeMap::new();
        for r in &records {
            fingerprints.insert(r.adapter_id.clone(), r.source_fingerprint.clone());
        }
        let state_hash = compute_state_hash(&records, "tf-1", &fingerprints, "0.0.500");
        ProofPayload {
            epoch: 0,
            state_hash,
            threshold_fingerprint: "tf-1".to_string(),
            petal_id: "petal-a".to_string(),
            petal_account_id: "0.0.10".to_string(),
            petal_state_topic_id: "0.0.100".to_string(),
            flora_account_id: "0.0.1000".to_string(),
            participants: vec!["0.0.10".into(), "0.0.11".into(), "0.0.12".into()],
            records,
            adapter_fingerprints: fingerprints,
            registry_topic_id: "0.0.500".to_string(),
            timestamp: "2024-01-01T00:00:00.000Z".to_string(),
            hcs_message: None,
            consensus_timestamp: None,
            sequence_number: None,
        }
    }

    #[test]
    fn state_hash_fixpoint() {
        let p = proof();
        assert_eq!(p.expected_state_hash(), p.state_hash);
    }

    #[test]
    fn state_hash_depends_on_every_input() {
        let p = proof();
        let base = p.state_hash.clone();
        assert_ne!(
            compute_state_hash(&p.records, "tf-2", &p.adapter_fingerprints, &p.registry_topic_id),
            base
        );
        assert_ne!(
            compute_state_hash(&p.records, "tf-1", &p.adapter_fingerprints, "0.0.501"),
            base
        );
        let mut fps = p.adapter_fingerprints.clone();
        fps.insert("binance".into(), "deadbeef".into());
        assert_ne!(compute_state_hash(&p.records, "tf-1", &fps, &p.registry_topic_id), base);
    }

    #[test]
    fn record_sort_is_by_adapter_then_entity() {
        let mut records = vec![record("coingecko", 0.071), record("binance", 0.07)];
        sort_records(&mut records);
        assert_eq!(records[0].adapter_id, "binance");
        assert_eq!(records[1].adapter_id, "coingecko");
    }

    #[test]
    fn parse_whole_proof_roundtrip() {
        let p = proof();
        let value = serde_json::to_value(&p).expect("to_value");
        match parse_incoming(&value).expect("parse") {
            IncomingProof::Whole(parsed) => assert_eq!(*parsed, p),
            IncomingProof::Chunk(_) => panic!("whole proof parsed as chunk"),
        }
    }

    #[test]
    fn parse_rejects_structural_faults() {
        let p = proof();
        let mut value = serde_json::to_value(&p).expect("to_value");
        value["stateHash"] = json!("not-hex");
        let err = parse_incoming(&value).expect_err("bad hash accepted");
        assert!(matches!(err, ProofParseError::Invalid(ref m) if m.contains("stateHash")));

        let mut value = serde_json::to_value(&p).expect("to_value");
        value["epoch"] = json!(-3);
        assert!(parse_incoming(&value).is_err());

        let mut value = serde_json::to_value(&p).expect("to_value");
        value.as_object_mut().expect("object").remove("records");
        assert!(parse_incoming(&value).is_err());
    }

    #[test]
    fn parse_rejects_record_without_price() {
        let mut p = proof();
        p.records[0].payload.remove("price");
        let value = serde_json::to_value(&p).expect("to_value");
        let err = parse_incoming(&value).expect_err("accepted priceless record");
        assert!(matches!(err, ProofParseError::Invalid(ref m) if m.contains("price")));
    }

    #[test]
    fn chunk_wire_format_uses_snake_case_chunk_fields() {
        let chunks = split_into_chunks(&proof(), 64).expect("split");
        let value = serde_json::to_value(&chunks[0]).expect("to_value");
        assert!(value.get("chunk_id").is_some());
        assert!(value.get("total_chunks").is_some());
        assert!(value.get("petalId").is_some());
    }

    #[test]
    fn chunks_reassemble_in_any_order() {
        let p = proof();
        let mut chunks = split_into_chunks(&p, 100).expect("split");
        assert!(chunks.len() >= 3, "fixture should split into several chunks");
        chunks.reverse();
        let mid = chunks.len() / 2;
        chunks.swap(0, mid);
        assert_eq!(assemble_chunks(&chunks).expect("assemble"), p);
    }

    #[test]
    fn assemble_rejects_incomplete_or_mismatched_parts() {
        let p = proof();
        let chunks = split_into_chunks(&p, 100).expect("split");
        assert!(assemble_chunks(&chunks[..chunks.len() - 1]).is_err());

        let mut dup = chunks.clone();
        let n = dup.len();
        dup[n - 1] = dup[0].clone();
        assert!(assemble_chunks(&dup).is_err());
    }

    #[test]
    fn memo_epoch_parses() {
        let msg = StateHashMessage::petal(7, "ab", "0.0.10", vec!["0.0.100".into()]);
        assert_eq!(msg.memo_epoch(), Some(7));
        assert!(msg.attests_epoch(7));
        assert!(!msg.attests_epoch(8));
        assert!(msg.is_state_hash());
    }

    #[test]
    fn consolidated_message_carries_price_and_participants() {
        let entry = ConsensusEntry {
            epoch: 4,
            state_hash: "aa".repeat(48),
            price: 0.071,
            timestamp: "2024-01-01T00:00:08.000Z".into(),
            participants: vec!["0.0.10".into(), "0.0.11".into()],
            sources: vec![],
            hcs_message: None,
            consensus_timestamp: None,
            sequence_number: None,
        };
        let msg = StateHashMessage::consolidated(&entry, "0.0.1000", "tf-1", vec!["0.0.600".into()]);
        assert_eq!(msg.price, Some(0.071));
        assert_eq!(msg.participants.as_deref(), Some(&["0.0.10".to_string(), "0.0.11".to_string()][..]));
        assert_eq!(msg.m, "hcs17:4");
    }
}
