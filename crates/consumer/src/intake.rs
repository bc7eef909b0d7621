//! Proof intake and policy validation.
//!
//! `POST /proof` bodies land here. The intake parses the raw JSON into a
//! whole or chunked proof, then revalidates the assembled payload against
//! flora policy. Every rejection carries a short, stable reason string the
//! HTTP layer returns verbatim.
//!
//! Chunk parts are buffered per `(petalId, epoch)`; partial buffers are
//! dropped when the epoch is consolidated and do not survive a restart.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use flora_common::account::{is_account_id, normalize_participants};
use flora_common::types::{assemble_chunks, parse_incoming, IncomingProof};
use flora_common::{ChunkedProofPayload, ProofParseError, ProofPayload};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntakeError {
    #[error("{0}")]
    Invalid(ProofParseError),
    #[error("flora_account_mismatch")]
    FloraAccountMismatch,
    #[error("threshold_fingerprint_mismatch")]
    ThresholdFingerprintMismatch,
    #[error("registry_topic_mismatch")]
    RegistryTopicMismatch,
    #[error("petal_account_mismatch")]
    PetalAccountMismatch,
    #[error("petal_state_topic_mismatch")]
    PetalStateTopicMismatch,
    #[error("participants_mismatch: {0}")]
    ParticipantsMismatch(String),
    #[error("duplicate_proof_mismatch")]
    DuplicateMismatch,
}

impl IntakeError {
    /// The stable reason string surfaced in 400 responses.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid_payload",
            Self::FloraAccountMismatch => "flora_account_mismatch",
            Self::ThresholdFingerprintMismatch => "threshold_fingerprint_mismatch",
            Self::RegistryTopicMismatch => "registry_topic_mismatch",
            Self::PetalAccountMismatch => "petal_account_mismatch",
            Self::PetalStateTopicMismatch => "petal_state_topic_mismatch",
            Self::ParticipantsMismatch(_) => "participants_mismatch",
            Self::DuplicateMismatch => "duplicate_proof_mismatch",
        }
    }
}

/// What a submission did.
#[derive(Debug, Clone, PartialEq)]
pub enum IntakeOutcome {
    /// A fully validated proof, ready for aggregation.
    Accepted(Box<ProofPayload>),
    /// Same `(petalId, epoch)` payload as one already accepted; no-op.
    Duplicate,
    /// A chunk was buffered; more parts are outstanding.
    ChunkBuffered { received: u32, total: u32 },
}

/// Flora policy the intake enforces.
#[derive(Debug, Clone)]
pub struct IntakePolicy {
    pub flora_account_id: String,
    pub threshold_fingerprint: String,
    /// The active adapter-category topic.
    pub registry_topic_id: String,
    pub expected_petals: usize,
    /// `petalId → accountId` from the bootstrap store, when known.
    pub petal_bindings: HashMap<String, String>,
    /// Full member account ids, when the bootstrap store knows them.
    pub expected_accounts: Option<Vec<String>>,
}

struct ChunkBuffer {
    total: u32,
    parts: HashMap<u32, ChunkedProofPayload>,
}

pub struct ProofIntake {
    policy: IntakePolicy,
    /// `petalId → petalStateTopicId` observed this run.
    observed_topics: HashMap<String, String>,
    chunks: HashMap<(String, i64), ChunkBuffer>,
    /// `(petalId, epoch) → stateHash` of the accepted payload.
    accepted: HashMap<(String, i64), String>,
}

impl ProofIntake {
    pub fn new(policy: IntakePolicy) -> Self {
        Self {
            policy,
            observed_topics: HashMap::new(),
            chunks: HashMap::new(),
            accepted: HashMap::new(),
        }
    }

    /// Handle one `POST /proof` body.
    pub fn submit(&mut self, body: &serde_json::Value) -> Result<IntakeOutcome, IntakeError> {
        match parse_incoming(body).map_err(IntakeError::Invalid)? {
            IncomingProof::Whole(proof) => self.admit(*proof),
            IncomingProof::Chunk(chunk) => self.buffer_chunk(chunk),
        }
    }

    fn buffer_chunk(&mut self, chunk: ChunkedProofPayload) -> Result<IntakeOutcome, IntakeError> {
        let key = (chunk.petal_id.clone(), chunk.epoch);
        let buffer = self
            .chunks
            .entry(key.clone())
            .or_insert_with(|| ChunkBuffer { total: chunk.total_chunks, parts: HashMap::new() });
        if buffer.total != chunk.total_chunks {
            return Err(IntakeError::Invalid(ProofParseError::Invalid(
                "total_chunks changed between parts".into(),
            )));
        }
        buffer.parts.insert(chunk.chunk_id, chunk);

        if (buffer.parts.len() as u32) < buffer.total {
            return Ok(IntakeOutcome::ChunkBuffered {
                received: buffer.parts.len() as u32,
                total: buffer.total,
            });
        }

        // All parts present: assemble, then validate like a whole proof.
        let buffer = self.chunks.remove(&key).unwrap_or(ChunkBuffer { total: 0, parts: HashMap::new() });
        let parts: Vec<ChunkedProofPayload> = buffer.parts.into_values().collect();
        let proof = assemble_chunks(&parts).map_err(IntakeError::Invalid)?;
        debug!(petal = %proof.petal_id, epoch = proof.epoch, "chunked proof assembled");
        self.admit(proof)
    }

    /// Policy validation for an assembled proof, in order.
    fn admit(&mut self, proof: ProofPayload) -> Result<IntakeOutcome, IntakeError> {
        if proof.flora_account_id != self.policy.flora_account_id {
            return Err(IntakeError::FloraAccountMismatch);
        }
        if proof.threshold_fingerprint != self.policy.threshold_fingerprint {
            return Err(IntakeError::ThresholdFingerprintMismatch);
        }
        if proof.registry_topic_id != self.policy.registry_topic_id {
            return Err(IntakeError::RegistryTopicMismatch);
        }
        if let Some(bound_account) = self.policy.petal_bindings.get(&proof.petal_id) {
            if bound_account != &proof.petal_account_id {
                return Err(IntakeError::PetalAccountMismatch);
            }
        }
        if let Some(observed) = self.observed_topics.get(&proof.petal_id) {
            if observed != &proof.petal_state_topic_id {
                return Err(IntakeError::PetalStateTopicMismatch);
            }
        }
        self.check_participants(&proof)?;

        // Idempotence: one assembled payload per (petalId, epoch).
        let key = (proof.petal_id.clone(), proof.epoch);
        if let Some(previous_hash) = self.accepted.get(&key) {
            if previous_hash == &proof.state_hash {
                return Ok(IntakeOutcome::Duplicate);
            }
            return Err(IntakeError::DuplicateMismatch);
        }

        self.observed_topics
            .insert(proof.petal_id.clone(), proof.petal_state_topic_id.clone());
        self.accepted.insert(key, proof.state_hash.clone());
        Ok(IntakeOutcome::Accepted(Box::new(proof)))
    }

    fn check_participants(&self, proof: &ProofPayload) -> Result<(), IntakeError> {
        match &self.policy.expected_accounts {
            Some(expected) => {
                let expected = normalize_participants(expected);
                let got: Vec<String> = normalize_participants(
                    proof.participants.iter().filter(|p| is_account_id(p.trim())),
                );
                if got != expected {
                    return Err(IntakeError::ParticipantsMismatch(format!(
                        "expected {expected:?}, got {got:?}"
                    )));
                }
            }
            None => {
                if proof.participants.len() != self.policy.expected_petals {
                    return Err(IntakeError::ParticipantsMismatch(format!(
                        "expected {} participants, got {}",
                        self.policy.expected_petals,
                        proof.participants.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Drop partial chunk buffers for a consolidated epoch.
    pub fn drop_chunks_for_epoch(&mut self, epoch: i64) {
        self.chunks.retain(|(_, e), _| *e != epoch);
    }

    /// Record a binding learned after construction (bootstrap refresh).
    pub fn bind_petal_account(&mut self, petal_id: &str, account_id: &str) {
        self.policy.petal_bindings.insert(petal_id.to_string(), account_id.to_string());
    }

    pub fn policy(&self) -> &IntakePolicy {
        &self.policy
    }
}
