//! Rotating-leader publication.
//!
//! For each consensus round the leader is `P[|e| mod |P|]` over the sorted
//! participant account ids. Before publishing, every matching proof must
//! be visible on its petal's state topic: the last few log messages are
//! polled with small delays until a matching `hcs-17` publication shows
//! up. Only then is the consolidated message submitted to the flora state
//! topic, paid from the leader's account.
//!
//! One attempt lives here; the consumer core drives the exponential
//! backoff between attempts and guarantees a single in-flight publication
//! per epoch.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use flora_common::{LedgerClient, LedgerError, ProofPayload, StateHashMessage, TopicOrder};

use crate::aggregator::ConsensusRound;

/// How many of a petal topic's newest messages are inspected per poll.
const VALIDATION_TAIL: usize = 5;

/// Publication timing knobs. Defaults match production; tests shrink them.
#[derive(Debug, Clone)]
pub struct PublisherTuning {
    /// Polls per proof before a validation attempt fails.
    pub validation_attempts: u32,
    /// Delay between validation polls.
    pub validation_delay: Duration,
    /// Backoff between publish attempts grows by this per attempt...
    pub backoff_base: Duration,
    /// ...capped here.
    pub backoff_cap: Duration,
}

impl Default for PublisherTuning {
    fn default() -> Self {
        Self {
            validation_attempts: 6,
            validation_delay: Duration::from_secs(2),
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(120),
        }
    }
}

impl PublisherTuning {
    /// Backoff before retry `attempt` (1-based): `base * attempt`, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(attempt).min(self.backoff_cap)
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no participants to elect a leader from")]
    NoParticipants,
    #[error("petal {petal_id} has no matching state-topic publication for epoch {epoch}")]
    ValidationFailed { petal_id: String, epoch: i64 },
    #[error("consolidated submit failed: {0}")]
    Submit(#[from] LedgerError),
}

/// A successful publication, used to stamp the entry in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishStamp {
    pub leader: String,
    pub hcs_message: String,
    pub consensus_timestamp: String,
    pub sequence_number: u64,
}

/// Deterministic leader election: `P[|e| mod |P|]`.
pub fn elect_leader(participants: &[String], epoch: i64) -> Option<&String> {
    if participants.is_empty() {
        return None;
    }
    let index = (epoch.unsigned_abs() as usize) % participants.len();
    participants.get(index)
}

pub struct LeaderPublisher {
    ledger: Arc<dyn LedgerClient>,
    flora_account_id: String,
    flora_state_topic: String,
    threshold_fingerprint: String,
    advertised_topics: Vec<String>,
    tuning: PublisherTuning,
}

impl LeaderPublisher {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        flora_account_id: String,
        flora_state_topic: String,
        threshold_fingerprint: String,
        advertised_topics: Vec<String>,
        tuning: PublisherTuning,
    ) -> Self {
        Self {
            ledger,
            flora_account_id,
            flora_state_topic,
            threshold_fingerprint,
            advertised_topics,
            tuning,
        }
    }

    pub fn tuning(&self) -> &PublisherTuning {
        &self.tuning
    }

    /// One full publication attempt: validate every matching proof on its
    /// petal state topic, then submit the consolidated message.
    pub async fn attempt(&self, round: &ConsensusRound) -> Result<PublishStamp, PublishError> {
        let leader = elect_leader(&round.entry.participants, round.entry.epoch)
            .ok_or(PublishError::NoParticipants)?
            .clone();
        debug!(epoch = round.entry.epoch, %leader, "leader elected");

        for proof in &round.matching {
            self.validate_petal_publication(proof).await?;
        }

        let message = StateHashMessage::consolidated(
            &round.entry,
            &self.flora_account_id,
            &self.threshold_fingerprint,
            self.advertised_topics.clone(),
        );
        let body = serde_json::to_vec(&message)
            .map_err(|e| PublishError::Submit(LedgerError::Malformed(e.to_string())))?;
        let receipt = self.ledger.submit_message(&self.flora_state_topic, &leader, &body).await?;
        info!(
            epoch = round.entry.epoch,
            %leader,
            sequence = receipt.sequence_number,
            "consolidated proof published"
        );
        Ok(PublishStamp {
            leader,
            hcs_message: format!("hcs://17/{}", self.flora_state_topic),
            consensus_timestamp: receipt.consensus_timestamp,
            sequence_number: receipt.sequence_number,
        })
    }

    /// Poll a petal's state topic until a matching publication appears.
    async fn validate_petal_publication(&self, proof: &ProofPayload) -> Result<(), PublishError> {
        for attempt in 1..=self.tuning.validation_attempts {
            match self
                .ledger
                .topic_messages(&proof.petal_state_topic_id, TopicOrder::Desc, VALIDATION_TAIL, None)
                .await
            {
                Ok(messages) => {
                    if messages.iter().any(|m| Self::message_attests(m, proof)) {
                        return Ok(());
                    }
                }
                Err(err) => {
                    warn!(
                        petal = %proof.petal_id,
                        topic = %proof.petal_state_topic_id,
                        error = %err,
                        "petal state topic poll failed"
                    );
                }
            }
            if attempt < self.tuning.validation_attempts {
                tokio::time::sleep(self.tuning.validation_delay).await;
            }
        }
        Err(PublishError::ValidationFailed {
            petal_id: proof.petal_id.clone(),
            epoch: proof.epoch,
        })
    }

    fn message_attests(message: &flora_common::TopicMessage, proof: &ProofPayload) -> bool {
        let Ok(bytes) = message.decoded() else {
            return false;
        };
        let Ok(decoded) = serde_json::from_slice::<StateHashMessage>(&bytes) else {
            return false;
        };
        decoded.is_state_hash()
            && decoded.state_hash == proof.state_hash
            && decoded.account_id == proof.petal_account_id
            && decoded.attests_epoch(proof.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participants() -> Vec<String> {
        vec!["0.0.10".into(), "0.0.11".into(), "0.0.12".into()]
    }

    #[test]
    fn leader_rotates_by_epoch() {
        let p = participants();
        assert_eq!(elect_leader(&p, 0), Some(&"0.0.10".to_string()));
        assert_eq!(elect_leader(&p, 1), Some(&"0.0.11".to_string()));
        assert_eq!(elect_leader(&p, 2), Some(&"0.0.12".to_string()));
        assert_eq!(elect_leader(&p, 3), Some(&"0.0.10".to_string()));
    }

    #[test]
    fn negative_epochs_use_absolute_value() {
        let p = participants();
        assert_eq!(elect_leader(&p, -1), Some(&"0.0.11".to_string()));
        assert_eq!(elect_leader(&p, -4), Some(&"0.0.11".to_string()));
    }

    #[test]
    fn empty_participants_elect_nobody() {
        assert_eq!(elect_leader(&[], 0), None);
    }

    #[test]
    fn backoff_grows_linearly_and_caps() {
        let tuning = PublisherTuning::default();
        assert_eq!(tuning.backoff_for(1), Duration::from_secs(5));
        assert_eq!(tuning.backoff_for(4), Duration::from_secs(20));
        assert_eq!(tuning.backoff_for(100), Duration::from_secs(120));
    }
}
