//! Epoch scheduler.
//!
//! Single-petal, single-task loop: tick every `blockTimeMs`, compute the
//! epoch from the shared origin, and publish at most once per epoch. The
//! state-topic write is fire-and-forget; the HTTP post to the consumer is
//! awaited but never crashes the loop. Stopping the scheduler stops the
//! timer and abandons in-flight submissions.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use flora_common::epoch::epoch_at;
use flora_common::{LedgerClient, ProofPayload, StateHashMessage};

use crate::client::{ClientError, ConsumerClient};
use crate::proof::{build_proof, ProofContext};
use crate::runner::AdapterRunner;

/// Where finished proofs go. The production sink is the consumer's
/// `/proof` endpoint; tests plug in a channel.
#[async_trait]
pub trait ProofSink: Send + Sync {
    async fn submit(&self, proof: &ProofPayload) -> Result<(), ClientError>;
}

#[async_trait]
impl ProofSink for ConsumerClient {
    async fn submit(&self, proof: &ProofPayload) -> Result<(), ClientError> {
        self.post_proof(proof).await
    }
}

pub struct PetalScheduler {
    context: ProofContext,
    runner: AdapterRunner,
    ledger: Arc<dyn LedgerClient>,
    sink: Arc<dyn ProofSink>,
    publish_state_topic: bool,
    last_epoch: AtomicI64,
    shutdown: Arc<Notify>,
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl PetalScheduler {
    pub fn new(
        context: ProofContext,
        runner: AdapterRunner,
        ledger: Arc<dyn LedgerClient>,
        sink: Arc<dyn ProofSink>,
        publish_state_topic: bool,
    ) -> Self {
        Self {
            context,
            runner,
            ledger,
            sink,
            publish_state_topic,
            last_epoch: AtomicI64::new(-1),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Drive epochs until shutdown is requested.
    pub async fn run(&self) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.context.block_time_ms.max(1) as u64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            petal = %self.context.petal_id,
            block_time_ms = self.context.block_time_ms,
            "petal scheduler started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(now_unix_ms()).await,
                _ = self.shutdown.notified() => {
                    info!(petal = %self.context.petal_id, "petal scheduler stopped");
                    return;
                }
            }
        }
    }

    /// One timer tick. Public so tests can drive epochs directly.
    pub async fn tick(&self, now_ms: i64) {
        let epoch = epoch_at(now_ms, self.context.epoch_origin_ms, self.context.block_time_ms);
        if epoch < 0 || epoch <= self.last_epoch.load(Ordering::SeqCst) {
            return;
        }
        self.last_epoch.store(epoch, Ordering::SeqCst);

        let records = match self.runner.run().await {
            Ok(records) => records,
            Err(err) => {
                warn!(epoch, error = %err, "epoch skipped");
                return;
            }
        };
        let proof = build_proof(&self.context, epoch, records);
        debug!(epoch, state_hash = %proof.state_hash, "proof built");

        if self.publish_state_topic {
            self.spawn_state_topic_publish(&proof);
        }

        if let Err(err) = self.sink.submit(&proof).await {
            warn!(epoch, error = %err, "proof post to consumer failed");
        }
    }

    /// Fire-and-forget write to the petal's own state topic. Failure is
    /// logged and does not block the consumer post.
    fn spawn_state_topic_publish(&self, proof: &ProofPayload) {
        let message = StateHashMessage::petal(
            proof.epoch,
            &proof.state_hash,
            &self.context.petal_account_id,
            vec![self.context.petal_state_topic_id.clone()],
        );
        let body = match serde_json::to_vec(&message) {
            Ok(body) => body,
            Err(err) => {
                warn!(epoch = proof.epoch, error = %err, "state message serialization failed");
                return;
            }
        };
        let ledger = Arc::clone(&self.ledger);
        let topic = self.context.petal_state_topic_id.clone();
        let payer = self.context.petal_account_id.clone();
        let epoch = proof.epoch;
        tokio::spawn(async move {
            if let Err(err) = ledger.submit_message(&topic, &payer, &body).await {
                warn!(epoch, topic = %topic, error = %err, "state topic publish failed");
            }
        });
    }
}
