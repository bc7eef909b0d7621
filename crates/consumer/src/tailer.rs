//! Flora state-topic tailer.
//!
//! Polls the log for the flora state topic on a timer and backfills
//! consensus metadata onto history entries. The cursor only ever moves
//! forward; messages at or before it are skipped. Whole ProofPayloads
//! found on the topic (legacy petals that published proofs directly) are
//! fed back through the normal intake path.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use flora_common::types::{parse_incoming, IncomingProof};
use flora_common::{StateHashMessage, TopicOrder};

use crate::aggregator::EpochMetadata;
use crate::core::Consumer;

/// Messages fetched per poll.
const POLL_PAGE: usize = 100;

pub struct LogTailer {
    consumer: Arc<Consumer>,
    shutdown: Arc<Notify>,
}

impl LogTailer {
    pub fn new(consumer: Arc<Consumer>) -> Self {
        Self { consumer, shutdown: Arc::new(Notify::new()) }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Initial cursor: newest persisted entry, else the newest topic
    /// message, else `"0"`.
    pub async fn init_cursor(&self) {
        if let Ok(Some(ts)) = self.consumer.store.latest_consensus_timestamp() {
            self.consumer.set_tail_cursor(ts);
            return;
        }
        let newest = self
            .consumer
            .ledger
            .topic_messages(&self.consumer.config.state_topic_id, TopicOrder::Desc, 1, None)
            .await;
        match newest {
            Ok(messages) if !messages.is_empty() => {
                self.consumer.set_tail_cursor(messages[0].consensus_timestamp.clone());
            }
            Ok(_) => self.consumer.set_tail_cursor("0".to_string()),
            Err(err) => {
                warn!(error = %err, "initial cursor probe failed, starting from 0");
                self.consumer.set_tail_cursor("0".to_string());
            }
        }
    }

    /// Poll until shutdown. I/O failures are logged and retried on the
    /// next tick; they never crash the process.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.consumer.config.poll_interval_ms.max(1),
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            topic = %self.consumer.config.state_topic_id,
            interval_ms = self.consumer.config.poll_interval_ms,
            "log tailer started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                _ = self.shutdown.notified() => {
                    info!("log tailer stopped");
                    return;
                }
            }
        }
    }

    /// One poll of the flora state topic.
    pub async fn poll_once(&self) {
        self.consumer.counters.tail_polls.fetch_add(1, Ordering::Relaxed);
        let cursor = self.consumer.tail_cursor();
        let messages = match self
            .consumer
            .ledger
            .topic_messages(
                &self.consumer.config.state_topic_id,
                TopicOrder::Asc,
                POLL_PAGE,
                Some(&cursor),
            )
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                warn!(error = %err, "state topic poll failed");
                return;
            }
        };

        for message in messages {
            if !self.consumer.advance_tail_cursor(&message.consensus_timestamp) {
                continue;
            }
            let bytes = match message.decoded() {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(sequence = message.sequence_number, error = %err, "undecodable message");
                    continue;
                }
            };
            let value: serde_json::Value = match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(err) => {
                    warn!(sequence = message.sequence_number, error = %err, "non-JSON message");
                    continue;
                }
            };

            let mut target_epoch = None;
            if let Ok(IncomingProof::Whole(proof)) = parse_incoming(&value) {
                // Legacy petal publishing proofs straight to the flora topic.
                target_epoch = Some(proof.epoch);
                debug!(epoch = proof.epoch, petal = %proof.petal_id, "legacy proof on flora topic");
                if let Err(err) = self.consumer.submit_proof(&value).await {
                    warn!(epoch = proof.epoch, reason = err.reason(), "legacy proof rejected");
                }
            } else if let Ok(state) = serde_json::from_value::<StateHashMessage>(value.clone()) {
                if state.is_state_hash() {
                    target_epoch = state.epoch.or_else(|| state.memo_epoch());
                }
            }
            if target_epoch.is_none() {
                target_epoch = self.consumer.oldest_unstamped_epoch();
            }

            let Some(epoch) = target_epoch else {
                continue;
            };
            self.consumer.apply_log_metadata(
                epoch,
                EpochMetadata {
                    hcs_message: Some(format!(
                        "hcs://17/{}",
                        self.consumer.config.state_topic_id
                    )),
                    consensus_timestamp: Some(message.consensus_timestamp.clone()),
                    sequence_number: Some(message.sequence_number),
                },
            );
        }
    }
}
