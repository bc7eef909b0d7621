//! Ledger client abstraction.
//!
//! The underlying ledger (topic creation, message submission, mirror HTTP)
//! is an external collaborator. This module defines [`LedgerClient`], the
//! narrow contract the flora core consumes, so the consumer and petals can
//! run against any backend without binding to an SDK:
//!
//! - submit a message to a topic, paying from a given account
//! - read a topic's message stream with `order` / `limit` /
//!   `timestamp=gt:<ts>` filters
//! - read an account's public key and key type
//!
//! [`MockLedger`] is a complete in-memory implementation. It backs the
//! test suite and the binaries' `mock` ledger mode, assigning strictly
//! monotonic consensus timestamps and per-topic sequence numbers the way
//! the real log does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use thiserror::Error;

use crate::canonical::sha384_hex;

// ════════════════════════════════════════════════════════════════════════════
// CONSENSUS TIMESTAMP
// ════════════════════════════════════════════════════════════════════════════

/// A `seconds.nanoseconds` log timestamp, ordered numerically.
///
/// The tailer's cursor and the metadata backfill compare these; string
/// comparison would order `"99.0"` after `"100.0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConsensusTimestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl ConsensusTimestamp {
    /// Parse `"1700000000.000000123"`. A missing fractional part reads as
    /// zero nanoseconds; anything non-numeric is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(2, '.');
        let secs = parts.next()?.parse::<u64>().ok()?;
        let nanos = match parts.next() {
            None | Some("") => 0,
            Some(frac) => {
                if frac.len() > 9 || !frac.chars().all(|c| c.is_ascii_digit()) {
                    return None;
                }
                // Right-pad to nanosecond precision.
                let padded = format!("{frac:0<9}");
                padded.parse::<u32>().ok()?
            }
        };
        Some(Self { secs, nanos })
    }

    pub fn to_raw(self) -> String {
        format!("{}.{:09}", self.secs, self.nanos)
    }
}

/// True when `candidate` is strictly newer than `cursor`. Unparseable
/// candidates never advance a cursor.
pub fn is_after(candidate: &str, cursor: &str) -> bool {
    match (ConsensusTimestamp::parse(candidate), ConsensusTimestamp::parse(cursor)) {
        (Some(c), Some(cur)) => c > cur,
        (Some(_), None) => true,
        _ => false,
    }
}

// ════════════════════════════════════════════════════════════════════════════
// LEDGER TYPES
// ════════════════════════════════════════════════════════════════════════════

/// One message read back from a topic. `message` is base64, exactly as the
/// mirror returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub topic_id: String,
    pub consensus_timestamp: String,
    pub sequence_number: u64,
    pub message: String,
}

impl TopicMessage {
    /// Decoded message body.
    pub fn decoded(&self) -> Result<Vec<u8>, LedgerError> {
        BASE64
            .decode(&self.message)
            .map_err(|e| LedgerError::Malformed(format!("topic message base64: {e}")))
    }
}

/// Receipt for a successfully submitted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub consensus_timestamp: String,
    pub sequence_number: u64,
}

/// An account's public key as the mirror reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountKeyInfo {
    pub key: String,
    pub key_type: String,
}

/// Read order for a topic's message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("ledger network error: {0}")]
    Network(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("submission rejected: {0}")]
    Rejected(String),
    #[error("malformed ledger data: {0}")]
    Malformed(String),
}

/// The narrow ledger contract the flora core consumes.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit `message` to `topic_id`, paying from `payer_account_id`.
    async fn submit_message(
        &self,
        topic_id: &str,
        payer_account_id: &str,
        message: &[u8],
    ) -> Result<SubmitReceipt, LedgerError>;

    /// Read messages from a topic. `after` is an exclusive lower bound
    /// (`timestamp=gt:<ts>`); `limit` caps the page size.
    async fn topic_messages(
        &self,
        topic_id: &str,
        order: TopicOrder,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<TopicMessage>, LedgerError>;

    /// Read an account's public key and key type.
    async fn account_key(&self, account_id: &str) -> Result<AccountKeyInfo, LedgerError>;
}

// ════════════════════════════════════════════════════════════════════════════
// MOCK LEDGER
// ════════════════════════════════════════════════════════════════════════════

/// In-memory ledger for tests and the `mock` ledger mode.
///
/// Consensus timestamps are strictly monotonic across all topics; sequence
/// numbers are per-topic and 1-based. `fail_next_submits` makes the next N
/// submissions fail with a network error, for retry-path tests.
pub struct MockLedger {
    topics: Mutex<HashMap<String, Vec<TopicMessage>>>,
    keys: Mutex<HashMap<String, AccountKeyInfo>>,
    clock_nanos: AtomicU64,
    fail_next_submits: AtomicU64,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
            // Arbitrary fixed origin so timestamps look like the real log.
            clock_nanos: AtomicU64::new(1_700_000_000_000_000_000),
            fail_next_submits: AtomicU64::new(0),
        }
    }

    /// Register an explicit key for an account; unknown accounts get a
    /// deterministic placeholder key instead.
    pub fn set_account_key(&self, account_id: &str, key: &str, key_type: &str) {
        self.keys.lock().insert(
            account_id.to_string(),
            AccountKeyInfo { key: key.to_string(), key_type: key_type.to_string() },
        );
    }

    /// Make the next `n` submissions fail with a network error.
    pub fn fail_next_submits(&self, n: u64) {
        self.fail_next_submits.store(n, Ordering::SeqCst);
    }

    /// Number of messages currently on a topic.
    pub fn topic_len(&self, topic_id: &str) -> usize {
        self.topics.lock().get(topic_id).map_or(0, Vec::len)
    }

    fn next_timestamp(&self) -> String {
        let nanos = self.clock_nanos.fetch_add(1_000_000, Ordering::SeqCst);
        ConsensusTimestamp { secs: nanos / 1_000_000_000, nanos: (nanos % 1_000_000_000) as u32 }
            .to_raw()
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn submit_message(
        &self,
        topic_id: &str,
        _payer_account_id: &str,
        message: &[u8],
    ) -> Result<SubmitReceipt, LedgerError> {
        let pending = self.fail_next_submits.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next_submits.store(pending - 1, Ordering::SeqCst);
            return Err(LedgerError::Network("injected submit failure".into()));
        }
        let mut topics = self.topics.lock();
        let messages = topics.entry(topic_id.to_string()).or_default();
        let receipt = SubmitReceipt {
            consensus_timestamp: self.next_timestamp(),
            sequence_number: messages.len() as u64 + 1,
        };
        messages.push(TopicMessage {
            topic_id: topic_id.to_string(),
            consensus_timestamp: receipt.consensus_timestamp.clone(),
            sequence_number: receipt.sequence_number,
            message: BASE64.encode(message),
        });
        Ok(receipt)
    }

    async fn topic_messages(
        &self,
        topic_id: &str,
        order: TopicOrder,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<TopicMessage>, LedgerError> {
        let topics = self.topics.lock();
        let mut messages: Vec<TopicMessage> = topics
            .get(topic_id)
            .map(|m| m.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|m| after.map_or(true, |ts| is_after(&m.consensus_timestamp, ts)))
            .cloned()
            .collect();
        if matches!(order, TopicOrder::Desc) {
            messages.reverse();
        }
        messages.truncate(limit);
        Ok(messages)
    }

    async fn account_key(&self, account_id: &str) -> Result<AccountKeyInfo, LedgerError> {
        if let Some(info) = self.keys.lock().get(account_id) {
            return Ok(info.clone());
        }
        // Deterministic placeholder so roster views are stable in dev mode.
        Ok(AccountKeyInfo {
            key: sha384_hex(account_id.as_bytes())[..64].to_string(),
            key_type: "ED25519".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_parse_and_order() {
        let a = ConsensusTimestamp::parse("99.000000500").expect("parse");
        let b = ConsensusTimestamp::parse("100.000000001").expect("parse");
        assert!(a < b);
        assert!(is_after("100.000000001", "99.000000500"));
        assert!(!is_after("99.000000500", "99.000000500"));
        assert!(!is_after("garbage", "99.0"));
    }

    #[test]
    fn timestamp_fraction_is_right_padded() {
        let t = ConsensusTimestamp::parse("7.5").expect("parse");
        assert_eq!(t.nanos, 500_000_000);
        assert_eq!(ConsensusTimestamp::parse("7").map(|t| t.nanos), Some(0));
        assert!(ConsensusTimestamp::parse("7.1234567890").is_none());
    }

    #[tokio::test]
    async fn mock_submit_assigns_monotonic_metadata() {
        let ledger = MockLedger::new();
        let r1 = ledger.submit_message("0.0.600", "0.0.10", b"one").await.expect("submit");
        let r2 = ledger.submit_message("0.0.600", "0.0.10", b"two").await.expect("submit");
        assert_eq!(r1.sequence_number, 1);
        assert_eq!(r2.sequence_number, 2);
        assert!(is_after(&r2.consensus_timestamp, &r1.consensus_timestamp));
    }

    #[tokio::test]
    async fn mock_read_supports_order_limit_and_gt_filter() {
        let ledger = MockLedger::new();
        for body in [b"a".as_slice(), b"b", b"c"] {
            ledger.submit_message("0.0.600", "0.0.10", body).await.expect("submit");
        }
        let all = ledger.topic_messages("0.0.600", TopicOrder::Asc, 10, None).await.expect("read");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].decoded().expect("decode"), b"a");

        let newest =
            ledger.topic_messages("0.0.600", TopicOrder::Desc, 1, None).await.expect("read");
        assert_eq!(newest[0].decoded().expect("decode"), b"c");

        let after = ledger
            .topic_messages("0.0.600", TopicOrder::Asc, 10, Some(&all[0].consensus_timestamp))
            .await
            .expect("read");
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].decoded().expect("decode"), b"b");
    }

    #[tokio::test]
    async fn mock_submit_failure_injection() {
        let ledger = MockLedger::new();
        ledger.fail_next_submits(1);
        assert!(ledger.submit_message("0.0.600", "0.0.10", b"x").await.is_err());
        assert!(ledger.submit_message("0.0.600", "0.0.10", b"x").await.is_ok());
    }
}
