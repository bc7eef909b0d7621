//! flora-common
//!
//! Shared core of the flora price-oracle network: the canonical
//! serializer and SHA-384 hasher every member must agree on, the proof
//! and consensus data model, epoch arithmetic, account-id ordering, the
//! ledger-client abstraction with its in-memory mock, AEAD wrapping for
//! secret bootstrap state, and environment configuration.

pub mod account;
pub mod canonical;
pub mod config;
pub mod epoch;
pub mod ledger;
pub mod secrets;
pub mod types;

pub use canonical::{canonicalize, hash_canonical, sha384_hex};
pub use config::{ConfigError, FloraConfig, LedgerMode, PetalConfig};
pub use ledger::{
    AccountKeyInfo, ConsensusTimestamp, LedgerClient, LedgerError, MockLedger, SubmitReceipt,
    TopicMessage, TopicOrder,
};
pub use types::{
    assemble_chunks, compute_state_hash, parse_incoming, split_into_chunks, AdapterRecord,
    ChunkedProofPayload, ConsensusEntry, IncomingProof, ProofParseError, ProofPayload,
    SourcePrice, StateHashMessage,
};
