//! flora-consumer
//!
//! The single consumer process of the flora: accepts petal proofs over
//! HTTP (whole or chunked), buckets them per epoch, forms consensus on
//! the plurality state hash at quorum, publishes the consolidated proof
//! through a rotating leader, tails the flora state topic to backfill
//! log metadata, and persists history in the relational store.

pub mod aggregator;
pub mod bootstrap;
pub mod core;
pub mod http;
pub mod intake;
pub mod publisher;
pub mod roster;
pub mod tailer;

pub use aggregator::{Aggregator, ConsensusRound, EpochMetadata};
pub use bootstrap::{record_binding, run_bootstrap, BootstrapState};
pub use crate::core::{Consumer, ConsumerError, Counters};
pub use intake::{IntakeError, IntakeOutcome, IntakePolicy, ProofIntake};
pub use publisher::{elect_leader, LeaderPublisher, PublishError, PublishStamp, PublisherTuning};
pub use roster::{KeyCache, PetalState, Roster};
pub use tailer::LogTailer;
