//! flora-petal
//!
//! A petal is one worker of the flora: every epoch it samples the
//! registered price adapters concurrently, canonicalizes and hashes the
//! observations into a state hash, publishes the proof to its own state
//! topic and posts it to the consumer.

pub mod adapter;
pub mod client;
pub mod proof;
pub mod runner;
pub mod scheduler;

pub use adapter::{AdapterError, FixedAdapter, PriceAdapter, RestAdapter};
pub use client::{ClientError, ConsumerClient};
pub use proof::{build_proof, ProofContext};
pub use runner::{AdapterRunner, RunnerError, DEFAULT_ADAPTER_TIMEOUT};
pub use scheduler::{PetalScheduler, ProofSink};
