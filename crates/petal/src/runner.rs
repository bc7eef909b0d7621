//! Per-epoch adapter fan-out.
//!
//! All registered adapters run concurrently with a per-adapter deadline.
//! The policy is all-or-nothing: every petal must hash the same adapter
//! set, so a partial set can never produce a matching state hash; any
//! failure skips the whole epoch.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::warn;

use flora_common::AdapterRecord;

use crate::adapter::{AdapterError, PriceAdapter};

/// Default per-adapter deadline.
pub const DEFAULT_ADAPTER_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Error)]
pub enum RunnerError {
    /// At least one adapter failed; the epoch is skipped.
    #[error("epoch skipped: {0}")]
    EpochSkipped(AdapterError),
}

pub struct AdapterRunner {
    adapters: Vec<Arc<dyn PriceAdapter>>,
    timeout: Duration,
}

impl AdapterRunner {
    pub fn new(adapters: Vec<Arc<dyn PriceAdapter>>, timeout: Duration) -> Self {
        Self { adapters, timeout }
    }

    pub fn adapter_ids(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.id().to_string()).collect()
    }

    /// Run every adapter once. Records come back in registration order;
    /// the proof builder re-sorts them before hashing.
    pub async fn run(&self) -> Result<Vec<AdapterRecord>, RunnerError> {
        let fetches = self.adapters.iter().map(|adapter| {
            let adapter = Arc::clone(adapter);
            let deadline = self.timeout;
            async move {
                match tokio::time::timeout(deadline, adapter.fetch()).await {
                    Ok(result) => result,
                    Err(_) => Err(AdapterError::Deadline { adapter_id: adapter.id().to_string() }),
                }
            }
        });

        let mut records = Vec::with_capacity(self.adapters.len());
        for result in join_all(fetches).await {
            match result {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(adapter = err.adapter_id(), error = %err, "adapter failed, skipping epoch");
                    return Err(RunnerError::EpochSkipped(err));
                }
            }
        }
        Ok(records)
    }
}
