//! flora-petal entry point.
//!
//! Configuration is environment-driven (see `flora_common::config`).
//! Petal-specific variables:
//!
//! - `PETAL_ID`: unique label, or `auto` for a generated one
//! - `PETAL_ACCOUNT_ID`, `PETAL_STATE_TOPIC`: this petal's identity
//! - `CONSUMER_URL`: where proofs are posted
//! - `ADAPTERS`: optional semicolon-separated REST adapters,
//!   `id,url,/json/pointer[,source]`; without it the petal runs the
//!   fixed development adapter set
//! - `LEDGER_MODE=mock` wires the in-memory ledger so a single machine
//!   can drive a full flora
//!
//! Startup: parse + validate config, wire the ledger and adapters, start
//! the scheduler, wait for ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flora_common::{LedgerClient, LedgerMode, MockLedger, PetalConfig};
use flora_petal::{
    AdapterRunner, ConsumerClient, FixedAdapter, PetalScheduler, PriceAdapter, ProofContext,
    RestAdapter,
};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

/// Parse the `ADAPTERS` variable: `id,url,/pointer[,source];...`.
fn rest_adapters(raw: &str, timeout: Duration) -> Result<Vec<Arc<dyn PriceAdapter>>> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("building adapter HTTP client")?;
    let mut adapters: Vec<Arc<dyn PriceAdapter>> = Vec::new();
    for entry in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let fields: Vec<&str> = entry.split(',').map(str::trim).collect();
        if fields.len() < 3 {
            bail!("ADAPTERS entry {entry:?} must be id,url,/pointer[,source]");
        }
        let source = fields.get(3).copied().unwrap_or(fields[0]);
        adapters.push(Arc::new(RestAdapter::new(
            fields[0],
            "HBAR-USD",
            source,
            fields[1],
            fields[2],
            client.clone(),
        )));
    }
    if adapters.is_empty() {
        bail!("ADAPTERS is set but contains no entries");
    }
    Ok(adapters)
}

/// Fixed development adapter set for mock-ledger floras.
fn dev_adapters() -> Vec<Arc<dyn PriceAdapter>> {
    vec![
        Arc::new(FixedAdapter::new("binance", "HBAR-USD", "binance", 0.07)),
        Arc::new(FixedAdapter::new("coingecko", "HBAR-USD", "coingecko", 0.071)),
        Arc::new(FixedAdapter::new("hedera", "HBAR-USD", "hedera", 0.072)),
    ]
}

/// Registry fingerprints for the adapter set. Deterministic over the
/// adapter identity so every petal running the same set agrees.
fn registry_fingerprints(ids: &[String]) -> std::collections::BTreeMap<String, String> {
    ids.iter()
        .map(|id| (id.clone(), flora_common::sha384_hex(format!("{id}:HBAR-USD").as_bytes())))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mut config = PetalConfig::from_env().context("petal configuration")?;
    if config.petal_id == "auto" {
        config.petal_id = format!("petal-{}", uuid::Uuid::new_v4());
    }

    let ledger: Arc<dyn LedgerClient> = match config.flora.ledger_mode {
        LedgerMode::Mock => Arc::new(MockLedger::new()),
        LedgerMode::External => {
            bail!("LEDGER_MODE=external requires an SDK-backed LedgerClient; \
                   embed flora-petal as a library and inject one")
        }
    };

    let timeout = Duration::from_millis(config.adapter_timeout_ms);
    let adapters = match std::env::var("ADAPTERS").ok().filter(|s| !s.trim().is_empty()) {
        Some(raw) => rest_adapters(&raw, timeout)?,
        None => {
            warn!("ADAPTERS not set, running the fixed development adapter set");
            dev_adapters()
        }
    };

    let runner = AdapterRunner::new(adapters, timeout);
    let adapter_ids = runner.adapter_ids();
    info!(
        petal = %config.petal_id,
        adapters = ?adapter_ids,
        consumer = %config.consumer_url,
        "petal starting"
    );

    let context = ProofContext {
        epoch_origin_ms: config.flora.epoch_origin_ms,
        block_time_ms: config.flora.block_time_ms,
        threshold_fingerprint: config.flora.threshold_fingerprint.clone(),
        adapter_fingerprints: registry_fingerprints(&adapter_ids),
        registry_topic_id: config.flora.registry_topic_id.clone(),
        flora_account_id: config.flora.flora_account_id.clone(),
        petal_id: config.petal_id.clone(),
        petal_account_id: config.petal_account_id.clone(),
        petal_state_topic_id: config.petal_state_topic_id.clone(),
        participants: config.flora.participants.clone(),
    };

    let sink = Arc::new(ConsumerClient::new(&config.consumer_url, Duration::from_secs(10))?);
    let scheduler = Arc::new(PetalScheduler::new(
        context,
        runner,
        ledger,
        sink,
        config.flora.publish_state_topic,
    ));

    let shutdown = scheduler.shutdown_handle();
    let run = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    shutdown.notify_waiters();
    let _ = run.await;
    Ok(())
}
