//! flora-consumer entry point.
//!
//! Startup order: configuration (fail fast), store + bootstrap, ledger,
//! consumer core, publisher task, log tailer, HTTP server, ctrl-c
//! shutdown. I/O faults inside the long-lived tasks are logged and
//! retried; only configuration and store-open faults abort.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flora_common::{FloraConfig, LedgerClient, LedgerMode, MockLedger};
use flora_consumer::{run_bootstrap, Consumer, LogTailer, PublisherTuning};
use flora_store::HistoryStore;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mut config = FloraConfig::from_env().context("consumer configuration")?;
    let store = Arc::new(
        HistoryStore::open(&config.db_path, config.petal_key_secret.as_deref())
            .context("opening history store")?,
    );
    let bootstrap = run_bootstrap(&store, &mut config).context("bootstrap state")?;

    let ledger: Arc<dyn LedgerClient> = match config.ledger_mode {
        LedgerMode::Mock => Arc::new(MockLedger::new()),
        LedgerMode::External => {
            bail!("LEDGER_MODE=external requires an SDK-backed LedgerClient; \
                   embed flora-consumer as a library and inject one")
        }
    };

    let port = config.port;
    let (consumer, consensus_rx) =
        Consumer::new(config, ledger, store, bootstrap, PublisherTuning::default())
            .context("constructing consumer")?;

    // Leader publication pipeline.
    let publisher_task = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.run_publisher(consensus_rx).await })
    };

    // Log tailer.
    let tailer = Arc::new(LogTailer::new(Arc::clone(&consumer)));
    tailer.init_cursor().await;
    let tailer_shutdown = tailer.shutdown_handle();
    let tailer_task = {
        let tailer = Arc::clone(&tailer);
        tokio::spawn(async move { tailer.run().await })
    };

    // HTTP surface.
    let app = flora_consumer::http::router(Arc::clone(&consumer));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "consumer listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("http server")?;

    tailer_shutdown.notify_waiters();
    let _ = tailer_task.await;
    publisher_task.abort();
    Ok(())
}
