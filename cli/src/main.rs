//! chainsync: keep a store in step with an EVM chain.
//!
//! ```bash
//! chainsync run          --config chainsync.toml
//! chainsync check-config --config chainsync.toml
//! chainsync info
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chainsync_core::{FilterChain, HeaderSource, SyncConfig, SyncEngine, SyncStats};
use chainsync_evm::{
    AddressFilter, EvmBlockFetcher, HttpClientConfig, HttpRpcClient, LogSink, RpcTransport,
    TransferFilter, WsConfig, WsHeaderSource,
};

mod api;
mod config;
mod logging;

use config::{AppConfig, FiltersConfig};

const DEFAULT_CONFIG: &str = "chainsync.toml";

#[derive(Parser)]
#[command(
    name = "chainsync",
    about = "Block synchronization engine for EVM chains",
    long_about = "
Follows the chain head over a websocket subscription, backfills missed blocks
from the committed watermark, and runs every block through the filter chain.

ENVIRONMENT VARIABLES:
  CHAINSYNC_WS_ENDPOINT    overrides [chain] ws_endpoint
  CHAINSYNC_RPC_ENDPOINT   overrides [chain] rpc_endpoint
  CHAINSYNC_STORE_URL      overrides [store] url
  RUST_LOG                 overrides [log] level and components
",
    version
)]
struct Cli {
    /// Config file. Defaults are used if it is absent and not given explicitly.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "CHAINSYNC_WS_ENDPOINT")]
    ws_endpoint: Option<String>,

    #[arg(long, global = true, env = "CHAINSYNC_RPC_ENDPOINT")]
    rpc_endpoint: Option<String>,

    #[arg(long, global = true, env = "CHAINSYNC_STORE_URL")]
    store_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync until SIGINT/SIGTERM
    Run,

    /// Validate the config file and print the effective settings
    #[command(name = "check-config")]
    CheckConfig,

    /// Show built-in defaults and available store backends
    Info,
}

impl Cli {
    fn load_config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path, true)?,
            None => AppConfig::load(DEFAULT_CONFIG.as_ref(), false)?,
        };
        if let Some(url) = &self.ws_endpoint {
            config.chain.ws_endpoint = url.clone();
        }
        if let Some(url) = &self.rpc_endpoint {
            config.chain.rpc_endpoint = url.clone();
        }
        if let Some(url) = &self.store_url {
            config.store.url = url.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let config = cli.load_config()?;
            cmd_run(config).await
        }
        Commands::CheckConfig => {
            let config = cli.load_config()?;
            cmd_check_config(&config)
        }
        Commands::Info => {
            cmd_info();
            Ok(())
        }
    }
}

// ─── run ──────────────────────────────────────────────────────────────────────

async fn cmd_run(config: AppConfig) -> Result<()> {
    logging::init_tracing(&config.log);
    config.validate()?;

    let store = chainsync_storage::connect(&config.store.url)
        .await
        .context("failed to open store")?;

    let rpc = HttpRpcClient::new(
        config.chain.rpc_endpoint.clone(),
        HttpClientConfig {
            request_timeout: config.chain.rpc_timeout(),
            ..HttpClientConfig::default()
        },
    )
    .context("failed to build RPC client")?;
    let rpc = Arc::new(rpc);
    let headers = Arc::new(WsHeaderSource::new(
        config.chain.ws_endpoint.clone(),
        WsConfig::default(),
    ));

    // Unreachable endpoints are fatal at startup; later drops are retried.
    let tip = rpc
        .call("eth_blockNumber", Vec::new())
        .await
        .with_context(|| format!("cannot reach {}", config.chain.rpc_endpoint))?;
    drop(
        headers
            .subscribe()
            .await
            .with_context(|| format!("cannot subscribe at {}", config.chain.ws_endpoint))?,
    );
    info!(tip = %tip, "chain endpoints reachable");

    let fetcher = Arc::new(EvmBlockFetcher::new(rpc));
    let filters = build_filters(&config.filters);

    info!(
        ws = %config.chain.ws_endpoint,
        rpc = %config.chain.rpc_endpoint,
        filters = ?filters.names(),
        pool_size = config.syncer.pool.pool_size,
        "starting chainsync"
    );

    let stats = Arc::new(SyncStats::new());
    let engine = SyncEngine::new(config.syncer.clone(), fetcher, filters, store, headers)
        .with_stats(stats.clone());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let api = match config.api.address {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind status endpoint on {addr}"))?;
            Some(tokio::spawn(api::serve(
                listener,
                stats.clone(),
                shutdown.child_token(),
            )))
        }
        None => None,
    };

    let result = engine.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Some(handle) = api {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "status endpoint failed"),
            Err(e) => warn!(error = %e, "status endpoint task panicked"),
        }
    }

    let snapshot = stats.snapshot();
    info!(
        head = snapshot.head_cursor,
        completed = snapshot.pool_completed,
        failed = snapshot.pool_failed,
        "chainsync stopped"
    );
    result.context("sync engine stopped with an error")
}

/// Optional address gate, then the ERC-20 transfer decoder.
fn build_filters(config: &FiltersConfig) -> FilterChain {
    let mut chain = FilterChain::new();
    if !config.addresses.is_empty() {
        chain.push(Arc::new(AddressFilter::new(&config.addresses)));
    }
    chain.push(Arc::new(TransferFilter::new(Arc::new(LogSink))));
    chain
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, starting graceful shutdown"),
        _ = terminate => info!("received SIGTERM, starting graceful shutdown"),
    }
}

// ─── check-config / info ──────────────────────────────────────────────────────

fn cmd_check_config(config: &AppConfig) -> Result<()> {
    config.validate()?;
    println!("# configuration OK\n");
    print!("{}", config.to_toml_string()?);
    Ok(())
}

fn cmd_info() {
    let defaults = SyncConfig::default();
    println!("chainsync v{}", env!("CARGO_PKG_VERSION"));
    println!("  Workers: {} (queue {})", defaults.pool.pool_size, defaults.pool.queue_capacity);
    println!("  Job timeout: {}s", defaults.pool.job_timeout_secs);
    println!(
        "  Janitor: every {}s, {} blocks/batch, {} blocks behind head",
        defaults.janitor.sweep_interval_secs,
        defaults.janitor.batch_size,
        defaults.janitor.head_block_lag
    );
    println!(
        "  Resubscribe backoff: {}ms up to {}ms",
        defaults.head.resubscribe_backoff_ms, defaults.head.resubscribe_backoff_max_ms
    );
    println!("  Store backends: memory://, sqlite:<path>, postgres://");
    println!("  Filters: address gate, ERC-20 Transfer decoder");
}
