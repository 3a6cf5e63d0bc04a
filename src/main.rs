use marketkeeper::bridge::{BridgeClient, IndexerBridgeClient};
use marketkeeper::chain::{ChainClient, RpcChainClient};
use marketkeeper::config::Config;
use marketkeeper::discovery::{DiscoverySignal, FactoryMonitor};
use marketkeeper::keeper::Keeper;
use marketkeeper::lifecycle::{LifecycleEvent, OracleParams};

use alloy::primitives::{Address, U256};
use anyhow::Context;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = Config::load(Path::new("marketkeeper.toml"))
        .context("failed to load marketkeeper.toml")?;

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("marketkeeper v{} starting", env!("CARGO_PKG_VERSION"));

    if !config.has_signer() {
        anyhow::bail!(
            "no signer key configured (set KEEPER_PRIVATE_KEY or chain.private_key)"
        );
    }

    // --- Oracle parameters ---
    let feed = Address::from_str(&config.oracle.feed)
        .context("oracle.feed is not a valid address")?;
    let fee_guard_in_use = config.factories.iter().any(|f| f.fee_guard);
    let fee_token = if config.oracle.fee_token.is_empty() {
        if fee_guard_in_use {
            anyhow::bail!("a factory has fee_guard enabled but oracle.fee_token is not set");
        }
        Address::ZERO
    } else {
        Address::from_str(&config.oracle.fee_token)
            .context("oracle.fee_token is not a valid address")?
    };
    let request_fee = U256::from_str(&config.oracle.request_fee)
        .context("oracle.request_fee is not a valid integer")?;

    let oracle = OracleParams {
        feed,
        fee_token,
        request_timeout_secs: config.oracle.request_timeout_secs,
        request_fee,
    };

    // --- Chain client ---
    let chain: Arc<dyn ChainClient> = Arc::new(
        RpcChainClient::connect(&config.chain.ws_url, &config.chain.private_key)
            .await
            .context("failed to connect chain client")?,
    );

    // --- Bridge status client (optional) ---
    let bridge: Option<Arc<dyn BridgeClient>> = if config.oracle.indexer_url.is_empty() {
        info!("no bridge indexer configured - resolution wait polls market state only");
        None
    } else {
        info!(url = %config.oracle.indexer_url, "bridge indexer client configured");
        Some(Arc::new(IndexerBridgeClient::new(
            config.oracle.indexer_url.clone(),
        )))
    };

    // --- Factory discovery ---
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<DiscoverySignal>();
    let monitor = FactoryMonitor::new(config.chain.clone(), &config.factories, signal_tx)?;
    info!(factories = config.factories.len(), "starting factory monitor");
    let monitor_handle = monitor.start();

    // --- Keeper ---
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<LifecycleEvent>();
    let mut keeper = Keeper::new(chain, bridge, oracle, config.lifecycle.clone(), event_tx);

    // --- Main Event Loop ---
    info!("entering main event loop - press Ctrl+C to stop");

    loop {
        tokio::select! {
            Some(signal) = signal_rx.recv() => {
                match signal {
                    DiscoverySignal::MarketCreated { job, block_number } => {
                        let market = job.market;
                        if keeper.observe(job) {
                            debug!(market = %market, block = block_number, "market accepted");
                        }
                    }
                    DiscoverySignal::Connected => info!("discovery connected"),
                    DiscoverySignal::Disconnected { reason } => {
                        warn!(reason = %reason, "discovery disconnected");
                    }
                    DiscoverySignal::Replayed { from_block, to_block, events } => {
                        info!(
                            from_block = from_block,
                            to_block = to_block,
                            events = events,
                            "creation replay complete"
                        );
                    }
                }
            }

            Some(event) = event_rx.recv() => {
                match event {
                    LifecycleEvent::PhaseChanged { market, from, to } => {
                        debug!(market = %market, from = %from, to = %to, "phase change");
                    }
                    LifecycleEvent::TaskResolved { market } => {
                        info!(market = %market, "market lifecycle complete");
                        keeper.finish(market);
                    }
                    LifecycleEvent::TaskFailed { market, phase, error, timed_out } => {
                        warn!(
                            market = %market,
                            phase = %phase,
                            error = %error,
                            timed_out = timed_out,
                            "market lifecycle failed"
                        );
                        keeper.finish(market);
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                monitor_handle.abort();
                keeper.shutdown().await;
                break;
            }
        }
    }

    Ok(())
}
