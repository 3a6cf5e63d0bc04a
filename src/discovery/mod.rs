//! Factory event discovery.
//!
//! Subscribes to the market chain over WebSocket for `MarketCreated` /
//! `MarketCreatedV2` logs on the configured factory contracts, decodes
//! them and emits typed [`DiscoverySignal`]s via a tokio channel.
//!
//! Features:
//! - Automatic reconnection with exponential backoff across primary and
//!   fallback URLs
//! - Replay window on connect (eth_getLogs over the trailing block range)
//!   so creations that landed while we were down still get picked up
//!
//! Duplicate deliveries — a replay overlapping the live stream, or the
//! same event seen across reconnects — are expected here; the keeper
//! deduplicates by market address.

use crate::chain::abi;
use crate::config::{ChainConfig, FactoryConfig, FactoryVersion};
use crate::lifecycle::MarketJob;

use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use futures_util::StreamExt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("invalid factory address: {0}")]
    InvalidAddress(String),
    #[error("no WebSocket URLs configured")]
    NoUrls,
}

/// Signals emitted by the factory monitor.
#[derive(Debug, Clone)]
pub enum DiscoverySignal {
    /// A market creation event was decoded, live or replayed.
    MarketCreated { job: MarketJob, block_number: u64 },
    Connected,
    Disconnected { reason: String },
    /// A replay window was scanned on connect.
    Replayed {
        from_block: u64,
        to_block: u64,
        events: usize,
    },
}

struct WatchedFactory {
    address: Address,
    version: FactoryVersion,
    fee_guard: bool,
}

/// The creation topic a factory of this version emits.
fn creation_topic(version: FactoryVersion) -> B256 {
    match version {
        FactoryVersion::V1 => *abi::MARKET_CREATED_TOPIC,
        FactoryVersion::V2 => *abi::MARKET_CREATED_V2_TOPIC,
    }
}

/// The monitor that watches factory contracts for market creations.
pub struct FactoryMonitor {
    chain: ChainConfig,
    factories: Vec<WatchedFactory>,
    signal_tx: mpsc::UnboundedSender<DiscoverySignal>,
}

impl FactoryMonitor {
    pub fn new(
        chain: ChainConfig,
        factories: &[FactoryConfig],
        signal_tx: mpsc::UnboundedSender<DiscoverySignal>,
    ) -> Result<Self, DiscoveryError> {
        let factories = factories
            .iter()
            .map(|f| {
                Address::from_str(&f.address)
                    .map(|address| WatchedFactory {
                        address,
                        version: f.version,
                        fee_guard: f.fee_guard,
                    })
                    .map_err(|_| DiscoveryError::InvalidAddress(f.address.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            chain,
            factories,
            signal_tx,
        })
    }

    /// Start the monitor in a background task. Returns immediately; the
    /// monitor reconnects on its own for the life of the process.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_forever().await;
        })
    }

    /// WebSocket URLs to rotate through: primary first, then fallbacks.
    fn ws_urls(&self) -> Vec<&str> {
        let mut urls: Vec<&str> = Vec::new();
        if !self.chain.ws_url.is_empty() {
            urls.push(&self.chain.ws_url);
        }
        for url in &self.chain.fallback_ws_urls {
            if !url.is_empty() && urls.iter().all(|u| *u != url.as_str()) {
                urls.push(url);
            }
        }
        urls
    }

    /// Main loop: connect, replay, subscribe, process, reconnect on failure.
    async fn run_forever(&self) {
        let max_backoff = Duration::from_secs(60);
        let urls = self.ws_urls();
        if urls.is_empty() {
            error!("no WebSocket URLs configured (primary or fallback)");
            return;
        }
        let mut url_index = 0;
        let mut consecutive_failures: usize = 0;

        loop {
            let url = urls[url_index];
            info!(url = %url, provider = url_index + 1, total = urls.len(), "connecting to market chain WebSocket");

            match self.run_session_with_url(url).await {
                Ok(()) => {
                    info!("WebSocket session ended cleanly");
                    consecutive_failures = 0;
                    // On clean disconnect, stay on the same provider
                }
                Err(e) => {
                    let err_str = e.to_string();
                    let is_rate_limited =
                        err_str.contains("429") || err_str.contains("Too Many Requests");

                    if is_rate_limited {
                        warn!(url = %url, "provider rate limited, rotating");
                    } else {
                        error!(url = %url, error = %e, "WebSocket session error");
                    }

                    let _ = self
                        .signal_tx
                        .send(DiscoverySignal::Disconnected { reason: err_str });

                    consecutive_failures += 1;
                    url_index = (url_index + 1) % urls.len();
                }
            }

            // Rotate fast while untried providers remain; only back off
            // hard once the whole rotation has failed.
            let backoff = if consecutive_failures == 0 {
                Duration::from_secs(1)
            } else if consecutive_failures < urls.len() {
                Duration::from_secs(2)
            } else {
                let cycle = consecutive_failures / urls.len();
                let secs = (2u64).pow(cycle.min(5) as u32).min(max_backoff.as_secs());
                Duration::from_secs(secs)
            };

            info!(
                backoff_secs = backoff.as_secs(),
                next_url = %urls[url_index],
                failures = consecutive_failures,
                "reconnecting to market chain WebSocket"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// A single WebSocket session: connect, replay the trailing window,
    /// then process live events until the stream ends.
    async fn run_session_with_url(&self, url: &str) -> anyhow::Result<()> {
        let ws = WsConnect::new(url);
        let provider = ProviderBuilder::new().connect_ws(ws).await?;

        let _ = self.signal_tx.send(DiscoverySignal::Connected);
        info!("market chain WebSocket connected");

        let current_block = provider.get_block_number().await?;
        let filter = self.build_filter();

        // Replay the trailing window before going live so creations that
        // landed while we were disconnected still get a task.
        if self.chain.replay_blocks > 0 {
            let from_block = current_block.saturating_sub(self.chain.replay_blocks);
            let replay_filter = filter.clone().from_block(from_block).to_block(current_block);
            let logs = provider.get_logs(&replay_filter).await?;
            let mut events = 0usize;
            for log in &logs {
                if self.process_log(log) {
                    events += 1;
                }
            }
            info!(
                from_block = from_block,
                to_block = current_block,
                events = events,
                "replayed creation window"
            );
            let _ = self.signal_tx.send(DiscoverySignal::Replayed {
                from_block,
                to_block: current_block,
                events,
            });
        }

        let sub = provider.subscribe_logs(&filter).await?;
        let mut stream = sub.into_stream();

        info!(block = current_block, factories = self.factories.len(), "subscribed to factory events");

        while let Some(log) = stream.next().await {
            self.process_log(&log);
        }

        // Stream ended — will reconnect
        Ok(())
    }

    /// Log filter covering all watched factories and the creation topics
    /// of the versions actually configured.
    fn build_filter(&self) -> Filter {
        let addresses: Vec<Address> = self.factories.iter().map(|f| f.address).collect();
        let mut topics: Vec<B256> = Vec::new();
        for factory in &self.factories {
            let topic = creation_topic(factory.version);
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        Filter::new().address(addresses).event_signature(topics)
    }

    /// Decode one log and emit a signal. Returns whether a creation was
    /// emitted; malformed or unrecognized logs are skipped with a warning.
    fn process_log(&self, log: &Log) -> bool {
        let Some(topic0) = log.topic0() else {
            debug!("log has no topic0");
            return false;
        };
        if *topic0 != *abi::MARKET_CREATED_TOPIC && *topic0 != *abi::MARKET_CREATED_V2_TOPIC {
            debug!(topic = %topic0, "unrecognised event topic");
            return false;
        }

        let factory_address = log.address();
        let Some(factory) = self
            .factories
            .iter()
            .find(|f| f.address == factory_address)
        else {
            // The node should only send logs matching our filter; anything
            // else is not ours to act on.
            warn!(factory = %factory_address, "creation event from unwatched factory");
            return false;
        };

        if *topic0 != creation_topic(factory.version) {
            warn!(
                factory = %factory_address,
                version = ?factory.version,
                topic = %topic0,
                "creation event topic does not match factory version, skipping"
            );
            return false;
        }

        let event = match abi::decode_market_created(log.topics(), &log.data().data) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    factory = %factory_address,
                    version = ?factory.version,
                    error = %e,
                    "malformed creation event, skipping"
                );
                return false;
            }
        };

        let block_number = log.block_number.unwrap_or(0);
        info!(
            market = %event.market,
            prompt = %event.prompt,
            asset = %event.asset,
            close_time = event.close_time,
            factory = %factory_address,
            fee_guard = factory.fee_guard,
            block = block_number,
            "NEW MARKET: creation event"
        );

        let _ = self.signal_tx.send(DiscoverySignal::MarketCreated {
            job: MarketJob {
                market: event.market,
                prompt: event.prompt,
                asset: event.asset,
                close_time: event.close_time,
                fee_guarded: factory.fee_guard,
            },
            block_number,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{keccak256, Bytes, LogData, B256, U256};

    fn chain_config() -> ChainConfig {
        ChainConfig {
            ws_url: "wss://node.example/ws".to_string(),
            fallback_ws_urls: vec![],
            private_key: String::new(),
            replay_blocks: 1_000,
        }
    }

    fn factory_config(address: &str, fee_guard: bool) -> FactoryConfig {
        FactoryConfig {
            address: address.to_string(),
            version: FactoryVersion::V1,
            fee_guard,
        }
    }

    fn creation_log(factory: Address, market: Address, block: u64) -> Log {
        creation_log_with_topic(*abi::MARKET_CREATED_TOPIC, factory, market, block)
    }

    fn creation_log_with_topic(topic0: B256, factory: Address, market: Address, block: u64) -> Log {
        let mut market_topic = [0u8; 32];
        market_topic[12..].copy_from_slice(market.as_slice());

        // (string prompt, string asset, uint256 closeTime) with two
        // short strings, each fitting one padded word.
        let mut data = Vec::new();
        data.extend_from_slice(&U256::from(96u64).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(160u64).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(1_752_834_917u64).to_be_bytes::<32>());
        for s in ["Up or down?", "ETH/USD"] {
            data.extend_from_slice(&U256::from(s.len()).to_be_bytes::<32>());
            let mut padded = s.as_bytes().to_vec();
            padded.resize(32, 0);
            data.extend_from_slice(&padded);
        }

        Log {
            inner: alloy::primitives::Log {
                address: factory,
                data: LogData::new_unchecked(
                    vec![topic0, B256::from(market_topic)],
                    Bytes::from(data),
                ),
            },
            block_number: Some(block),
            ..Default::default()
        }
    }

    fn monitor_with(
        factories: &[FactoryConfig],
    ) -> (FactoryMonitor, mpsc::UnboundedReceiver<DiscoverySignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = FactoryMonitor::new(chain_config(), factories, tx).unwrap();
        (monitor, rx)
    }

    #[test]
    fn test_rejects_invalid_factory_address() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = FactoryMonitor::new(
            chain_config(),
            &[factory_config("not-an-address", false)],
            tx,
        );
        assert!(matches!(result, Err(DiscoveryError::InvalidAddress(_))));
    }

    #[test]
    fn test_creation_log_becomes_signal_with_factory_fee_guard() {
        let factory = Address::repeat_byte(0x0f);
        let market = Address::repeat_byte(0xab);
        let (monitor, mut rx) = monitor_with(&[FactoryConfig {
            address: format!("{factory}"),
            version: FactoryVersion::V2,
            fee_guard: true,
        }]);

        assert!(monitor.process_log(&creation_log_with_topic(
            *abi::MARKET_CREATED_V2_TOPIC,
            factory,
            market,
            42,
        )));

        match rx.try_recv().unwrap() {
            DiscoverySignal::MarketCreated { job, block_number } => {
                assert_eq!(job.market, market);
                assert_eq!(job.prompt, "Up or down?");
                assert_eq!(job.asset, "ETH/USD");
                assert_eq!(job.close_time, 1_752_834_917);
                assert!(job.fee_guarded);
                assert_eq!(block_number, 42);
            }
            other => panic!("expected MarketCreated, got {other:?}"),
        }
    }

    #[test]
    fn test_creation_topic_must_match_factory_version() {
        let v1_factory = Address::repeat_byte(0x0f);
        let v2_factory = Address::repeat_byte(0x1f);
        let market = Address::repeat_byte(0xab);
        let (monitor, mut rx) = monitor_with(&[
            factory_config(&format!("{v1_factory}"), false),
            FactoryConfig {
                address: format!("{v2_factory}"),
                version: FactoryVersion::V2,
                fee_guard: false,
            },
        ]);

        // A V1 factory emitting the V2 topic (and vice versa) is skipped.
        assert!(!monitor.process_log(&creation_log_with_topic(
            *abi::MARKET_CREATED_V2_TOPIC,
            v1_factory,
            market,
            1,
        )));
        assert!(!monitor.process_log(&creation_log(v2_factory, market, 2)));
        assert!(rx.try_recv().is_err());

        // The matching topic still goes through.
        assert!(monitor.process_log(&creation_log(v1_factory, market, 3)));
        assert!(matches!(
            rx.try_recv().unwrap(),
            DiscoverySignal::MarketCreated { .. }
        ));
    }

    #[test]
    fn test_filter_topics_follow_configured_versions() {
        let (v1_only, _rx) =
            monitor_with(&[factory_config(&format!("{}", Address::repeat_byte(0x0f)), false)]);
        let filter = v1_only.build_filter();
        assert!(filter.topics[0].matches(&abi::MARKET_CREATED_TOPIC));
        assert!(!filter.topics[0].matches(&abi::MARKET_CREATED_V2_TOPIC));
    }

    #[test]
    fn test_unwatched_factory_is_skipped() {
        let watched = Address::repeat_byte(0x0f);
        let stranger = Address::repeat_byte(0x99);
        let (monitor, mut rx) = monitor_with(&[factory_config(&format!("{watched}"), false)]);

        assert!(!monitor.process_log(&creation_log(stranger, Address::repeat_byte(0xab), 7)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_malformed_creation_event_is_skipped() {
        let factory = Address::repeat_byte(0x0f);
        let (monitor, mut rx) = monitor_with(&[factory_config(&format!("{factory}"), false)]);

        // Right topic, zero market address, truncated data.
        let log = Log {
            inner: alloy::primitives::Log {
                address: factory,
                data: LogData::new_unchecked(
                    vec![*abi::MARKET_CREATED_TOPIC, B256::ZERO],
                    Bytes::from(vec![0u8; 32]),
                ),
            },
            ..Default::default()
        };
        assert!(!monitor.process_log(&log));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_foreign_topic_is_ignored() {
        let factory = Address::repeat_byte(0x0f);
        let (monitor, mut rx) = monitor_with(&[factory_config(&format!("{factory}"), false)]);

        let log = Log {
            inner: alloy::primitives::Log {
                address: factory,
                data: LogData::new_unchecked(
                    vec![keccak256("Transfer(address,address,uint256)".as_bytes())],
                    Bytes::new(),
                ),
            },
            ..Default::default()
        };
        assert!(!monitor.process_log(&log));
        assert!(rx.try_recv().is_err());
    }
}
