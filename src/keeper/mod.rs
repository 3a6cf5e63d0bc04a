//! Task supervisor.
//!
//! Owns one lifecycle task per market: deduplicates creation signals by
//! market address (replays and reconnects redeliver the same event),
//! spawns a [`LifecycleTask`] for each new market, records terminal
//! markets so a later redelivery doesn't restart them, and aborts every
//! in-flight task on shutdown.

use crate::bridge::BridgeClient;
use crate::chain::ChainClient;
use crate::config::LifecycleConfig;
use crate::lifecycle::{LifecycleEvent, LifecycleTask, MarketJob, OracleParams};

use alloy::primitives::Address;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct Keeper {
    chain: Arc<dyn ChainClient>,
    bridge: Option<Arc<dyn BridgeClient>>,
    oracle: OracleParams,
    cfg: LifecycleConfig,
    event_tx: mpsc::UnboundedSender<LifecycleEvent>,
    /// Markets with a live task.
    tasks: HashMap<Address, JoinHandle<()>>,
    /// Markets that already reached a terminal phase this run. A replayed
    /// creation event for one of these is dropped, not restarted.
    completed: HashSet<Address>,
}

impl Keeper {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        bridge: Option<Arc<dyn BridgeClient>>,
        oracle: OracleParams,
        cfg: LifecycleConfig,
        event_tx: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Self {
        Self {
            chain,
            bridge,
            oracle,
            cfg,
            event_tx,
            tasks: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    /// Handle a creation signal. Spawns a lifecycle task unless this
    /// market is already tracked; returns whether a task was spawned.
    pub fn observe(&mut self, job: MarketJob) -> bool {
        let market = job.market;
        if self.tasks.contains_key(&market) || self.completed.contains(&market) {
            debug!(market = %market, "duplicate creation event, already tracked");
            return false;
        }

        let task = LifecycleTask::new(
            job,
            Arc::clone(&self.chain),
            self.bridge.clone(),
            self.oracle.clone(),
            self.cfg.clone(),
            self.event_tx.clone(),
        );
        let handle = tokio::spawn(task.run());
        self.tasks.insert(market, handle);
        info!(market = %market, active = self.tasks.len(), "lifecycle task spawned");
        true
    }

    /// Record that a market's task reached a terminal phase.
    pub fn finish(&mut self, market: Address) {
        if self.tasks.remove(&market).is_some() {
            self.completed.insert(market);
            debug!(
                market = %market,
                active = self.tasks.len(),
                completed = self.completed.len(),
                "lifecycle task finished"
            );
        }
    }

    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    /// Abort every in-flight task and wait for each to wind down. Tasks
    /// parked on long timers are cancelled at their next await point.
    pub async fn shutdown(&mut self) {
        let n = self.tasks.len();
        for (market, handle) in self.tasks.drain() {
            handle.abort();
            let _ = handle.await;
            debug!(market = %market, "lifecycle task aborted");
        }
        if n > 0 {
            info!(aborted = n, "all lifecycle tasks stopped");
        }
    }
}
