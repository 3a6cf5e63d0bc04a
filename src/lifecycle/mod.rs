//! Per-market lifecycle state machine.
//!
//! Each discovered market gets one task that drives it
//! `AwaitingClose → Closing → PriceRequesting → AwaitingResolution →
//! Resolved`, issuing the corresponding chain calls along the way. Every
//! state-changing call is preceded by a pre-flight read so an effect that
//! already holds is skipped instead of re-submitted, and retried with
//! exponential backoff when it fails. A task that exhausts its retries or
//! outlives the resolution budget lands in the absorbing `Errored` phase
//! and reports why; it never takes the process or its sibling tasks down
//! with it.

use crate::bridge::{BridgeClient, PollStatus, RequestCommitment};
use crate::chain::{ChainClient, ChainError, MarketState, PriceRequestOutcome, TxOutcome};
use crate::config::LifecycleConfig;
use crate::guard::{self, GuardError};

use alloy::primitives::{Address, U256};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingClose,
    Closing,
    PriceRequesting,
    AwaitingResolution,
    Resolved,
    Errored,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::AwaitingClose => write!(f, "AWAITING_CLOSE"),
            Phase::Closing => write!(f, "CLOSING"),
            Phase::PriceRequesting => write!(f, "PRICE_REQUESTING"),
            Phase::AwaitingResolution => write!(f, "AWAITING_RESOLUTION"),
            Phase::Resolved => write!(f, "RESOLVED"),
            Phase::Errored => write!(f, "ERRORED"),
        }
    }
}

/// What the discovery monitor knows about a freshly created market.
#[derive(Debug, Clone)]
pub struct MarketJob {
    pub market: Address,
    pub prompt: String,
    pub asset: String,
    pub close_time: u64,
    /// Whether this market's factory requires the fee-token allowance
    /// guard before requesting a price.
    pub fee_guarded: bool,
}

/// Oracle request parameters shared by every task.
#[derive(Debug, Clone)]
pub struct OracleParams {
    /// Remote price feed contract on the oracle-source chain.
    pub feed: Address,
    /// Fee token the dispatcher pulls bridge fees from.
    pub fee_token: Address,
    pub request_timeout_secs: u64,
    pub request_fee: U256,
}

/// Events emitted by lifecycle tasks, consumed by the keeper loop.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    PhaseChanged {
        market: Address,
        from: Phase,
        to: Phase,
    },
    TaskResolved {
        market: Address,
    },
    TaskFailed {
        market: Address,
        phase: Phase,
        error: String,
        /// Distinguishes "we never saw the resolution" from "our call
        /// failed" for operators chasing bridge/relay problems.
        timed_out: bool,
    },
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("{call} failed after {attempts} attempts: {last}")]
    Exhausted {
        call: &'static str,
        attempts: u32,
        last: String,
    },
    #[error("resolution not observed within {budget_secs}s")]
    ResolutionTimeout { budget_secs: u64 },
    #[error("bridge reported the price request timed out")]
    BridgeTimedOut,
}

impl LifecycleError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            LifecycleError::ResolutionTimeout { .. } | LifecycleError::BridgeTimedOut
        )
    }
}

/// Failures inside one attempt of the price-request step.
#[derive(Error, Debug)]
enum StepError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Guard(#[from] GuardError),
}

pub struct LifecycleTask {
    job: MarketJob,
    phase: Phase,
    chain: Arc<dyn ChainClient>,
    bridge: Option<Arc<dyn BridgeClient>>,
    oracle: OracleParams,
    cfg: LifecycleConfig,
    event_tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleTask {
    pub fn new(
        job: MarketJob,
        chain: Arc<dyn ChainClient>,
        bridge: Option<Arc<dyn BridgeClient>>,
        oracle: OracleParams,
        cfg: LifecycleConfig,
        event_tx: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Self {
        Self {
            job,
            phase: Phase::AwaitingClose,
            chain,
            bridge,
            oracle,
            cfg,
            event_tx,
        }
    }

    /// Drive the market to a terminal phase. Consumes the task.
    pub async fn run(mut self) {
        info!(
            market = %self.job.market,
            prompt = %self.job.prompt,
            asset = %self.job.asset,
            close_time = self.job.close_time,
            fee_guarded = self.job.fee_guarded,
            "lifecycle task started"
        );

        match self.drive().await {
            Ok(()) => {
                self.set_phase(Phase::Resolved);
                info!(market = %self.job.market, "market resolved");
                let _ = self.event_tx.send(LifecycleEvent::TaskResolved {
                    market: self.job.market,
                });
            }
            Err(e) => {
                let failed_phase = self.phase;
                self.set_phase(Phase::Errored);
                warn!(
                    market = %self.job.market,
                    phase = %failed_phase,
                    error = %e,
                    timed_out = e.is_timeout(),
                    "lifecycle task failed"
                );
                let _ = self.event_tx.send(LifecycleEvent::TaskFailed {
                    market: self.job.market,
                    phase: failed_phase,
                    error: e.to_string(),
                    timed_out: e.is_timeout(),
                });
            }
        }
    }

    async fn drive(&mut self) -> Result<(), LifecycleError> {
        self.wait_for_close().await;

        self.set_phase(Phase::Closing);
        self.close().await?;

        self.set_phase(Phase::PriceRequesting);
        let commitment = self.request_price().await?;

        self.set_phase(Phase::AwaitingResolution);
        self.await_resolution(commitment).await
    }

    fn set_phase(&mut self, to: Phase) {
        let from = self.phase;
        self.phase = to;
        debug!(market = %self.job.market, from = %from, to = %to, "phase change");
        let _ = self.event_tx.send(LifecycleEvent::PhaseChanged {
            market: self.job.market,
            from,
            to,
        });
    }

    /// Suspend until the market's close time. A close time already in the
    /// past means no sleep at all.
    async fn wait_for_close(&self) {
        // Prefer the contract's own closeTime over the event value, which
        // can be stale when the creation was replayed. A failed read is
        // soft; the event value still bounds the wait.
        let close_time = match self.chain.close_time(self.job.market).await {
            Ok(t) if t > 0 => {
                if t != self.job.close_time {
                    warn!(
                        market = %self.job.market,
                        event_close_time = self.job.close_time,
                        chain_close_time = t,
                        "close time differs from creation event, using chain value"
                    );
                }
                t
            }
            _ => self.job.close_time,
        };

        let now = unix_now();
        if close_time > now {
            let wait_secs = close_time - now;
            info!(
                market = %self.job.market,
                close_at = %format_close_time(close_time),
                wait_secs = wait_secs,
                "waiting for close time"
            );
            sleep(Duration::from_secs(wait_secs)).await;
        } else {
            info!(
                market = %self.job.market,
                close_at = %format_close_time(close_time),
                "already past close time, proceeding"
            );
        }
    }

    async fn close(&mut self) -> Result<(), LifecycleError> {
        let outcome = with_retries(
            self.job.market,
            "closeMarket",
            self.cfg.call_attempts,
            Duration::from_millis(self.cfg.retry_base_ms),
            || self.close_once(),
        )
        .await?;

        match outcome {
            TxOutcome::AlreadySatisfied => {
                info!(market = %self.job.market, "market already closed");
            }
            TxOutcome::Executed => {
                info!(market = %self.job.market, "market closed");
                if self.cfg.post_close_delay_secs > 0 {
                    // Let the close settle before the follow-up request.
                    sleep(Duration::from_secs(self.cfg.post_close_delay_secs)).await;
                }
            }
        }
        Ok(())
    }

    async fn close_once(&self) -> Result<TxOutcome, ChainError> {
        // Pre-flight read: don't submit when the state already moved on.
        match self.chain.market_state(self.job.market).await? {
            MarketState::Open => self.chain.close_market(self.job.market).await,
            _ => Ok(TxOutcome::AlreadySatisfied),
        }
    }

    async fn request_price(&mut self) -> Result<Option<RequestCommitment>, LifecycleError> {
        let outcome = with_retries(
            self.job.market,
            "requestPriceGet",
            self.cfg.call_attempts,
            Duration::from_millis(self.cfg.retry_base_ms),
            || self.request_once(),
        )
        .await?;

        match outcome {
            PriceRequestOutcome::AlreadyRequested => {
                info!(market = %self.job.market, "price already requested");
                Ok(None)
            }
            PriceRequestOutcome::Requested { commitment } => {
                info!(
                    market = %self.job.market,
                    feed = %self.oracle.feed,
                    timeout_secs = self.oracle.request_timeout_secs,
                    fee = %self.oracle.request_fee,
                    commitment = ?commitment,
                    "price requested"
                );
                Ok(commitment)
            }
        }
    }

    /// One attempt: pre-flight check, allowance guard, then the request.
    /// The guard runs inside the attempt so its allowance read is live on
    /// every retry, never a cached value from a previous attempt.
    async fn request_once(&self) -> Result<PriceRequestOutcome, StepError> {
        if self.chain.price_requested(self.job.market).await? {
            return Ok(PriceRequestOutcome::AlreadyRequested);
        }

        if self.job.fee_guarded {
            let dispatcher = self.chain.dispatcher(self.job.market).await?;
            let destination = self.chain.destination(self.job.market).await?;
            debug!(
                market = %self.job.market,
                dispatcher = %dispatcher,
                destination = %destination,
                "bridge routing"
            );
            guard::ensure_allowance(
                self.chain.as_ref(),
                self.oracle.fee_token,
                dispatcher,
                self.oracle.request_fee,
            )
            .await?;
        }

        self.chain
            .request_price(
                self.job.market,
                self.oracle.feed,
                self.oracle.request_timeout_secs,
                self.oracle.request_fee,
            )
            .await
            .map_err(StepError::Chain)
    }

    /// Poll the market (and the bridge, when we know the request
    /// commitment) until resolution lands or the wait budget runs out.
    async fn await_resolution(
        &self,
        commitment: Option<RequestCommitment>,
    ) -> Result<(), LifecycleError> {
        let started = Instant::now();
        let budget = Duration::from_secs(self.cfg.resolution_budget_secs);
        let poll_interval = Duration::from_secs(self.cfg.resolution_poll_secs);

        loop {
            if started.elapsed() >= budget {
                return Err(LifecycleError::ResolutionTimeout {
                    budget_secs: self.cfg.resolution_budget_secs,
                });
            }

            match self.chain.market_state(self.job.market).await {
                Ok(MarketState::Resolved) => return Ok(()),
                Ok(state) => {
                    debug!(market = %self.job.market, state = %state, "not resolved yet");
                }
                // Poll failures are soft; the budget bounds how long we try.
                Err(e) => {
                    warn!(market = %self.job.market, error = %e, "resolution poll failed");
                }
            }

            if let (Some(bridge), Some(commitment)) = (self.bridge.as_ref(), commitment) {
                match bridge.poll_response(commitment).await {
                    Ok(PollStatus::TimedOut) => return Err(LifecycleError::BridgeTimedOut),
                    Ok(PollStatus::Delivered(values)) => {
                        debug!(
                            market = %self.job.market,
                            values = values.len(),
                            "bridge response delivered, awaiting on-chain settle"
                        );
                    }
                    Ok(PollStatus::Pending) => {}
                    Err(e) => {
                        debug!(market = %self.job.market, error = %e, "bridge status poll failed");
                    }
                }
            }

            sleep(poll_interval).await;
        }
    }
}

/// Retry `op` up to `attempts` times with exponential backoff.
async fn with_retries<T, E, F, Fut>(
    market: Address,
    call: &'static str,
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, LifecycleError>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                let delay = base_delay * 2u32.pow((attempt - 1).min(6));
                warn!(
                    market = %market,
                    call = call,
                    attempt = attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "call failed, backing off"
                );
                sleep(delay).await;
            }
            Err(e) => {
                return Err(LifecycleError::Exhausted {
                    call,
                    attempts,
                    last: e.to_string(),
                });
            }
        }
    }
    unreachable!("retry loop always returns")
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn format_close_time(close_time: u64) -> String {
    chrono::DateTime::from_timestamp(close_time as i64, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| close_time.to_string())
}
