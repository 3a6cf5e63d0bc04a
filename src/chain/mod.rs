//! Chain client seam for the market chain.
//!
//! Everything the keeper does on-chain goes through the [`ChainClient`]
//! trait: view reads on market contracts, the two lifecycle transactions
//! (`closeMarket`, `requestPriceGet`) and the fee-token calls used by the
//! allowance guard. The production implementation in `rpc` is backed by an
//! alloy WebSocket provider with a local signer; tests swap in the
//! programmable mock from `mock`.
//!
//! Idempotent-skip conditions ("already closed", "price already requested")
//! surface as [`TxOutcome::AlreadySatisfied`], never as errors. Raw node
//! revert strings are translated to that variant exactly once, inside the
//! RPC implementation — callers only ever match on the enum.

pub mod abi;
pub mod rpc;

#[cfg(test)]
pub(crate) mod mock;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use thiserror::Error;

pub use rpc::RpcChainClient;

/// Market contract state, mirroring the on-chain enum (0=Open, 1=Closed, 2=Resolved).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketState {
    Open,
    Closed,
    Resolved,
}

impl MarketState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(MarketState::Open),
            1 => Some(MarketState::Closed),
            2 => Some(MarketState::Resolved),
            _ => None,
        }
    }
}

impl std::fmt::Display for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketState::Open => write!(f, "OPEN"),
            MarketState::Closed => write!(f, "CLOSED"),
            MarketState::Resolved => write!(f, "RESOLVED"),
        }
    }
}

/// Outcome of a state-changing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// The transaction was included and took effect.
    Executed,
    /// The requested effect already held on-chain; nothing was submitted,
    /// or the node reported a recognized already-done revert.
    AlreadySatisfied,
}

/// Outcome of `requestPriceGet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceRequestOutcome {
    /// The request was dispatched. The dispatcher logs the bridge request
    /// commitment on dispatch; when that log was present in the receipt we
    /// carry it so the resolution wait can poll the bridge for status.
    Requested { commitment: Option<B256> },
    /// A request for this market was already outstanding.
    AlreadyRequested,
}

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    /// Network / node trouble; worth retrying.
    #[error("transport error: {0}")]
    Transport(String),
    /// The node rejected or reverted the call for a reason we don't
    /// recognize as idempotent.
    #[error("call reverted: {0}")]
    Reverted(String),
    /// Return data didn't decode the way the ABI says it should.
    #[error("malformed return data from {call}: {detail}")]
    Decode {
        call: &'static str,
        detail: String,
    },
}

/// Narrow surface over the market chain, held for the lifetime of each
/// lifecycle task rather than re-acquired per call.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// The keeper's own signing address (the fee-token owner).
    fn signer(&self) -> Address;

    async fn close_time(&self, market: Address) -> Result<u64, ChainError>;
    async fn market_state(&self, market: Address) -> Result<MarketState, ChainError>;
    async fn price_requested(&self, market: Address) -> Result<bool, ChainError>;
    async fn dispatcher(&self, market: Address) -> Result<Address, ChainError>;
    async fn destination(&self, market: Address) -> Result<Bytes, ChainError>;

    /// Submit `closeMarket()` and await inclusion.
    async fn close_market(&self, market: Address) -> Result<TxOutcome, ChainError>;

    /// Submit `requestPriceGet(feed, timeout, fee)` and await inclusion.
    async fn request_price(
        &self,
        market: Address,
        feed: Address,
        timeout_secs: u64,
        fee: U256,
    ) -> Result<PriceRequestOutcome, ChainError>;

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ChainError>;

    /// Raise the spender's allowance to the maximum representable value.
    async fn approve_max(&self, token: Address, spender: Address) -> Result<TxOutcome, ChainError>;
}
