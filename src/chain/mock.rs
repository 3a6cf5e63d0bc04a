//! Programmable in-memory chain for lifecycle, guard and keeper tests.
//!
//! Per-call result queues let a test script transient failures and
//! idempotent-skip outcomes; counters record exactly how many calls of
//! each kind were issued.

use super::{ChainClient, ChainError, MarketState, PriceRequestOutcome, TxOutcome};
use alloy::primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub(crate) struct MockChain {
    signer: Address,
    inner: Mutex<Inner>,
}

struct Inner {
    close_time: u64,
    state: MarketState,
    /// States returned by successive `market_state` reads before falling
    /// back to the sticky `state`.
    state_sequence: VecDeque<MarketState>,
    /// Per-market sticky states, taking precedence over the shared ones.
    market_states: HashMap<Address, MarketState>,
    price_requested: bool,
    dispatcher: Address,
    destination: Vec<u8>,
    allowance: U256,
    close_results: VecDeque<Result<TxOutcome, ChainError>>,
    request_results: VecDeque<Result<PriceRequestOutcome, ChainError>>,
    approve_results: VecDeque<Result<TxOutcome, ChainError>>,
    close_calls: u32,
    request_calls: u32,
    approve_calls: u32,
    allowance_reads: u32,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            signer: Address::repeat_byte(0xfe),
            inner: Mutex::new(Inner {
                close_time: 0,
                state: MarketState::Open,
                state_sequence: VecDeque::new(),
                market_states: HashMap::new(),
                price_requested: false,
                dispatcher: Address::repeat_byte(0xd1),
                destination: vec![0x01, 0x00, 0x00, 0xaa],
                allowance: U256::ZERO,
                close_results: VecDeque::new(),
                request_results: VecDeque::new(),
                approve_results: VecDeque::new(),
                close_calls: 0,
                request_calls: 0,
                approve_calls: 0,
                allowance_reads: 0,
            }),
        }
    }

    pub fn set_close_time(&self, close_time: u64) {
        self.inner.lock().unwrap().close_time = close_time;
    }

    pub fn set_state(&self, state: MarketState) {
        self.inner.lock().unwrap().state = state;
    }

    /// Queue states for successive `market_state` reads.
    pub fn queue_states(&self, states: impl IntoIterator<Item = MarketState>) {
        self.inner.lock().unwrap().state_sequence.extend(states);
    }

    /// Pin one market's state, independent of the shared state. Used when
    /// several markets share the mock and must diverge.
    pub fn set_market_state(&self, market: Address, state: MarketState) {
        self.inner.lock().unwrap().market_states.insert(market, state);
    }

    pub fn set_price_requested(&self, requested: bool) {
        self.inner.lock().unwrap().price_requested = requested;
    }

    pub fn set_allowance(&self, allowance: U256) {
        self.inner.lock().unwrap().allowance = allowance;
    }

    pub fn queue_close_result(&self, result: Result<TxOutcome, ChainError>) {
        self.inner.lock().unwrap().close_results.push_back(result);
    }

    pub fn queue_request_result(&self, result: Result<PriceRequestOutcome, ChainError>) {
        self.inner.lock().unwrap().request_results.push_back(result);
    }

    pub fn queue_approve_result(&self, result: Result<TxOutcome, ChainError>) {
        self.inner.lock().unwrap().approve_results.push_back(result);
    }

    pub fn close_calls(&self) -> u32 {
        self.inner.lock().unwrap().close_calls
    }

    pub fn request_calls(&self) -> u32 {
        self.inner.lock().unwrap().request_calls
    }

    pub fn approve_calls(&self) -> u32 {
        self.inner.lock().unwrap().approve_calls
    }

    pub fn allowance_reads(&self) -> u32 {
        self.inner.lock().unwrap().allowance_reads
    }

    pub fn allowance_value(&self) -> U256 {
        self.inner.lock().unwrap().allowance
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn signer(&self) -> Address {
        self.signer
    }

    async fn close_time(&self, _market: Address) -> Result<u64, ChainError> {
        Ok(self.inner.lock().unwrap().close_time)
    }

    async fn market_state(&self, market: Address) -> Result<MarketState, ChainError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.market_states.get(&market) {
            return Ok(*state);
        }
        Ok(inner.state_sequence.pop_front().unwrap_or(inner.state))
    }

    async fn price_requested(&self, _market: Address) -> Result<bool, ChainError> {
        Ok(self.inner.lock().unwrap().price_requested)
    }

    async fn dispatcher(&self, _market: Address) -> Result<Address, ChainError> {
        Ok(self.inner.lock().unwrap().dispatcher)
    }

    async fn destination(&self, _market: Address) -> Result<Bytes, ChainError> {
        Ok(Bytes::from(self.inner.lock().unwrap().destination.clone()))
    }

    async fn close_market(&self, _market: Address) -> Result<TxOutcome, ChainError> {
        let mut inner = self.inner.lock().unwrap();
        inner.close_calls += 1;
        let result = inner
            .close_results
            .pop_front()
            .unwrap_or(Ok(TxOutcome::Executed));
        if matches!(result, Ok(TxOutcome::Executed)) {
            inner.state = MarketState::Closed;
        }
        result
    }

    async fn request_price(
        &self,
        _market: Address,
        _feed: Address,
        _timeout_secs: u64,
        _fee: U256,
    ) -> Result<PriceRequestOutcome, ChainError> {
        let mut inner = self.inner.lock().unwrap();
        inner.request_calls += 1;
        let result = inner
            .request_results
            .pop_front()
            .unwrap_or(Ok(PriceRequestOutcome::Requested { commitment: None }));
        if matches!(result, Ok(PriceRequestOutcome::Requested { .. })) {
            inner.price_requested = true;
        }
        result
    }

    async fn allowance(
        &self,
        _token: Address,
        _owner: Address,
        _spender: Address,
    ) -> Result<U256, ChainError> {
        let mut inner = self.inner.lock().unwrap();
        inner.allowance_reads += 1;
        Ok(inner.allowance)
    }

    async fn approve_max(
        &self,
        _token: Address,
        _spender: Address,
    ) -> Result<TxOutcome, ChainError> {
        let mut inner = self.inner.lock().unwrap();
        inner.approve_calls += 1;
        let result = inner
            .approve_results
            .pop_front()
            .unwrap_or(Ok(TxOutcome::Executed));
        if matches!(result, Ok(TxOutcome::Executed)) {
            inner.allowance = U256::MAX;
        }
        result
    }
}
