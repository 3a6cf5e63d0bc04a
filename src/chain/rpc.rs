//! alloy-backed [`ChainClient`] implementation.
//!
//! Holds one WebSocket provider with a local signer for the life of the
//! process. This is the only place raw node errors are interpreted: known
//! already-done revert reasons become [`TxOutcome::AlreadySatisfied`],
//! everything else is classified as transport trouble or a hard revert.

use crate::chain::abi;
use crate::chain::{ChainClient, ChainError, MarketState, PriceRequestOutcome, TxOutcome};

use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::{RpcError, TransportErrorKind};
use async_trait::async_trait;
use std::str::FromStr;
use tracing::{debug, info};

/// Revert reasons the market contract uses for effects that already hold.
/// Matched once here, at the node boundary; everything downstream sees
/// only `TxOutcome::AlreadySatisfied`.
const IDEMPOTENT_REVERTS: &[&str] = &["Already closed", "Price already requested"];

pub struct RpcChainClient {
    provider: DynProvider,
    signer: Address,
}

impl RpcChainClient {
    /// Connect the call/transaction provider and load the signer.
    pub async fn connect(ws_url: &str, private_key: &str) -> Result<Self, ChainError> {
        let signer = PrivateKeySigner::from_str(private_key)
            .map_err(|e| ChainError::Transport(format!("invalid signer key: {e}")))?;
        let signer_address = signer.address();
        let wallet = EthereumWallet::from(signer);

        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_ws(WsConnect::new(ws_url))
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?
            .erased();

        info!(url = %ws_url, signer = %signer_address, "chain client connected");

        Ok(Self {
            provider,
            signer: signer_address,
        })
    }

    async fn view(
        &self,
        to: Address,
        calldata: Vec<u8>,
        call: &'static str,
    ) -> Result<Bytes, ChainError> {
        let tx = TransactionRequest::default()
            .with_to(to)
            .with_input(calldata);
        self.provider.call(tx).await.map_err(|e| match e {
            RpcError::ErrorResp(payload) => {
                ChainError::Reverted(format!("{call}: {}", payload.message))
            }
            other => ChainError::Transport(format!("{call}: {other}")),
        })
    }

    async fn send(
        &self,
        to: Address,
        calldata: Vec<u8>,
        call: &'static str,
    ) -> Result<TxOutcome, ChainError> {
        let tx = TransactionRequest::default()
            .with_to(to)
            .with_input(calldata);

        let pending = match self.provider.send_transaction(tx).await {
            Ok(pending) => pending,
            Err(e) => return classify_send_error(e),
        };

        let tx_hash = *pending.tx_hash();
        debug!(call = call, to = %to, tx = %tx_hash, "transaction submitted");

        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        if receipt.status() {
            debug!(call = call, tx = %tx_hash, block = ?receipt.block_number, "transaction included");
            Ok(TxOutcome::Executed)
        } else {
            Err(ChainError::Reverted(format!("{call} reverted on-chain")))
        }
    }
}

/// Map a submission error: recognized already-done reverts are successes,
/// other node-reported errors are hard reverts, everything else transport.
fn classify_send_error(e: RpcError<TransportErrorKind>) -> Result<TxOutcome, ChainError> {
    match e {
        RpcError::ErrorResp(payload) => {
            if IDEMPOTENT_REVERTS.iter().any(|r| payload.message.contains(r)) {
                Ok(TxOutcome::AlreadySatisfied)
            } else {
                Err(ChainError::Reverted(payload.message.to_string()))
            }
        }
        other => Err(ChainError::Transport(other.to_string())),
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    fn signer(&self) -> Address {
        self.signer
    }

    async fn close_time(&self, market: Address) -> Result<u64, ChainError> {
        let data = self
            .view(market, abi::encode_call(*abi::CLOSE_TIME_SEL, &[]), "closeTime")
            .await?;
        abi::decode_u256(&data)
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| ChainError::Decode {
                call: "closeTime",
                detail: format!("{} bytes", data.len()),
            })
    }

    async fn market_state(&self, market: Address) -> Result<MarketState, ChainError> {
        let data = self
            .view(market, abi::encode_call(*abi::STATE_SEL, &[]), "state")
            .await?;
        abi::decode_u256(&data)
            .and_then(|v| u8::try_from(v).ok())
            .and_then(MarketState::from_u8)
            .ok_or_else(|| ChainError::Decode {
                call: "state",
                detail: format!("{} bytes", data.len()),
            })
    }

    async fn price_requested(&self, market: Address) -> Result<bool, ChainError> {
        let data = self
            .view(
                market,
                abi::encode_call(*abi::PRICE_REQUESTED_SEL, &[]),
                "priceRequested",
            )
            .await?;
        abi::decode_bool(&data).ok_or_else(|| ChainError::Decode {
            call: "priceRequested",
            detail: format!("{} bytes", data.len()),
        })
    }

    async fn dispatcher(&self, market: Address) -> Result<Address, ChainError> {
        let data = self
            .view(market, abi::encode_call(*abi::DISPATCHER_SEL, &[]), "dispatcher")
            .await?;
        abi::decode_address(&data).ok_or_else(|| ChainError::Decode {
            call: "dispatcher",
            detail: format!("{} bytes", data.len()),
        })
    }

    async fn destination(&self, market: Address) -> Result<Bytes, ChainError> {
        let data = self
            .view(
                market,
                abi::encode_call(*abi::DESTINATION_SEL, &[]),
                "destination",
            )
            .await?;
        abi::decode_bytes(&data)
            .map(Bytes::from)
            .ok_or_else(|| ChainError::Decode {
                call: "destination",
                detail: format!("{} bytes", data.len()),
            })
    }

    async fn close_market(&self, market: Address) -> Result<TxOutcome, ChainError> {
        self.send(
            market,
            abi::encode_call(*abi::CLOSE_MARKET_SEL, &[]),
            "closeMarket",
        )
        .await
    }

    async fn request_price(
        &self,
        market: Address,
        feed: Address,
        timeout_secs: u64,
        fee: U256,
    ) -> Result<PriceRequestOutcome, ChainError> {
        let calldata = abi::encode_call(
            *abi::REQUEST_PRICE_GET_SEL,
            &[
                abi::address_word(feed),
                abi::u256_word(U256::from(timeout_secs)),
                abi::u256_word(fee),
            ],
        );
        let tx = TransactionRequest::default()
            .with_to(market)
            .with_input(calldata);

        let pending = match self.provider.send_transaction(tx).await {
            Ok(pending) => pending,
            // classify only succeeds for a recognized already-done revert
            Err(e) => {
                return classify_send_error(e).map(|_| PriceRequestOutcome::AlreadyRequested)
            }
        };

        let tx_hash = *pending.tx_hash();
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        if !receipt.status() {
            return Err(ChainError::Reverted(
                "requestPriceGet reverted on-chain".to_string(),
            ));
        }

        // The dispatcher logs the bridge request commitment on dispatch.
        let commitment = receipt
            .inner
            .logs()
            .iter()
            .find(|log| log.topic0() == Some(&*abi::GET_REQUEST_DISPATCHED_TOPIC))
            .and_then(|log| log.topics().get(1).copied());

        debug!(
            market = %market,
            tx = %tx_hash,
            commitment = ?commitment,
            "price request dispatched"
        );
        Ok(PriceRequestOutcome::Requested { commitment })
    }

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ChainError> {
        let calldata = abi::encode_call(
            *abi::ALLOWANCE_SEL,
            &[abi::address_word(owner), abi::address_word(spender)],
        );
        let data = self.view(token, calldata, "allowance").await?;
        abi::decode_u256(&data).ok_or_else(|| ChainError::Decode {
            call: "allowance",
            detail: format!("{} bytes", data.len()),
        })
    }

    async fn approve_max(&self, token: Address, spender: Address) -> Result<TxOutcome, ChainError> {
        let calldata = abi::encode_call(
            *abi::APPROVE_SEL,
            &[abi::address_word(spender), abi::u256_word(U256::MAX)],
        );
        self.send(token, calldata, "approve").await
    }
}
