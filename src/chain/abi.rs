//! Minimal manual ABI codec for the handful of calls and events we touch.
//!
//! Selectors and event topics are derived from their signatures at first
//! use rather than pasted in as hex, so a signature typo shows up as a
//! failing call instead of a silently wrong constant.

use alloy::primitives::{keccak256, Address, B256, U256};
use std::sync::LazyLock;

// ─── Function selectors ──────────────────────────────────────────────────────

pub static CLOSE_TIME_SEL: LazyLock<[u8; 4]> = LazyLock::new(|| selector("closeTime()"));
pub static STATE_SEL: LazyLock<[u8; 4]> = LazyLock::new(|| selector("state()"));
pub static PRICE_REQUESTED_SEL: LazyLock<[u8; 4]> =
    LazyLock::new(|| selector("priceRequested()"));
pub static DISPATCHER_SEL: LazyLock<[u8; 4]> = LazyLock::new(|| selector("dispatcher()"));
pub static DESTINATION_SEL: LazyLock<[u8; 4]> = LazyLock::new(|| selector("destination()"));
pub static CLOSE_MARKET_SEL: LazyLock<[u8; 4]> = LazyLock::new(|| selector("closeMarket()"));
pub static REQUEST_PRICE_GET_SEL: LazyLock<[u8; 4]> =
    LazyLock::new(|| selector("requestPriceGet(address,uint256,uint256)"));
pub static ALLOWANCE_SEL: LazyLock<[u8; 4]> =
    LazyLock::new(|| selector("allowance(address,address)"));
pub static APPROVE_SEL: LazyLock<[u8; 4]> = LazyLock::new(|| selector("approve(address,uint256)"));

// ─── Event topic0 hashes ─────────────────────────────────────────────────────

/// keccak256("MarketCreated(address,string,string,uint256)")
pub static MARKET_CREATED_TOPIC: LazyLock<B256> =
    LazyLock::new(|| keccak256("MarketCreated(address,string,string,uint256)".as_bytes()));

/// keccak256("MarketCreatedV2(address,string,string,uint256)")
pub static MARKET_CREATED_V2_TOPIC: LazyLock<B256> =
    LazyLock::new(|| keccak256("MarketCreatedV2(address,string,string,uint256)".as_bytes()));

/// keccak256("GetRequestDispatched(bytes32)")
///
/// Emitted by the dispatcher when a market hands it a cross-chain GET;
/// topics[1] is the request commitment.
pub static GET_REQUEST_DISPATCHED_TOPIC: LazyLock<B256> =
    LazyLock::new(|| keccak256("GetRequestDispatched(bytes32)".as_bytes()));

/// First four bytes of keccak256 of the signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

// ─── Call encoding ───────────────────────────────────────────────────────────

/// Build calldata: selector followed by 32-byte words.
pub fn encode_call(sel: [u8; 4], words: &[[u8; 32]]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * words.len());
    data.extend_from_slice(&sel);
    for word in words {
        data.extend_from_slice(word);
    }
    data
}

pub fn address_word(addr: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(addr.as_slice());
    word
}

pub fn u256_word(value: U256) -> [u8; 32] {
    value.to_be_bytes()
}

// ─── Return-data decoding ────────────────────────────────────────────────────

pub fn decode_u256(data: &[u8]) -> Option<U256> {
    let word: [u8; 32] = data.get(0..32)?.try_into().ok()?;
    Some(U256::from_be_bytes(word))
}

pub fn decode_address(data: &[u8]) -> Option<Address> {
    let word = data.get(0..32)?;
    Some(Address::from_slice(&word[12..]))
}

pub fn decode_bool(data: &[u8]) -> Option<bool> {
    decode_u256(data).map(|v| !v.is_zero())
}

/// Decode a single dynamic `bytes` return value:
/// offset word, then length word at the offset, then the payload.
pub fn decode_bytes(data: &[u8]) -> Option<Vec<u8>> {
    let offset: usize = decode_u256(data)?.try_into().ok()?;
    let len: usize = decode_u256(data.get(offset..)?)?.try_into().ok()?;
    let start = offset.checked_add(32)?;
    let end = start.checked_add(len)?;
    data.get(start..end).map(|b| b.to_vec())
}

/// Decode a dynamic `string` at the given head slot of an encoded tuple.
fn decode_string_at(data: &[u8], head_slot: usize) -> Option<String> {
    let offset: usize = decode_u256(data.get(head_slot * 32..)?)?.try_into().ok()?;
    let len: usize = decode_u256(data.get(offset..)?)?.try_into().ok()?;
    let start = offset.checked_add(32)?;
    let end = start.checked_add(len)?;
    let bytes = data.get(start..end)?;
    String::from_utf8(bytes.to_vec()).ok()
}

// ─── MarketCreated decoding ──────────────────────────────────────────────────

/// Decoded factory creation event, identical shape for V1 and V2.
#[derive(Debug, Clone)]
pub struct MarketCreated {
    pub market: Address,
    pub prompt: String,
    pub asset: String,
    pub close_time: u64,
}

/// Decode a MarketCreated / MarketCreatedV2 log.
///
/// The market address is indexed (topics[1]); the data carries
/// `(string prompt, string asset, uint256 closeTime)`.
pub fn decode_market_created(topics: &[B256], data: &[u8]) -> Result<MarketCreated, String> {
    let market_topic = topics
        .get(1)
        .ok_or_else(|| "missing market address topic".to_string())?;
    let market = Address::from_slice(&market_topic.0[12..]);
    if market == Address::ZERO {
        return Err("zero market address".to_string());
    }

    let prompt =
        decode_string_at(data, 0).ok_or_else(|| "malformed prompt string".to_string())?;
    let asset = decode_string_at(data, 1).ok_or_else(|| "malformed asset string".to_string())?;
    let close_time: u64 = decode_u256(data.get(64..).ok_or("data truncated")?)
        .ok_or_else(|| "missing closeTime word".to_string())?
        .try_into()
        .map_err(|_| "closeTime out of u64 range".to_string())?;

    Ok(MarketCreated {
        market,
        prompt,
        asset,
        close_time,
    })
}
