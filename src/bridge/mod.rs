//! Cross-chain GET bridge client.
//!
//! A market's price request is carried to the oracle-source chain as an
//! asynchronous storage GET keyed by (feed address, storage slot). The
//! dispatch itself happens on-chain — the market contract hands the request
//! to its dispatcher when `requestPriceGet` executes — so off-chain we only
//! derive the request commitment and poll the bridge indexer for delivery
//! status while waiting for resolution.
//!
//! Responses carry raw key/value pairs; decoding the stored feed answer is
//! the caller's business ([`decode_stored_answer`] covers the common case).

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Commitment identifying one dispatched bridge request.
pub type RequestCommitment = B256;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("indexer request failed: {0}")]
    Http(String),
    #[error("malformed indexer response: {0}")]
    Malformed(String),
    #[error("requests are dispatched on-chain by the market contract")]
    DispatchUnsupported,
}

/// Storage key on the remote chain: 20-byte contract address followed by
/// the 32-byte slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestKey {
    pub contract: Address,
    pub slot: B256,
}

impl RequestKey {
    pub fn new(contract: Address, slot: B256) -> Self {
        Self { contract, slot }
    }

    pub fn encode(&self) -> [u8; 52] {
        let mut out = [0u8; 52];
        out[..20].copy_from_slice(self.contract.as_slice());
        out[20..].copy_from_slice(self.slot.as_slice());
        out
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 52 {
            return None;
        }
        Some(Self {
            contract: Address::from_slice(&bytes[..20]),
            slot: B256::from_slice(&bytes[20..]),
        })
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.contract, self.slot)
    }
}

/// One cross-chain storage GET, as handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct GetRequest {
    /// Opaque remote-chain routing descriptor (the market's `destination`).
    pub dest: Bytes,
    pub key: RequestKey,
    /// Remote block height to read at; 0 means latest.
    pub height: u64,
    pub nonce: u64,
    pub timeout_secs: u64,
    pub fee: U256,
    pub context: Bytes,
}

impl GetRequest {
    /// Deterministic commitment over every request field. Variable-length
    /// fields are length-prefixed so no two requests can share an encoding.
    pub fn commitment(&self) -> RequestCommitment {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.dest.len() as u64).to_be_bytes());
        buf.extend_from_slice(&self.dest);
        buf.extend_from_slice(&self.key.encode());
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.timeout_secs.to_be_bytes());
        buf.extend_from_slice(&self.fee.to_be_bytes::<32>());
        buf.extend_from_slice(&(self.context.len() as u64).to_be_bytes());
        buf.extend_from_slice(&self.context);
        keccak256(&buf)
    }
}

/// Raw key/value pair from a delivered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Resolution status of a dispatched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Delivered(Vec<StorageValue>),
    TimedOut,
}

/// Decode a stored feed answer (a single big-endian word) from a delivered
/// value. Feeds pack the latest answer into the low bytes of the slot.
pub fn decode_stored_answer(value: &[u8]) -> Option<U256> {
    if value.is_empty() || value.len() > 32 {
        return None;
    }
    let mut word = [0u8; 32];
    word[32 - value.len()..].copy_from_slice(value);
    Some(U256::from_be_bytes(word))
}

#[async_trait]
pub trait BridgeClient: Send + Sync {
    /// Dispatch a GET request and return its commitment.
    async fn dispatch_get(&self, request: &GetRequest) -> Result<RequestCommitment, BridgeError>;

    /// Poll for the resolution of a previously dispatched request.
    async fn poll_response(&self, commitment: RequestCommitment)
        -> Result<PollStatus, BridgeError>;
}

// ─── Indexer-backed client ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IndexerRequestStatus {
    status: String,
    #[serde(default)]
    values: Vec<IndexerValue>,
}

#[derive(Debug, Deserialize)]
struct IndexerValue {
    key: String,
    #[serde(default)]
    value: String,
}

/// Bridge client over the indexer HTTP API. Poll-only: dispatch happens
/// on-chain through the market contract.
pub struct IndexerBridgeClient {
    base_url: String,
    http: reqwest::Client,
}

impl IndexerBridgeClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BridgeClient for IndexerBridgeClient {
    async fn dispatch_get(&self, _request: &GetRequest) -> Result<RequestCommitment, BridgeError> {
        Err(BridgeError::DispatchUnsupported)
    }

    async fn poll_response(
        &self,
        commitment: RequestCommitment,
    ) -> Result<PollStatus, BridgeError> {
        let url = format!("{}/requests/{commitment}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| BridgeError::Http(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // Not indexed yet — same as pending from our side.
            return Ok(PollStatus::Pending);
        }
        let response = response
            .error_for_status()
            .map_err(|e| BridgeError::Http(e.to_string()))?;

        let body: IndexerRequestStatus = response
            .json()
            .await
            .map_err(|e| BridgeError::Malformed(e.to_string()))?;

        debug!(commitment = %commitment, status = %body.status, "bridge request status");

        match body.status.as_str() {
            "SOURCE" | "HYPERBRIDGE_DELIVERED" | "PENDING" => Ok(PollStatus::Pending),
            "DESTINATION" | "DELIVERED" => {
                let mut values = Vec::with_capacity(body.values.len());
                for v in &body.values {
                    let key = decode_hex(&v.key)
                        .ok_or_else(|| BridgeError::Malformed(format!("bad key: {}", v.key)))?;
                    let value = if v.value.is_empty() {
                        Vec::new()
                    } else {
                        decode_hex(&v.value).ok_or_else(|| {
                            BridgeError::Malformed(format!("bad value: {}", v.value))
                        })?
                    };
                    values.push(StorageValue { key, value });
                }
                Ok(PollStatus::Delivered(values))
            }
            "TIMED_OUT" => Ok(PollStatus::TimedOut),
            other => Err(BridgeError::Malformed(format!("unknown status: {other}"))),
        }
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    alloy::hex::decode(s.trim_start_matches("0x")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key_roundtrip() {
        let key = RequestKey::new(Address::repeat_byte(0xa3), B256::ZERO);
        let encoded = key.encode();
        assert_eq!(encoded.len(), 52);
        assert_eq!(RequestKey::parse(&encoded), Some(key));
        assert_eq!(RequestKey::parse(&encoded[..51]), None);
    }

    fn sample_request(nonce: u64) -> GetRequest {
        GetRequest {
            dest: Bytes::from(vec![0x01, 0x00, 0x00, 0xaa]),
            key: RequestKey::new(Address::repeat_byte(0xa3), B256::ZERO),
            height: 0,
            nonce,
            timeout_secs: 3_600,
            fee: U256::from(100u64),
            context: Bytes::new(),
        }
    }

    #[test]
    fn test_commitment_deterministic() {
        assert_eq!(sample_request(7).commitment(), sample_request(7).commitment());
        assert_ne!(sample_request(7).commitment(), sample_request(8).commitment());
    }

    #[test]
    fn test_commitment_field_sensitivity() {
        let base = sample_request(1);
        let mut other = sample_request(1);
        other.fee = U256::from(101u64);
        assert_ne!(base.commitment(), other.commitment());

        // Moving a byte between dest and context must change the encoding.
        let mut shifted = sample_request(1);
        shifted.dest = Bytes::from(vec![0x01, 0x00, 0x00]);
        shifted.context = Bytes::from(vec![0xaa]);
        assert_ne!(base.commitment(), shifted.commitment());
    }

    #[test]
    fn test_decode_stored_answer() {
        assert_eq!(
            decode_stored_answer(&[0x01, 0x00]),
            Some(U256::from(256u64))
        );
        assert_eq!(decode_stored_answer(&[]), None);
        assert_eq!(decode_stored_answer(&[0u8; 33]), None);
    }

    #[test]
    fn test_indexer_status_parsing() {
        let body: IndexerRequestStatus = serde_json::from_str(
            r#"{"status":"DELIVERED","values":[{"key":"0xA39434A63A52E749F02807ae27335515BA4b07F70000000000000000000000000000000000000000000000000000000000000000","value":"0x0186a0"}]}"#,
        )
        .unwrap();
        assert_eq!(body.status, "DELIVERED");
        assert_eq!(body.values.len(), 1);
        let value = decode_hex(&body.values[0].value).unwrap();
        assert_eq!(decode_stored_answer(&value), Some(U256::from(100_000u64)));

        let key = decode_hex(&body.values[0].key).unwrap();
        let parsed = RequestKey::parse(&key).unwrap();
        assert_eq!(parsed.slot, B256::ZERO);
    }
}
