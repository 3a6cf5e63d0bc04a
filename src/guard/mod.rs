//! Fee-token allowance guard.
//!
//! Metered bridge calls pull their fee from the keeper's fee-token balance
//! via the market's dispatcher, so the dispatcher needs allowance before
//! `requestPriceGet` can succeed. The guard reads the live allowance on
//! every run — approval and the metered call are not atomic, so nothing is
//! cached — and when short it raises the allowance to `U256::MAX` once
//! rather than re-approving before every future request to the same
//! spender. Success is only reported after a fresh post-approval read
//! confirms the allowance actually covers the requirement.

use crate::chain::{ChainClient, ChainError};
use alloy::primitives::{Address, U256};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum GuardError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("allowance still insufficient after approval: have {have}, need {need}")]
    StillInsufficient { have: U256, need: U256 },
}

/// Ensure `spender` may pull at least `required` of `token` from the
/// keeper's account, approving the maximum if the current allowance falls
/// short. Never lowers an existing allowance.
pub async fn ensure_allowance(
    chain: &dyn ChainClient,
    token: Address,
    spender: Address,
    required: U256,
) -> Result<(), GuardError> {
    let owner = chain.signer();

    let current = chain.allowance(token, owner, spender).await?;
    if current >= required {
        debug!(
            token = %token,
            spender = %spender,
            allowance = %current,
            required = %required,
            "fee-token allowance sufficient"
        );
        return Ok(());
    }

    info!(
        token = %token,
        spender = %spender,
        allowance = %current,
        required = %required,
        "fee-token allowance short, approving max"
    );
    chain.approve_max(token, spender).await?;

    // Re-read rather than trusting the approval: the confirmed state is
    // what the metered call will see.
    let fresh = chain.allowance(token, owner, spender).await?;
    if fresh < required {
        return Err(GuardError::StillInsufficient {
            have: fresh,
            need: required,
        });
    }

    debug!(token = %token, spender = %spender, allowance = %fresh, "allowance confirmed");
    Ok(())
}
