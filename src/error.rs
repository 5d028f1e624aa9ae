use solana_sdk::{pubkey::Pubkey, signature::Signature};
use thiserror::Error;

use crate::types::AccountKind;

/// One account whose bytes could not be decoded. The cached value for it is left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeFailure {
    pub pubkey: Pubkey,
    pub kind: AccountKind,
    pub reason: String,
}

/// Errors surfaced by the SDK.
///
/// Functions return `anyhow::Result`; match on a failure with
/// `err.downcast_ref::<SdkError>()`.
#[derive(Debug, Clone, Error)]
pub enum SdkError {
    #[error("rpc request failed: {0}")]
    Rpc(String),

    #[error("account not found: {0}")]
    AccountNotFound(Pubkey),

    #[error("failed to decode {} account(s), first: {} {:?} ({})", .0.len(), .0[0].pubkey, .0[0].kind, .0[0].reason)]
    Decode(Vec<DecodeFailure>),

    #[error("perp market {0} is not loaded")]
    PerpMarketNotLoaded(u16),

    #[error("spot market {0} is not loaded")]
    SpotMarketNotLoaded(u16),

    #[error("user account snapshot is required unless the instruction bootstraps the user")]
    MissingUserAccount,

    #[error("transaction is {size} bytes, limit is {limit}")]
    TransactionTooLarge { size: usize, limit: usize },

    #[error("failed to compile transaction message: {0}")]
    MessageCompile(String),

    #[error("failed to sign transaction: {0}")]
    Signing(String),

    #[error("transaction {signature} failed at slot {slot}: {reason}")]
    TransactionFailed {
        signature: Signature,
        slot: u64,
        reason: String,
    },

    #[error("transaction {signature} was not confirmed in time ({timeout_count} timeouts so far)")]
    ConfirmationTimeout {
        signature: Signature,
        timeout_count: u64,
    },
}

impl SdkError {
    /// Transient failures the caller may retry as-is
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SdkError::Rpc(_) | SdkError::ConfirmationTimeout { .. }
        )
    }
}

/// Finds the `SdkError` carried by an `anyhow::Error`, if any
pub fn sdk_error(err: &anyhow::Error) -> Option<&SdkError> {
    err.downcast_ref::<SdkError>()
}
