use std::time::Duration;

use solana_sdk::{compute_budget, message::VersionedMessage};

// ComputeBudgetInstruction::SetComputeUnitLimit
const SET_COMPUTE_UNIT_LIMIT_TAG: u8 = 2;

/// Reads the compute unit limit a message requests, if it sets one
pub fn compute_unit_limit(message: &VersionedMessage) -> Option<u32> {
    let keys = message.static_account_keys();
    message.instructions().iter().find_map(|ix| {
        let program = keys.get(usize::from(ix.program_id_index))?;
        if *program != compute_budget::id() || ix.data.first() != Some(&SET_COMPUTE_UNIT_LIMIT_TAG) {
            return None;
        }
        let units: [u8; 4] = ix.data.get(1..5)?.try_into().ok()?;
        Some(u32::from_le_bytes(units))
    })
}

/// Delay before retry `attempt` (0-based): `base * 2^attempt`, capped at `max`
pub fn exponential_backoff(base: Duration, attempt: u32, max: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}

/// Fixed-width, zero padded name as stored in market records
pub fn decode_name(name: &[u8; 32]) -> String {
    String::from_utf8_lossy(name)
        .trim_end_matches(['\0', ' '])
        .to_string()
}
