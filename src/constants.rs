use lazy_static::lazy_static;
use solana_sdk::{pubkey, pubkey::Pubkey};

pub const PERPS_PROGRAM_ID: Pubkey = pubkey!("dRiftyHA39MWEi3m9aunc5MzRF1JYuBsbn6VPcn33UH");

// market lookup tables published by the program team
pub const DEVNET_LOOKUP: Pubkey = pubkey!("FaMS3U4uBojvGn5FSDEPimddcXsCfwkKsFgMVVnDdxGb");
pub const MAINNET_LOOKUP: Pubkey = pubkey!("D9cnvzswDikQDf53k4HpQ3KJ9y1Fv3HGGDFYMXnK5T6c");

/// Spot market every perp market settles in
pub const QUOTE_SPOT_MARKET_INDEX: u16 = 0;

/// Oracle address used by markets that have no oracle configured
pub const NO_ORACLE: Pubkey = Pubkey::new_from_array([0u8; 32]);

/// 10^6, quote asset oracles always report one unit
pub const PRICE_PRECISION: i64 = 1_000_000;

// COMPUTE BUDGET
pub const DEFAULT_COMPUTE_UNITS: u32 = 600_000;
pub const MAX_COMPUTE_UNITS: u32 = 1_400_000;
pub const DEFAULT_COMPUTE_UNITS_BUFFER_MULTIPLIER: f64 = 1.2;

// RPC
pub const MAX_MULTIPLE_ACCOUNTS: usize = 100; // getMultipleAccounts hard limit

// SEEDS
pub const STATE_SEED: &[u8] = b"drift_state";
pub const PERP_MARKET_SEED: &[u8] = b"perp_market";
pub const SPOT_MARKET_SEED: &[u8] = b"spot_market";
pub const USER_SEED: &[u8] = b"user";

lazy_static! {
    pub static ref STATE_ACCOUNT: Pubkey =
        Pubkey::find_program_address(&[STATE_SEED], &PERPS_PROGRAM_ID).0;
}

pub fn get_perp_market_address(market_index: u16) -> Pubkey {
    Pubkey::find_program_address(
        &[PERP_MARKET_SEED, &market_index.to_le_bytes()],
        &PERPS_PROGRAM_ID,
    )
    .0
}

pub fn get_spot_market_address(market_index: u16) -> Pubkey {
    Pubkey::find_program_address(
        &[SPOT_MARKET_SEED, &market_index.to_le_bytes()],
        &PERPS_PROGRAM_ID,
    )
    .0
}

pub fn get_user_account_address(authority: &Pubkey, sub_account_id: u16) -> Pubkey {
    Pubkey::find_program_address(
        &[USER_SEED, authority.as_ref(), &sub_account_id.to_le_bytes()],
        &PERPS_PROGRAM_ID,
    )
    .0
}
