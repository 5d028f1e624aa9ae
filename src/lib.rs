//! # Perps SDK
//!
//! A client engine for a perpetuals program on Solana. It keeps a local, slot-stamped mirror
//! of the program accounts a trader needs and uses it to build, simulate and send transactions:
//!
//! 1. **Account mirror**: state, perp markets, spot markets, oracles and user accounts, kept
//!    fresh either by polling or by websocket subscriptions. A cached account never goes back
//!    to an older slot, whichever source the update came from.
//! 2. **Remaining accounts**: for any instruction, the oracles and markets the program needs to
//!    see, including the ones implied by the user's open positions.
//! 3. **Transactions**: legacy or v0 (with address lookup tables), with a fixed or simulated
//!    compute budget, sent and confirmed by polling, websocket or both.
//!
//! ## 🚀 Quick Start
//!
//! ### Installation
//!
//! ```toml
//! [dependencies]
//! perps-sdk-on-chain = "0.1.0"
//! ```
//!
//! ### Basic Setup
//!
//! ```ignore
//! use perps_sdk_on_chain::{PerpsSDK, SdkConfig};
//!
//! let sdk = PerpsSDK::new(SdkConfig {
//!     rpc_endpoint: "https://api.devnet.solana.com".to_string(),
//!     ws_endpoint: "wss://api.devnet.solana.com".to_string(),
//!     is_devnet: true,
//!     perp_market_indexes: vec![0, 1],
//!     spot_market_indexes: vec![0, 1],
//!     users: vec![user_account],
//!     ..Default::default()
//! })
//! .await?;
//!
//! if !sdk.subscribe().await {
//!     // initial load incomplete, the cache may be partial
//! }
//! ```
//!
//! ## 📖 Usage
//!
//! ### Reading accounts
//!
//! ```ignore
//! let market = sdk.get_perp_market_account(0).expect("market 0 is tracked");
//! println!("slot {} margin {}", market.slot, market.data.margin_ratio_initial);
//!
//! // bypasses a cold cache: fetches until the market is loaded
//! let market = sdk.force_get_perp_market(3).await?;
//! ```
//!
//! ### Building and sending
//!
//! ```ignore
//! let user = sdk.get_active_user_account().expect("user is tracked");
//! let remaining_accounts = sdk.get_remaining_accounts(&RemainingAccountsParams {
//!     user_accounts: vec![user.data],
//!     writable_perp_market_indexes: vec![0],
//!     use_market_last_slot_cache: true,
//!     ..Default::default()
//! })?;
//!
//! let ix = place_order_ix(remaining_accounts);
//! let params = BuildParams {
//!     budget: ComputeBudgetPolicy::simulated(10_000),
//!     ..sdk.build_params(wallet.pubkey())
//! };
//!
//! if let BuildResult::Ready(tx) = sdk.build_transaction(vec![ix], &params).await? {
//!     let sent = sdk.send_transaction_for_markets(tx, &[&wallet], &[0], &[]).await?;
//!     println!("{} confirmed at {}", sent.signature, sent.slot);
//! }
//! ```
//!
//! ## ⚠️ Errors
//!
//! Every fallible call returns `anyhow::Result`. Failures raised by the SDK carry an
//! [`SdkError`] that can be recovered with `err.downcast_ref::<SdkError>()`;
//! [`SdkError::is_retryable`] tells transient RPC failures and confirmation timeouts apart
//! from rejected transactions and misuse.
//!
//! ## 🌐 Network Configuration
//!
//! The market lookup table defaults to [`DEVNET_LOOKUP`] or [`MAINNET_LOOKUP`] following
//! `is_devnet`, unless `market_lookup_table` is set.

mod account_loader;
mod account_metas;
mod cache;
mod constants;
mod decoder;
mod error;
mod rpc;
mod sdk;
mod subscriber;
mod tx_builder;
mod tx_sender;
mod types;
mod utils;

#[cfg(test)]
mod test_utils;

pub use sdk::{PerpsSDK, SdkConfig};

pub use account_loader::BatchAccountLoader;
pub use account_metas::{
    LastActiveSlotTable, MarketLookup, MustIncludeMarkets, OracleWritablePredicate,
    RemainingAccountsParams, RemainingAccountsResolver, default_oracle_writable,
};
pub use cache::SlotStampedCache;
pub use decoder::{AccountDecoder, BorshAccountDecoder, DISCRIMINATOR_LEN, encode_account};
pub use error::{DecodeFailure, SdkError, sdk_error};
pub use rpc::{
    AccountNotifier, AccountUpdate, LedgerRpc, PubsubNotifier, SignatureNotifier, SignatureStatus,
    SimulationOutcome, SubscriptionHandle,
};
pub use subscriber::{
    AccountStore, AccountSubscriber, AccountSubscriptionConfig, BatchOutcome,
    PollingAccountSubscriber, TrackedAccounts, WebSocketAccountSubscriber,
};
pub use tx_builder::{
    AssembledTransaction, BuildParams, BuildResult, ComputeBudgetPolicy, TransactionBuilder,
    TransactionVersion, compute_units_from_simulation,
};
pub use tx_sender::{
    ConfirmationStrategy, TimeoutPolicy, TransactionObserver, TxSender, TxSenderConfig,
    TxSigAndSlot,
};
pub use types::*;
pub use utils::{compute_unit_limit, decode_name, exponential_backoff};

pub use constants::{
    DEFAULT_COMPUTE_UNITS, DEVNET_LOOKUP, MAINNET_LOOKUP, MAX_COMPUTE_UNITS, NO_ORACLE,
    PERPS_PROGRAM_ID, PRICE_PRECISION, QUOTE_SPOT_MARKET_INDEX, STATE_ACCOUNT,
    get_perp_market_address, get_spot_market_address, get_user_account_address,
};
