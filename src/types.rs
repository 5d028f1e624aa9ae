use anchor_lang::prelude::*;
use anchor_lang::prelude::borsh;

/// A decoded value together with the ledger slot it was observed at
#[derive(Debug, Clone, PartialEq)]
pub struct DataAndSlot<T> {
    pub data: T,
    pub slot: u64,
}

impl<T> DataAndSlot<T> {
    pub fn new(data: T, slot: u64) -> Self {
        Self { data, slot }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DataAndSlot<U> {
        DataAndSlot {
            data: f(self.data),
            slot: self.slot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MarketType {
    Perp,
    Spot,
}

/// Which record layout an account holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    State,
    PerpMarket,
    SpotMarket,
    Oracle(OracleSource),
    User,
}

/// A decoded program account, stored in the account cache
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedAccount {
    State(StateAccount),
    PerpMarket(PerpMarket),
    SpotMarket(SpotMarket),
    Oracle(OraclePriceData),
    User(UserAccount),
}

impl DecodedAccount {
    pub fn kind(&self) -> AccountKind {
        match self {
            DecodedAccount::State(_) => AccountKind::State,
            DecodedAccount::PerpMarket(_) => AccountKind::PerpMarket,
            DecodedAccount::SpotMarket(_) => AccountKind::SpotMarket,
            DecodedAccount::Oracle(oracle) => AccountKind::Oracle(oracle.source),
            DecodedAccount::User(_) => AccountKind::User,
        }
    }
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OracleSource {
    #[default]
    Pyth,
    Switchboard,
    QuoteAsset,
    Pyth1K,
    Pyth1M,
    PythStableCoin,
    Prelaunch, // price is written by the program itself
    PythPull,
    Pyth1KPull,
    Pyth1MPull,
    PythStableCoinPull,
    SwitchboardOnDemand,
    PythLazer,
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MarketStatus {
    #[default]
    Initialized,
    Active,
    FundingPaused,
    AmmPaused,
    FillPaused,
    WithdrawPaused,
    ReduceOnly,
    Settlement,
    Delisted,
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SpotBalanceType {
    #[default]
    Deposit,
    Borrow,
}

/// Oracle address plus the feed model needed to decode it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OracleInfo {
    pub pubkey: Pubkey,
    pub source: OracleSource,
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Debug, Default, PartialEq)]
pub struct StateAccount {
    pub admin: Pubkey,
    pub whitelist_mint: Pubkey,
    pub discount_mint: Pubkey,
    pub signer: Pubkey,

    pub number_of_authorities: u64,
    pub number_of_sub_accounts: u64,
    pub number_of_markets: u16,
    pub number_of_spot_markets: u16,

    pub min_perp_auction_duration: u8,
    pub default_market_order_time_in_force: u8,
    pub exchange_status: u8, // bitflags, 0 = active

    pub padding: [u8; 9],
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Debug, Default, PartialEq)]
pub struct PerpMarket {
    pub pubkey: Pubkey,
    pub oracle: Pubkey,
    pub oracle_source: OracleSource,

    pub name: [u8; 32],
    pub market_index: u16,
    pub quote_spot_market_index: u16,
    pub status: MarketStatus,

    pub margin_ratio_initial: u32, // 10^4 = 100%
    pub margin_ratio_maintenance: u32,

    pub padding: [u8; 16],
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Debug, Default, PartialEq)]
pub struct SpotMarket {
    pub pubkey: Pubkey,
    pub oracle: Pubkey,
    pub oracle_source: OracleSource,
    pub mint: Pubkey,
    pub vault: Pubkey,

    pub name: [u8; 32],
    pub market_index: u16,
    pub decimals: u32,
    pub status: MarketStatus,

    pub padding: [u8; 16],
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct SpotPosition {
    pub scaled_balance: u64,
    pub open_bids: i64,
    pub open_asks: i64,
    pub cumulative_deposits: i64,
    pub market_index: u16,
    pub balance_type: SpotBalanceType,
    pub open_orders: u8,
    pub padding: [u8; 4],
}

impl SpotPosition {
    /// Slot is free: no balance and no resting orders
    pub fn is_available(&self) -> bool {
        self.scaled_balance == 0 && self.open_orders == 0
    }

    pub fn has_open_bid_or_ask(&self) -> bool {
        self.open_bids != 0 || self.open_asks != 0
    }
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct PerpPosition {
    pub last_cumulative_funding_rate: i64,
    pub base_asset_amount: i64,
    pub quote_asset_amount: i64,
    pub quote_break_even_amount: i64,
    pub quote_entry_amount: i64,
    pub open_bids: i64,
    pub open_asks: i64,
    pub settled_pnl: i64,
    pub lp_shares: u64,
    pub market_index: u16,
    pub open_orders: u8,
    pub padding: [u8; 5],
}

impl PerpPosition {
    pub fn is_available(&self) -> bool {
        self.base_asset_amount == 0
            && self.quote_asset_amount == 0
            && self.open_orders == 0
            && self.lp_shares == 0
    }
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Debug, Default, PartialEq)]
pub struct UserAccount {
    pub authority: Pubkey,
    pub delegate: Pubkey,
    pub name: [u8; 32],

    pub spot_positions: [SpotPosition; 8],
    pub perp_positions: [PerpPosition; 8],

    pub next_order_id: u32,
    pub sub_account_id: u16,
    pub status: u8,
    pub is_margin_trading_enabled: bool,

    pub padding: [u8; 8],
}

impl UserAccount {
    /// Positions that still reference a market
    pub fn active_perp_positions(&self) -> impl Iterator<Item = &PerpPosition> {
        self.perp_positions.iter().filter(|p| !p.is_available())
    }

    pub fn active_spot_positions(&self) -> impl Iterator<Item = &SpotPosition> {
        self.spot_positions.iter().filter(|p| !p.is_available())
    }
}

/// Oracle feed account body as stored on chain
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct OraclePriceFeed {
    pub price: i64,      // PRICE_PRECISION
    pub confidence: u64, // PRICE_PRECISION
    pub slot: u64,       // slot the feed was last updated
    pub has_sufficient_number_of_data_points: bool,
}

/// Price reported by an oracle, tagged with the source it was read as
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OraclePriceData {
    pub price: i64,
    pub confidence: u64,
    pub slot: u64,
    pub has_sufficient_number_of_data_points: bool,
    pub source: OracleSource,
}

impl OraclePriceData {
    pub fn from_feed(feed: OraclePriceFeed, source: OracleSource) -> Self {
        Self {
            price: feed.price,
            confidence: feed.confidence,
            slot: feed.slot,
            has_sufficient_number_of_data_points: feed.has_sufficient_number_of_data_points,
            source,
        }
    }
}
