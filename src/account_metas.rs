use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use anchor_lang::prelude::AccountMeta;
use anyhow::Result;
use solana_sdk::pubkey::Pubkey;

use crate::{
    constants::{NO_ORACLE, QUOTE_SPOT_MARKET_INDEX},
    error::SdkError,
    types::{OracleSource, PerpMarket, SpotMarket, UserAccount},
};

/// Read access to decoded market records
pub trait MarketLookup {
    fn perp_market(&self, market_index: u16) -> Option<PerpMarket>;
    fn spot_market(&self, market_index: u16) -> Option<SpotMarket>;
}

/// Decides whether an instruction writing to `market` also writes its oracle
pub type OracleWritablePredicate = Arc<dyn Fn(&PerpMarket) -> bool + Send + Sync>;

/// Prelaunch markets keep their price in a program-owned oracle
pub fn default_oracle_writable() -> OracleWritablePredicate {
    Arc::new(|market: &PerpMarket| market.oracle_source == OracleSource::Prelaunch)
}

/// Inputs of one remaining-accounts computation
#[derive(Debug, Clone, Default)]
pub struct RemainingAccountsParams {
    /// Snapshots whose open positions must be visible to the program
    pub user_accounts: Vec<UserAccount>,
    pub writable_perp_market_indexes: Vec<u16>,
    pub writable_spot_market_indexes: Vec<u16>,
    pub readable_perp_market_indexes: Vec<u16>,
    pub readable_spot_market_indexes: Vec<u16>,
    /// Fold in markets recently touched by confirmed transactions
    pub use_market_last_slot_cache: bool,
    /// The instruction creates the user, so no snapshot exists yet
    pub user_account_not_available: bool,
}

/// Slot at which each market last mattered to the active user
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LastActiveSlotTable {
    perp: BTreeMap<u16, u64>,
    spot: BTreeMap<u16, u64>,
}

impl LastActiveSlotTable {
    pub fn record_perp(&mut self, market_index: u16, slot: u64) {
        let entry = self.perp.entry(market_index).or_default();
        *entry = (*entry).max(slot);
    }

    pub fn record_spot(&mut self, market_index: u16, slot: u64) {
        let entry = self.spot.entry(market_index).or_default();
        *entry = (*entry).max(slot);
    }

    pub fn perp_slot(&self, market_index: u16) -> Option<u64> {
        self.perp.get(&market_index).copied()
    }

    pub fn spot_slot(&self, market_index: u16) -> Option<u64> {
        self.spot.get(&market_index).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.perp.is_empty() && self.spot.is_empty()
    }

    pub fn clear(&mut self) {
        self.perp.clear();
        self.spot.clear();
    }

    /// Removes entries the user snapshot has caught up with and returns the rest
    fn retain_newer_than(&mut self, user_slot: u64) -> (Vec<u16>, Vec<u16>) {
        self.perp.retain(|_, slot| *slot > user_slot);
        self.spot.retain(|_, slot| *slot > user_slot);
        (
            self.perp.keys().copied().collect(),
            self.spot.keys().copied().collect(),
        )
    }
}

/// Markets forced into every instruction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MustIncludeMarkets {
    pub perp: Vec<u16>,
    pub spot: Vec<u16>,
}

impl MustIncludeMarkets {
    pub fn add(&mut self, perp_market_indexes: &[u16], spot_market_indexes: &[u16]) {
        for index in perp_market_indexes {
            if !self.perp.contains(index) {
                self.perp.push(*index);
            }
        }
        for index in spot_market_indexes {
            if !self.spot.contains(index) {
                self.spot.push(*index);
            }
        }
    }
}

/// Insertion ordered, de-duplicated account list. A writable request upgrades an
/// earlier read-only entry in place.
#[derive(Debug, Default)]
struct MetaBucket {
    metas: Vec<AccountMeta>,
    positions: HashMap<Pubkey, usize>,
}

impl MetaBucket {
    fn add(&mut self, pubkey: Pubkey, is_writable: bool) {
        match self.positions.get(&pubkey) {
            Some(position) => {
                if is_writable {
                    self.metas[*position].is_writable = true;
                }
            }
            None => {
                self.positions.insert(pubkey, self.metas.len());
                self.metas.push(if is_writable {
                    AccountMeta::new(pubkey, false)
                } else {
                    AccountMeta::new_readonly(pubkey, false)
                });
            }
        }
    }
}

/// The three buckets the program expects, filled in resolution order
#[derive(Debug, Default)]
struct RemainingAccountMaps {
    oracles: MetaBucket,
    spot_markets: MetaBucket,
    perp_markets: MetaBucket,
}

impl From<RemainingAccountMaps> for Vec<AccountMeta> {
    fn from(maps: RemainingAccountMaps) -> Self {
        // the program locates accounts by offset: oracles, then spot, then perp
        let mut metas = maps.oracles.metas;
        metas.extend(maps.spot_markets.metas);
        metas.extend(maps.perp_markets.metas);
        metas
    }
}

/// Computes the auxiliary accounts an instruction needs: oracles and markets implied
/// by the user's open positions, recently touched markets, and explicit requests.
#[derive(Clone)]
pub struct RemainingAccountsResolver {
    must_include: MustIncludeMarkets,
    is_oracle_writable: OracleWritablePredicate,
}

impl fmt::Debug for RemainingAccountsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemainingAccountsResolver")
            .field("must_include", &self.must_include)
            .finish_non_exhaustive()
    }
}

impl Default for RemainingAccountsResolver {
    fn default() -> Self {
        Self::new(default_oracle_writable())
    }
}

impl RemainingAccountsResolver {
    pub fn new(is_oracle_writable: OracleWritablePredicate) -> Self {
        Self {
            must_include: MustIncludeMarkets::default(),
            is_oracle_writable,
        }
    }

    pub fn must_include(&self) -> &MustIncludeMarkets {
        &self.must_include
    }

    pub fn must_include_markets(&mut self, perp_market_indexes: &[u16], spot_market_indexes: &[u16]) {
        self.must_include.add(perp_market_indexes, spot_market_indexes);
    }

    /// Resolves the remaining accounts for one instruction.
    ///
    /// # Arguments
    /// * `params` - user snapshots and requested markets
    /// * `markets` - current market records
    /// * `last_active_slots` - entries older than `user_slot` are evicted
    /// * `user_slot` - slot of the active user's snapshot
    ///
    /// # Returns
    /// Oracle metas, then spot market metas, then perp market metas. The same inputs
    /// always give the same list.
    pub fn resolve(
        &self,
        params: &RemainingAccountsParams,
        markets: &dyn MarketLookup,
        last_active_slots: &mut LastActiveSlotTable,
        user_slot: Option<u64>,
    ) -> Result<Vec<AccountMeta>> {
        if params.user_accounts.is_empty() && !params.user_account_not_available {
            return Err(SdkError::MissingUserAccount.into());
        }

        let mut maps = RemainingAccountMaps::default();

        for user in &params.user_accounts {
            for position in user.active_spot_positions() {
                self.add_spot_market(&mut maps, markets, position.market_index, false)?;
                if position.has_open_bid_or_ask() {
                    self.add_spot_market(&mut maps, markets, QUOTE_SPOT_MARKET_INDEX, false)?;
                }
            }
            for position in user.active_perp_positions() {
                self.add_perp_market(&mut maps, markets, position.market_index, false)?;
            }
        }

        if params.use_market_last_slot_cache {
            // a user being created has no snapshot yet, so every recorded entry is newer
            let user_slot = if params.user_account_not_available {
                0
            } else {
                user_slot.ok_or(SdkError::MissingUserAccount)?
            };
            let (perp, spot) = last_active_slots.retain_newer_than(user_slot);
            for index in perp {
                self.add_perp_market(&mut maps, markets, index, false)?;
            }
            for index in spot {
                self.add_spot_market(&mut maps, markets, index, false)?;
            }
        }

        for index in &params.readable_perp_market_indexes {
            self.add_perp_market(&mut maps, markets, *index, false)?;
        }
        for index in &self.must_include.perp {
            self.add_perp_market(&mut maps, markets, *index, false)?;
        }
        for index in &params.readable_spot_market_indexes {
            self.add_spot_market(&mut maps, markets, *index, false)?;
        }
        for index in &self.must_include.spot {
            self.add_spot_market(&mut maps, markets, *index, false)?;
        }
        for index in &params.writable_perp_market_indexes {
            self.add_perp_market(&mut maps, markets, *index, true)?;
        }
        for index in &params.writable_spot_market_indexes {
            self.add_spot_market(&mut maps, markets, *index, true)?;
        }

        Ok(maps.into())
    }

    fn add_perp_market(
        &self,
        maps: &mut RemainingAccountMaps,
        markets: &dyn MarketLookup,
        market_index: u16,
        is_writable: bool,
    ) -> Result<()> {
        let market = markets
            .perp_market(market_index)
            .ok_or(SdkError::PerpMarketNotLoaded(market_index))?;

        maps.perp_markets.add(market.pubkey, is_writable);
        if market.oracle != NO_ORACLE {
            let oracle_writable = is_writable && (self.is_oracle_writable)(&market);
            maps.oracles.add(market.oracle, oracle_writable);
        }

        self.add_spot_market(maps, markets, market.quote_spot_market_index, false)
    }

    fn add_spot_market(
        &self,
        maps: &mut RemainingAccountMaps,
        markets: &dyn MarketLookup,
        market_index: u16,
        is_writable: bool,
    ) -> Result<()> {
        let market = markets
            .spot_market(market_index)
            .ok_or(SdkError::SpotMarketNotLoaded(market_index))?;

        maps.spot_markets.add(market.pubkey, is_writable);
        if market.oracle != NO_ORACLE {
            maps.oracles.add(market.oracle, false);
        }
        Ok(())
    }
}
