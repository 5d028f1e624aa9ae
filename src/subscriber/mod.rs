pub mod polling;
pub mod websocket;

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use log::warn;
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};

pub use polling::PollingAccountSubscriber;
pub use websocket::WebSocketAccountSubscriber;

use crate::{
    account_metas::MarketLookup,
    cache::SlotStampedCache,
    constants::{NO_ORACLE, STATE_ACCOUNT, get_perp_market_address, get_spot_market_address},
    decoder::AccountDecoder,
    error::{DecodeFailure, SdkError},
    types::{
        AccountKind, DataAndSlot, DecodedAccount, OracleInfo, OraclePriceData, OracleSource,
        PerpMarket, SpotMarket, StateAccount, UserAccount,
    },
};

/// How the account cache is kept warm
#[derive(Debug, Clone, PartialEq)]
pub enum AccountSubscriptionConfig {
    Polling {
        frequency: Duration,
    },
    WebSocket {
        /// Silence after which a subscription is torn down and reopened
        resub_timeout: Duration,
        commitment: CommitmentConfig,
    },
}

impl Default for AccountSubscriptionConfig {
    fn default() -> Self {
        AccountSubscriptionConfig::Polling {
            frequency: Duration::from_millis(1_000),
        }
    }
}

/// Accounts a subscriber keeps in its cache
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackedAccounts {
    pub state: Option<Pubkey>,
    pub perp_markets: BTreeMap<u16, Pubkey>,
    pub spot_markets: BTreeMap<u16, Pubkey>,
    pub oracles: BTreeMap<Pubkey, OracleSource>,
    pub users: Vec<Pubkey>,
}

impl TrackedAccounts {
    /// Program state plus markets and oracles at their program addresses
    pub fn for_markets(perp_indexes: &[u16], spot_indexes: &[u16], oracles: &[OracleInfo]) -> Self {
        Self {
            state: Some(*STATE_ACCOUNT),
            perp_markets: perp_indexes
                .iter()
                .map(|i| (*i, get_perp_market_address(*i)))
                .collect(),
            spot_markets: spot_indexes
                .iter()
                .map(|i| (*i, get_spot_market_address(*i)))
                .collect(),
            oracles: oracles.iter().map(|o| (o.pubkey, o.source)).collect(),
            users: Vec::new(),
        }
    }

    pub fn with_users(mut self, users: &[Pubkey]) -> Self {
        for user in users {
            if !self.users.contains(user) {
                self.users.push(*user);
            }
        }
        self
    }

    /// Every tracked account with the layout it holds, in a stable order
    pub fn targets(&self) -> Vec<(Pubkey, AccountKind)> {
        let mut targets = Vec::new();
        if let Some(state) = self.state {
            targets.push((state, AccountKind::State));
        }
        targets.extend(self.perp_markets.values().map(|p| (*p, AccountKind::PerpMarket)));
        targets.extend(self.spot_markets.values().map(|p| (*p, AccountKind::SpotMarket)));
        targets.extend(
            self.oracles
                .iter()
                .map(|(p, source)| (*p, AccountKind::Oracle(*source))),
        );
        targets.extend(self.users.iter().map(|p| (*p, AccountKind::User)));
        targets
    }

    /// Adds what is not tracked yet and returns only the additions
    pub fn merge(&mut self, other: &TrackedAccounts) -> Vec<(Pubkey, AccountKind)> {
        let mut added = Vec::new();

        if self.state.is_none() {
            if let Some(state) = other.state {
                self.state = Some(state);
                added.push((state, AccountKind::State));
            }
        }
        for (index, pubkey) in &other.perp_markets {
            if !self.perp_markets.contains_key(index) {
                self.perp_markets.insert(*index, *pubkey);
                added.push((*pubkey, AccountKind::PerpMarket));
            }
        }
        for (index, pubkey) in &other.spot_markets {
            if !self.spot_markets.contains_key(index) {
                self.spot_markets.insert(*index, *pubkey);
                added.push((*pubkey, AccountKind::SpotMarket));
            }
        }
        for (pubkey, source) in &other.oracles {
            if *pubkey != NO_ORACLE && !self.oracles.contains_key(pubkey) {
                self.oracles.insert(*pubkey, *source);
                added.push((*pubkey, AccountKind::Oracle(*source)));
            }
        }
        for user in &other.users {
            if !self.users.contains(user) {
                self.users.push(*user);
                added.push((*user, AccountKind::User));
            }
        }

        added
    }
}

/// Outcome of decoding and applying one batch of raw accounts
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub applied: usize,
    pub missing: Vec<Pubkey>,
    pub failures: Vec<DecodeFailure>,
    /// Oracles referenced by freshly decoded markets that are not tracked yet
    pub discovered_oracles: Vec<OracleInfo>,
}

impl BatchOutcome {
    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(SdkError::Decode(self.failures).into())
        }
    }
}

/// Decoded account cache plus the set of accounts it tracks.
///
/// Shared by both subscriber variants; a polling tick and a push notification may
/// write concurrently and the slot rule of `SlotStampedCache` keeps the result sane.
pub struct AccountStore {
    cache: SlotStampedCache<Pubkey, DecodedAccount>,
    tracked: RwLock<TrackedAccounts>,
    decoder: Arc<dyn AccountDecoder>,
}

impl AccountStore {
    pub fn new(tracked: TrackedAccounts, decoder: Arc<dyn AccountDecoder>) -> Self {
        Self {
            cache: SlotStampedCache::new(),
            tracked: RwLock::new(tracked),
            decoder,
        }
    }

    pub fn tracked(&self) -> TrackedAccounts {
        self.tracked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn track(&self, accounts: &TrackedAccounts) -> Vec<(Pubkey, AccountKind)> {
        self.tracked
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(accounts)
    }

    pub fn targets(&self) -> Vec<(Pubkey, AccountKind)> {
        self.tracked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .targets()
    }

    /// Decodes a batch read at `slot` and applies everything that decoded in one write.
    /// Undecodable accounts keep their cached value.
    pub fn apply_batch(
        &self,
        accounts: Vec<(Pubkey, AccountKind, Option<Vec<u8>>)>,
        slot: u64,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut decoded = Vec::with_capacity(accounts.len());

        for (pubkey, kind, data) in accounts {
            let data = match (data, kind) {
                (Some(data), _) => data,
                // priced without a feed account
                (None, AccountKind::Oracle(OracleSource::QuoteAsset)) => Vec::new(),
                (None, _) => {
                    outcome.missing.push(pubkey);
                    continue;
                }
            };
            match self.decoder.decode(kind, &data) {
                Ok(account) => decoded.push((pubkey, account)),
                Err(err) => {
                    warn!("failed to decode {:?} account {}: {}", kind, pubkey, err);
                    outcome.failures.push(DecodeFailure {
                        pubkey,
                        kind,
                        reason: err.to_string(),
                    });
                }
            }
        }

        outcome.discovered_oracles = self.untracked_oracles(&decoded);
        outcome.applied = self.cache.put_batch(decoded, slot);
        outcome
    }

    fn untracked_oracles(&self, decoded: &[(Pubkey, DecodedAccount)]) -> Vec<OracleInfo> {
        let tracked = self.tracked.read().unwrap_or_else(PoisonError::into_inner);
        let mut discovered: Vec<OracleInfo> = Vec::new();

        for (_, account) in decoded {
            let oracle = match account {
                DecodedAccount::PerpMarket(m) => OracleInfo {
                    pubkey: m.oracle,
                    source: m.oracle_source,
                },
                DecodedAccount::SpotMarket(m) => OracleInfo {
                    pubkey: m.oracle,
                    source: m.oracle_source,
                },
                _ => continue,
            };
            if oracle.pubkey != NO_ORACLE
                && !tracked.oracles.contains_key(&oracle.pubkey)
                && !discovered.contains(&oracle)
            {
                discovered.push(oracle);
            }
        }

        discovered
    }

    pub fn oracles_to_track(oracles: &[OracleInfo]) -> TrackedAccounts {
        TrackedAccounts {
            oracles: oracles.iter().map(|o| (o.pubkey, o.source)).collect(),
            ..Default::default()
        }
    }

    /// State account and every tracked market are cached
    pub fn has_required_accounts(&self) -> bool {
        let tracked = self.tracked();
        let state_ready = tracked.state.is_none_or(|state| self.cache.contains(&state));
        state_ready
            && tracked.perp_markets.values().all(|p| self.cache.contains(p))
            && tracked.spot_markets.values().all(|p| self.cache.contains(p))
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn cache(&self) -> &SlotStampedCache<Pubkey, DecodedAccount> {
        &self.cache
    }

    pub fn state(&self) -> Option<DataAndSlot<StateAccount>> {
        let state = self.tracked().state?;
        match self.cache.get(&state)? {
            DataAndSlot {
                data: DecodedAccount::State(account),
                slot,
            } => Some(DataAndSlot::new(account, slot)),
            _ => None,
        }
    }

    pub fn perp_market(&self, market_index: u16) -> Option<DataAndSlot<PerpMarket>> {
        let pubkey = *self.tracked().perp_markets.get(&market_index)?;
        self.perp_market_at(&pubkey)
    }

    fn perp_market_at(&self, pubkey: &Pubkey) -> Option<DataAndSlot<PerpMarket>> {
        match self.cache.get(pubkey)? {
            DataAndSlot {
                data: DecodedAccount::PerpMarket(market),
                slot,
            } => Some(DataAndSlot::new(market, slot)),
            _ => None,
        }
    }

    pub fn spot_market(&self, market_index: u16) -> Option<DataAndSlot<SpotMarket>> {
        let pubkey = *self.tracked().spot_markets.get(&market_index)?;
        self.spot_market_at(&pubkey)
    }

    fn spot_market_at(&self, pubkey: &Pubkey) -> Option<DataAndSlot<SpotMarket>> {
        match self.cache.get(pubkey)? {
            DataAndSlot {
                data: DecodedAccount::SpotMarket(market),
                slot,
            } => Some(DataAndSlot::new(market, slot)),
            _ => None,
        }
    }

    pub fn perp_markets(&self) -> Vec<DataAndSlot<PerpMarket>> {
        self.tracked()
            .perp_markets
            .values()
            .filter_map(|p| self.perp_market_at(p))
            .collect()
    }

    pub fn spot_markets(&self) -> Vec<DataAndSlot<SpotMarket>> {
        self.tracked()
            .spot_markets
            .values()
            .filter_map(|p| self.spot_market_at(p))
            .collect()
    }

    pub fn oracle(&self, pubkey: &Pubkey) -> Option<DataAndSlot<OraclePriceData>> {
        match self.cache.get(pubkey)? {
            DataAndSlot {
                data: DecodedAccount::Oracle(price),
                slot,
            } => Some(DataAndSlot::new(price, slot)),
            _ => None,
        }
    }

    pub fn user(&self, pubkey: &Pubkey) -> Option<DataAndSlot<UserAccount>> {
        match self.cache.get(pubkey)? {
            DataAndSlot {
                data: DecodedAccount::User(user),
                slot,
            } => Some(DataAndSlot::new(user, slot)),
            _ => None,
        }
    }
}

impl MarketLookup for AccountStore {
    fn perp_market(&self, market_index: u16) -> Option<PerpMarket> {
        AccountStore::perp_market(self, market_index).map(|m| m.data)
    }

    fn spot_market(&self, market_index: u16) -> Option<SpotMarket> {
        AccountStore::spot_market(self, market_index).map(|m| m.data)
    }
}

/// Keeps program accounts cached, by polling or by push notifications.
///
/// Callers never branch on the variant; pick one at construction time.
#[async_trait]
pub trait AccountSubscriber: Send + Sync {
    /// Populates the cache and starts keeping it fresh. Returns `false` if the state
    /// account or a tracked market could not be loaded.
    async fn subscribe(&self) -> bool;

    /// Refreshes every tracked account once. Transient failures are returned, not retried.
    async fn fetch(&self) -> Result<()>;

    async fn unsubscribe(&self);

    /// Starts tracking additional accounts. Already tracked accounts are left alone.
    async fn extend(&self, accounts: TrackedAccounts) -> Result<()>;

    fn is_subscribed(&self) -> bool;

    fn store(&self) -> &AccountStore;

    fn get_state_account(&self) -> Option<DataAndSlot<StateAccount>> {
        self.store().state()
    }

    fn get_perp_market(&self, market_index: u16) -> Option<DataAndSlot<PerpMarket>> {
        self.store().perp_market(market_index)
    }

    fn get_spot_market(&self, market_index: u16) -> Option<DataAndSlot<SpotMarket>> {
        self.store().spot_market(market_index)
    }

    fn get_perp_markets(&self) -> Vec<DataAndSlot<PerpMarket>> {
        self.store().perp_markets()
    }

    fn get_spot_markets(&self) -> Vec<DataAndSlot<SpotMarket>> {
        self.store().spot_markets()
    }

    fn get_oracle(&self, pubkey: &Pubkey) -> Option<DataAndSlot<OraclePriceData>> {
        self.store().oracle(pubkey)
    }

    fn get_oracle_for_perp_market(&self, market_index: u16) -> Option<DataAndSlot<OraclePriceData>> {
        let market = self.get_perp_market(market_index)?;
        self.get_oracle(&market.data.oracle)
    }

    fn get_oracle_for_spot_market(&self, market_index: u16) -> Option<DataAndSlot<OraclePriceData>> {
        let market = self.get_spot_market(market_index)?;
        self.get_oracle(&market.data.oracle)
    }

    fn get_user(&self, pubkey: &Pubkey) -> Option<DataAndSlot<UserAccount>> {
        self.store().user(pubkey)
    }
}
