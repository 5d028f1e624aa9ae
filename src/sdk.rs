use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_rpc_client_api::config::RpcSendTransactionConfig;
use solana_sdk::{
    address_lookup_table::AddressLookupTableAccount,
    commitment_config::{CommitmentConfig, CommitmentLevel},
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    signer::Signer,
};

use crate::{
    account_loader::BatchAccountLoader,
    account_metas::{LastActiveSlotTable, RemainingAccountsParams, RemainingAccountsResolver},
    constants::{DEVNET_LOOKUP, MAINNET_LOOKUP, STATE_ACCOUNT},
    decoder::BorshAccountDecoder,
    error::SdkError,
    rpc::{LedgerRpc, PubsubNotifier, SignatureNotifier},
    subscriber::{
        AccountStore, AccountSubscriber, AccountSubscriptionConfig, PollingAccountSubscriber,
        TrackedAccounts, WebSocketAccountSubscriber,
    },
    tx_builder::{
        AssembledTransaction, BuildParams, BuildResult, ComputeBudgetPolicy, TransactionBuilder,
        TransactionVersion,
    },
    tx_sender::{
        ConfirmationStrategy, TransactionObserver, TxSender, TxSenderConfig, TxSigAndSlot,
    },
    types::{
        DataAndSlot, OracleInfo, OraclePriceData, PerpMarket, SpotMarket, StateAccount, UserAccount,
    },
    utils::decode_name,
};

const FORCE_GET_RETRIES: u32 = 10;

#[derive(Debug, Clone)]
pub struct SdkConfig {
    pub rpc_endpoint: String,
    pub ws_endpoint: String,
    pub commitment: CommitmentLevel,
    pub is_devnet: bool, // picks the default market lookup table
    pub subscription: AccountSubscriptionConfig,
    pub tx_version: TransactionVersion,
    pub budget: ComputeBudgetPolicy,
    pub market_lookup_table: Option<Pubkey>,
    pub perp_market_indexes: Vec<u16>,
    pub spot_market_indexes: Vec<u16>,
    pub oracle_infos: Vec<OracleInfo>,
    /// User accounts to track; the first one starts as the active user
    pub users: Vec<Pubkey>,
    /// Window in which single account loads are coalesced
    pub batch_delay: Duration,
    pub confirmation: TxSenderConfig,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            rpc_endpoint: "http://127.0.0.1:8899".to_string(),
            ws_endpoint: "ws://127.0.0.1:8900".to_string(),
            commitment: CommitmentLevel::Confirmed,
            is_devnet: false,
            subscription: AccountSubscriptionConfig::default(),
            tx_version: TransactionVersion::default(),
            budget: ComputeBudgetPolicy::default(),
            market_lookup_table: None,
            perp_market_indexes: Vec::new(),
            spot_market_indexes: Vec::new(),
            oracle_infos: Vec::new(),
            users: Vec::new(),
            batch_delay: Duration::from_millis(10),
            confirmation: TxSenderConfig::default(),
        }
    }
}

pub struct PerpsSDK {
    subscriber: Box<dyn AccountSubscriber>,
    resolver: RwLock<RemainingAccountsResolver>,
    last_active_slots: Mutex<LastActiveSlotTable>,
    active_user: RwLock<Option<Pubkey>>,
    builder: TransactionBuilder,
    sender: TxSender,
    tx_version: TransactionVersion,
    budget: ComputeBudgetPolicy,
}

impl PerpsSDK {
    /// Create a new Perps SDK instance connected to `config.rpc_endpoint`.
    ///
    /// A websocket connection is opened only when the subscription or the
    /// confirmation strategy needs one.
    pub async fn new(config: SdkConfig) -> Result<Self> {
        let commitment = CommitmentConfig {
            commitment: config.commitment,
        };
        let rpc: Arc<dyn LedgerRpc> = Arc::new(RpcClient::new_with_commitment(
            config.rpc_endpoint.clone(),
            commitment,
        ));

        let tracked = TrackedAccounts::for_markets(
            &config.perp_market_indexes,
            &config.spot_market_indexes,
            &config.oracle_infos,
        )
        .with_users(&config.users);
        let store = AccountStore::new(tracked, Arc::new(BorshAccountDecoder));
        let loader = BatchAccountLoader::new(rpc.clone(), config.batch_delay);

        let subscriber: Box<dyn AccountSubscriber> = match &config.subscription {
            AccountSubscriptionConfig::Polling { frequency } => {
                Box::new(PollingAccountSubscriber::new(store, loader, *frequency))
            }
            AccountSubscriptionConfig::WebSocket {
                resub_timeout,
                commitment,
            } => {
                let notifier = PubsubNotifier::connect(&config.ws_endpoint, *commitment)
                    .await
                    .context("account subscription needs a websocket connection")?;
                Box::new(WebSocketAccountSubscriber::new(
                    store,
                    loader,
                    Arc::new(notifier),
                    *resub_timeout,
                ))
            }
        };

        let signature_notifier: Option<Arc<dyn SignatureNotifier>> =
            match config.confirmation.strategy {
                ConfirmationStrategy::Polling => None,
                ConfirmationStrategy::WebSocket | ConfirmationStrategy::Combo => {
                    let notifier: Arc<dyn SignatureNotifier> = Arc::new(
                        PubsubNotifier::connect(&config.ws_endpoint, commitment)
                            .await
                            .context("signature confirmation needs a websocket connection")?,
                    );
                    Some(notifier)
                }
            };

        Ok(Self::from_parts(rpc, subscriber, signature_notifier, &config))
    }

    /// Assemble an instance from already built collaborators
    pub fn from_parts(
        rpc: Arc<dyn LedgerRpc>,
        subscriber: Box<dyn AccountSubscriber>,
        signature_notifier: Option<Arc<dyn SignatureNotifier>>,
        config: &SdkConfig,
    ) -> Self {
        let market_lookup_table = config.market_lookup_table.unwrap_or(if config.is_devnet {
            DEVNET_LOOKUP
        } else {
            MAINNET_LOOKUP
        });

        Self {
            subscriber,
            resolver: RwLock::new(RemainingAccountsResolver::default()),
            last_active_slots: Mutex::new(LastActiveSlotTable::default()),
            active_user: RwLock::new(config.users.first().copied()),
            builder: TransactionBuilder::new(rpc.clone(), market_lookup_table),
            sender: TxSender::new(rpc, signature_notifier, config.confirmation.clone()),
            tx_version: config.tx_version,
            budget: config.budget.clone(),
        }
    }

    /// Hooks called around signing and sending
    pub fn with_observer(mut self, observer: Arc<dyn TransactionObserver>) -> Self {
        self.sender = self.sender.with_observer(observer);
        self
    }

    /// Populate the cache and keep it fresh. Returns `false` when the initial load could
    /// not complete; the caller decides whether to continue with a partial cache.
    pub async fn subscribe(&self) -> bool {
        let subscribed = self.subscriber.subscribe().await;
        if subscribed {
            for market in self.subscriber.get_perp_markets() {
                debug!(
                    "perp market {} {} at slot {}",
                    market.data.market_index,
                    decode_name(&market.data.name),
                    market.slot
                );
            }
            info!("subscribed");
        }
        subscribed
    }

    /// Refresh every tracked account once
    pub async fn fetch_accounts(&self) -> Result<()> {
        self.subscriber.fetch().await
    }

    pub async fn unsubscribe(&self) {
        self.subscriber.unsubscribe().await;
        info!("unsubscribed");
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscriber.is_subscribed()
    }

    pub fn get_state_account(&self) -> Option<DataAndSlot<StateAccount>> {
        self.subscriber.get_state_account()
    }

    pub fn get_perp_market_account(&self, market_index: u16) -> Option<DataAndSlot<PerpMarket>> {
        self.subscriber.get_perp_market(market_index)
    }

    pub fn get_spot_market_account(&self, market_index: u16) -> Option<DataAndSlot<SpotMarket>> {
        self.subscriber.get_spot_market(market_index)
    }

    pub fn get_perp_market_accounts(&self) -> Vec<DataAndSlot<PerpMarket>> {
        self.subscriber.get_perp_markets()
    }

    pub fn get_spot_market_accounts(&self) -> Vec<DataAndSlot<SpotMarket>> {
        self.subscriber.get_spot_markets()
    }

    pub fn get_oracle_price_data_for_perp_market(
        &self,
        market_index: u16,
    ) -> Option<DataAndSlot<OraclePriceData>> {
        self.subscriber.get_oracle_for_perp_market(market_index)
    }

    pub fn get_oracle_price_data_for_spot_market(
        &self,
        market_index: u16,
    ) -> Option<DataAndSlot<OraclePriceData>> {
        self.subscriber.get_oracle_for_spot_market(market_index)
    }

    pub fn get_user_account(&self, pubkey: &Pubkey) -> Option<DataAndSlot<UserAccount>> {
        self.subscriber.get_user(pubkey)
    }

    /// Snapshot of the active user, if one is set and loaded
    pub fn get_active_user_account(&self) -> Option<DataAndSlot<UserAccount>> {
        self.active_user()
            .and_then(|pubkey| self.subscriber.get_user(&pubkey))
    }

    /// Fetch until the perp market is cached, tracking it first if needed
    ///
    /// # Arguments
    /// * `market_index` - The perp market index
    ///
    /// # Returns
    /// The market record, or `PerpMarketNotLoaded` after the retries run out
    pub async fn force_get_perp_market(&self, market_index: u16) -> Result<PerpMarket> {
        if !self
            .subscriber
            .store()
            .tracked()
            .perp_markets
            .contains_key(&market_index)
        {
            self.subscriber
                .extend(TrackedAccounts::for_markets(&[market_index], &[], &[]))
                .await?;
        }

        for attempt in 1..=FORCE_GET_RETRIES {
            if let Some(market) = self.subscriber.get_perp_market(market_index) {
                return Ok(market.data);
            }
            debug!(
                "perp market {} not cached, fetching ({}/{})",
                market_index, attempt, FORCE_GET_RETRIES
            );
            if let Err(err) = self.subscriber.fetch().await {
                warn!("fetch for perp market {} failed: {:#}", market_index, err);
            }
        }

        self.subscriber
            .get_perp_market(market_index)
            .map(|market| market.data)
            .ok_or_else(|| SdkError::PerpMarketNotLoaded(market_index).into())
    }

    pub async fn force_get_state_account(&self) -> Result<StateAccount> {
        self.subscriber.fetch().await?;
        self.subscriber
            .get_state_account()
            .map(|state| state.data)
            .ok_or_else(|| SdkError::AccountNotFound(*STATE_ACCOUNT).into())
    }

    pub async fn force_get_user_account(&self, pubkey: &Pubkey) -> Result<UserAccount> {
        if !self.subscriber.store().tracked().users.contains(pubkey) {
            self.add_user(*pubkey).await?;
        } else {
            self.subscriber.fetch().await?;
        }
        self.subscriber
            .get_user(pubkey)
            .map(|user| user.data)
            .ok_or_else(|| SdkError::AccountNotFound(*pubkey).into())
    }

    /// Force markets into every resolved account list from now on
    pub fn must_include_markets_in_ix(&self, perp_market_indexes: &[u16], spot_market_indexes: &[u16]) {
        self.resolver
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .must_include_markets(perp_market_indexes, spot_market_indexes);
    }

    /// Start tracking a user account. The first user added becomes the active one.
    pub async fn add_user(&self, pubkey: Pubkey) -> Result<()> {
        self.subscriber
            .extend(TrackedAccounts::default().with_users(&[pubkey]))
            .await?;

        let mut active_user = self.active_user.write().unwrap_or_else(PoisonError::into_inner);
        if active_user.is_none() {
            *active_user = Some(pubkey);
        }
        Ok(())
    }

    /// The active user's snapshot slot drives last-active-slot eviction
    pub async fn switch_active_user(&self, pubkey: Pubkey) -> Result<()> {
        if !self.subscriber.store().tracked().users.contains(&pubkey) {
            self.add_user(pubkey).await?;
        }
        *self.active_user.write().unwrap_or_else(PoisonError::into_inner) = Some(pubkey);
        info!("active user is now {}", pubkey);
        Ok(())
    }

    pub fn active_user(&self) -> Option<Pubkey> {
        *self.active_user.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Oracles, spot markets and perp markets an instruction must carry, in that order
    pub fn get_remaining_accounts(&self, params: &RemainingAccountsParams) -> Result<Vec<AccountMeta>> {
        let user_slot = self.get_active_user_account().map(|user| user.slot);
        let resolver = self.resolver.read().unwrap_or_else(PoisonError::into_inner);
        let mut last_active_slots = self
            .last_active_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        resolver.resolve(
            params,
            self.subscriber.store(),
            &mut last_active_slots,
            user_slot,
        )
    }

    pub fn last_active_slots(&self) -> LastActiveSlotTable {
        self.last_active_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Build parameters from the configured format and compute budget
    pub fn build_params(&self, payer: Pubkey) -> BuildParams {
        BuildParams {
            payer,
            version: self.tx_version,
            budget: self.budget.clone(),
            ..Default::default()
        }
    }

    pub async fn build_transaction(
        &self,
        instructions: Vec<Instruction>,
        params: &BuildParams,
    ) -> Result<BuildResult> {
        self.builder.build(instructions, params).await
    }

    pub async fn build_bulk(
        &self,
        instruction_sets: Vec<Vec<Instruction>>,
        params: &BuildParams,
    ) -> Result<Vec<BuildResult>> {
        self.builder.build_bulk(instruction_sets, params).await
    }

    pub async fn build_map(
        &self,
        instruction_sets: BTreeMap<String, Vec<Instruction>>,
        params: &BuildParams,
    ) -> Result<BTreeMap<String, BuildResult>> {
        self.builder.build_map(instruction_sets, params).await
    }

    pub async fn fetch_market_lookup_table(&self) -> Result<AddressLookupTableAccount> {
        self.builder.fetch_market_lookup_table().await
    }

    pub async fn send_transaction(
        &self,
        tx: AssembledTransaction,
        signers: &[&dyn Signer],
        config: Option<RpcSendTransactionConfig>,
        pre_signed: bool,
    ) -> Result<TxSigAndSlot> {
        self.sender.send(tx, signers, config, pre_signed).await
    }

    pub async fn send_signed_transaction(
        &self,
        tx: &AssembledTransaction,
        config: Option<RpcSendTransactionConfig>,
    ) -> Result<TxSigAndSlot> {
        self.sender.send_signed(tx, config).await
    }

    /// Sign every transaction of a map built by `build_map`
    pub fn sign_transaction_map(
        &self,
        transactions: BTreeMap<String, AssembledTransaction>,
        signers: &[&dyn Signer],
    ) -> Result<BTreeMap<String, AssembledTransaction>> {
        transactions
            .into_iter()
            .map(|(name, tx)| -> Result<(String, AssembledTransaction)> {
                let signed = self
                    .sender
                    .sign(tx, signers)
                    .with_context(|| format!("failed to sign {}", name))?;
                Ok((name, signed))
            })
            .collect()
    }

    /// Send a transaction and, once it is confirmed, stamp the markets it touched with
    /// the confirmed slot. A failed send leaves the last-active-slot table unchanged.
    pub async fn send_transaction_for_markets(
        &self,
        tx: AssembledTransaction,
        signers: &[&dyn Signer],
        perp_market_indexes: &[u16],
        spot_market_indexes: &[u16],
    ) -> Result<TxSigAndSlot> {
        let sent = self.sender.send(tx, signers, None, false).await?;

        let mut last_active_slots = self
            .last_active_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for index in perp_market_indexes {
            last_active_slots.record_perp(*index, sent.slot);
        }
        for index in spot_market_indexes {
            last_active_slots.record_spot(*index, sent.slot);
        }

        Ok(sent)
    }

    /// Confirmation timeouts seen by the dispatcher
    pub fn timeout_count(&self) -> u64 {
        self.sender.timeout_count()
    }
}
