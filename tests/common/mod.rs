use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use perps_sdk_on_chain::{
    AccountStore, BatchAccountLoader, BorshAccountDecoder, DataAndSlot, LedgerRpc, OracleSource,
    PerpMarket, PerpsSDK, PollingAccountSubscriber, QUOTE_SPOT_MARKET_INDEX, SdkConfig, SdkError,
    SignatureStatus, SimulationOutcome, SpotMarket, StateAccount, TrackedAccounts, UserAccount,
    encode_account, get_perp_market_address, get_spot_market_address, NO_ORACLE, STATE_ACCOUNT,
};
use solana_rpc_client_api::config::RpcSendTransactionConfig;
use solana_sdk::{
    address_lookup_table::AddressLookupTableAccount, hash::Hash, pubkey::Pubkey,
    signature::Signature, transaction::VersionedTransaction,
};

/// Ledger held in memory; every read reports the current slot
pub struct MemoryLedger {
    slot: AtomicU64,
    accounts: Mutex<HashMap<Pubkey, Vec<u8>>>,
    lookup_tables: Mutex<HashMap<Pubkey, AddressLookupTableAccount>>,
    statuses: Mutex<VecDeque<SignatureStatus>>,
    pub sent: Mutex<Vec<Vec<u8>>>,
}

impl MemoryLedger {
    pub fn new(slot: u64) -> Self {
        Self {
            slot: AtomicU64::new(slot),
            accounts: Mutex::new(HashMap::new()),
            lookup_tables: Mutex::new(HashMap::new()),
            statuses: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_slot(&self, slot: u64) {
        self.slot.store(slot, Ordering::SeqCst);
    }

    pub fn set_account(&self, pubkey: Pubkey, data: Vec<u8>) {
        self.accounts.lock().unwrap().insert(pubkey, data);
    }

    pub fn set_lookup_table(&self, table: AddressLookupTableAccount) {
        self.lookup_tables.lock().unwrap().insert(table.key, table);
    }

    pub fn script_statuses(&self, statuses: impl IntoIterator<Item = SignatureStatus>) {
        self.statuses.lock().unwrap().extend(statuses);
    }
}

#[async_trait]
impl LedgerRpc for MemoryLedger {
    async fn get_account(&self, pubkey: &Pubkey) -> Result<DataAndSlot<Option<Vec<u8>>>> {
        let data = self.accounts.lock().unwrap().get(pubkey).cloned();
        Ok(DataAndSlot::new(data, self.slot.load(Ordering::SeqCst)))
    }

    async fn get_multiple_accounts(&self, pubkeys: &[Pubkey]) -> Result<DataAndSlot<Vec<Option<Vec<u8>>>>> {
        let accounts = self.accounts.lock().unwrap();
        let data = pubkeys.iter().map(|p| accounts.get(p).cloned()).collect();
        Ok(DataAndSlot::new(data, self.slot.load(Ordering::SeqCst)))
    }

    async fn get_latest_blockhash(&self) -> Result<Hash> {
        Ok(Hash::new_from_array([7; 32]))
    }

    async fn get_slot(&self) -> Result<u64> {
        Ok(self.slot.load(Ordering::SeqCst))
    }

    async fn simulate(&self, _transaction: &VersionedTransaction) -> Result<SimulationOutcome> {
        Ok(SimulationOutcome::default())
    }

    async fn send_raw_transaction(&self, wire_transaction: &[u8], _config: RpcSendTransactionConfig) -> Result<Signature> {
        self.sent.lock().unwrap().push(wire_transaction.to_vec());
        let transaction: VersionedTransaction = bincode::deserialize(wire_transaction)?;
        Ok(transaction.signatures[0])
    }

    async fn get_signature_status(&self, _signature: &Signature) -> Result<SignatureStatus> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SignatureStatus::Unknown))
    }

    async fn get_address_lookup_table(&self, pubkey: &Pubkey) -> Result<AddressLookupTableAccount> {
        self.lookup_tables
            .lock()
            .unwrap()
            .get(pubkey)
            .cloned()
            .ok_or_else(|| SdkError::AccountNotFound(*pubkey).into())
    }
}

pub fn perp_market(market_index: u16, oracle: Pubkey) -> PerpMarket {
    let mut name = [b' '; 32];
    name[..4].copy_from_slice(b"PERP");
    PerpMarket {
        pubkey: get_perp_market_address(market_index),
        oracle,
        oracle_source: OracleSource::PythPull,
        name,
        market_index,
        quote_spot_market_index: QUOTE_SPOT_MARKET_INDEX,
        margin_ratio_initial: 1_000,
        margin_ratio_maintenance: 500,
        ..Default::default()
    }
}

pub fn quote_spot_market() -> SpotMarket {
    SpotMarket {
        pubkey: get_spot_market_address(QUOTE_SPOT_MARKET_INDEX),
        oracle: NO_ORACLE,
        oracle_source: OracleSource::QuoteAsset,
        market_index: QUOTE_SPOT_MARKET_INDEX,
        decimals: 6,
        ..Default::default()
    }
}

/// A program with state, quote spot market 0 and perp markets 0..3, each perp market
/// with its own oracle
pub struct Program {
    pub ledger: Arc<MemoryLedger>,
    pub perp_oracles: Vec<Pubkey>,
}

impl Program {
    pub fn new(slot: u64) -> Self {
        let ledger = Arc::new(MemoryLedger::new(slot));
        ledger.set_account(*STATE_ACCOUNT, encode_account(&StateAccount::default()).unwrap());
        ledger.set_account(
            get_spot_market_address(QUOTE_SPOT_MARKET_INDEX),
            encode_account(&quote_spot_market()).unwrap(),
        );

        let mut perp_oracles = Vec::new();
        for index in 0..3 {
            let oracle = Pubkey::new_unique();
            ledger.set_account(get_perp_market_address(index), encode_account(&perp_market(index, oracle)).unwrap());
            ledger.set_account(
                oracle,
                encode_account(&perps_sdk_on_chain::OraclePriceFeed {
                    price: 150_000_000,
                    confidence: 10_000,
                    slot,
                    has_sufficient_number_of_data_points: true,
                })
                .unwrap(),
            );
            perp_oracles.push(oracle);
        }

        Self { ledger, perp_oracles }
    }

    pub fn add_user(&self, pubkey: Pubkey, user: &UserAccount) {
        self.ledger.set_account(pubkey, encode_account(user).unwrap());
    }

    pub fn sdk(&self, config: SdkConfig) -> PerpsSDK {
        let tracked = TrackedAccounts::for_markets(
            &config.perp_market_indexes,
            &config.spot_market_indexes,
            &config.oracle_infos,
        )
        .with_users(&config.users);
        let store = AccountStore::new(tracked, Arc::new(BorshAccountDecoder));
        let loader = BatchAccountLoader::new(self.ledger.clone(), Duration::from_millis(1));
        let subscriber = PollingAccountSubscriber::new(store, loader, Duration::from_secs(60));

        PerpsSDK::from_parts(self.ledger.clone(), Box::new(subscriber), None, &config)
    }
}
