use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use anyhow::Result;
use async_trait::async_trait;
use solana_rpc_client_api::config::RpcSendTransactionConfig;
use solana_sdk::{
    address_lookup_table::AddressLookupTableAccount, hash::Hash, pubkey::Pubkey,
    signature::Signature, transaction::VersionedTransaction,
};
use tokio::sync::{mpsc, oneshot};

use crate::{
    error::SdkError,
    rpc::{
        AccountNotifier, AccountUpdate, LedgerRpc, SignatureNotifier, SignatureStatus,
        SimulationOutcome, SubscriptionHandle,
    },
    types::DataAndSlot,
};

/// In-memory ledger with scripted responses
pub struct FakeLedger {
    slot: AtomicU64,
    accounts: Mutex<HashMap<Pubkey, Vec<u8>>>,
    lookup_tables: Mutex<HashMap<Pubkey, AddressLookupTableAccount>>,
    fail_reads: AtomicBool,
    blockhash: Hash,
    simulation: Mutex<SimulationOutcome>,
    statuses: Mutex<VecDeque<SignatureStatus>>,
    pub simulated: Mutex<Vec<VersionedTransaction>>,
    pub sent: Mutex<Vec<Vec<u8>>>,
    multiple_accounts_calls: AtomicUsize,
    blockhash_calls: AtomicUsize,
    lookup_table_calls: AtomicUsize,
    status_calls: AtomicUsize,
    dropped_trailing: AtomicUsize,
}

impl FakeLedger {
    pub fn new(slot: u64) -> Self {
        Self {
            slot: AtomicU64::new(slot),
            accounts: Mutex::new(HashMap::new()),
            lookup_tables: Mutex::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
            blockhash: Hash::new_unique(),
            simulation: Mutex::new(SimulationOutcome::default()),
            statuses: Mutex::new(VecDeque::new()),
            simulated: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            multiple_accounts_calls: AtomicUsize::new(0),
            blockhash_calls: AtomicUsize::new(0),
            lookup_table_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            dropped_trailing: AtomicUsize::new(0),
        }
    }

    pub fn set_slot(&self, slot: u64) {
        self.slot.store(slot, Ordering::SeqCst);
    }

    pub fn set_account(&self, pubkey: Pubkey, data: Vec<u8>) {
        self.accounts.lock().unwrap().insert(pubkey, data);
    }

    pub fn remove_account(&self, pubkey: &Pubkey) {
        self.accounts.lock().unwrap().remove(pubkey);
    }

    pub fn set_lookup_table(&self, table: AddressLookupTableAccount) {
        self.lookup_tables.lock().unwrap().insert(table.key, table);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_simulation(&self, outcome: SimulationOutcome) {
        *self.simulation.lock().unwrap() = outcome;
    }

    /// Statuses returned by successive `get_signature_status` calls; `Unknown` once drained
    pub fn script_statuses(&self, statuses: impl IntoIterator<Item = SignatureStatus>) {
        self.statuses.lock().unwrap().extend(statuses);
    }

    pub fn blockhash(&self) -> Hash {
        self.blockhash
    }

    pub fn multiple_accounts_calls(&self) -> usize {
        self.multiple_accounts_calls.load(Ordering::SeqCst)
    }

    pub fn blockhash_calls(&self) -> usize {
        self.blockhash_calls.load(Ordering::SeqCst)
    }

    pub fn lookup_table_calls(&self) -> usize {
        self.lookup_table_calls.load(Ordering::SeqCst)
    }

    /// `get_multiple_accounts` answers with `count` fewer entries than requested
    pub fn drop_trailing_accounts(&self, count: usize) {
        self.dropped_trailing.store(count, Ordering::SeqCst);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SdkError::Rpc("connection refused".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerRpc for FakeLedger {
    async fn get_account(&self, pubkey: &Pubkey) -> Result<DataAndSlot<Option<Vec<u8>>>> {
        self.check_reads()?;
        let data = self.accounts.lock().unwrap().get(pubkey).cloned();
        Ok(DataAndSlot::new(data, self.slot.load(Ordering::SeqCst)))
    }

    async fn get_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
    ) -> Result<DataAndSlot<Vec<Option<Vec<u8>>>>> {
        self.multiple_accounts_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reads()?;
        let accounts = self.accounts.lock().unwrap();
        let mut data: Vec<Option<Vec<u8>>> = pubkeys.iter().map(|p| accounts.get(p).cloned()).collect();
        let dropped = self.dropped_trailing.load(Ordering::SeqCst).min(data.len());
        data.truncate(data.len() - dropped);
        Ok(DataAndSlot::new(data, self.slot.load(Ordering::SeqCst)))
    }

    async fn get_latest_blockhash(&self) -> Result<Hash> {
        self.blockhash_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.blockhash)
    }

    async fn get_slot(&self) -> Result<u64> {
        Ok(self.slot.load(Ordering::SeqCst))
    }

    async fn simulate(&self, transaction: &VersionedTransaction) -> Result<SimulationOutcome> {
        self.simulated.lock().unwrap().push(transaction.clone());
        Ok(self.simulation.lock().unwrap().clone())
    }

    async fn send_raw_transaction(
        &self,
        wire_transaction: &[u8],
        _config: RpcSendTransactionConfig,
    ) -> Result<Signature> {
        self.sent.lock().unwrap().push(wire_transaction.to_vec());
        let transaction: VersionedTransaction = bincode::deserialize(wire_transaction)?;
        Ok(transaction.signatures[0])
    }

    async fn get_signature_status(&self, _signature: &Signature) -> Result<SignatureStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SignatureStatus::Unknown))
    }

    async fn get_address_lookup_table(&self, pubkey: &Pubkey) -> Result<AddressLookupTableAccount> {
        self.lookup_table_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup_tables
            .lock()
            .unwrap()
            .get(pubkey)
            .cloned()
            .ok_or_else(|| SdkError::AccountNotFound(*pubkey).into())
    }
}

/// Account notifier whose notifications are pushed by the test
#[derive(Default)]
pub struct FakeNotifier {
    sinks: Mutex<HashMap<Pubkey, mpsc::Sender<AccountUpdate>>>,
    open: Mutex<Vec<SubscriptionHandle>>,
    next_id: AtomicU64,
    subscribe_calls: Mutex<HashMap<Pubkey, usize>>,
}

impl FakeNotifier {
    pub async fn push(&self, pubkey: Pubkey, data: Vec<u8>, slot: u64) {
        let sink = self.sinks.lock().unwrap().get(&pubkey).cloned();
        if let Some(sink) = sink {
            let _ = sink.send(AccountUpdate { pubkey, data, slot }).await;
        }
    }

    pub fn subscribe_calls(&self, pubkey: &Pubkey) -> usize {
        self.subscribe_calls
            .lock()
            .unwrap()
            .get(pubkey)
            .copied()
            .unwrap_or_default()
    }

    pub fn open_subscriptions(&self) -> usize {
        self.open.lock().unwrap().len()
    }
}

#[async_trait]
impl AccountNotifier for FakeNotifier {
    async fn subscribe_account(
        &self,
        pubkey: Pubkey,
        sink: mpsc::Sender<AccountUpdate>,
    ) -> Result<SubscriptionHandle> {
        *self.subscribe_calls.lock().unwrap().entry(pubkey).or_default() += 1;
        self.sinks.lock().unwrap().insert(pubkey, sink);
        let handle = SubscriptionHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            pubkey,
        };
        self.open.lock().unwrap().push(handle);
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.open.lock().unwrap().retain(|h| *h != handle);
    }
}

/// Signature notifier that answers every subscription with a fixed status, or never
pub struct FakeSignatureNotifier {
    status: Option<SignatureStatus>,
    subscribe_error: Option<String>,
    pending: Mutex<Vec<oneshot::Sender<SignatureStatus>>>,
}

impl FakeSignatureNotifier {
    pub fn new(status: Option<SignatureStatus>) -> Self {
        Self {
            status,
            subscribe_error: None,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Every subscription attempt fails with a transport error
    pub fn failing(reason: &str) -> Self {
        Self {
            subscribe_error: Some(reason.to_string()),
            ..Self::new(None)
        }
    }
}

#[async_trait]
impl SignatureNotifier for FakeSignatureNotifier {
    async fn subscribe_signature(
        &self,
        _signature: Signature,
    ) -> Result<oneshot::Receiver<SignatureStatus>> {
        if let Some(reason) = &self.subscribe_error {
            return Err(SdkError::Rpc(reason.clone()).into());
        }
        let (sender, receiver) = oneshot::channel();
        match &self.status {
            Some(status) => {
                let _ = sender.send(status.clone());
            }
            None => self.pending.lock().unwrap().push(sender),
        }
        Ok(receiver)
    }
}
