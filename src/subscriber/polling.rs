use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, info, warn};
use solana_sdk::pubkey::Pubkey;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
    account_loader::BatchAccountLoader,
    subscriber::{AccountStore, AccountSubscriber, BatchOutcome, TrackedAccounts},
    types::AccountKind,
};

/// Refreshes every tracked account with one batched read per tick
pub struct PollingAccountSubscriber {
    store: Arc<AccountStore>,
    loader: Arc<BatchAccountLoader>,
    frequency: Duration,
    subscribed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingAccountSubscriber {
    pub fn new(store: AccountStore, loader: BatchAccountLoader, frequency: Duration) -> Self {
        Self {
            store: Arc::new(store),
            loader: Arc::new(loader),
            frequency,
            subscribed: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// One polling round. Driven by the internal interval once subscribed, but can be
    /// called directly by a caller that owns its own schedule.
    pub async fn tick(&self) -> Result<()> {
        poll(&self.store, &self.loader).await
    }
}

pub(super) async fn poll(store: &AccountStore, loader: &BatchAccountLoader) -> Result<()> {
    let targets = store.targets();
    let pubkeys: Vec<Pubkey> = targets.iter().map(|(p, _)| *p).collect();

    let loaded = loader.load_many(&pubkeys).await?;
    let batch = targets
        .into_iter()
        .zip(loaded.data)
        .map(|((pubkey, kind), data)| (pubkey, kind, data))
        .collect();

    let outcome = store.apply_batch(batch, loaded.slot);
    debug!(
        "polled {} accounts at slot {}, {} applied",
        pubkeys.len(),
        loaded.slot,
        outcome.applied
    );

    settle(store, loader, outcome).await
}

/// Follows up on a batch: loads newly referenced oracles, then reports decode failures
async fn settle(store: &AccountStore, loader: &BatchAccountLoader, outcome: BatchOutcome) -> Result<()> {
    for missing in &outcome.missing {
        warn!("tracked account {} does not exist", missing);
    }

    let mut result = Ok(());
    if !outcome.discovered_oracles.is_empty() {
        let added = store.track(&AccountStore::oracles_to_track(&outcome.discovered_oracles));
        result = load_added(store, loader, added).await;
    }

    outcome.into_result().and(result)
}

/// Loads freshly tracked accounts. Each goes through the coalescing loader, so they
/// land in the same request and share its slot.
pub(super) async fn load_added(
    store: &AccountStore,
    loader: &BatchAccountLoader,
    added: Vec<(Pubkey, AccountKind)>,
) -> Result<()> {
    if added.is_empty() {
        return Ok(());
    }

    let loads = join_all(added.iter().map(|(pubkey, _)| loader.load(*pubkey))).await;

    let mut by_slot: BTreeMap<u64, Vec<(Pubkey, AccountKind, Option<Vec<u8>>)>> = BTreeMap::new();
    for ((pubkey, kind), loaded) in added.into_iter().zip(loads) {
        let loaded = loaded?;
        by_slot
            .entry(loaded.slot)
            .or_default()
            .push((pubkey, kind, loaded.data));
    }

    let mut failures = Vec::new();
    for (slot, batch) in by_slot {
        let outcome = store.apply_batch(batch, slot);
        for missing in &outcome.missing {
            warn!("newly tracked account {} does not exist", missing);
        }
        failures.extend(outcome.failures);
    }

    BatchOutcome {
        failures,
        ..Default::default()
    }
    .into_result()
}

#[async_trait]
impl AccountSubscriber for PollingAccountSubscriber {
    async fn subscribe(&self) -> bool {
        if self.subscribed.load(Ordering::SeqCst) {
            return true;
        }

        if let Err(err) = self.fetch().await {
            warn!("initial account fetch failed: {:#}", err);
        }
        if !self.store.has_required_accounts() {
            warn!("state account or a tracked market is missing, not subscribing");
            return false;
        }

        let store = self.store.clone();
        let loader = self.loader.clone();
        let frequency = self.frequency;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(frequency);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(err) = poll(&store, &loader).await {
                    warn!("account poll failed: {:#}", err);
                }
            }
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.subscribed.store(true, Ordering::SeqCst);
        info!("polling {} accounts every {:?}", self.store.targets().len(), frequency);
        true
    }

    async fn fetch(&self) -> Result<()> {
        self.tick().await
    }

    async fn unsubscribe(&self) {
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.store.clear();
        self.subscribed.store(false, Ordering::SeqCst);
        info!("stopped polling accounts");
    }

    async fn extend(&self, accounts: TrackedAccounts) -> Result<()> {
        let added = self.store.track(&accounts);
        if added.is_empty() || !self.is_subscribed() {
            return Ok(());
        }
        debug!("tracking {} more accounts", added.len());
        load_added(&self.store, &self.loader, added).await
    }

    fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    fn store(&self) -> &AccountStore {
        &self.store
    }
}
