use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use solana_sdk::pubkey::Pubkey;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};

use crate::{
    account_loader::BatchAccountLoader,
    rpc::{AccountNotifier, AccountUpdate, SubscriptionHandle},
    subscriber::{
        AccountStore, AccountSubscriber, TrackedAccounts,
        polling::{load_added, poll},
    },
    types::AccountKind,
};

const NOTIFICATION_BUFFER: usize = 32;

type Watchers = Arc<Mutex<HashMap<Pubkey, JoinHandle<()>>>>;

/// Everything a per-account watcher task needs
#[derive(Clone)]
struct WatcherContext {
    store: Arc<AccountStore>,
    loader: Arc<BatchAccountLoader>,
    notifier: Arc<dyn AccountNotifier>,
    resub_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    discovered: mpsc::UnboundedSender<Vec<(Pubkey, AccountKind)>>,
}

/// Keeps the cache fresh from push notifications, one subscription per account.
///
/// The initial population is one batched read. A subscription that stays silent for
/// `resub_timeout` is closed and reopened; updates from either handle go through the
/// same slot check, so a late notification cannot roll an account back.
pub struct WebSocketAccountSubscriber {
    store: Arc<AccountStore>,
    loader: Arc<BatchAccountLoader>,
    notifier: Arc<dyn AccountNotifier>,
    resub_timeout: Duration,
    shutdown: watch::Sender<bool>,
    watchers: Watchers,
    context: Mutex<Option<WatcherContext>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    subscribed: AtomicBool,
}

impl WebSocketAccountSubscriber {
    pub fn new(
        store: AccountStore,
        loader: BatchAccountLoader,
        notifier: Arc<dyn AccountNotifier>,
        resub_timeout: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store: Arc::new(store),
            loader: Arc::new(loader),
            notifier,
            resub_timeout,
            shutdown,
            watchers: Arc::new(Mutex::new(HashMap::new())),
            context: Mutex::new(None),
            supervisor: Mutex::new(None),
            subscribed: AtomicBool::new(false),
        }
    }

    /// Starts a watcher for every tracked account that has none
    fn ensure_watchers(&self) {
        let context = self
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(context) = context {
            spawn_watchers(&self.watchers, &context, self.store.targets());
        }
    }
}

fn spawn_watchers(watchers: &Watchers, context: &WatcherContext, targets: Vec<(Pubkey, AccountKind)>) {
    let mut watchers = watchers.lock().unwrap_or_else(PoisonError::into_inner);
    for (pubkey, kind) in targets {
        if watchers.contains_key(&pubkey) {
            continue;
        }
        let handle = tokio::spawn(watch_account(context.clone(), pubkey, kind));
        watchers.insert(pubkey, handle);
    }
}

/// Loads and then watches oracles discovered while applying notifications
async fn supervise(
    context: WatcherContext,
    watchers: Watchers,
    mut discovered: mpsc::UnboundedReceiver<Vec<(Pubkey, AccountKind)>>,
) {
    let mut shutdown = context.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            targets = discovered.recv() => match targets {
                Some(targets) => {
                    if let Err(err) = load_added(&context.store, &context.loader, targets.clone()).await {
                        warn!("failed to load {} discovered oracles: {:#}", targets.len(), err);
                    }
                    spawn_watchers(&watchers, &context, targets);
                }
                None => break,
            },
        }
    }
}

async fn open_subscription(
    notifier: &dyn AccountNotifier,
    pubkey: Pubkey,
    sink: &mpsc::Sender<AccountUpdate>,
) -> Option<SubscriptionHandle> {
    match notifier.subscribe_account(pubkey, sink.clone()).await {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!("failed to subscribe to {}: {:#}", pubkey, err);
            None
        }
    }
}

async fn watch_account(context: WatcherContext, pubkey: Pubkey, kind: AccountKind) {
    let WatcherContext {
        store,
        notifier,
        loader: _,
        resub_timeout,
        mut shutdown,
        discovered,
    } = context;

    // all handles for this account deliver here
    let (sink, mut updates) = mpsc::channel::<AccountUpdate>(NOTIFICATION_BUFFER);
    let mut handle = open_subscription(notifier.as_ref(), pubkey, &sink).await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = timeout(resub_timeout, updates.recv()) => match received {
                Ok(Some(update)) => {
                    let outcome = store.apply_batch(
                        vec![(update.pubkey, kind, Some(update.data))],
                        update.slot,
                    );
                    if !outcome.discovered_oracles.is_empty() {
                        let added = store.track(&AccountStore::oracles_to_track(&outcome.discovered_oracles));
                        if !added.is_empty() {
                            let _ = discovered.send(added);
                        }
                    }
                    if let Err(err) = outcome.into_result() {
                        warn!("dropping notification for {}: {:#}", pubkey, err);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "no notification for {} in {:?}, resubscribing",
                        pubkey, resub_timeout
                    );
                    if let Some(stale) = handle.take() {
                        notifier.unsubscribe(stale).await;
                    }
                    handle = open_subscription(notifier.as_ref(), pubkey, &sink).await;
                }
            },
        }
    }

    if let Some(handle) = handle {
        notifier.unsubscribe(handle).await;
    }
    debug!("stopped watching {}", pubkey);
}

#[async_trait]
impl AccountSubscriber for WebSocketAccountSubscriber {
    async fn subscribe(&self) -> bool {
        if self.subscribed.load(Ordering::SeqCst) {
            return true;
        }

        if let Err(err) = poll(&self.store, &self.loader).await {
            warn!("initial account fetch failed: {:#}", err);
        }
        if !self.store.has_required_accounts() {
            warn!("state account or a tracked market is missing, not subscribing");
            return false;
        }

        self.shutdown.send_replace(false);
        let (discovered_tx, discovered_rx) = mpsc::unbounded_channel();
        let context = WatcherContext {
            store: self.store.clone(),
            loader: self.loader.clone(),
            notifier: self.notifier.clone(),
            resub_timeout: self.resub_timeout,
            shutdown: self.shutdown.subscribe(),
            discovered: discovered_tx,
        };

        let supervisor = tokio::spawn(supervise(
            context.clone(),
            self.watchers.clone(),
            discovered_rx,
        ));
        *self.supervisor.lock().unwrap_or_else(PoisonError::into_inner) = Some(supervisor);
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = Some(context);

        self.ensure_watchers();
        self.subscribed.store(true, Ordering::SeqCst);
        info!("watching {} accounts", self.store.targets().len());
        true
    }

    async fn fetch(&self) -> Result<()> {
        poll(&self.store, &self.loader).await?;
        self.ensure_watchers();
        Ok(())
    }

    async fn unsubscribe(&self) {
        self.shutdown.send_replace(true);
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handles: Vec<JoinHandle<()>> = self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        for handle in handles.into_iter().chain(supervisor) {
            let _ = handle.await;
        }

        self.store.clear();
        self.subscribed.store(false, Ordering::SeqCst);
        info!("closed account subscriptions");
    }

    async fn extend(&self, accounts: TrackedAccounts) -> Result<()> {
        let added = self.store.track(&accounts);
        if added.is_empty() || !self.is_subscribed() {
            return Ok(());
        }
        debug!("watching {} more accounts", added.len());

        let loaded = load_added(&self.store, &self.loader, added).await;
        self.ensure_watchers();
        loaded
    }

    fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    fn store(&self) -> &AccountStore {
        &self.store
    }
}
