use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use log::{debug, warn};
use solana_rpc_client_api::config::RpcSendTransactionConfig;
use solana_sdk::{
    signature::Signature,
    signer::Signer,
    transaction::VersionedTransaction,
};
use tokio::time::{sleep, timeout};

use crate::{
    error::SdkError,
    rpc::{LedgerRpc, SignatureNotifier, SignatureStatus},
    tx_builder::AssembledTransaction,
    utils::exponential_backoff,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmationStrategy {
    /// Signature status notifications
    WebSocket,
    /// Repeated status queries with backoff
    #[default]
    Polling,
    /// Both at once, first confirmation wins
    Combo,
}

/// What to do when a confirmation round times out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Resend the identical signed bytes, the ledger drops duplicates
    Rebroadcast { max_rebroadcasts: u32 },
    Fail,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy::Rebroadcast { max_rebroadcasts: 3 }
    }
}

#[derive(Debug, Clone)]
pub struct TxSenderConfig {
    pub strategy: ConfirmationStrategy,
    /// Bound on one confirmation round
    pub timeout: Duration,
    /// First polling delay, doubled after every miss
    pub poll_interval: Duration,
    pub max_poll_retries: u32,
    pub timeout_policy: TimeoutPolicy,
    pub send_config: RpcSendTransactionConfig,
}

impl Default for TxSenderConfig {
    fn default() -> Self {
        Self {
            strategy: ConfirmationStrategy::default(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(400),
            max_poll_retries: 10,
            timeout_policy: TimeoutPolicy::default(),
            send_config: RpcSendTransactionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSigAndSlot {
    pub signature: Signature,
    /// Slot the transaction was confirmed at
    pub slot: u64,
}

/// Hooks invoked synchronously around signing and sending
pub trait TransactionObserver: Send + Sync {
    fn pre_sign(&self, _tx: &AssembledTransaction) {}

    fn on_signed(&self, _tx: &AssembledTransaction) {}

    fn on_sent(&self, _signature: &Signature, _wire_size: usize) {}
}

/// Sends assembled transactions and waits for confirmation
pub struct TxSender {
    rpc: Arc<dyn LedgerRpc>,
    signature_notifier: Option<Arc<dyn SignatureNotifier>>,
    config: TxSenderConfig,
    observer: Option<Arc<dyn TransactionObserver>>,
    timeout_count: AtomicU64,
}

impl TxSender {
    pub fn new(
        rpc: Arc<dyn LedgerRpc>,
        signature_notifier: Option<Arc<dyn SignatureNotifier>>,
        config: TxSenderConfig,
    ) -> Self {
        Self {
            rpc,
            signature_notifier,
            config,
            observer: None,
            timeout_count: AtomicU64::new(0),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransactionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Confirmation timeouts surfaced so far
    pub fn timeout_count(&self) -> u64 {
        self.timeout_count.load(Ordering::SeqCst)
    }

    /// Signs with the path matching the transaction's own format
    pub fn sign(&self, tx: AssembledTransaction, signers: &[&dyn Signer]) -> Result<AssembledTransaction> {
        if let Some(observer) = &self.observer {
            observer.pre_sign(&tx);
        }

        let signed = match tx {
            AssembledTransaction::Legacy(mut tx) => {
                let blockhash = tx.message.recent_blockhash;
                tx.try_sign(signers, blockhash)
                    .map_err(|err| SdkError::Signing(err.to_string()))?;
                AssembledTransaction::Legacy(tx)
            }
            AssembledTransaction::Versioned(tx) => {
                let tx = VersionedTransaction::try_new(tx.message, signers)
                    .map_err(|err| SdkError::Signing(err.to_string()))?;
                AssembledTransaction::Versioned(tx)
            }
        };

        if let Some(observer) = &self.observer {
            observer.on_signed(&signed);
        }
        Ok(signed)
    }

    /// Send a transaction and wait until it is confirmed
    ///
    /// # Arguments
    /// * `tx` - legacy or versioned transaction
    /// * `signers` - ignored when `pre_signed` is set
    /// * `config` - overrides the configured send options
    /// * `pre_signed` - the transaction already carries every signature
    ///
    /// # Returns
    /// The transaction signature and the slot it was confirmed at
    pub async fn send(
        &self,
        tx: AssembledTransaction,
        signers: &[&dyn Signer],
        config: Option<RpcSendTransactionConfig>,
        pre_signed: bool,
    ) -> Result<TxSigAndSlot> {
        let tx = if pre_signed { tx } else { self.sign(tx, signers)? };
        self.send_signed(&tx, config).await
    }

    pub async fn send_signed(
        &self,
        tx: &AssembledTransaction,
        config: Option<RpcSendTransactionConfig>,
    ) -> Result<TxSigAndSlot> {
        let config = config.unwrap_or_else(|| self.config.send_config.clone());
        let wire_transaction = tx.serialize()?;
        let signature = tx.signature();

        self.rpc
            .send_raw_transaction(&wire_transaction, config.clone())
            .await?;
        if let Some(observer) = &self.observer {
            observer.on_sent(&signature, wire_transaction.len());
        }
        debug!("sent {} ({:?})", signature, tx.version());

        let mut rebroadcasts = 0;
        loop {
            if let Some(slot) = self.confirm(&signature).await? {
                return Ok(TxSigAndSlot { signature, slot });
            }

            match self.config.timeout_policy {
                TimeoutPolicy::Rebroadcast { max_rebroadcasts } if rebroadcasts < max_rebroadcasts => {
                    rebroadcasts += 1;
                    warn!(
                        "{} not confirmed, rebroadcasting ({}/{})",
                        signature, rebroadcasts, max_rebroadcasts
                    );
                    let resend = RpcSendTransactionConfig {
                        skip_preflight: true,
                        ..config.clone()
                    };
                    if let Err(err) = self.rpc.send_raw_transaction(&wire_transaction, resend).await {
                        warn!("rebroadcast of {} failed: {:#}", signature, err);
                    }
                }
                _ => {
                    let timeout_count = self.timeout_count.fetch_add(1, Ordering::SeqCst) + 1;
                    return Err(SdkError::ConfirmationTimeout {
                        signature,
                        timeout_count,
                    }
                    .into());
                }
            }
        }
    }

    /// One confirmation round. `None` means the round timed out.
    async fn confirm(&self, signature: &Signature) -> Result<Option<u64>> {
        match self.config.strategy {
            ConfirmationStrategy::Polling => self.confirm_by_polling(signature).await,
            ConfirmationStrategy::WebSocket => self.confirm_by_websocket(signature).await,
            ConfirmationStrategy::Combo if self.signature_notifier.is_none() => {
                self.confirm_by_polling(signature).await
            }
            ConfirmationStrategy::Combo => {
                let polling = self.confirm_by_polling(signature);
                let websocket = self.confirm_by_websocket(signature);
                tokio::pin!(polling, websocket);

                // only a confirmation or a rejection decides the race
                tokio::select! {
                    result = &mut polling => {
                        if is_undecided(&result) {
                            log_undecided("polling", signature, &result);
                            websocket.await
                        } else {
                            result
                        }
                    }
                    result = &mut websocket => {
                        if is_undecided(&result) {
                            log_undecided("websocket", signature, &result);
                            polling.await
                        } else {
                            result
                        }
                    }
                }
            }
        }
    }

    async fn confirm_by_polling(&self, signature: &Signature) -> Result<Option<u64>> {
        let polling = async {
            for attempt in 0..self.config.max_poll_retries {
                match self.rpc.get_signature_status(signature).await? {
                    SignatureStatus::Confirmed { slot } => return Ok(Some(slot)),
                    SignatureStatus::Failed { slot, reason } => {
                        return Err(failed(*signature, slot, reason));
                    }
                    SignatureStatus::Pending | SignatureStatus::Unknown => {
                        sleep(exponential_backoff(
                            self.config.poll_interval,
                            attempt,
                            self.config.timeout,
                        ))
                        .await;
                    }
                }
            }
            Ok(None)
        };

        timeout(self.config.timeout, polling).await.unwrap_or(Ok(None))
    }

    async fn confirm_by_websocket(&self, signature: &Signature) -> Result<Option<u64>> {
        let Some(notifier) = &self.signature_notifier else {
            warn!("no signature notifier configured, confirming by polling");
            return self.confirm_by_polling(signature).await;
        };

        let receiver = notifier.subscribe_signature(*signature).await?;
        match timeout(self.config.timeout, receiver).await {
            Ok(Ok(SignatureStatus::Confirmed { slot })) => Ok(Some(slot)),
            Ok(Ok(SignatureStatus::Failed { slot, reason })) => Err(failed(*signature, slot, reason)),
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => Ok(None),
        }
    }
}

/// A timed out round or a transient transport failure
fn is_undecided(result: &Result<Option<u64>>) -> bool {
    match result {
        Ok(slot) => slot.is_none(),
        Err(err) => matches!(err.downcast_ref::<SdkError>(), Some(SdkError::Rpc(_))),
    }
}

fn log_undecided(side: &str, signature: &Signature, result: &Result<Option<u64>>) {
    if let Err(err) = result {
        warn!("{} confirmation of {} failed, waiting on the other side: {:#}", side, signature, err);
    }
}

fn failed(signature: Signature, slot: u64, reason: String) -> anyhow::Error {
    SdkError::TransactionFailed {
        signature,
        slot,
        reason,
    }
    .into()
}
