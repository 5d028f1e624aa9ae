use std::{
    collections::HashMap,
    str::FromStr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use futures_util::{Stream, StreamExt};
use log::{debug, warn};
use serde_json::json;
use solana_account_decoder::UiAccountEncoding;
use solana_pubsub_client::nonblocking::pubsub_client::PubsubClient;
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_rpc_client_api::{
    config::{
        RpcAccountInfoConfig, RpcSendTransactionConfig, RpcSignatureSubscribeConfig,
        RpcSimulateTransactionConfig,
    },
    request::RpcRequest,
    response::{Response, RpcSignatureResult},
};
use solana_sdk::{
    address_lookup_table::{AddressLookupTableAccount, state::AddressLookupTable},
    commitment_config::CommitmentConfig,
    hash::Hash,
    pubkey::Pubkey,
    signature::Signature,
    transaction::VersionedTransaction,
};
use tokio::sync::{mpsc, oneshot};

use crate::{error::SdkError, types::DataAndSlot};

/// Result of a dry-run execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationOutcome {
    pub units_consumed: Option<u64>,
    pub error: Option<String>,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    /// Landed and reached the configured commitment
    Confirmed { slot: u64 },
    /// Landed but the program rejected it
    Failed { slot: u64, reason: String },
    /// Seen by the cluster, commitment not reached yet
    Pending,
    Unknown,
}

/// Read/write access to the ledger. Every method is a network round trip.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    async fn get_account(&self, pubkey: &Pubkey) -> Result<DataAndSlot<Option<Vec<u8>>>>;

    /// All accounts in one response share the slot it was served at
    async fn get_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
    ) -> Result<DataAndSlot<Vec<Option<Vec<u8>>>>>;

    async fn get_latest_blockhash(&self) -> Result<Hash>;

    async fn get_slot(&self) -> Result<u64>;

    async fn simulate(&self, transaction: &VersionedTransaction) -> Result<SimulationOutcome>;

    async fn send_raw_transaction(
        &self,
        wire_transaction: &[u8],
        config: RpcSendTransactionConfig,
    ) -> Result<Signature>;

    async fn get_signature_status(&self, signature: &Signature) -> Result<SignatureStatus>;

    async fn get_address_lookup_table(&self, pubkey: &Pubkey) -> Result<AddressLookupTableAccount>;
}

fn rpc_error(err: impl std::fmt::Display) -> SdkError {
    SdkError::Rpc(err.to_string())
}

#[async_trait]
impl LedgerRpc for RpcClient {
    async fn get_account(&self, pubkey: &Pubkey) -> Result<DataAndSlot<Option<Vec<u8>>>> {
        let response = self
            .get_account_with_commitment(pubkey, self.commitment())
            .await
            .map_err(rpc_error)?;

        Ok(DataAndSlot::new(
            response.value.map(|account| account.data),
            response.context.slot,
        ))
    }

    async fn get_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
    ) -> Result<DataAndSlot<Vec<Option<Vec<u8>>>>> {
        let response = self
            .get_multiple_accounts_with_commitment(pubkeys, self.commitment())
            .await
            .map_err(rpc_error)?;

        let accounts = response
            .value
            .into_iter()
            .map(|account| account.map(|a| a.data))
            .collect();
        Ok(DataAndSlot::new(accounts, response.context.slot))
    }

    async fn get_latest_blockhash(&self) -> Result<Hash> {
        Ok(RpcClient::get_latest_blockhash(self)
            .await
            .map_err(rpc_error)?)
    }

    async fn get_slot(&self) -> Result<u64> {
        Ok(RpcClient::get_slot(self).await.map_err(rpc_error)?)
    }

    async fn simulate(&self, transaction: &VersionedTransaction) -> Result<SimulationOutcome> {
        let config = RpcSimulateTransactionConfig {
            sig_verify: false,
            replace_recent_blockhash: true,
            commitment: Some(self.commitment()),
            ..Default::default()
        };

        let result = self
            .simulate_transaction_with_config(transaction, config)
            .await
            .map_err(rpc_error)?
            .value;

        Ok(SimulationOutcome {
            units_consumed: result.units_consumed,
            error: result.err.map(|err| err.to_string()),
            logs: result.logs.unwrap_or_default(),
        })
    }

    async fn send_raw_transaction(
        &self,
        wire_transaction: &[u8],
        config: RpcSendTransactionConfig,
    ) -> Result<Signature> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(wire_transaction);
        let mut config = serde_json::to_value(config)?;
        config["encoding"] = json!("base64");

        let signature: String = self
            .send(RpcRequest::SendTransaction, json!([encoded, config]))
            .await
            .map_err(rpc_error)?;

        Signature::from_str(&signature).context("rpc returned an invalid signature")
    }

    async fn get_signature_status(&self, signature: &Signature) -> Result<SignatureStatus> {
        let response = self
            .get_signature_statuses(&[*signature])
            .await
            .map_err(rpc_error)?;

        let Some(Some(status)) = response.value.into_iter().next() else {
            return Ok(SignatureStatus::Unknown);
        };

        if let Some(err) = &status.err {
            return Ok(SignatureStatus::Failed {
                slot: status.slot,
                reason: err.to_string(),
            });
        }

        if status.satisfies_commitment(self.commitment()) {
            Ok(SignatureStatus::Confirmed { slot: status.slot })
        } else {
            Ok(SignatureStatus::Pending)
        }
    }

    async fn get_address_lookup_table(&self, pubkey: &Pubkey) -> Result<AddressLookupTableAccount> {
        let account = RpcClient::get_account(self, pubkey)
            .await
            .map_err(rpc_error)?;
        let table = AddressLookupTable::deserialize(&account.data)
            .map_err(|err| anyhow::anyhow!("invalid lookup table {}: {}", pubkey, err))?;

        Ok(AddressLookupTableAccount {
            key: *pubkey,
            addresses: table.addresses.to_vec(),
        })
    }
}

/// One push notification for an account
#[derive(Debug, Clone, PartialEq)]
pub struct AccountUpdate {
    pub pubkey: Pubkey,
    pub data: Vec<u8>,
    pub slot: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub pubkey: Pubkey,
}

/// Push notifications for account changes.
///
/// Every subscription for an account delivers into the sink it was opened with, so a
/// closed handle may still deliver notifications that were already in flight.
#[async_trait]
pub trait AccountNotifier: Send + Sync {
    async fn subscribe_account(
        &self,
        pubkey: Pubkey,
        sink: mpsc::Sender<AccountUpdate>,
    ) -> Result<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// Push notification of a signature reaching the configured commitment
#[async_trait]
pub trait SignatureNotifier: Send + Sync {
    async fn subscribe_signature(
        &self,
        signature: Signature,
    ) -> Result<oneshot::Receiver<SignatureStatus>>;
}

/// `AccountNotifier` and `SignatureNotifier` backed by one websocket connection
pub struct PubsubNotifier {
    client: Arc<PubsubClient>,
    commitment: CommitmentConfig,
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl PubsubNotifier {
    pub async fn connect(ws_endpoint: &str, commitment: CommitmentConfig) -> Result<Self> {
        let client = PubsubClient::new(ws_endpoint)
            .await
            .map_err(rpc_error)
            .with_context(|| format!("failed to connect to {}", ws_endpoint))?;

        Ok(Self {
            client: Arc::new(client),
            commitment,
            next_id: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl AccountNotifier for PubsubNotifier {
    async fn subscribe_account(
        &self,
        pubkey: Pubkey,
        sink: mpsc::Sender<AccountUpdate>,
    ) -> Result<SubscriptionHandle> {
        let client = self.client.clone();
        let config = RpcAccountInfoConfig {
            encoding: Some(UiAccountEncoding::Base64),
            commitment: Some(self.commitment),
            ..Default::default()
        };
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let (mut stream, unsubscribe) =
                match client.account_subscribe(&pubkey, Some(config)).await {
                    Ok(subscription) => {
                        let _ = ready_tx.send(Ok(()));
                        subscription
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return;
                    }
                };

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    next = stream.next() => {
                        let Some(response) = next else { break };
                        let Some(data) = response.value.data.decode() else {
                            warn!("undecodable account notification for {}", pubkey);
                            continue;
                        };
                        let update = AccountUpdate {
                            pubkey,
                            data,
                            slot: response.context.slot,
                        };
                        if sink.send(update).await.is_err() {
                            break;
                        }
                    }
                }
            }

            unsubscribe().await;
        });

        ready_rx
            .await
            .map_err(|_| SdkError::Rpc("subscription task ended early".to_string()))?
            .map_err(SdkError::Rpc)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, stop_tx);
        debug!("opened account subscription {} for {}", id, pubkey);

        Ok(SubscriptionHandle { id, pubkey })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let stop = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id);
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
    }
}

#[async_trait]
impl SignatureNotifier for PubsubNotifier {
    async fn subscribe_signature(
        &self,
        signature: Signature,
    ) -> Result<oneshot::Receiver<SignatureStatus>> {
        let client = self.client.clone();
        let config = RpcSignatureSubscribeConfig {
            commitment: Some(self.commitment),
            enable_received_notification: Some(false),
        };
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
        let (status_tx, status_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, unsubscribe) =
                match client.signature_subscribe(&signature, Some(config)).await {
                    Ok(subscription) => {
                        let _ = ready_tx.send(Ok(()));
                        subscription
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return;
                    }
                };

            forward_signature_status(&mut stream, status_tx).await;
            debug!("closing signature subscription for {}", signature);
            unsubscribe().await;
        });

        ready_rx
            .await
            .map_err(|_| SdkError::Rpc("subscription task ended early".to_string()))?
            .map_err(SdkError::Rpc)?;

        Ok(status_rx)
    }
}

/// Sends the first processed status to `status_tx`. Returns early once the receiver is
/// dropped or the stream ends.
async fn forward_signature_status<S>(stream: &mut S, mut status_tx: oneshot::Sender<SignatureStatus>)
where
    S: Stream<Item = Response<RpcSignatureResult>> + Unpin,
{
    loop {
        tokio::select! {
            _ = status_tx.closed() => return,
            next = stream.next() => {
                let Some(response) = next else { return };
                let slot = response.context.slot;
                if let RpcSignatureResult::ProcessedSignature(processed) = response.value {
                    let status = match processed.err {
                        Some(err) => SignatureStatus::Failed {
                            slot,
                            reason: err.to_string(),
                        },
                        None => SignatureStatus::Confirmed { slot },
                    };
                    let _ = status_tx.send(status);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use solana_rpc_client_api::response::{
        ProcessedSignatureResult, ReceivedSignatureResult, RpcResponseContext,
    };
    use std::time::Duration;

    fn notification(slot: u64, value: RpcSignatureResult) -> Response<RpcSignatureResult> {
        Response {
            context: RpcResponseContext {
                slot,
                api_version: None,
            },
            value,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_signature_wait_ends_the_subscription() {
        let mut silent = stream::pending::<Response<RpcSignatureResult>>();
        let (status_tx, status_rx) = oneshot::channel();
        drop(status_rx);

        let forwarded = tokio::time::timeout(
            Duration::from_secs(1),
            forward_signature_status(&mut silent, status_tx),
        )
        .await;
        assert!(forwarded.is_ok());
    }

    #[tokio::test]
    async fn processed_notification_is_forwarded() {
        let mut notifications = stream::iter(vec![
            notification(
                40,
                RpcSignatureResult::ReceivedSignature(ReceivedSignatureResult::ReceivedSignature),
            ),
            notification(
                41,
                RpcSignatureResult::ProcessedSignature(ProcessedSignatureResult { err: None }),
            ),
        ]);
        let (status_tx, status_rx) = oneshot::channel();

        forward_signature_status(&mut notifications, status_tx).await;
        assert_eq!(status_rx.await.unwrap(), SignatureStatus::Confirmed { slot: 41 });
    }
}
