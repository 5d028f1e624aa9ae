use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Result;
use futures_util::future::try_join_all;
use log::debug;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::oneshot;

use crate::{
    constants::MAX_MULTIPLE_ACCOUNTS, error::SdkError, rpc::LedgerRpc, types::DataAndSlot,
};

type LoadResult = Result<DataAndSlot<Option<Vec<u8>>>, SdkError>;

struct PendingLoad {
    pubkey: Pubkey,
    reply: oneshot::Sender<LoadResult>,
}

/// Coalesces single-account loads issued within `delay` into one
/// `get_multiple_accounts` round trip.
pub struct BatchAccountLoader {
    rpc: Arc<dyn LedgerRpc>,
    delay: Duration,
    pending: Arc<Mutex<Vec<PendingLoad>>>,
}

impl BatchAccountLoader {
    pub fn new(rpc: Arc<dyn LedgerRpc>, delay: Duration) -> Self {
        Self {
            rpc,
            delay,
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Loads one account. Calls made while a batch is pending join that batch and
    /// resolve with the slot shared by the whole batch.
    pub async fn load(&self, pubkey: Pubkey) -> Result<DataAndSlot<Option<Vec<u8>>>> {
        let (reply, receiver) = oneshot::channel();

        let starts_batch = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.push(PendingLoad { pubkey, reply });
            pending.len() == 1
        };

        if starts_batch {
            let rpc = self.rpc.clone();
            let pending = self.pending.clone();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let batch = std::mem::take(
                    &mut *pending.lock().unwrap_or_else(PoisonError::into_inner),
                );
                Self::flush(rpc.as_ref(), batch).await;
            });
        }

        let loaded = receiver
            .await
            .map_err(|_| SdkError::Rpc("batch loader dropped the request".to_string()))??;
        Ok(loaded)
    }

    async fn flush(rpc: &dyn LedgerRpc, batch: Vec<PendingLoad>) {
        let mut pubkeys: Vec<Pubkey> = Vec::with_capacity(batch.len());
        for load in &batch {
            if !pubkeys.contains(&load.pubkey) {
                pubkeys.push(load.pubkey);
            }
        }
        debug!(
            "flushing {} coalesced loads as {} accounts",
            batch.len(),
            pubkeys.len()
        );

        match load_chunked(rpc, &pubkeys).await {
            Ok(loaded) => {
                for load in batch {
                    let position = pubkeys.iter().position(|p| *p == load.pubkey);
                    let data = position.and_then(|i| loaded.data.get(i).cloned().flatten());
                    let _ = load.reply.send(Ok(DataAndSlot::new(data, loaded.slot)));
                }
            }
            Err(err) => {
                let err = match err.downcast::<SdkError>() {
                    Ok(sdk_err) => sdk_err,
                    Err(other) => SdkError::Rpc(other.to_string()),
                };
                for load in batch {
                    let _ = load.reply.send(Err(err.clone()));
                }
            }
        }
    }

    /// Loads many accounts at once, in requests of at most `MAX_MULTIPLE_ACCOUNTS`.
    pub async fn load_many(&self, pubkeys: &[Pubkey]) -> Result<DataAndSlot<Vec<Option<Vec<u8>>>>> {
        load_chunked(self.rpc.as_ref(), pubkeys).await
    }
}

/// Chunks are requested concurrently. The result is stamped with the lowest slot
/// any chunk was served at, so no account claims to be newer than it is.
async fn load_chunked(
    rpc: &dyn LedgerRpc,
    pubkeys: &[Pubkey],
) -> Result<DataAndSlot<Vec<Option<Vec<u8>>>>> {
    if pubkeys.is_empty() {
        return Ok(DataAndSlot::new(Vec::new(), 0));
    }

    let chunks = try_join_all(pubkeys.chunks(MAX_MULTIPLE_ACCOUNTS).map(|chunk| async move {
        let loaded = rpc.get_multiple_accounts(chunk).await?;
        if loaded.data.len() != chunk.len() {
            return Err(SdkError::Rpc(format!(
                "asked for {} accounts, got {}",
                chunk.len(),
                loaded.data.len()
            ))
            .into());
        }
        Ok::<_, anyhow::Error>(loaded)
    }))
    .await?;

    let slot = chunks.iter().map(|c| c.slot).min().unwrap_or_default();
    let accounts = chunks.into_iter().flat_map(|c| c.data).collect();
    Ok(DataAndSlot::new(accounts, slot))
}
