use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use log::{debug, warn};
use solana_sdk::{
    address_lookup_table::AddressLookupTableAccount,
    compute_budget::ComputeBudgetInstruction,
    hash::Hash,
    instruction::Instruction,
    message::{Message, VersionedMessage, v0},
    packet::PACKET_DATA_SIZE,
    pubkey::Pubkey,
    signature::Signature,
    transaction::{Transaction, VersionedTransaction},
};
use tokio::sync::OnceCell;

use crate::{
    constants::{DEFAULT_COMPUTE_UNITS, DEFAULT_COMPUTE_UNITS_BUFFER_MULTIPLIER, MAX_COMPUTE_UNITS},
    error::SdkError,
    rpc::LedgerRpc,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionVersion {
    Legacy,
    #[default]
    V0,
}

/// How the compute unit limit is chosen
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeBudgetPolicy {
    Fixed {
        units: u32,
        price: u64, // micro-lamports per unit
    },
    /// Dry-run first and size the limit from the units actually consumed
    Simulated {
        price: u64,
        buffer_multiplier: f64,
        lower_bound: Option<u32>,
        /// Used when the simulation reports no consumption or fails
        fallback_units: u32,
        exit_early_on_failure: bool,
    },
}

impl Default for ComputeBudgetPolicy {
    fn default() -> Self {
        ComputeBudgetPolicy::Fixed {
            units: DEFAULT_COMPUTE_UNITS,
            price: 0,
        }
    }
}

impl ComputeBudgetPolicy {
    pub fn simulated(price: u64) -> Self {
        ComputeBudgetPolicy::Simulated {
            price,
            buffer_multiplier: DEFAULT_COMPUTE_UNITS_BUFFER_MULTIPLIER,
            lower_bound: None,
            fallback_units: DEFAULT_COMPUTE_UNITS,
            exit_early_on_failure: false,
        }
    }
}

/// A transaction in either wire format
#[derive(Debug, Clone, PartialEq)]
pub enum AssembledTransaction {
    Legacy(Transaction),
    Versioned(VersionedTransaction),
}

impl AssembledTransaction {
    pub fn version(&self) -> TransactionVersion {
        match self {
            AssembledTransaction::Legacy(_) => TransactionVersion::Legacy,
            AssembledTransaction::Versioned(_) => TransactionVersion::V0,
        }
    }

    /// First signature, which identifies the transaction once signed
    pub fn signature(&self) -> Signature {
        let signatures = match self {
            AssembledTransaction::Legacy(tx) => &tx.signatures,
            AssembledTransaction::Versioned(tx) => &tx.signatures,
        };
        signatures.first().copied().unwrap_or_default()
    }

    pub fn recent_blockhash(&self) -> Hash {
        match self {
            AssembledTransaction::Legacy(tx) => tx.message.recent_blockhash,
            AssembledTransaction::Versioned(tx) => *tx.message.recent_blockhash(),
        }
    }

    pub fn to_versioned(&self) -> VersionedTransaction {
        match self {
            AssembledTransaction::Legacy(tx) => tx.clone().into(),
            AssembledTransaction::Versioned(tx) => tx.clone(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            AssembledTransaction::Legacy(tx) => bincode::serialize(tx)?,
            AssembledTransaction::Versioned(tx) => bincode::serialize(tx)?,
        };
        Ok(bytes)
    }

    pub fn serialized_size(&self) -> Result<usize> {
        let size = match self {
            AssembledTransaction::Legacy(tx) => bincode::serialized_size(tx)?,
            AssembledTransaction::Versioned(tx) => bincode::serialized_size(tx)?,
        };
        Ok(size as usize)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildResult {
    Ready(AssembledTransaction),
    /// The dry run failed and the policy asked not to build anything
    SimulationFailed { error: String, logs: Vec<String> },
}

impl BuildResult {
    pub fn ready(self) -> Option<AssembledTransaction> {
        match self {
            BuildResult::Ready(tx) => Some(tx),
            BuildResult::SimulationFailed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildParams {
    pub payer: Pubkey,
    pub version: TransactionVersion,
    pub budget: ComputeBudgetPolicy,
    /// V0 only; the market lookup table is used when absent
    pub lookup_tables: Option<Vec<AddressLookupTableAccount>>,
    pub blockhash: Option<Hash>,
}

/// Compute unit limit for a simulated consumption.
///
/// The multiplier is applied in basis points so the result does not depend on float
/// rounding: 250_000 units at 1.2 is exactly 300_000.
pub fn compute_units_from_simulation(consumed: u64, buffer_multiplier: f64, lower_bound: Option<u32>) -> u32 {
    let multiplier_bps = (buffer_multiplier * 10_000.0).round().max(0.0) as u64;
    let buffered = consumed.saturating_mul(multiplier_bps).div_ceil(10_000);
    let floor = lower_bound.map(u64::from).unwrap_or_default();

    buffered.max(floor).min(u64::from(MAX_COMPUTE_UNITS)) as u32
}

/// Builds transactions in either format, with a fixed or simulated compute budget
pub struct TransactionBuilder {
    rpc: Arc<dyn LedgerRpc>,
    market_lookup_table: Pubkey,
    lookup_table: OnceCell<AddressLookupTableAccount>,
}

impl TransactionBuilder {
    pub fn new(rpc: Arc<dyn LedgerRpc>, market_lookup_table: Pubkey) -> Self {
        Self {
            rpc,
            market_lookup_table,
            lookup_table: OnceCell::new(),
        }
    }

    /// Fetches the market lookup table on first use and caches it
    pub async fn fetch_market_lookup_table(&self) -> Result<AddressLookupTableAccount> {
        let table = self
            .lookup_table
            .get_or_try_init(|| self.rpc.get_address_lookup_table(&self.market_lookup_table))
            .await?;
        Ok(table.clone())
    }

    /// Build one transaction
    ///
    /// # Arguments
    /// * `instructions` - program instructions, compute budget instructions are prepended
    /// * `params` - payer, format, budget policy, optional lookup tables and blockhash
    ///
    /// # Returns
    /// `BuildResult::Ready` with an unsigned transaction, or `SimulationFailed` when the
    /// policy simulates, the simulation fails and `exit_early_on_failure` is set
    pub async fn build(&self, instructions: Vec<Instruction>, params: &BuildParams) -> Result<BuildResult> {
        let blockhash = match params.blockhash {
            Some(blockhash) => blockhash,
            None => self.rpc.get_latest_blockhash().await?,
        };
        let lookup_tables = self.lookup_tables_for(params).await?;

        let (units, price) = match &params.budget {
            ComputeBudgetPolicy::Fixed { units, price } => (*units, *price),
            ComputeBudgetPolicy::Simulated {
                price,
                buffer_multiplier,
                lower_bound,
                fallback_units,
                exit_early_on_failure,
            } => {
                let probe = compile(
                    with_compute_budget(&instructions, MAX_COMPUTE_UNITS, *price),
                    params,
                    &lookup_tables,
                    blockhash,
                )?;
                let outcome = self.rpc.simulate(&probe.to_versioned()).await?;

                match (outcome.error, outcome.units_consumed) {
                    (Some(error), _) if *exit_early_on_failure => {
                        warn!("simulation failed, not building: {}", error);
                        return Ok(BuildResult::SimulationFailed {
                            error,
                            logs: outcome.logs,
                        });
                    }
                    (Some(error), _) => {
                        warn!(
                            "simulation failed ({}), using {} compute units",
                            error, fallback_units
                        );
                        (*fallback_units, *price)
                    }
                    (None, Some(consumed)) => {
                        let units =
                            compute_units_from_simulation(consumed, *buffer_multiplier, *lower_bound);
                        debug!("simulation consumed {} units, limit set to {}", consumed, units);
                        (units, *price)
                    }
                    (None, None) => (*fallback_units, *price),
                }
            }
        };

        let tx = compile(
            with_compute_budget(&instructions, units, price),
            params,
            &lookup_tables,
            blockhash,
        )?;

        let size = tx.serialized_size()?;
        if size > PACKET_DATA_SIZE {
            return Err(SdkError::TransactionTooLarge {
                size,
                limit: PACKET_DATA_SIZE,
            }
            .into());
        }

        Ok(BuildResult::Ready(tx))
    }

    /// Builds one transaction per instruction set, all on one fetched blockhash
    pub async fn build_bulk(
        &self,
        instruction_sets: Vec<Vec<Instruction>>,
        params: &BuildParams,
    ) -> Result<Vec<BuildResult>> {
        let params = self.with_shared_blockhash(params).await?;

        let mut results = Vec::with_capacity(instruction_sets.len());
        for instructions in instruction_sets {
            results.push(self.build(instructions, &params).await?);
        }
        Ok(results)
    }

    /// Builds named transactions on one fetched blockhash so they can go out as a group
    pub async fn build_map(
        &self,
        instruction_sets: BTreeMap<String, Vec<Instruction>>,
        params: &BuildParams,
    ) -> Result<BTreeMap<String, BuildResult>> {
        let params = self.with_shared_blockhash(params).await?;

        let mut results = BTreeMap::new();
        for (name, instructions) in instruction_sets {
            let result = self.build(instructions, &params).await?;
            results.insert(name, result);
        }
        Ok(results)
    }

    async fn with_shared_blockhash(&self, params: &BuildParams) -> Result<BuildParams> {
        let mut params = params.clone();
        if params.blockhash.is_none() {
            params.blockhash = Some(self.rpc.get_latest_blockhash().await?);
        }
        Ok(params)
    }

    async fn lookup_tables_for(&self, params: &BuildParams) -> Result<Vec<AddressLookupTableAccount>> {
        match (params.version, &params.lookup_tables) {
            (TransactionVersion::Legacy, _) => Ok(Vec::new()),
            (TransactionVersion::V0, Some(tables)) => Ok(tables.clone()),
            (TransactionVersion::V0, None) => Ok(vec![self.fetch_market_lookup_table().await?]),
        }
    }
}

fn with_compute_budget(instructions: &[Instruction], units: u32, price: u64) -> Vec<Instruction> {
    let mut all = Vec::with_capacity(instructions.len() + 2);
    all.push(ComputeBudgetInstruction::set_compute_unit_limit(units));
    if price > 0 {
        all.push(ComputeBudgetInstruction::set_compute_unit_price(price));
    }
    all.extend_from_slice(instructions);
    all
}

fn compile(
    instructions: Vec<Instruction>,
    params: &BuildParams,
    lookup_tables: &[AddressLookupTableAccount],
    blockhash: Hash,
) -> Result<AssembledTransaction> {
    match params.version {
        TransactionVersion::Legacy => {
            let message = Message::new_with_blockhash(&instructions, Some(&params.payer), &blockhash);
            Ok(AssembledTransaction::Legacy(Transaction::new_unsigned(message)))
        }
        TransactionVersion::V0 => {
            let message = v0::Message::try_compile(&params.payer, &instructions, lookup_tables, blockhash)
                .map_err(|err| SdkError::MessageCompile(err.to_string()))?;
            let message = VersionedMessage::V0(message);
            let signatures = vec![Signature::default(); usize::from(message.header().num_required_signatures)];

            Ok(AssembledTransaction::Versioned(VersionedTransaction { signatures, message }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rpc::SimulationOutcome, test_utils::FakeLedger, utils::compute_unit_limit};
    use assert_matches::assert_matches;
    use solana_sdk::{instruction::AccountMeta, message::VersionedMessage};

    fn program_ix(accounts: usize) -> Instruction {
        Instruction::new_with_bytes(
            Pubkey::new_unique(),
            &[1, 2, 3],
            (0..accounts)
                .map(|_| AccountMeta::new_readonly(Pubkey::new_unique(), false))
                .collect(),
        )
    }

    fn builder(ledger: &Arc<FakeLedger>) -> TransactionBuilder {
        let table = AddressLookupTableAccount {
            key: Pubkey::new_unique(),
            addresses: vec![Pubkey::new_unique(); 4],
        };
        let key = table.key;
        ledger.set_lookup_table(table);
        TransactionBuilder::new(ledger.clone(), key)
    }

    fn legacy(payer: Pubkey, budget: ComputeBudgetPolicy) -> BuildParams {
        BuildParams {
            payer,
            version: TransactionVersion::Legacy,
            budget,
            ..Default::default()
        }
    }

    #[test]
    fn multiplier_is_exact() {
        assert_eq!(compute_units_from_simulation(250_000, 1.2, None), 300_000);
        assert_eq!(compute_units_from_simulation(100_001, 1.0, None), 100_001);
        assert_eq!(compute_units_from_simulation(10_000, 1.2, Some(50_000)), 50_000);
        assert_eq!(compute_units_from_simulation(2_000_000, 1.2, None), MAX_COMPUTE_UNITS);
    }

    #[tokio::test]
    async fn simulate_first_sizes_the_limit() {
        let ledger = Arc::new(FakeLedger::new(1));
        ledger.set_simulation(SimulationOutcome {
            units_consumed: Some(250_000),
            ..Default::default()
        });
        let builder = builder(&ledger);

        let result = builder
            .build(
                vec![program_ix(2)],
                &legacy(Pubkey::new_unique(), ComputeBudgetPolicy::simulated(0)),
            )
            .await
            .unwrap();

        let tx = result.ready().unwrap();
        assert_eq!(compute_unit_limit(&tx.to_versioned().message), Some(300_000));

        // the probe ran with the maximum limit
        let probe = ledger.simulated.lock().unwrap()[0].clone();
        assert_eq!(compute_unit_limit(&probe.message), Some(MAX_COMPUTE_UNITS));
    }

    #[tokio::test]
    async fn failed_simulation_can_stop_the_build() {
        let ledger = Arc::new(FakeLedger::new(1));
        ledger.set_simulation(SimulationOutcome {
            error: Some("custom program error: 0x1771".to_string()),
            logs: vec!["Program log: slippage".to_string()],
            ..Default::default()
        });
        let builder = builder(&ledger);
        let payer = Pubkey::new_unique();

        let stop = ComputeBudgetPolicy::Simulated {
            price: 0,
            buffer_multiplier: 1.2,
            lower_bound: None,
            fallback_units: 400_000,
            exit_early_on_failure: true,
        };
        let result = builder.build(vec![program_ix(1)], &legacy(payer, stop)).await.unwrap();
        assert_matches!(result, BuildResult::SimulationFailed { logs, .. } if logs.len() == 1);

        let carry_on = ComputeBudgetPolicy::Simulated {
            price: 0,
            buffer_multiplier: 1.2,
            lower_bound: None,
            fallback_units: 400_000,
            exit_early_on_failure: false,
        };
        let result = builder.build(vec![program_ix(1)], &legacy(payer, carry_on)).await.unwrap();
        let tx = result.ready().unwrap();
        assert_eq!(compute_unit_limit(&tx.to_versioned().message), Some(400_000));
    }

    #[tokio::test]
    async fn price_instruction_only_when_priced() {
        let ledger = Arc::new(FakeLedger::new(1));
        let builder = builder(&ledger);
        let payer = Pubkey::new_unique();

        let unpriced = builder
            .build(
                vec![program_ix(1)],
                &legacy(payer, ComputeBudgetPolicy::Fixed { units: 200_000, price: 0 }),
            )
            .await
            .unwrap()
            .ready()
            .unwrap();
        let priced = builder
            .build(
                vec![program_ix(1)],
                &legacy(payer, ComputeBudgetPolicy::Fixed { units: 200_000, price: 5_000 }),
            )
            .await
            .unwrap()
            .ready()
            .unwrap();

        assert_matches!(&unpriced, AssembledTransaction::Legacy(tx) if tx.message.instructions.len() == 2);
        assert_matches!(&priced, AssembledTransaction::Legacy(tx) if tx.message.instructions.len() == 3);
    }

    #[tokio::test]
    async fn v0_without_tables_uses_cached_market_table() {
        let ledger = Arc::new(FakeLedger::new(1));
        let builder = builder(&ledger);
        let params = BuildParams {
            payer: Pubkey::new_unique(),
            ..Default::default()
        };

        for _ in 0..3 {
            let tx = builder.build(vec![program_ix(2)], &params).await.unwrap().ready().unwrap();
            assert_eq!(tx.version(), TransactionVersion::V0);
            assert_matches!(
                tx,
                AssembledTransaction::Versioned(VersionedTransaction {
                    message: VersionedMessage::V0(_),
                    ..
                })
            );
        }
        assert_eq!(ledger.lookup_table_calls(), 1);
    }

    #[tokio::test]
    async fn bulk_and_map_share_one_blockhash() {
        let ledger = Arc::new(FakeLedger::new(1));
        let builder = builder(&ledger);
        let params = legacy(Pubkey::new_unique(), ComputeBudgetPolicy::default());

        let bulk = builder
            .build_bulk(vec![vec![program_ix(1)], vec![program_ix(2)], vec![program_ix(3)]], &params)
            .await
            .unwrap();
        assert_eq!(ledger.blockhash_calls(), 1);
        assert!(bulk
            .into_iter()
            .all(|r| r.ready().unwrap().recent_blockhash() == ledger.blockhash()));

        let map = builder
            .build_map(
                BTreeMap::from([
                    ("cancel".to_string(), vec![program_ix(1)]),
                    ("place".to_string(), vec![program_ix(2)]),
                ]),
                &params,
            )
            .await
            .unwrap();
        assert_eq!(ledger.blockhash_calls(), 2);
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["cancel", "place"]);
    }

    #[tokio::test]
    async fn oversized_legacy_transaction_is_rejected() {
        let ledger = Arc::new(FakeLedger::new(1));
        let builder = builder(&ledger);

        let err = builder
            .build(
                vec![program_ix(40)],
                &legacy(Pubkey::new_unique(), ComputeBudgetPolicy::default()),
            )
            .await
            .unwrap_err();
        assert_matches!(
            err.downcast_ref::<SdkError>(),
            Some(SdkError::TransactionTooLarge { limit: PACKET_DATA_SIZE, .. })
        );
    }
}
