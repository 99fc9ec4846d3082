//! Block-by-block registry state transitions
//!
//! `apply_block` turns the snapshot of a block's parent into the snapshot
//! of the block, together with the undo record that inverts the step.
//! Nothing is published unless the whole block is valid.

use crate::activation::{ActivationGate, ActivationState, SporkValues};
use crate::commitment::{build_commitment, verify_commitment};
use crate::config::RegistryConfig;
use crate::payments::{check_coinbase_payee, PaymentSelector};
use crate::snapshot::{MasternodeEntry, Snapshot, UndoChange, UndoRecord};
use crate::specialtx::{
    self, CommitmentPayload, RegistrationPayload, RevocationPayload, ServiceUpdatePayload, SpecialTx,
    SpecialTxKind, MAX_REVOCATION_REASON,
};
use crate::transaction::{Block, Coin, CoinView, Transaction};
use crate::types::{BlockHeight, KeyId, OutPoint, Service};
use crate::{DmnError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// Operator reward ceiling, 100% in hundredths of a percent
const MAX_OPERATOR_REWARD: u16 = 10_000;

/// Everything a block transition reads besides the parent snapshot
#[derive(Clone, Copy)]
pub struct BlockContext<'a> {
    /// Activation state as of the parent block
    pub gate: &'a ActivationGate,
    /// Registry consensus parameters
    pub params: &'a RegistryConfig,
    /// Unspent outputs as of the parent block
    pub coins: &'a dyn CoinView,
    /// Deterministic-mode and enforcement heights
    pub sporks: SporkValues,
}

/// Result of connecting one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Snapshot after the block
    pub snapshot: Snapshot,
    /// Patch restoring the parent snapshot
    pub undo: UndoRecord,
    /// Entry the block owed the masternode payment to
    pub payee: Option<OutPoint>,
}

/// Which consensus checks to run after the state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Checks {
    All,
    StateOnly,
}

/// Mutable copy of the entry map that remembers the first value of every
/// key it touches
struct WorkingSet {
    entries: BTreeMap<OutPoint, MasternodeEntry>,
    prior: BTreeMap<OutPoint, Option<MasternodeEntry>>,
    services: HashMap<Service, OutPoint>,
    keys: HashMap<KeyId, OutPoint>,
}

impl WorkingSet {
    fn new(snapshot: &Snapshot) -> Self {
        let entries = snapshot.entries().clone();
        let mut services = HashMap::new();
        let mut keys = HashMap::new();
        for entry in entries.values() {
            if !entry.service.is_null() {
                services.insert(entry.service, entry.collateral);
            }
            keys.insert(entry.owner_key, entry.collateral);
            keys.insert(entry.operator_key, entry.collateral);
        }
        Self {
            entries,
            prior: BTreeMap::new(),
            services,
            keys,
        }
    }

    fn remember(&mut self, collateral: OutPoint) {
        if !self.prior.contains_key(&collateral) {
            let before = self.entries.get(&collateral).cloned();
            self.prior.insert(collateral, before);
        }
    }

    fn contains(&self, collateral: &OutPoint) -> bool {
        self.entries.contains_key(collateral)
    }

    fn insert(&mut self, entry: MasternodeEntry) {
        self.remember(entry.collateral);
        if !entry.service.is_null() {
            self.services.insert(entry.service, entry.collateral);
        }
        self.keys.insert(entry.owner_key, entry.collateral);
        self.keys.insert(entry.operator_key, entry.collateral);
        self.entries.insert(entry.collateral, entry);
    }

    fn remove(&mut self, collateral: &OutPoint) -> Option<MasternodeEntry> {
        if !self.contains(collateral) {
            return None;
        }
        self.remember(*collateral);
        let entry = self.entries.remove(collateral)?;
        if self.services.get(&entry.service) == Some(collateral) {
            self.services.remove(&entry.service);
        }
        for key in [entry.owner_key, entry.operator_key] {
            if self.keys.get(&key) == Some(collateral) {
                self.keys.remove(&key);
            }
        }
        Some(entry)
    }

    /// Mutate an entry, keeping the service index in step
    fn update<F>(&mut self, collateral: &OutPoint, f: F) -> Result<()>
    where
        F: FnOnce(&mut MasternodeEntry),
    {
        if !self.contains(collateral) {
            return Err(DmnError::UnknownMasternode(*collateral));
        }
        self.remember(*collateral);
        let entry = self
            .entries
            .get_mut(collateral)
            .ok_or(DmnError::UnknownMasternode(*collateral))?;

        let old_service = entry.service;
        f(entry);
        let new_service = entry.service;

        if old_service != new_service {
            if self.services.get(&old_service) == Some(collateral) {
                self.services.remove(&old_service);
            }
            if !new_service.is_null() {
                self.services.insert(new_service, *collateral);
            }
        }
        Ok(())
    }

    fn service_owner(&self, service: &Service) -> Option<OutPoint> {
        if service.is_null() {
            return None;
        }
        self.services.get(service).copied()
    }

    fn finish(self, height: BlockHeight, block: &Block) -> (Snapshot, UndoRecord) {
        let changes = self
            .prior
            .into_iter()
            .filter(|(collateral, prior)| self.entries.get(collateral) != prior.as_ref())
            .map(|(collateral, prior)| UndoChange { collateral, prior })
            .collect();

        let undo = UndoRecord {
            height,
            block_hash: block.hash,
            prev_block_hash: block.prev_hash,
            changes,
        };
        (Snapshot::from_parts(height, block.hash, self.entries), undo)
    }
}

/// Outputs created and spent so far inside the block being connected
#[derive(Default)]
struct BlockCoins {
    created: HashMap<OutPoint, Coin>,
    spent: HashSet<OutPoint>,
}

impl BlockCoins {
    fn lookup(&self, outpoint: &OutPoint, view: &dyn CoinView) -> Option<Coin> {
        if self.spent.contains(outpoint) {
            return None;
        }
        self.created.get(outpoint).cloned().or_else(|| view.coin(outpoint))
    }

    fn spend_inputs(&mut self, tx: &Transaction) {
        for input in &tx.inputs {
            if self.created.remove(input).is_none() {
                self.spent.insert(*input);
            }
        }
    }

    fn add_outputs(&mut self, tx: &Transaction, height: BlockHeight) {
        for (index, output) in tx.outputs.iter().enumerate() {
            self.created.insert(
                tx.outpoint(index as u32),
                Coin {
                    value: output.value,
                    script: output.script.clone(),
                    height,
                },
            );
        }
    }
}

/// Connect `block` on top of `prev`
pub fn apply_block(prev: &Snapshot, block: &Block, ctx: &BlockContext<'_>) -> Result<Transition> {
    transition(prev, block, ctx, Checks::All)
}

/// Commitment a block with these transactions must carry.
///
/// Runs the state change without the commitment and payee checks, so a
/// block template can be completed before it is connected.
pub fn expected_commitment(prev: &Snapshot, block: &Block, ctx: &BlockContext<'_>) -> Result<CommitmentPayload> {
    let transition = transition(prev, block, ctx, Checks::StateOnly)?;
    Ok(build_commitment(&transition.snapshot))
}

/// Disconnect the block `undo` was recorded for
pub fn revert_block(current: &Snapshot, undo: &UndoRecord) -> Result<Snapshot> {
    current.apply_undo(undo)
}

fn transition(prev: &Snapshot, block: &Block, ctx: &BlockContext<'_>, checks: Checks) -> Result<Transition> {
    let height = block.height;
    if block.prev_hash != prev.block_hash() || prev.height().checked_add(1) != Some(height) {
        return Err(DmnError::NonContiguousBlock {
            expected: format!("{} at height {}", prev.block_hash(), prev.height()),
            found: format!("{} at height {}", block.prev_hash, height.saturating_sub(1)),
        });
    }

    let selector = PaymentSelector::from_config(ctx.params);
    let payee = selector.winner(prev);

    let mut working = WorkingSet::new(prev);
    let mut block_coins = BlockCoins::default();
    let mut commitment = None;

    for (position, tx) in block.transactions.iter().enumerate() {
        // Spending a collateral removes its entry, whatever else the tx does
        for input in &tx.inputs {
            if let Some(removed) = working.remove(input) {
                debug!("Collateral {} spent by {}, removing masternode", removed.collateral, tx.txid);
            }
        }
        // A registration cannot lock up an output its own transaction spends
        block_coins.spend_inputs(tx);

        if let Some(special) = specialtx::decode_transaction(tx)? {
            let kind = special.kind();
            ctx.gate.check(kind, height).map_err(|e| match (kind, e) {
                (SpecialTxKind::Registration, DmnError::NotYetActive { height, state }) => {
                    DmnError::BelowActivation { height, state }
                }
                (_, e) => e,
            })?;

            if tx.is_coinbase() != (kind == SpecialTxKind::Commitment) {
                return Err(DmnError::InvalidPayload(format!(
                    "{:?} payload in {} transaction {}",
                    kind,
                    if tx.is_coinbase() { "coinbase" } else { "non-coinbase" },
                    tx.txid
                )));
            }

            match special {
                SpecialTx::Registration(payload) => {
                    apply_registration(&mut working, &block_coins, tx, &payload, height, ctx)?
                }
                SpecialTx::ServiceUpdate(payload) => apply_service_update(&mut working, tx, &payload, height, ctx)?,
                SpecialTx::Revocation(payload) => apply_revocation(&mut working, tx, &payload, height)?,
                SpecialTx::Commitment(payload) => {
                    if position != 0 {
                        return Err(DmnError::InvalidPayload(
                            "commitment outside the first transaction".to_string(),
                        ));
                    }
                    commitment = Some(payload);
                }
            }
        }

        block_coins.add_outputs(tx, height);
    }

    if let Some(collateral) = payee {
        if working.contains(&collateral) {
            working.update(&collateral, |entry| entry.last_paid_height = height)?;
        }
    }

    let (snapshot, undo) = working.finish(height, block);

    if checks == Checks::All {
        if ctx.gate.state_at(height) == Some(ActivationState::Active) {
            let payload = commitment.ok_or(DmnError::MissingCommitment(height))?;
            verify_commitment(&snapshot, &payload)?;
        }
        check_payee(prev, block, payee, &selector, ctx)?;
    }

    Ok(Transition { snapshot, undo, payee })
}

fn check_payee(
    prev: &Snapshot,
    block: &Block,
    payee: Option<OutPoint>,
    selector: &PaymentSelector,
    ctx: &BlockContext<'_>,
) -> Result<()> {
    let height = block.height;
    if !ctx.sporks.deterministic_active(height) {
        return Ok(());
    }
    let Some(entry) = payee.and_then(|collateral| prev.get(&collateral)) else {
        return Ok(());
    };

    let expected = selector.expected_outputs(entry, block.reward);
    let paid = block
        .coinbase()
        .is_some_and(|coinbase| check_coinbase_payee(coinbase, &expected));
    if paid {
        return Ok(());
    }

    if ctx.sporks.enforcement_active(height) {
        return Err(DmnError::BadPayee {
            height,
            expected: entry.collateral,
        });
    }
    warn!(
        "Block {} at height {} does not pay masternode {}, enforcement off",
        block.hash, height, entry.collateral
    );
    Ok(())
}

fn check_inputs_hash(tx: &Transaction, claimed: &crate::types::Hash256) -> Result<()> {
    if tx.inputs_hash() != *claimed {
        return Err(DmnError::InputsHashMismatch(tx.txid));
    }
    Ok(())
}

fn check_protocol_version(version: u32, params: &RegistryConfig) -> Result<()> {
    if version != 0 && !(params.min_protocol_version..=params.max_protocol_version).contains(&version) {
        return Err(DmnError::InvalidPayload(format!(
            "protocol version {} outside {}..={}",
            version, params.min_protocol_version, params.max_protocol_version
        )));
    }
    Ok(())
}

fn apply_registration(
    working: &mut WorkingSet,
    block_coins: &BlockCoins,
    tx: &Transaction,
    payload: &RegistrationPayload,
    height: BlockHeight,
    ctx: &BlockContext<'_>,
) -> Result<()> {
    check_inputs_hash(tx, &payload.inputs_hash)?;

    if payload.owner_key.is_null() || payload.operator_key.is_null() || payload.voting_key.is_null() {
        return Err(DmnError::InvalidPayload("null key in registration".to_string()));
    }
    if payload.operator_reward > MAX_OPERATOR_REWARD {
        return Err(DmnError::InvalidPayload(format!(
            "operator reward {} above {}",
            payload.operator_reward, MAX_OPERATOR_REWARD
        )));
    }
    if payload.payout_script.is_empty() {
        return Err(DmnError::InvalidPayload("empty payout script".to_string()));
    }
    check_protocol_version(payload.protocol_version, ctx.params)?;

    // Internal collateral points at one of the registration's own outputs
    let (collateral, coin) = if payload.collateral_outpoint.is_null() {
        let index = payload.collateral_outpoint.index;
        let output = tx.outputs.get(index as usize).ok_or_else(|| {
            DmnError::InvalidCollateral(format!("output {} missing from {}", index, tx.txid))
        })?;
        let coin = Coin {
            value: output.value,
            script: output.script.clone(),
            height,
        };
        (tx.outpoint(index), coin)
    } else {
        let collateral = payload.collateral_outpoint;
        let coin = block_coins
            .lookup(&collateral, ctx.coins)
            .ok_or_else(|| DmnError::InvalidCollateral(format!("{} is not unspent", collateral)))?;
        (collateral, coin)
    };

    let amount = ctx.params.collateral_amount;
    if coin.value != amount || payload.collateral_amount != amount {
        return Err(DmnError::InvalidCollateral(format!(
            "{} holds {}, payload claims {}, required {}",
            collateral, coin.value, payload.collateral_amount, amount
        )));
    }
    if coin.script != payload.collateral_script {
        return Err(DmnError::InvalidCollateral(format!(
            "{} does not pay the declared collateral script",
            collateral
        )));
    }

    // Grandfathered and fresh collateral are admitted alike; the label is logged only
    let admission = ctx.gate.check_registration(height, coin.height)?;

    if working.contains(&collateral) {
        return Err(DmnError::DuplicateCollateral(collateral));
    }
    if working.service_owner(&payload.service).is_some() {
        return Err(DmnError::DuplicateService(payload.service.to_string()));
    }
    for key in [payload.owner_key, payload.operator_key] {
        if working.keys.contains_key(&key) {
            return Err(DmnError::DuplicateKey(key.to_string()));
        }
    }

    let mut entry = MasternodeEntry {
        collateral,
        registration_txid: tx.txid,
        owner_key: payload.owner_key,
        operator_key: payload.operator_key,
        voting_key: payload.voting_key,
        service: payload.service,
        protocol_version: payload.protocol_version,
        payout_script: payload.payout_script.clone(),
        operator_payout_script: crate::types::Script::new(),
        operator_reward: payload.operator_reward,
        registered_height: height,
        collateral_height: coin.height,
        last_paid_height: 0,
        pose_revived_height: None,
        pose_ban_height: None,
        revocation_reason: 0,
    };
    if entry.service.is_null() || entry.protocol_version == 0 {
        entry.ban_if_not_banned(height);
    }

    debug!(
        "Registered masternode {} at height {} ({:?})",
        collateral, height, admission
    );
    working.insert(entry);
    Ok(())
}

fn apply_service_update(
    working: &mut WorkingSet,
    tx: &Transaction,
    payload: &ServiceUpdatePayload,
    height: BlockHeight,
    ctx: &BlockContext<'_>,
) -> Result<()> {
    let collateral = payload.collateral_outpoint;
    if !working.contains(&collateral) {
        return Err(DmnError::UnknownMasternode(collateral));
    }
    check_inputs_hash(tx, &payload.inputs_hash)?;

    if payload.service.is_null() || payload.protocol_version == 0 {
        return Err(DmnError::InvalidPayload(
            "service update without service or protocol version".to_string(),
        ));
    }
    check_protocol_version(payload.protocol_version, ctx.params)?;

    if let Some(owner) = working.service_owner(&payload.service) {
        if owner != collateral {
            return Err(DmnError::DuplicateService(payload.service.to_string()));
        }
    }

    working.update(&collateral, |entry| {
        entry.service = payload.service;
        entry.protocol_version = payload.protocol_version;
        entry.operator_payout_script = payload.operator_payout_script.clone();
        entry.revive(height);
    })?;
    debug!("Service update for masternode {} at height {}", collateral, height);
    Ok(())
}

fn apply_revocation(
    working: &mut WorkingSet,
    tx: &Transaction,
    payload: &RevocationPayload,
    height: BlockHeight,
) -> Result<()> {
    let collateral = payload.collateral_outpoint;
    if !working.contains(&collateral) {
        return Err(DmnError::UnknownMasternode(collateral));
    }
    check_inputs_hash(tx, &payload.inputs_hash)?;

    if payload.reason > MAX_REVOCATION_REASON {
        return Err(DmnError::InvalidPayload(format!(
            "revocation reason {} above {}",
            payload.reason, MAX_REVOCATION_REASON
        )));
    }

    working.update(&collateral, |entry| {
        entry.reset_operator_fields();
        entry.revocation_reason = payload.reason;
        entry.ban_if_not_banned(height);
    })?;
    debug!("Operator of masternode {} revoked at height {}", collateral, height);
    Ok(())
}
