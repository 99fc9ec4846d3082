//! Active chain tip management
//!
//! The manager owns the snapshot of the active tip, the activation gate fed
//! by its blocks and the undo store. Blocks are connected and disconnected
//! one at a time; competing branches are evaluated off to the side and
//! swapped in whole.

use crate::activation::{ActivationGate, ActivationState, SporkValues};
use crate::config::DmnConfig;
use crate::payments::PaymentSelector;
use crate::registry::{self, BlockContext, Transition};
use crate::snapshot::{Snapshot, UndoRecord};
use crate::storage::{StoredTip, UndoStore};
use crate::transaction::{Block, CoinView};
use crate::types::{BlockHash, BlockHeight, OutPoint};
use crate::{DmnError, Result};
use tracing::{debug, error, info, warn};

/// A branch evaluated against the active tip but not yet activated
#[derive(Debug, Clone)]
pub struct BranchCandidate {
    /// Active tip the branch was evaluated against
    base_tip: BlockHash,
    fork_height: BlockHeight,
    /// Undo records of the active blocks the branch replaces, tip first
    replaced: Vec<UndoRecord>,
    /// Undo records of the branch blocks, ascending
    connected: Vec<UndoRecord>,
    snapshot: Snapshot,
    gate: ActivationGate,
}

impl BranchCandidate {
    /// Snapshot at the branch tip
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Height of the common ancestor with the active chain
    pub fn fork_height(&self) -> BlockHeight {
        self.fork_height
    }

    /// Height of the branch tip
    pub fn tip_height(&self) -> BlockHeight {
        self.snapshot.height()
    }
}

/// Registry state of the active chain
pub struct MasternodeManager<S: UndoStore> {
    config: DmnConfig,
    store: S,
    genesis_hash: BlockHash,
    snapshot: Snapshot,
    gate: ActivationGate,
}

impl<S: UndoStore> MasternodeManager<S> {
    /// Resume from `store`, or start at genesis when it is empty
    pub fn open(config: DmnConfig, mut store: S, genesis_hash: BlockHash) -> Result<Self> {
        config.validate()?;

        let Some(tip) = store.load_tip()? else {
            let mut gate = ActivationGate::new(config.activation.clone());
            gate.push_block(0, false)?;
            let snapshot = Snapshot::empty(genesis_hash);
            store.save_tip(&StoredTip {
                snapshot: snapshot.clone(),
                signals: gate.signals().to_vec(),
                genesis_hash,
            })?;
            info!("Initialized masternode registry at genesis {}", genesis_hash);
            return Ok(Self {
                config,
                store,
                genesis_hash,
                snapshot,
                gate,
            });
        };

        if tip.genesis_hash != genesis_hash {
            return Err(DmnError::Storage(format!(
                "stored registry belongs to genesis {}, not {}",
                tip.genesis_hash, genesis_hash
            )));
        }
        if tip.signals.len() != tip.snapshot.height() as usize + 1 {
            return Err(DmnError::CorruptUndoRecord(format!(
                "tip at height {} carries {} activation signals",
                tip.snapshot.height(),
                tip.signals.len()
            )));
        }

        let gate = ActivationGate::from_signals(config.activation.clone(), &tip.signals)?;
        let manager = Self {
            config,
            store,
            genesis_hash,
            snapshot: tip.snapshot,
            gate,
        };
        manager.check_undo_chain()?;

        info!(
            "Resumed masternode registry at height {} ({} entries)",
            manager.snapshot.height(),
            manager.snapshot.len()
        );
        Ok(manager)
    }

    /// Active configuration
    pub fn config(&self) -> &DmnConfig {
        &self.config
    }

    /// Underlying undo store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Genesis block hash
    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis_hash
    }

    /// Snapshot of the active tip
    pub fn tip(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Height of the active tip
    pub fn tip_height(&self) -> BlockHeight {
        self.snapshot.height()
    }

    /// Activation gate of the active chain
    pub fn gate(&self) -> &ActivationGate {
        &self.gate
    }

    /// Activation state that applies to the next block
    pub fn activation_state(&self) -> ActivationState {
        self.gate
            .state_at(self.tip_height().saturating_add(1))
            .unwrap_or(ActivationState::Defined)
    }

    /// Whether the registry is authoritative for the next block
    pub fn is_deterministic_mode(&self, sporks: &SporkValues) -> bool {
        sporks.deterministic_active(self.tip_height().saturating_add(1))
    }

    /// Payee selector configured for this chain
    pub fn selector(&self) -> PaymentSelector {
        PaymentSelector::from_config(&self.config.registry)
    }

    /// Payee of the next block
    pub fn next_payee(&self) -> Option<OutPoint> {
        self.selector().winner(&self.snapshot)
    }

    /// Lowest height the active chain can be reverted to
    pub fn oldest_revertible(&self) -> BlockHeight {
        self.tip_height().saturating_sub(self.config.registry.max_reorg_depth)
    }

    /// Verify that every undo record within the reorg depth is present and
    /// chains back from the tip
    pub fn check_undo_chain(&self) -> Result<()> {
        let mut expected_hash = self.snapshot.block_hash();
        for height in (self.oldest_revertible() + 1..=self.tip_height()).rev() {
            let record = self.store.get(height)?.ok_or_else(|| {
                error!("Undo record for height {} lost within reorg depth", height);
                DmnError::UndoRecordMissing(height)
            })?;
            if record.block_hash != expected_hash {
                return Err(DmnError::CorruptUndoRecord(format!(
                    "undo record at height {} is for block {}, expected {}",
                    height, record.block_hash, expected_hash
                )));
            }
            expected_hash = record.prev_block_hash;
        }
        Ok(())
    }

    /// Connect `block` on top of the active tip
    pub fn connect_block(&mut self, block: &Block, coins: &dyn CoinView, sporks: SporkValues) -> Result<Transition> {
        let ctx = BlockContext {
            gate: &self.gate,
            params: &self.config.registry,
            coins,
            sporks,
        };
        let transition = registry::apply_block(&self.snapshot, block, &ctx)?;

        self.store.put(&transition.undo)?;
        self.gate
            .push_block(block.height, block.signals(self.config.activation.signal_bit))?;

        if let Err(e) = self.save_tip(&transition.snapshot) {
            self.gate.pop_block();
            if let Err(cleanup) = self.store.remove(block.height) {
                warn!("Failed to drop undo record {} after failed connect: {}", block.height, cleanup);
            }
            return Err(e);
        }

        self.snapshot = transition.snapshot.clone();
        self.prune(self.tip_height())?;

        debug!(
            "Connected block {} at height {} ({} entries, {} changes)",
            block.hash,
            block.height,
            self.snapshot.len(),
            transition.undo.changes.len()
        );
        Ok(transition)
    }

    /// Disconnect the active tip, returning the restored snapshot
    pub fn disconnect_tip(&mut self) -> Result<Snapshot> {
        let target = self.tip_height().checked_sub(1).ok_or(DmnError::ReorgTooDeep {
            height: 0,
            oldest: 0,
        })?;
        self.revert_to(target)?;
        Ok(self.snapshot.clone())
    }

    /// Disconnect blocks until `height` is the active tip
    pub fn revert_to(&mut self, height: BlockHeight) -> Result<()> {
        let old_tip = self.tip_height();
        let records = self.collect_undo(height)?;
        let (snapshot, gate) = unwind(&self.snapshot, &self.gate, &records)?;

        self.save_tip_with(&snapshot, &gate)?;
        for record in &records {
            self.store.remove(record.height)?;
        }

        self.snapshot = snapshot;
        self.gate = gate;
        if old_tip != height {
            info!("Reverted registry from height {} to {}", old_tip, height);
        }
        Ok(())
    }

    /// Apply a competing branch forking at `fork_height` without touching
    /// the active tip
    pub fn evaluate_branch(
        &self,
        fork_height: BlockHeight,
        blocks: &[Block],
        coins: &dyn CoinView,
        sporks: SporkValues,
    ) -> Result<BranchCandidate> {
        let replaced = self.collect_undo(fork_height)?;
        let (mut snapshot, mut gate) = unwind(&self.snapshot, &self.gate, &replaced)?;

        let mut connected = Vec::with_capacity(blocks.len());
        for block in blocks {
            let ctx = BlockContext {
                gate: &gate,
                params: &self.config.registry,
                coins,
                sporks,
            };
            let transition = registry::apply_block(&snapshot, block, &ctx)?;
            gate.push_block(block.height, block.signals(self.config.activation.signal_bit))?;
            snapshot = transition.snapshot;
            connected.push(transition.undo);
        }

        Ok(BranchCandidate {
            base_tip: self.snapshot.block_hash(),
            fork_height,
            replaced,
            connected,
            snapshot,
            gate,
        })
    }

    /// Make an evaluated branch the active chain
    pub fn activate(&mut self, candidate: BranchCandidate) -> Result<()> {
        if candidate.base_tip != self.snapshot.block_hash() {
            return Err(DmnError::StaleBranch(candidate.base_tip));
        }

        let old_tip = self.tip_height();
        if let Err(e) = self.persist_branch(&candidate, old_tip) {
            self.restore_records(&candidate, old_tip);
            return Err(e);
        }

        info!(
            "Activated branch forking at height {}: tip {} -> {} at height {}",
            candidate.fork_height,
            self.snapshot.block_hash(),
            candidate.snapshot.block_hash(),
            candidate.snapshot.height()
        );
        self.snapshot = candidate.snapshot;
        self.gate = candidate.gate;
        self.prune_below(self.oldest_revertible())?;
        Ok(())
    }

    /// Evaluate and activate a competing branch in one step
    pub fn reorganize(
        &mut self,
        fork_height: BlockHeight,
        blocks: &[Block],
        coins: &dyn CoinView,
        sporks: SporkValues,
    ) -> Result<()> {
        let candidate = self.evaluate_branch(fork_height, blocks, coins, sporks)?;
        self.activate(candidate)
    }

    fn persist_branch(&mut self, candidate: &BranchCandidate, old_tip: BlockHeight) -> Result<()> {
        for record in &candidate.connected {
            self.store.put(record)?;
        }
        for height in candidate.tip_height() + 1..=old_tip {
            self.store.remove(height)?;
        }
        self.save_tip_with(&candidate.snapshot, &candidate.gate)
    }

    /// Put back the records a failed activation may have overwritten
    fn restore_records(&mut self, candidate: &BranchCandidate, old_tip: BlockHeight) {
        for record in &candidate.connected {
            if record.height > old_tip {
                if let Err(e) = self.store.remove(record.height) {
                    warn!("Failed to drop branch undo record {}: {}", record.height, e);
                }
            }
        }
        for record in &candidate.replaced {
            if let Err(e) = self.store.put(record) {
                error!("Failed to restore undo record {}: {}", record.height, e);
            }
        }
    }

    /// Undo records needed to revert to `height`, tip first
    fn collect_undo(&self, height: BlockHeight) -> Result<Vec<UndoRecord>> {
        let tip = self.tip_height();
        if height > tip {
            return Err(DmnError::NonContiguousBlock {
                expected: format!("height at most {}", tip),
                found: height.to_string(),
            });
        }
        let oldest = self.oldest_revertible();
        if height < oldest {
            return Err(DmnError::ReorgTooDeep { height, oldest });
        }

        let mut records = Vec::with_capacity((tip - height) as usize);
        for h in (height + 1..=tip).rev() {
            let record = self.store.get(h)?.ok_or_else(|| {
                error!("Undo record for height {} lost within reorg depth", h);
                DmnError::UndoRecordMissing(h)
            })?;
            records.push(record);
        }
        Ok(records)
    }

    fn save_tip(&mut self, snapshot: &Snapshot) -> Result<()> {
        let tip = StoredTip {
            snapshot: snapshot.clone(),
            signals: self.gate.signals().to_vec(),
            genesis_hash: self.genesis_hash,
        };
        self.store.save_tip(&tip)
    }

    fn save_tip_with(&mut self, snapshot: &Snapshot, gate: &ActivationGate) -> Result<()> {
        let tip = StoredTip {
            snapshot: snapshot.clone(),
            signals: gate.signals().to_vec(),
            genesis_hash: self.genesis_hash,
        };
        self.store.save_tip(&tip)
    }

    /// Drop the record that just left the reorg window
    fn prune(&mut self, tip: BlockHeight) -> Result<()> {
        let depth = self.config.registry.max_reorg_depth;
        if tip > depth {
            self.store.remove(tip - depth)?;
        }
        Ok(())
    }

    fn prune_below(&mut self, cutoff: BlockHeight) -> Result<()> {
        for height in self.store.heights()? {
            if height > cutoff {
                break;
            }
            self.store.remove(height)?;
        }
        Ok(())
    }
}

/// Revert `snapshot` and `gate` through `records`, tip first
fn unwind(
    snapshot: &Snapshot,
    gate: &ActivationGate,
    records: &[UndoRecord],
) -> Result<(Snapshot, ActivationGate)> {
    let mut snapshot = snapshot.clone();
    let mut gate = gate.clone();
    for record in records {
        snapshot = registry::revert_block(&snapshot, record)?;
        gate.pop_block();
    }
    Ok((snapshot, gate))
}
