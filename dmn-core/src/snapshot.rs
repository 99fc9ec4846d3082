//! Immutable registry snapshots and the undo records between them

use crate::types::{BlockHash, BlockHeight, Hash256, KeyId, OutPoint, Script, Service, Txid};
use crate::{DmnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A registered masternode, keyed by its collateral outpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasternodeEntry {
    /// Funding collateral, immutable for the entry's lifetime
    pub collateral: OutPoint,
    /// Registration transaction
    pub registration_txid: Txid,
    /// Owner identity, unique across the registry
    pub owner_key: KeyId,
    /// Operator identity, unique across the registry
    pub operator_key: KeyId,
    /// Governance voting identity
    pub voting_key: KeyId,
    /// Announced service address, null after revocation
    pub service: Service,
    /// Announced protocol version, 0 after revocation
    pub protocol_version: u32,
    /// Where the owner's share of payments goes
    pub payout_script: Script,
    /// Where the operator's share goes, empty when unset
    pub operator_payout_script: Script,
    /// Operator share in hundredths of a percent
    pub operator_reward: u16,
    /// Height of the registering block
    pub registered_height: BlockHeight,
    /// Confirmation height of the collateral output
    pub collateral_height: BlockHeight,
    /// Height of the last payment, 0 when never paid
    pub last_paid_height: BlockHeight,
    /// Height of the last service update lifting a ban
    pub pose_revived_height: Option<BlockHeight>,
    /// Set while the entry is banned
    pub pose_ban_height: Option<BlockHeight>,
    /// Reason code of the last revocation, 0 when never revoked
    pub revocation_reason: u16,
}

impl MasternodeEntry {
    /// Whether the entry is eligible for listings and payments
    pub fn is_valid(&self) -> bool {
        self.pose_ban_height.is_none()
    }

    /// Ban the entry at `height` unless it already is
    pub fn ban_if_not_banned(&mut self, height: BlockHeight) {
        if self.pose_ban_height.is_none() {
            self.pose_ban_height = Some(height);
        }
    }

    /// Lift a ban at `height`
    pub fn revive(&mut self, height: BlockHeight) {
        if self.pose_ban_height.take().is_some() {
            self.pose_revived_height = Some(height);
        }
    }

    /// Clear everything the operator controls
    pub fn reset_operator_fields(&mut self) {
        self.service = Service::null();
        self.protocol_version = 0;
        self.operator_payout_script = Script::new();
    }
}

/// The full entry set as of one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    height: BlockHeight,
    block_hash: BlockHash,
    entries: Arc<BTreeMap<OutPoint, MasternodeEntry>>,
}

impl Snapshot {
    /// Empty snapshot at genesis
    pub fn empty(genesis_hash: BlockHash) -> Self {
        Self {
            height: 0,
            block_hash: genesis_hash,
            entries: Arc::new(BTreeMap::new()),
        }
    }

    pub(crate) fn from_parts(
        height: BlockHeight,
        block_hash: BlockHash,
        entries: BTreeMap<OutPoint, MasternodeEntry>,
    ) -> Self {
        Self {
            height,
            block_hash,
            entries: Arc::new(entries),
        }
    }

    /// Height of the block this snapshot follows
    pub fn height(&self) -> BlockHeight {
        self.height
    }

    /// Hash of the block this snapshot follows
    pub fn block_hash(&self) -> BlockHash {
        self.block_hash
    }

    /// Look up an entry by collateral
    pub fn get(&self, collateral: &OutPoint) -> Option<&MasternodeEntry> {
        self.entries.get(collateral)
    }

    /// Whether an entry exists for `collateral`
    pub fn contains(&self, collateral: &OutPoint) -> bool {
        self.entries.contains_key(collateral)
    }

    /// Number of entries, banned ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries not banned
    pub fn valid_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_valid()).count()
    }

    /// Entries in canonical collateral order
    pub fn iter(&self) -> impl Iterator<Item = &MasternodeEntry> {
        self.entries.values()
    }

    /// Find the entry operated by `key`
    pub fn by_operator_key(&self, key: &KeyId) -> Option<&MasternodeEntry> {
        self.entries.values().find(|e| &e.operator_key == key)
    }

    pub(crate) fn entries(&self) -> &BTreeMap<OutPoint, MasternodeEntry> {
        &self.entries
    }

    /// Canonical byte encoding, identical snapshots give identical bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Invert one block transition
    pub fn apply_undo(&self, undo: &UndoRecord) -> Result<Snapshot> {
        if undo.height != self.height || undo.block_hash != self.block_hash {
            return Err(DmnError::CorruptUndoRecord(format!(
                "undo record for {} at height {} does not match snapshot {} at height {}",
                undo.block_hash, undo.height, self.block_hash, self.height
            )));
        }
        let prior_height = self.height.checked_sub(1).ok_or_else(|| {
            DmnError::CorruptUndoRecord("cannot undo the genesis snapshot".to_string())
        })?;

        let mut entries = (*self.entries).clone();
        for change in &undo.changes {
            match &change.prior {
                Some(entry) => {
                    entries.insert(change.collateral, entry.clone());
                }
                None => {
                    entries.remove(&change.collateral);
                }
            }
        }

        Ok(Snapshot::from_parts(prior_height, undo.prev_block_hash, entries))
    }
}

/// Prior value of one entry touched by a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoChange {
    /// Entry touched by the block
    pub collateral: OutPoint,
    /// `None` when the block created the entry
    pub prior: Option<MasternodeEntry>,
}

/// Minimal reverse patch of one block's effect on the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoRecord {
    /// Height of the block this record reverts
    pub height: BlockHeight,
    /// Hash of that block
    pub block_hash: BlockHash,
    /// Hash of its parent
    pub prev_block_hash: Hash256,
    /// Prior value of every entry the block changed
    pub changes: Vec<UndoChange>,
}

impl UndoRecord {
    /// Whether the block left the registry unchanged
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
