//! Operator-facing queries over the registry

use crate::activation::SporkValues;
use crate::commitment::{compute_root, SimplifiedEntry};
use crate::manager::MasternodeManager;
use crate::snapshot::{MasternodeEntry, Snapshot};
use crate::storage::{MemoryUndoStore, UndoStore};
use crate::transaction::{Block, CoinView};
use crate::types::{BlockHeight, Hash256, OutPoint};
use crate::{DmnError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Status label of an entry that may be paid
pub const STATUS_ENABLED: &str = "ENABLED";
/// Status label of a banned entry
pub const STATUS_POSE_BANNED: &str = "POSE_BANNED";

/// Which entries a listing includes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListFilter {
    /// Every entry, banned ones included
    #[default]
    All,
    /// Only entries that are not banned
    Valid,
}

/// One line of a registry listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    /// Collateral outpoint as `txid-index`
    pub collateral: String,
    /// `ENABLED` or `POSE_BANNED`
    pub status: String,
    /// Service address as `ip:port`
    pub service: String,
    /// Owner payout script, hex
    pub payout_script: String,
    /// Height of the registering block
    pub registered_height: BlockHeight,
    /// Height of the last payment, 0 when never paid
    pub last_paid_height: BlockHeight,
}

/// Everything known about one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDetail {
    /// Collateral outpoint as `txid-index`
    pub collateral: String,
    /// `ENABLED` or `POSE_BANNED`
    pub status: String,
    /// Registration transaction id, hex
    pub registration_txid: String,
    /// Owner key id, hex
    pub owner_key: String,
    /// Operator key id, hex
    pub operator_key: String,
    /// Voting key id, hex
    pub voting_key: String,
    /// Service address as `ip:port`
    pub service: String,
    /// Announced protocol version
    pub protocol_version: u32,
    /// Owner payout script, hex
    pub payout_script: String,
    /// Operator payout script, hex, empty when unset
    pub operator_payout_script: String,
    /// Operator share in hundredths of a percent
    pub operator_reward: u16,
    /// Height of the registering block
    pub registered_height: BlockHeight,
    /// Confirmation height of the collateral
    pub collateral_height: BlockHeight,
    /// Height of the last payment, 0 when never paid
    pub last_paid_height: BlockHeight,
    /// Height the current ban started at
    pub pose_ban_height: Option<BlockHeight>,
    /// Height of the last revival
    pub pose_revived_height: Option<BlockHeight>,
    /// Reason code of the last revocation
    pub revocation_reason: u16,
    /// Commitment leaf hash of the entry
    pub leaf_hash: String,
}

/// Registry overview
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Height of the active tip
    pub height: BlockHeight,
    /// Hash of the active tip, hex
    pub block_hash: String,
    /// Activation state at the tip
    pub activation_state: String,
    /// First active height, once known
    pub activation_height: Option<BlockHeight>,
    /// Whether the registry drives payments at the next block
    pub deterministic_mode: bool,
    /// Entries including banned ones
    pub total_entries: usize,
    /// Entries not banned
    pub valid_entries: usize,
    /// Payee of the next block
    pub next_payee: Option<String>,
    /// Commitment root of the tip snapshot, hex
    pub commitment_root: String,
}

/// Outcome of a local consistency check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Height of the active tip
    pub height: BlockHeight,
    /// Undo records within the reorg depth
    pub undo_records: usize,
    /// Lowest height the tip can be reverted to
    pub oldest_revertible: BlockHeight,
    /// Commitment root of the tip snapshot, hex
    pub commitment_root: String,
}

/// Outcome of replaying the live chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Height replayed up to
    pub height: BlockHeight,
    /// Whether the replayed snapshot equals the local one byte for byte
    pub matches: bool,
    /// Root of the local snapshot, hex
    pub local_root: String,
    /// Root of the replayed snapshot, hex
    pub replayed_root: String,
}

/// Read access to the live chain for replays
pub trait BlockSource {
    /// Block at `height` on the live chain
    fn block(&self, height: BlockHeight) -> Result<Option<Block>>;

    /// Unspent outputs as of the parent of the block at `height`
    fn coin_view(&self, height: BlockHeight) -> &dyn CoinView;
}

fn status_label(entry: &MasternodeEntry) -> &'static str {
    if entry.is_valid() {
        STATUS_ENABLED
    } else {
        STATUS_POSE_BANNED
    }
}

/// List entries in canonical order
pub fn list(snapshot: &Snapshot, filter: ListFilter) -> Vec<EntrySummary> {
    snapshot
        .iter()
        .filter(|entry| filter == ListFilter::All || entry.is_valid())
        .map(|entry| EntrySummary {
            collateral: entry.collateral.to_string(),
            status: status_label(entry).to_string(),
            service: entry.service.to_string(),
            payout_script: entry.payout_script.to_string(),
            registered_height: entry.registered_height,
            last_paid_height: entry.last_paid_height,
        })
        .collect()
}

/// Detail of the entry backed by `collateral`
pub fn info(snapshot: &Snapshot, collateral: &OutPoint) -> Result<EntryDetail> {
    let entry = snapshot
        .get(collateral)
        .ok_or(DmnError::UnknownMasternode(*collateral))?;

    Ok(EntryDetail {
        collateral: entry.collateral.to_string(),
        status: status_label(entry).to_string(),
        registration_txid: entry.registration_txid.to_hex(),
        owner_key: entry.owner_key.to_string(),
        operator_key: entry.operator_key.to_string(),
        voting_key: entry.voting_key.to_string(),
        service: entry.service.to_string(),
        protocol_version: entry.protocol_version,
        payout_script: entry.payout_script.to_string(),
        operator_payout_script: entry.operator_payout_script.to_string(),
        operator_reward: entry.operator_reward,
        registered_height: entry.registered_height,
        collateral_height: entry.collateral_height,
        last_paid_height: entry.last_paid_height,
        pose_ban_height: entry.pose_ban_height,
        pose_revived_height: entry.pose_revived_height,
        revocation_reason: entry.revocation_reason,
        leaf_hash: SimplifiedEntry::from(entry).hash().to_hex(),
    })
}

/// Overview of the active tip
pub fn status<S: UndoStore>(manager: &MasternodeManager<S>, sporks: &SporkValues) -> StatusReport {
    let snapshot = manager.tip();
    StatusReport {
        height: snapshot.height(),
        block_hash: snapshot.block_hash().to_hex(),
        activation_state: manager.activation_state().to_string(),
        activation_height: manager.gate().activation_height(),
        deterministic_mode: manager.is_deterministic_mode(sporks),
        total_entries: snapshot.len(),
        valid_entries: snapshot.valid_count(),
        next_payee: manager.next_payee().map(|p| p.to_string()),
        commitment_root: compute_root(snapshot).to_hex(),
    }
}

/// Check that the undo chain within the reorg depth is intact
pub fn verify_integrity<S: UndoStore>(manager: &MasternodeManager<S>) -> Result<IntegrityReport> {
    manager.check_undo_chain()?;
    let oldest = manager.oldest_revertible();
    let undo_records = manager
        .store()
        .heights()?
        .into_iter()
        .filter(|h| *h > oldest)
        .count();

    Ok(IntegrityReport {
        height: manager.tip_height(),
        undo_records,
        oldest_revertible: oldest,
        commitment_root: compute_root(manager.tip()).to_hex(),
    })
}

/// Replay the live chain from genesis and compare with the local tip
pub fn verify_against<S: UndoStore>(
    manager: &MasternodeManager<S>,
    source: &dyn BlockSource,
    sporks: SporkValues,
) -> Result<VerifyReport> {
    let mut replay = MasternodeManager::open(
        manager.config().clone(),
        MemoryUndoStore::new(),
        manager.genesis_hash(),
    )?;

    for height in 1..=manager.tip_height() {
        let block = source
            .block(height)?
            .ok_or_else(|| DmnError::Storage(format!("live chain has no block at height {}", height)))?;
        replay.connect_block(&block, source.coin_view(height), sporks)?;
    }

    let local: Hash256 = compute_root(manager.tip());
    let replayed = compute_root(replay.tip());
    let matches = replay.tip().to_bytes()? == manager.tip().to_bytes()?;
    if matches {
        info!("Registry at height {} matches the live chain", manager.tip_height());
    } else {
        warn!(
            "Registry at height {} diverges from the live chain: local {} replayed {}",
            manager.tip_height(),
            local,
            replayed
        );
    }

    Ok(VerifyReport {
        height: manager.tip_height(),
        matches,
        local_root: local.to_hex(),
        replayed_root: replayed.to_hex(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DmnConfig;
    use crate::types::Hash256;

    #[test]
    fn test_queries_on_empty_registry() {
        let manager = MasternodeManager::open(DmnConfig::default(), MemoryUndoStore::new(), Hash256([1; 32])).unwrap();

        assert!(list(manager.tip(), ListFilter::All).is_empty());
        assert!(matches!(
            info(manager.tip(), &OutPoint::new(Hash256([2; 32]), 0)),
            Err(DmnError::UnknownMasternode(_))
        ));

        let report = status(&manager, &SporkValues::default());
        assert_eq!(report.height, 0);
        assert_eq!(report.activation_state, "defined");
        assert!(!report.deterministic_mode);
        assert_eq!(report.commitment_root, Hash256::ZERO.to_hex());

        let integrity = verify_integrity(&manager).unwrap();
        assert_eq!(integrity.undo_records, 0);

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"activation_state\":\"defined\""));
    }
}
