//! Merkle commitment over a registry snapshot
//!
//! Each entry is reduced to its simplified form (collateral, service,
//! operator key, voting key, validity) and hashed with double SHA-256. The
//! leaves are taken in canonical collateral order and combined pairwise,
//! duplicating the last hash on levels with an odd count. An empty
//! snapshot commits to the zero hash.

use crate::snapshot::{MasternodeEntry, Snapshot};
use crate::specialtx::CommitmentPayload;
use crate::types::{Hash256, KeyId, OutPoint, Service};
use crate::{DmnError, Result};
use serde::{Deserialize, Serialize};

/// The part of an entry light clients need, and the commitment leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimplifiedEntry {
    /// Collateral outpoint
    pub collateral: OutPoint,
    /// Service address
    pub service: Service,
    /// Operator identity
    pub operator_key: KeyId,
    /// Voting identity
    pub voting_key: KeyId,
    /// Whether the entry is not banned
    pub is_valid: bool,
}

impl From<&MasternodeEntry> for SimplifiedEntry {
    fn from(entry: &MasternodeEntry) -> Self {
        Self {
            collateral: entry.collateral,
            service: entry.service,
            operator_key: entry.operator_key,
            voting_key: entry.voting_key,
            is_valid: entry.is_valid(),
        }
    }
}

impl SimplifiedEntry {
    /// Fixed 95-byte serialization
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(95);
        out.extend_from_slice(&self.collateral.txid.0);
        out.extend_from_slice(&self.collateral.index.to_le_bytes());
        out.extend_from_slice(&self.service.ip);
        // ports are big-endian on the wire
        out.extend_from_slice(&self.service.port.to_be_bytes());
        out.extend_from_slice(&self.operator_key.0);
        out.extend_from_slice(&self.voting_key.0);
        out.push(u8::from(self.is_valid));
        out
    }

    /// Leaf hash
    pub fn hash(&self) -> Hash256 {
        Hash256::sha256d(&self.to_bytes())
    }
}

/// Merkle root over leaf hashes
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next_level = Vec::with_capacity(level.len().div_ceil(2));

        for chunk in level.chunks(2) {
            let mut data = [0u8; 64];
            data[..32].copy_from_slice(&chunk[0].0);

            // Odd count: pair the last hash with itself
            let right = chunk.get(1).unwrap_or(&chunk[0]);
            data[32..].copy_from_slice(&right.0);

            next_level.push(Hash256::sha256d(&data));
        }

        level = next_level;
    }

    level[0]
}

/// Simplified entries of a snapshot in canonical order
pub fn simplified_list(snapshot: &Snapshot) -> Vec<SimplifiedEntry> {
    snapshot.iter().map(SimplifiedEntry::from).collect()
}

/// Commitment root of a snapshot
pub fn compute_root(snapshot: &Snapshot) -> Hash256 {
    let leaves: Vec<Hash256> = snapshot
        .iter()
        .map(|entry| SimplifiedEntry::from(entry).hash())
        .collect();
    merkle_root(&leaves)
}

/// Check a block's coinbase commitment against the snapshot that block produced
pub fn verify_commitment(snapshot: &Snapshot, payload: &CommitmentPayload) -> Result<()> {
    if payload.height != snapshot.height() {
        return Err(DmnError::CommitmentHeight {
            expected: snapshot.height(),
            found: payload.height,
        });
    }

    let expected = compute_root(snapshot);
    if payload.merkle_root_mn_list != expected {
        return Err(DmnError::CommitmentMismatch {
            expected,
            found: payload.merkle_root_mn_list,
        });
    }

    Ok(())
}

/// Commitment payload a block at the snapshot's height should carry
pub fn build_commitment(snapshot: &Snapshot) -> CommitmentPayload {
    CommitmentPayload {
        version: crate::specialtx::PAYLOAD_VERSION,
        height: snapshot.height(),
        merkle_root_mn_list: compute_root(snapshot),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_root_is_zero() {
        assert_eq!(merkle_root(&[]), Hash256::ZERO);
        assert_eq!(compute_root(&Snapshot::empty(Hash256([1; 32]))), Hash256::ZERO);
    }

    #[test]
    fn test_single_leaf_is_root() {
        let leaf = Hash256([3; 32]);
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let a = Hash256([1; 32]);
        let b = Hash256([2; 32]);
        let c = Hash256([3; 32]);
        assert_eq!(merkle_root(&[a, b, c]), merkle_root(&[a, b, c, c]));
        assert_ne!(merkle_root(&[a, b, c]), merkle_root(&[a, c, b]));
    }

    #[test]
    fn test_two_leaf_root() {
        let a = Hash256([1; 32]);
        let b = Hash256([2; 32]);
        let mut data = Vec::new();
        data.extend_from_slice(&a.0);
        data.extend_from_slice(&b.0);
        assert_eq!(merkle_root(&[a, b]), Hash256::sha256d(&data));
    }

    #[test]
    fn test_leaf_layout() {
        let entry = SimplifiedEntry {
            collateral: OutPoint::new(Hash256([9; 32]), 1),
            service: Service { ip: [0; 16], port: 0x4e1f },
            operator_key: KeyId([2; 20]),
            voting_key: KeyId([3; 20]),
            is_valid: true,
        };
        let bytes = entry.to_bytes();
        assert_eq!(bytes.len(), 95);
        assert_eq!(&bytes[32..36], &[1, 0, 0, 0]);
        assert_eq!(&bytes[52..54], &[0x4e, 0x1f]);
        assert_eq!(bytes[94], 1);
    }

    #[test]
    fn test_verify_commitment_height_and_root() {
        let snapshot = Snapshot::empty(Hash256::ZERO);
        let good = build_commitment(&snapshot);
        assert!(verify_commitment(&snapshot, &good).is_ok());

        let mut wrong_height = good.clone();
        wrong_height.height = 3;
        assert!(matches!(
            verify_commitment(&snapshot, &wrong_height),
            Err(DmnError::CommitmentHeight { expected: 0, found: 3 })
        ));

        let mut wrong_root = good;
        wrong_root.merkle_root_mn_list = Hash256([1; 32]);
        assert!(matches!(
            verify_commitment(&snapshot, &wrong_root),
            Err(DmnError::CommitmentMismatch { .. })
        ));
    }
}
