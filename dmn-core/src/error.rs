//! Error types for the masternode registry

use crate::activation::ActivationState;
use crate::types::{BlockHeight, Hash256, OutPoint};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DmnError {
    #[error("Malformed special transaction payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid special transaction payload: {0}")]
    InvalidPayload(String),

    #[error("Special transactions not accepted at height {height} (deployment {state})")]
    NotYetActive { height: BlockHeight, state: ActivationState },

    #[error("Registration below activation at height {height} (deployment {state})")]
    BelowActivation { height: BlockHeight, state: ActivationState },

    #[error("Collateral {0} already backs an active masternode")]
    DuplicateCollateral(OutPoint),

    #[error("Service address {0} already registered")]
    DuplicateService(String),

    #[error("Key {0} already registered")]
    DuplicateKey(String),

    #[error("Unknown masternode {0}")]
    UnknownMasternode(OutPoint),

    #[error("Invalid collateral: {0}")]
    InvalidCollateral(String),

    #[error("Inputs hash mismatch for transaction {0}")]
    InputsHashMismatch(Hash256),

    #[error("Coinbase commitment missing at height {0}")]
    MissingCommitment(BlockHeight),

    #[error("Coinbase commitment height mismatch: expected {expected}, got {found}")]
    CommitmentHeight { expected: BlockHeight, found: BlockHeight },

    #[error("Masternode list commitment mismatch: expected {expected}, got {found}")]
    CommitmentMismatch { expected: Hash256, found: Hash256 },

    #[error("Coinbase does not pay masternode {expected} at height {height}")]
    BadPayee { height: BlockHeight, expected: OutPoint },

    #[error("Block does not extend the tip: expected {expected}, got {found}")]
    NonContiguousBlock { expected: String, found: String },

    #[error("Branch was evaluated against tip {0}, which is no longer active")]
    StaleBranch(Hash256),

    #[error("Reorganization too deep: cannot revert height {height} (oldest retained {oldest})")]
    ReorgTooDeep { height: BlockHeight, oldest: BlockHeight },

    #[error("Undo record missing for height {0}")]
    UndoRecordMissing(BlockHeight),

    #[error("Undo record corrupt: {0}")]
    CorruptUndoRecord(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DmnError {
    /// Check if error rejects the block that caused it.
    ///
    /// Block-invalid errors leave the snapshot chain untouched; the block is
    /// simply not connected.
    pub fn is_block_invalid(&self) -> bool {
        matches!(
            self,
            DmnError::MalformedPayload(_)
                | DmnError::InvalidPayload(_)
                | DmnError::NotYetActive { .. }
                | DmnError::BelowActivation { .. }
                | DmnError::DuplicateCollateral(_)
                | DmnError::DuplicateService(_)
                | DmnError::DuplicateKey(_)
                | DmnError::UnknownMasternode(_)
                | DmnError::InvalidCollateral(_)
                | DmnError::InputsHashMismatch(_)
                | DmnError::MissingCommitment(_)
                | DmnError::CommitmentHeight { .. }
                | DmnError::CommitmentMismatch { .. }
                | DmnError::BadPayee { .. }
        )
    }

    /// Check if error means local state can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DmnError::UndoRecordMissing(_) | DmnError::CorruptUndoRecord(_)
        )
    }

    /// Short reject reason as reported to peers and block submitters
    pub fn reject_reason(&self) -> &'static str {
        match self {
            DmnError::MalformedPayload(_) => "bad-tx-payload",
            DmnError::InvalidPayload(_) => "bad-protx-payload",
            DmnError::NotYetActive { .. } => "bad-tx-type",
            DmnError::BelowActivation { .. } => "bad-protx-not-active",
            DmnError::DuplicateCollateral(_) => "bad-protx-dup-collateral",
            DmnError::DuplicateService(_) => "bad-protx-dup-addr",
            DmnError::DuplicateKey(_) => "bad-protx-dup-key",
            DmnError::UnknownMasternode(_) => "bad-protx-hash",
            DmnError::InvalidCollateral(_) => "bad-protx-collateral",
            DmnError::InputsHashMismatch(_) => "bad-protx-inputs-hash",
            DmnError::MissingCommitment(_) => "bad-cbtx-missing",
            DmnError::CommitmentHeight { .. } => "bad-cbtx-height",
            DmnError::CommitmentMismatch { .. } => "bad-cbtx-mnmerkleroot",
            DmnError::BadPayee { .. } => "bad-cb-payee",
            DmnError::NonContiguousBlock { .. } => "bad-prevblk",
            _ => "internal-error",
        }
    }
}

impl From<bincode::Error> for DmnError {
    fn from(e: bincode::Error) -> Self {
        DmnError::Serialization(e.to_string())
    }
}
