//! Deterministic masternode registry
//!
//! Derives the set of service-providing nodes purely from on-chain special
//! transactions. Every node connecting the same blocks arrives at
//! byte-identical snapshots, commits to them in each coinbase, and selects
//! the same payees. Reorganizations are handled by exact undo records kept
//! for the configured reorg depth.

pub mod activation;
pub mod commitment;
pub mod config;
pub mod error;
pub mod manager;
pub mod payments;
pub mod query;
pub mod registry;
pub mod snapshot;
pub mod specialtx;
pub mod storage;
pub mod transaction;
pub mod types;

pub use activation::{ActivationGate, ActivationState, RegistrationAdmission, SporkValues};
pub use commitment::{compute_root, merkle_root, verify_commitment, SimplifiedEntry};
pub use config::{ActivationConfig, DmnConfig, RegistryConfig, StorageConfig};
pub use error::DmnError;
pub use manager::{BranchCandidate, MasternodeManager};
pub use payments::PaymentSelector;
pub use registry::{apply_block, expected_commitment, revert_block, BlockContext, Transition};
pub use snapshot::{MasternodeEntry, Snapshot, UndoChange, UndoRecord};
pub use specialtx::{SpecialTx, SpecialTxKind};
pub use storage::{FileUndoStore, MemoryUndoStore, StoredTip, UndoStore};
pub use transaction::{Block, Coin, CoinView, Transaction, TxOut};
pub use types::{Amount, BlockHash, BlockHeight, Hash256, KeyId, OutPoint, Script, Service, Txid, COIN};

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, DmnError>;

/// Registry format version
pub const DMN_VERSION: &str = "0.1.0";
