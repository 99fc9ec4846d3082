//! Special transaction payloads and their wire codec
//!
//! Masternode special transactions carry a typed payload next to their
//! ordinary inputs and outputs. Payloads are encoded field by field in
//! declaration order: fixed-width little-endian integers, fixed-size byte
//! arrays, and variable-length scripts prefixed with a 64-bit length. A
//! payload must be consumed exactly; trailing bytes are malformed.

use crate::transaction::Transaction;
use crate::types::{Amount, BlockHeight, Hash256, KeyId, OutPoint, Script, Service};
use crate::{DmnError, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Provider registration
pub const TRANSACTION_PROVIDER_REGISTER: u16 = 1;
/// Provider service update
pub const TRANSACTION_PROVIDER_UPDATE_SERVICE: u16 = 2;
/// Provider operator revocation
pub const TRANSACTION_PROVIDER_UPDATE_REVOKE: u16 = 4;
/// Coinbase commitment
pub const TRANSACTION_COINBASE: u16 = 5;

/// Upper bound on an encoded payload
pub const MAX_PAYLOAD_SIZE: u64 = 10_000;

/// Current payload version of every variant
pub const PAYLOAD_VERSION: u16 = 1;

/// Highest defined revocation reason
pub const MAX_REVOCATION_REASON: u16 = 3;

/// Kinds of special transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialTxKind {
    /// Registers a new masternode
    Registration,
    /// Updates service address and protocol version
    ServiceUpdate,
    /// Revokes the operator
    Revocation,
    /// Coinbase commitment to the masternode list
    Commitment,
}

impl SpecialTxKind {
    /// Map a transaction type to a kind
    pub fn from_tx_type(tx_type: u16) -> Option<Self> {
        match tx_type {
            TRANSACTION_PROVIDER_REGISTER => Some(Self::Registration),
            TRANSACTION_PROVIDER_UPDATE_SERVICE => Some(Self::ServiceUpdate),
            TRANSACTION_PROVIDER_UPDATE_REVOKE => Some(Self::Revocation),
            TRANSACTION_COINBASE => Some(Self::Commitment),
            _ => None,
        }
    }

    /// Transaction type discriminant
    pub fn tx_type(self) -> u16 {
        match self {
            Self::Registration => TRANSACTION_PROVIDER_REGISTER,
            Self::ServiceUpdate => TRANSACTION_PROVIDER_UPDATE_SERVICE,
            Self::Revocation => TRANSACTION_PROVIDER_UPDATE_REVOKE,
            Self::Commitment => TRANSACTION_COINBASE,
        }
    }
}

/// Registration payload.
///
/// A null `collateral_outpoint` txid means the collateral is output
/// `collateral_outpoint.index` of the registering transaction itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationPayload {
    /// Payload version, must be 1
    pub version: u16,
    /// Collateral the payload refers to
    pub collateral_outpoint: OutPoint,
    /// Value the collateral holds
    pub collateral_amount: Amount,
    /// Script the collateral pays
    pub collateral_script: Script,
    /// Service address and port
    pub service: Service,
    /// Announced protocol version
    pub protocol_version: u32,
    /// Owner identity
    pub owner_key: KeyId,
    /// Operator identity
    pub operator_key: KeyId,
    /// Governance voting identity
    pub voting_key: KeyId,
    /// Operator share of rewards in hundredths of a percent
    pub operator_reward: u16,
    /// Owner payout script
    pub payout_script: Script,
    /// Double SHA-256 of the transaction's inputs
    pub inputs_hash: Hash256,
}

/// Service update payload, sent by the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUpdatePayload {
    /// Payload version, must be 1
    pub version: u16,
    /// Collateral the payload refers to
    pub collateral_outpoint: OutPoint,
    /// Service address and port
    pub service: Service,
    /// Announced protocol version
    pub protocol_version: u32,
    /// Operator payout script, empty to leave unset
    pub operator_payout_script: Script,
    /// Double SHA-256 of the transaction's inputs
    pub inputs_hash: Hash256,
}

/// Operator revocation payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationPayload {
    /// Payload version, must be 1
    pub version: u16,
    /// Collateral the payload refers to
    pub collateral_outpoint: OutPoint,
    /// Revocation reason code, 0..=3
    pub reason: u16,
    /// Double SHA-256 of the transaction's inputs
    pub inputs_hash: Hash256,
}

/// Coinbase commitment payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentPayload {
    /// Payload version, must be 1
    pub version: u16,
    /// Height of the carrying block
    pub height: BlockHeight,
    /// Commitment root of the snapshot after the block
    pub merkle_root_mn_list: Hash256,
}

/// A decoded special transaction payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialTx {
    /// Provider registration
    Registration(RegistrationPayload),
    /// Service update
    ServiceUpdate(ServiceUpdatePayload),
    /// Operator revocation
    Revocation(RevocationPayload),
    /// Coinbase commitment
    Commitment(CommitmentPayload),
}

impl SpecialTx {
    /// Kind of this payload
    pub fn kind(&self) -> SpecialTxKind {
        match self {
            SpecialTx::Registration(_) => SpecialTxKind::Registration,
            SpecialTx::ServiceUpdate(_) => SpecialTxKind::ServiceUpdate,
            SpecialTx::Revocation(_) => SpecialTxKind::Revocation,
            SpecialTx::Commitment(_) => SpecialTxKind::Commitment,
        }
    }

    /// Transaction type discriminant
    pub fn tx_type(&self) -> u16 {
        self.kind().tx_type()
    }

    fn version(&self) -> u16 {
        match self {
            SpecialTx::Registration(p) => p.version,
            SpecialTx::ServiceUpdate(p) => p.version,
            SpecialTx::Revocation(p) => p.version,
            SpecialTx::Commitment(p) => p.version,
        }
    }

    /// Encode into wire bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let options = wire_options();
        let bytes = match self {
            SpecialTx::Registration(p) => options.serialize(p),
            SpecialTx::ServiceUpdate(p) => options.serialize(p),
            SpecialTx::Revocation(p) => options.serialize(p),
            SpecialTx::Commitment(p) => options.serialize(p),
        };
        bytes.map_err(|e| DmnError::Serialization(e.to_string()))
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_PAYLOAD_SIZE)
        .reject_trailing_bytes()
}

fn decode_as<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    wire_options()
        .deserialize(bytes)
        .map_err(|e| DmnError::MalformedPayload(e.to_string()))
}

/// Decode a payload of the given transaction type
pub fn decode(tx_type: u16, payload: &[u8]) -> Result<SpecialTx> {
    let kind = SpecialTxKind::from_tx_type(tx_type)
        .ok_or_else(|| DmnError::MalformedPayload(format!("unknown special transaction type {}", tx_type)))?;

    if payload.len() as u64 > MAX_PAYLOAD_SIZE {
        return Err(DmnError::MalformedPayload(format!(
            "payload of {} bytes exceeds limit",
            payload.len()
        )));
    }

    let decoded = match kind {
        SpecialTxKind::Registration => SpecialTx::Registration(decode_as(payload)?),
        SpecialTxKind::ServiceUpdate => SpecialTx::ServiceUpdate(decode_as(payload)?),
        SpecialTxKind::Revocation => SpecialTx::Revocation(decode_as(payload)?),
        SpecialTxKind::Commitment => SpecialTx::Commitment(decode_as(payload)?),
    };

    if decoded.version() != PAYLOAD_VERSION {
        return Err(DmnError::MalformedPayload(format!(
            "unsupported {:?} payload version {}",
            kind,
            decoded.version()
        )));
    }

    Ok(decoded)
}

/// Decode the payload of a transaction, `None` for ordinary transactions
pub fn decode_transaction(tx: &Transaction) -> Result<Option<SpecialTx>> {
    if !tx.is_special() {
        return Ok(None);
    }
    decode(tx.tx_type, &tx.payload).map(Some)
}
