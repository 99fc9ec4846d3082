//! Transactions and blocks as handed over by the upstream validation pipeline

use crate::types::{Amount, BlockHash, BlockHeight, Hash256, OutPoint, Script, Txid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Transaction type of ordinary (non-special) transactions
pub const TRANSACTION_NORMAL: u16 = 0;

/// A transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    /// Output value
    pub value: Amount,
    /// Locking script
    pub script: Script,
}

impl TxOut {
    /// Create a new output
    pub fn new(value: Amount, script: Script) -> Self {
        Self { value, script }
    }
}

/// A transaction reduced to what the registry needs: its inputs, outputs
/// and the special transaction payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id
    pub txid: Txid,

    /// Special transaction type, `TRANSACTION_NORMAL` for ordinary ones
    pub tx_type: u16,

    /// Spent outpoints
    pub inputs: Vec<OutPoint>,

    /// Created outputs
    pub outputs: Vec<TxOut>,

    /// Extra payload carried by special transactions
    pub payload: Vec<u8>,
}

/// Fields covered by the transaction id
#[derive(Serialize)]
struct TxIdPreimage<'a> {
    tx_type: u16,
    inputs: &'a [OutPoint],
    outputs: &'a [TxOut],
    payload: &'a [u8],
}

impl Transaction {
    /// Create a transaction, deriving its id from its contents
    pub fn new(tx_type: u16, inputs: Vec<OutPoint>, outputs: Vec<TxOut>, payload: Vec<u8>) -> Self {
        let preimage = TxIdPreimage {
            tx_type,
            inputs: &inputs,
            outputs: &outputs,
            payload: &payload,
        };
        // Serializing plain vectors and integers into memory cannot fail
        let bytes = bincode::serialize(&preimage).unwrap_or_default();
        Self {
            txid: Hash256::sha256d(&bytes),
            tx_type,
            inputs,
            outputs,
            payload,
        }
    }

    /// Whether this is a coinbase (spends nothing)
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Whether this transaction carries a special payload
    pub fn is_special(&self) -> bool {
        self.tx_type != TRANSACTION_NORMAL
    }

    /// Outpoint of output `index` of this transaction
    pub fn outpoint(&self, index: u32) -> OutPoint {
        OutPoint::new(self.txid, index)
    }

    /// Replay protection hash over the spent outpoints.
    ///
    /// Double SHA-256 of each input's txid followed by its little-endian
    /// output index.
    pub fn inputs_hash(&self) -> Hash256 {
        inputs_hash(&self.inputs)
    }
}

/// Replay protection hash over a list of spent outpoints
pub fn inputs_hash(inputs: &[OutPoint]) -> Hash256 {
    let mut data = Vec::with_capacity(inputs.len() * 36);
    for input in inputs {
        data.extend_from_slice(&input.txid.0);
        data.extend_from_slice(&input.index.to_le_bytes());
    }
    Hash256::sha256d(&data)
}

/// A block: header fields relevant to the registry plus its transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Hash of this block
    pub hash: BlockHash,

    /// Hash of the parent block
    pub prev_hash: BlockHash,

    /// Height of this block
    pub height: BlockHeight,

    /// Header version, carrying deployment signal bits
    pub version: u32,

    /// Total reward available to the coinbase (subsidy plus fees), as
    /// computed by upstream validation
    pub reward: Amount,

    /// Transactions, coinbase first
    pub transactions: Vec<Transaction>,
}

#[derive(Serialize)]
struct BlockHashPreimage<'a> {
    prev_hash: &'a BlockHash,
    height: BlockHeight,
    version: u32,
    reward: Amount,
    txids: Vec<&'a Txid>,
}

impl Block {
    /// Create a block, deriving its hash from header fields and txids
    pub fn new(
        prev_hash: BlockHash,
        height: BlockHeight,
        version: u32,
        reward: Amount,
        transactions: Vec<Transaction>,
    ) -> Self {
        let preimage = BlockHashPreimage {
            prev_hash: &prev_hash,
            height,
            version,
            reward,
            txids: transactions.iter().map(|tx| &tx.txid).collect(),
        };
        let bytes = bincode::serialize(&preimage).unwrap_or_default();
        Self {
            hash: Hash256::sha256d(&bytes),
            prev_hash,
            height,
            version,
            reward,
            transactions,
        }
    }

    /// The coinbase transaction, if the block has one
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Whether the header signals for deployment bit `bit`
    pub fn signals(&self, bit: u8) -> bool {
        bit < 29 && (self.version >> bit) & 1 == 1
    }

    /// Every outpoint spent by the block, in block order
    pub fn spent_outpoints(&self) -> impl Iterator<Item = &OutPoint> {
        self.transactions.iter().flat_map(|tx| tx.inputs.iter())
    }
}

/// An unspent output with the height it was confirmed at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// Output value
    pub value: Amount,
    /// Locking script
    pub script: Script,
    /// Height of the block that created the output
    pub height: BlockHeight,
}

/// Read access to the upstream unspent output set
pub trait CoinView {
    /// Look up an unspent output
    fn coin(&self, outpoint: &OutPoint) -> Option<Coin>;
}

impl CoinView for HashMap<OutPoint, Coin> {
    fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.get(outpoint).cloned()
    }
}

/// A coin view without any coins
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyCoinView;

impl CoinView for EmptyCoinView {
    fn coin(&self, _outpoint: &OutPoint) -> Option<Coin> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txid_depends_on_contents() {
        let a = Transaction::new(0, vec![OutPoint::new(Hash256([1; 32]), 0)], vec![], vec![]);
        let b = Transaction::new(0, vec![OutPoint::new(Hash256([1; 32]), 1)], vec![], vec![]);
        assert_ne!(a.txid, b.txid);
        assert_eq!(a.txid, a.clone().txid);
    }

    #[test]
    fn test_block_signals() {
        let block = Block::new(Hash256::ZERO, 1, 1 << 3, 0, vec![]);
        assert!(block.signals(3));
        assert!(!block.signals(4));
        assert!(!block.signals(30));
    }

    #[test]
    fn test_coinbase_detection() {
        let coinbase = Transaction::new(0, vec![], vec![TxOut::new(50, Script::new())], vec![]);
        let spend = Transaction::new(0, vec![OutPoint::new(Hash256([9; 32]), 0)], vec![], vec![]);
        let block = Block::new(Hash256::ZERO, 1, 0, 50, vec![coinbase.clone(), spend]);
        assert_eq!(block.coinbase(), Some(&coinbase));
        assert_eq!(block.spent_outpoints().count(), 1);
    }

    #[test]
    fn test_inputs_hash_is_order_sensitive() {
        let a = OutPoint::new(Hash256([1; 32]), 0);
        let b = OutPoint::new(Hash256([2; 32]), 0);
        assert_ne!(inputs_hash(&[a, b]), inputs_hash(&[b, a]));
    }
}
