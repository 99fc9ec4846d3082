//! Primitive chain types shared by every registry component

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Block height on the chain
pub type BlockHeight = u32;

/// Amount in the smallest currency unit
pub type Amount = u64;

/// Smallest units per coin
pub const COIN: Amount = 100_000_000;

/// 256-bit hash used for transaction ids, block hashes and merkle roots
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

/// Transaction id
pub type Txid = Hash256;

/// Block hash
pub type BlockHash = Hash256;

impl Hash256 {
    /// The all-zero hash
    pub const ZERO: Hash256 = Hash256([0; 32]);

    /// Double SHA-256 of `data`
    pub fn sha256d(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        Hash256(out)
    }

    /// Whether this is the all-zero hash
    pub fn is_null(&self) -> bool {
        self.0 == [0; 32]
    }

    /// Hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from 64 hex characters
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Hash256(out))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

/// Reference to a transaction output.
///
/// Field order gives the canonical collateral ordering: transaction id
/// compared byte-wise, then output index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct OutPoint {
    /// Transaction holding the output
    pub txid: Txid,
    /// Output index within that transaction
    pub index: u32,
}

impl OutPoint {
    /// Create a new outpoint
    pub fn new(txid: Txid, index: u32) -> Self {
        Self { txid, index }
    }

    /// Null outpoint, used by registrations to point at their own outputs
    pub fn null() -> Self {
        Self { txid: Hash256::ZERO, index: u32::MAX }
    }

    /// Whether the transaction id part is null
    pub fn is_null(&self) -> bool {
        self.txid.is_null()
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.txid, self.index)
    }
}

impl fmt::Debug for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutPoint({}-{})", self.txid, self.index)
    }
}

impl FromStr for OutPoint {
    type Err = String;

    /// Accepts `txid-index` and `txid:index`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, index) = s
            .rsplit_once(['-', ':'])
            .ok_or_else(|| format!("expected <txid>-<index>, got {}", s))?;
        let txid = Hash256::from_hex(txid).map_err(|e| format!("bad txid: {}", e))?;
        let index = index.parse::<u32>().map_err(|e| format!("bad index: {}", e))?;
        Ok(OutPoint::new(txid, index))
    }
}

/// 160-bit key identifier for owner, operator and voting keys
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct KeyId(pub [u8; 20]);

impl KeyId {
    /// Whether the identifier is all zero
    pub fn is_null(&self) -> bool {
        self.0 == [0; 20]
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

/// Network service address: IPv6 (or IPv4-mapped) address and port.
///
/// The all-zero value means "no service announced".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Service {
    /// 16 address bytes, IPv4 addresses are mapped into `::ffff:0:0/96`
    pub ip: [u8; 16],
    /// Port number
    pub port: u16,
}

impl Service {
    /// Unset service
    pub fn null() -> Self {
        Self::default()
    }

    /// Whether no address is set
    pub fn is_null(&self) -> bool {
        self.ip == [0; 16] && self.port == 0
    }

    /// Convert to a socket address, `None` when unset
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        if self.is_null() {
            return None;
        }
        let v6 = Ipv6Addr::from(self.ip);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        Some(SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for Service {
    fn from(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self { ip: ip.octets(), port: addr.port() }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket_addr() {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("[::]:0"),
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Service({})", self)
    }
}

/// Locking script of an output (payout or collateral address)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Script(pub Vec<u8>);

impl Script {
    /// Empty script
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Whether the script has no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Script {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", hex::encode(&self.0))
    }
}
