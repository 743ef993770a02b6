//! Core chain types shared across the session toolkit.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// ADDRESS
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors raised while parsing chain-level identifiers.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid chain id: {0}")]
    InvalidChainId(String),
}

/// A 20-byte account or contract address.
///
/// Stored normalized (lowercase hex with `0x` prefix) so equality and hashing
/// are case-insensitive; `Display` renders the EIP-55 checksummed form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Parse an address from any-cased `0x` hex.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let body = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| ParseError::InvalidAddress(s.to_string()))?;
        if body.len() != 40 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseError::InvalidAddress(s.to_string()));
        }
        Ok(Self(format!("0x{}", body.to_ascii_lowercase())))
    }

    /// The normalized (lowercase) form, `0x` prefixed.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The raw 20 bytes.
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        // Infallible: the constructor validated 40 hex chars.
        if let Ok(bytes) = hex::decode(&self.0[2..]) {
            out.copy_from_slice(&bytes);
        }
        out
    }

    /// EIP-55 checksummed rendering.
    pub fn to_checksum(&self) -> String {
        let body = &self.0[2..];
        let hash = Keccak256::digest(body.as_bytes());
        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (i, c) in body.chars().enumerate() {
            let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
            if c.is_ascii_alphabetic() && nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_checksum())
    }
}

impl std::str::FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_checksum())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN ID
// ═══════════════════════════════════════════════════════════════════════════════

/// An EVM chain id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl ChainId {
    /// Parse from the `0x`-hex quantity form providers report (`eth_chainId`).
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        let body = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| ParseError::InvalidChainId(s.to_string()))?;
        u64::from_str_radix(body, 16)
            .map(Self)
            .map_err(|_| ParseError::InvalidChainId(s.to_string()))
    }

    /// Render as the `0x`-hex quantity form.
    pub fn to_hex(self) -> String {
        format!("0x{:x}", self.0)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
