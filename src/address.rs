//! # Address
//!
//! Virtual addresses inside a loaded image. Arithmetic on addresses is always checked.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from address arithmetic
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Adding `offset` to `base` does not fit in the address space
    #[error("address {base} + {offset:#x} overflows")]
    Overflow {
        /// Address the offset was applied to
        base: VirtualAddress,
        /// Offset that was applied
        offset: u64,
    },
    /// `address` lies below `base`
    #[error("address {address} is below {base}")]
    Underflow {
        /// Address being measured
        address: VirtualAddress,
        /// Base it was measured from
        base: VirtualAddress,
    },
}

/// A location in the running image's address space, as opposed to a position in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    /// Wraps a raw address
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw address value
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Advances the address by `offset` bytes, failing instead of wrapping
    pub fn checked_add(self, offset: u64) -> Result<Self, AddressError> {
        self.0
            .checked_add(offset)
            .map(Self)
            .ok_or(AddressError::Overflow { base: self, offset })
    }

    /// Distance in bytes from `base` up to this address
    pub fn offset_from(self, base: VirtualAddress) -> Result<u64, AddressError> {
        self.0.checked_sub(base.0).ok_or(AddressError::Underflow {
            address: self,
            base,
        })
    }

    /// Parses `0x`-prefixed hex or plain decimal
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let raw = match text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16).ok()?,
            None => text.parse().ok()?,
        };
        Some(Self(raw))
    }
}

impl From<u64> for VirtualAddress {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
