//! Unstructured byte patches

use crate::address::VirtualAddress;

/// Drops raw bytes at an address with no validation of what is being overwritten.
///
/// This is deliberately weaker than [`InstructionPatch`](super::InstructionPatch): the bytes that
/// were there are recorded in the resulting edit but never checked, and the content is opaque.
/// It is meant for things like placing a payload into a region already known to be free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobPatch {
    /// Where the content is written
    address: VirtualAddress,
    /// Bytes to write
    new_content: Vec<u8>,
    /// Why the patch exists
    reason: String,
}
impl BlobPatch {
    /// Writes `new_content` at `address`
    pub fn new(
        address: impl Into<VirtualAddress>,
        new_content: impl Into<Vec<u8>>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            new_content: new_content.into(),
            reason: reason.into(),
        }
    }

    /// Target address
    pub fn address(&self) -> VirtualAddress {
        self.address
    }

    /// Bytes to write
    pub fn new_content(&self) -> &[u8] {
        &self.new_content
    }

    /// Justification text
    pub fn reason(&self) -> &str {
        &self.reason
    }
}
