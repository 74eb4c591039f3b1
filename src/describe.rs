//! # Describe
//!
//! JSON description format for patch sets, so patches can be kept next to the images they target
//! instead of being compiled in. Every field maps one to one onto a patch field:
//!
//! ```json
//! {
//!   "name": "ibss",
//!   "patches": [
//!     {
//!       "kind": "instruction",
//!       "address": "0x84010b96",
//!       "original": [{ "text": "ldrb r0, [r4]", "size": 2 }],
//!       "patched": [{ "text": "movs r0, #3", "size": 2 }],
//!       "reason": "Pretend the signature check passed"
//!     },
//!     { "kind": "blob", "address": "0x840000fc", "content": "00bf00bf", "reason": "Payload" }
//!   ]
//! }
//! ```

use std::fmt;
use std::ops::Deref;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::address::VirtualAddress;
use crate::code::{Instruction, Width};
use crate::patch::{BlobPatch, InstructionPatch, LengthPolicy, Patch, PatchSet};

/// Errors converting descriptions into patches
#[derive(Debug, Error)]
pub enum DescribeError {
    /// The text is not a valid description
    #[error("invalid patch description: {0}")]
    Json(#[from] serde_json::Error),
    /// An instruction size is zero or too large
    #[error("instruction \"{instruction}\" has invalid size {size}")]
    InvalidSize {
        /// Instruction text
        instruction: String,
        /// Declared size
        size: usize,
    },
}

/// Bytes written as a contiguous lowercase hex string
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HexBytes(pub Vec<u8>);

impl HexBytes {
    /// Unwraps the bytes
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Deref for HexBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl Serialize for HexBytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HexBytesVisitor;

        impl<'de> Visitor<'de> for HexBytesVisitor {
            type Value = HexBytes;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a hex string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                // whitespace is allowed so long payloads can be grouped
                let digits: String = v.split_whitespace().collect();
                let digits = digits.strip_prefix("0x").unwrap_or(digits.as_str());
                hex::decode(digits).map(HexBytes).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(HexBytesVisitor)
    }
}

/// Serde adapter writing a [`VirtualAddress`] as a `0x` hex string
mod hex_address {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::address::VirtualAddress;

    /// Writes the address as `0x...`
    pub fn serialize<S: Serializer>(
        addr: &VirtualAddress,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(addr)
    }

    /// Reads a hex or decimal address string
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<VirtualAddress, D::Error> {
        let text = String::deserialize(deserializer)?;
        VirtualAddress::parse(&text)
            .ok_or_else(|| D::Error::custom(format!("invalid address \"{}\"", text)))
    }
}

/// One instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstructionDescription {
    /// Instruction text in the disassembler's syntax
    pub text: String,
    /// Encoded size in bytes
    pub size: usize,
    /// Exact encoding, when pinned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<HexBytes>,
}

impl From<&Instruction> for InstructionDescription {
    fn from(instruction: &Instruction) -> Self {
        Self {
            text: instruction.text(),
            size: instruction.width().bytes(),
            encoding: instruction.encoding().map(|e| HexBytes(e.to_vec())),
        }
    }
}

impl TryFrom<InstructionDescription> for Instruction {
    type Error = DescribeError;

    fn try_from(desc: InstructionDescription) -> Result<Self, Self::Error> {
        let width = Width::from_len(desc.size).ok_or_else(|| DescribeError::InvalidSize {
            instruction: desc.text.clone(),
            size: desc.size,
        })?;
        let instruction = Instruction::parse(&desc.text, width);
        Ok(match desc.encoding {
            Some(encoding) => instruction.with_encoding(encoding.into_inner()),
            None => instruction,
        })
    }
}

/// One patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchDescription {
    /// An [`InstructionPatch`]
    Instruction {
        /// Address of the first replaced instruction
        #[serde(with = "hex_address")]
        address: VirtualAddress,
        /// Instructions expected before patching. Empty for unchecked patches.
        #[serde(default)]
        original: Vec<InstructionDescription>,
        /// Instructions written
        patched: Vec<InstructionDescription>,
        /// Why the patch exists
        reason: String,
        /// Function the patch lands in
        #[serde(default, skip_serializing_if = "Option::is_none")]
        function: Option<String>,
        /// Whether the patch may change the image size
        #[serde(default)]
        resize: bool,
        /// Exact patched length
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_length: Option<usize>,
    },
    /// A [`BlobPatch`]
    Blob {
        /// Target address
        #[serde(with = "hex_address")]
        address: VirtualAddress,
        /// Bytes written
        content: HexBytes,
        /// Why the patch exists
        reason: String,
    },
}

impl From<&Patch> for PatchDescription {
    fn from(patch: &Patch) -> Self {
        match patch {
            Patch::Instruction(p) => PatchDescription::Instruction {
                address: p.address(),
                original: p.original_instructions().iter().map(Into::into).collect(),
                patched: p.patched_instructions().iter().map(Into::into).collect(),
                reason: p.reason().to_string(),
                function: p.function().map(str::to_string),
                resize: p.length_policy() == LengthPolicy::Resize,
                expected_length: p.expected_length(),
            },
            Patch::Blob(p) => PatchDescription::Blob {
                address: p.address(),
                content: HexBytes(p.new_content().to_vec()),
                reason: p.reason().to_string(),
            },
        }
    }
}

impl TryFrom<PatchDescription> for Patch {
    type Error = DescribeError;

    fn try_from(desc: PatchDescription) -> Result<Self, Self::Error> {
        Ok(match desc {
            PatchDescription::Instruction {
                address,
                original,
                patched,
                reason,
                function,
                resize,
                expected_length,
            } => {
                let original = original
                    .into_iter()
                    .map(Instruction::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                let patched = patched
                    .into_iter()
                    .map(Instruction::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                let length = if resize {
                    LengthPolicy::Resize
                } else {
                    LengthPolicy::Exact
                };
                InstructionPatch::from_parts(
                    address,
                    original,
                    patched,
                    reason,
                    function,
                    length,
                    expected_length,
                )
                .into()
            }
            PatchDescription::Blob {
                address,
                content,
                reason,
            } => BlobPatch::new(address, content.into_inner(), reason).into(),
        })
    }
}

/// A named set of patches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchSetDescription {
    /// Set name
    #[serde(default)]
    pub name: String,
    /// Patches in declaration order
    pub patches: Vec<PatchDescription>,
}

impl From<&PatchSet> for PatchSetDescription {
    fn from(set: &PatchSet) -> Self {
        Self {
            name: set.name().to_string(),
            patches: set.patches().iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<PatchSetDescription> for PatchSet {
    type Error = DescribeError;

    fn try_from(desc: PatchSetDescription) -> Result<Self, Self::Error> {
        let mut set = PatchSet::new(desc.name);
        for patch in desc.patches {
            set.push(Patch::try_from(patch)?);
        }
        Ok(set)
    }
}

/// Writes `set` as pretty JSON
pub fn to_json(set: &PatchSet) -> Result<String, DescribeError> {
    Ok(serde_json::to_string_pretty(&PatchSetDescription::from(set))?)
}

/// Reads a patch set from JSON
pub fn from_json(text: &str) -> Result<PatchSet, DescribeError> {
    let desc: PatchSetDescription = serde_json::from_str(text)?;
    desc.try_into()
}
