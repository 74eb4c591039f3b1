//! # Code
//!
//! Instruction values plus the two halves of a codec: an [`Assembler`] that turns text into bytes,
//! and a [`Disassembler`] that turns bytes back into text.
//!
//! The two halves are meant to come from independent sources. Patches are only trusted when an
//! owned assembler and a third-party disassembler agree with each other, so both are injected
//! through a [`Codec`] instead of living in global state.

pub mod capstone;
pub mod iced;
pub mod thumb;
pub mod x64;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{AddressError, VirtualAddress};

/// Encoded size of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Width {
    /// 2 byte encoding (16-bit Thumb)
    Narrow,
    /// 4 byte encoding (32-bit Thumb or ARM)
    Wide,
    /// Explicit length for variable-length instruction sets
    Bytes(u8),
}

impl Width {
    /// Number of bytes an instruction of this width occupies
    pub fn bytes(self) -> usize {
        match self {
            Width::Narrow => 2,
            Width::Wide => 4,
            Width::Bytes(n) => n as usize,
        }
    }

    /// Width for an encoding of `len` bytes, preferring the named Thumb widths
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            2 => Some(Width::Narrow),
            4 => Some(Width::Wide),
            n => u8::try_from(n).ok().filter(|&n| n > 0).map(Width::Bytes),
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Width::Narrow => f.write_str("narrow"),
            Width::Wide => f.write_str("wide"),
            Width::Bytes(n) => write!(f, "{} bytes", n),
        }
    }
}

/// A single machine instruction in the disassembler's textual syntax.
///
/// `==` compares every field, encodings included. Checking a decoded instruction against a
/// declared one goes through [`Instruction::matches`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Lowercase mnemonic, e.g. `ldrb`
    mnemonic: String,
    /// Operand tokens in order, e.g. `["r0", "[r4]"]`
    operands: Vec<String>,
    /// Encoding, when one has been resolved
    encoding: Option<Vec<u8>>,
    /// Declared size
    width: Width,
}

impl Instruction {
    /// Parses `text` (`"movs r0, #3"`) as an instruction of the given width
    pub fn parse(text: &str, width: Width) -> Self {
        let text = text.trim();
        let (mnemonic, rest) = match text.split_once(char::is_whitespace) {
            Some((mnemonic, rest)) => (mnemonic, rest),
            None => (text, ""),
        };
        Self {
            mnemonic: mnemonic.to_ascii_lowercase(),
            operands: split_operands(rest),
            encoding: None,
            width,
        }
    }

    /// 16-bit Thumb instruction
    pub fn narrow(text: &str) -> Self {
        Self::parse(text, Width::Narrow)
    }

    /// 32-bit Thumb (or ARM) instruction
    pub fn wide(text: &str) -> Self {
        Self::parse(text, Width::Wide)
    }

    /// Instruction with an explicit byte length
    pub fn sized(text: &str, len: u8) -> Self {
        Self::parse(text, Width::Bytes(len))
    }

    /// Pins the instruction to an exact encoding
    pub fn with_encoding(mut self, encoding: impl Into<Vec<u8>>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    /// Mnemonic
    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    /// Operand tokens
    pub fn operands(&self) -> &[String] {
        &self.operands
    }

    /// Resolved encoding, if any
    pub fn encoding(&self) -> Option<&[u8]> {
        self.encoding.as_deref()
    }

    /// Declared width
    pub fn width(&self) -> Width {
        self.width
    }

    /// Normalised text, e.g. `ldrb r0, [r4]`
    pub fn text(&self) -> String {
        self.to_string()
    }

    /// Whether this instruction satisfies `declared`.
    ///
    /// Mnemonic, operands and size must agree. The encoding only has to agree when `declared`
    /// pins one, so the relation is one-sided and not an equivalence.
    pub fn matches(&self, declared: &Instruction) -> bool {
        let encoding_agrees = match &declared.encoding {
            Some(pinned) => self.encoding.as_ref() == Some(pinned),
            None => true,
        };
        self.mnemonic == declared.mnemonic
            && self.operands == declared.operands
            && self.width.bytes() == declared.width.bytes()
            && encoding_agrees
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mnemonic)?;
        if !self.operands.is_empty() {
            write!(f, " {}", self.operands.join(", "))?;
        }
        Ok(())
    }
}

/// Splits an operand string on top-level commas. Commas inside `[...]` or `{...}` stay put.
fn split_operands(text: &str) -> Vec<String> {
    let mut operands = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '[' | '{' => depth += 1,
            ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                operands.push(normalize(&current));
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        operands.push(normalize(&current));
    }
    operands
}

/// Lowercases a token and collapses its whitespace, keeping `", "` inside brackets
fn normalize(token: &str) -> String {
    let token = token.trim().to_ascii_lowercase();
    let mut out = String::with_capacity(token.len());
    for part in token.split(',') {
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push_str(&part.split_whitespace().collect::<Vec<_>>().join(" "));
    }
    out
}

/// Errors from an [`Assembler`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The assembler has no encoding for this mnemonic
    #[error("unsupported instruction \"{0}\"")]
    Unsupported(String),
    /// Wrong number of operands
    #[error("\"{instruction}\" takes {expected} operand(s)")]
    OperandCount {
        /// Offending instruction
        instruction: String,
        /// Operands the mnemonic takes
        expected: usize,
    },
    /// An operand could not be parsed or is not allowed here
    #[error("invalid operand \"{operand}\" in \"{instruction}\"")]
    InvalidOperand {
        /// Offending instruction
        instruction: String,
        /// The operand token
        operand: String,
    },
    /// An immediate does not fit the encoding
    #[error("immediate {value} out of range in \"{instruction}\"")]
    ImmediateOutOfRange {
        /// Offending instruction
        instruction: String,
        /// The immediate
        value: i64,
    },
    /// A PC-relative target is too far away from the instruction
    #[error("branch from {from} to {target:#x} is out of range for \"{instruction}\"")]
    BranchOutOfRange {
        /// Offending instruction
        instruction: String,
        /// Address the instruction is encoded at
        from: VirtualAddress,
        /// Branch target
        target: u64,
    },
    /// An instruction or branch target violates the alignment rules of the instruction set
    #[error("misaligned address {address:#x} for \"{instruction}\"")]
    Misaligned {
        /// Offending instruction
        instruction: String,
        /// The misaligned address
        address: u64,
    },
    /// The instruction cannot be encoded at the declared width
    #[error("\"{instruction}\" cannot be encoded as {width}")]
    WidthUnavailable {
        /// Offending instruction
        instruction: String,
        /// Declared width
        width: Width,
    },
    /// Address arithmetic failed while computing a relative offset
    #[error("{0}")]
    Address(#[from] AddressError),
}

/// Errors from a [`Disassembler`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The disassembler backend itself failed
    #[error("disassembler backend error: {0}")]
    Backend(String),
    /// The bytes are not a valid instruction
    #[error("invalid instruction bytes {bytes:02x?} at {address}")]
    Invalid {
        /// Address of the bytes
        address: VirtualAddress,
        /// The bytes
        bytes: Vec<u8>,
    },
    /// Fewer bytes than the declared width were supplied
    #[error("need {needed} bytes at {address}, only {available} available")]
    Truncated {
        /// Address of the bytes
        address: VirtualAddress,
        /// Bytes needed
        needed: usize,
        /// Bytes supplied
        available: usize,
    },
    /// The decoded instruction is not the declared width
    #[error("instruction at {address} is {decoded} bytes, declared {declared}")]
    LengthMismatch {
        /// Address of the bytes
        address: VirtualAddress,
        /// Declared length
        declared: usize,
        /// Decoded length
        decoded: usize,
    },
}

/// Turns instruction text into machine code
pub trait Assembler {
    /// Encodes `instruction` as if it were placed at `at`.
    ///
    /// Must be deterministic. PC-relative operands are computed relative to `at`.
    fn assemble(&self, instruction: &Instruction, at: VirtualAddress)
        -> Result<Vec<u8>, EncodeError>;
}

/// Turns machine code back into instruction text
pub trait Disassembler {
    /// Decodes exactly one instruction of `width` bytes from the start of `bytes`, located at `at`.
    ///
    /// The returned instruction carries its encoding.
    fn disassemble(
        &self,
        bytes: &[u8],
        at: VirtualAddress,
        width: Width,
    ) -> Result<Instruction, DecodeError>;
}

impl<T: Assembler + ?Sized> Assembler for &T {
    fn assemble(
        &self,
        instruction: &Instruction,
        at: VirtualAddress,
    ) -> Result<Vec<u8>, EncodeError> {
        (**self).assemble(instruction, at)
    }
}

impl<T: Disassembler + ?Sized> Disassembler for &T {
    fn disassemble(
        &self,
        bytes: &[u8],
        at: VirtualAddress,
        width: Width,
    ) -> Result<Instruction, DecodeError> {
        (**self).disassemble(bytes, at, width)
    }
}

/// An assembler paired with an independently sourced disassembler
#[derive(Debug, Clone, Default)]
pub struct Codec<A, D> {
    /// Owned encoder
    pub assembler: A,
    /// Trusted decoder
    pub disassembler: D,
}

impl<A: Assembler, D: Disassembler> Codec<A, D> {
    /// Pairs an assembler with a disassembler
    pub fn new(assembler: A, disassembler: D) -> Self {
        Self {
            assembler,
            disassembler,
        }
    }

    /// Encodes with the assembler half
    pub fn assemble(
        &self,
        instruction: &Instruction,
        at: VirtualAddress,
    ) -> Result<Vec<u8>, EncodeError> {
        self.assembler.assemble(instruction, at)
    }

    /// Decodes with the disassembler half
    pub fn disassemble(
        &self,
        bytes: &[u8],
        at: VirtualAddress,
        width: Width,
    ) -> Result<Instruction, DecodeError> {
        self.disassembler.disassemble(bytes, at, width)
    }
}

/// Helper types naming an assembler/disassembler pair for one instruction set
pub trait Architecture {
    /// Owned encoder for the instruction set
    type Assembler: Assembler + Default;
    /// Trusted decoder for the instruction set
    type Disassembler: Disassembler + Default;
    /// Human readable name, used in logs
    const NAME: &'static str;

    /// Creates the default codec for this instruction set
    fn codec() -> Codec<Self::Assembler, Self::Disassembler> {
        Codec::new(Default::default(), Default::default())
    }
}

/// ARMv7 Thumb, as run by SecureROM-era boot stages
pub struct Thumb;
impl Architecture for Thumb {
    type Assembler = thumb::ThumbAssembler;
    type Disassembler = capstone::CapstoneDisassembler;
    const NAME: &'static str = "thumb";
}

/// x86-64
pub struct X64;
impl Architecture for X64 {
    type Assembler = x64::X64Assembler;
    type Disassembler = iced::IcedDisassembler;
    const NAME: &'static str = "x86-64";
}
