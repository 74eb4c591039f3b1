//! Trusted ARM/Thumb disassembler backed by capstone

use ::capstone::arch::arm::ArchMode;
use ::capstone::arch::BuildsCapstone;
use ::capstone::Capstone;

use crate::address::VirtualAddress;

use super::{DecodeError, Disassembler, Instruction, Width};

/// Capstone-backed disassembler for ARM or Thumb code
///
/// A fresh capstone handle is opened per call, so the disassembler can be shared across validation
/// threads.
#[derive(Debug, Clone, Copy)]
pub struct CapstoneDisassembler {
    /// Instruction set state the bytes are decoded in
    thumb: bool,
}

impl CapstoneDisassembler {
    /// Decodes Thumb (including 32-bit Thumb-2) code
    pub fn thumb() -> Self {
        Self { thumb: true }
    }

    /// Decodes 32-bit ARM code
    pub fn arm() -> Self {
        Self { thumb: false }
    }

    /// Opens a capstone handle in the configured mode
    fn handle(&self) -> Result<Capstone, DecodeError> {
        let mode = if self.thumb {
            ArchMode::Thumb
        } else {
            ArchMode::Arm
        };
        Capstone::new()
            .arm()
            .mode(mode)
            .build()
            .map_err(|e| DecodeError::Backend(e.to_string()))
    }
}

impl Default for CapstoneDisassembler {
    fn default() -> Self {
        Self::thumb()
    }
}

impl Disassembler for CapstoneDisassembler {
    fn disassemble(
        &self,
        bytes: &[u8],
        at: VirtualAddress,
        width: Width,
    ) -> Result<Instruction, DecodeError> {
        let len = width.bytes();
        let bytes = bytes.get(..len).ok_or(DecodeError::Truncated {
            address: at,
            needed: len,
            available: bytes.len(),
        })?;
        let invalid = || DecodeError::Invalid {
            address: at,
            bytes: bytes.to_vec(),
        };

        let cs = self.handle()?;
        let insns = cs.disasm_count(bytes, at.get(), 1).map_err(|_| invalid())?;
        let insn = insns.iter().next().ok_or_else(invalid)?;

        let decoded = insn.bytes().len();
        if decoded != len {
            return Err(DecodeError::LengthMismatch {
                address: at,
                declared: len,
                decoded,
            });
        }

        let text = format!(
            "{} {}",
            insn.mnemonic().unwrap_or_default(),
            insn.op_str().unwrap_or_default()
        );
        Ok(Instruction::parse(&text, width).with_encoding(insn.bytes()))
    }
}
