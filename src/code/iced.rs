//! Trusted x86 disassembler backed by iced-x86

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

use crate::address::VirtualAddress;

use super::{DecodeError, Disassembler, Instruction, Width};

/// iced-x86 decoder with an Intel syntax formatter
#[derive(Debug, Clone, Copy)]
pub struct IcedDisassembler {
    /// Code size: 16, 32 or 64
    bitness: u32,
}

impl IcedDisassembler {
    /// Disassembler for code of the given bitness
    pub fn new(bitness: u32) -> Self {
        Self { bitness }
    }

    /// Formatter configured for the syntax [`X64Assembler`](crate::code::x64::X64Assembler) accepts
    fn formatter() -> IntelFormatter {
        let mut formatter = IntelFormatter::new();
        let options = formatter.options_mut();
        options.set_hex_prefix("0x");
        options.set_hex_suffix("");
        options.set_uppercase_hex(false);
        options.set_branch_leading_zeros(false);
        options.set_show_branch_size(false);
        options.set_space_after_operand_separator(true);
        formatter
    }
}

impl Default for IcedDisassembler {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Disassembler for IcedDisassembler {
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

        let mut decoder = Decoder::with_ip(self.bitness, bytes, at.get(), DecoderOptions::NONE);
        let decoded = decoder.decode();
        if decoded.is_invalid() {
            return Err(DecodeError::Invalid {
                address: at,
                bytes: bytes.to_vec(),
            });
        }
        if decoded.len() != len {
            return Err(DecodeError::LengthMismatch {
                address: at,
                declared: len,
                decoded: decoded.len(),
            });
        }

        let mut output = String::new();
        Self::formatter().format(&decoded, &mut output);
        Ok(Instruction::parse(&output, width).with_encoding(bytes))
    }
}
