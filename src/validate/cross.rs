//! Cross-validation of the owned assembler against the trusted disassembler

use log::trace;

use crate::address::VirtualAddress;
use crate::code::{Assembler, Disassembler, Instruction};

use super::ValidationErrorKind;

/// Assembles `instruction` at `at` and checks the trusted disassembler reads the same instruction
/// back out of the produced bytes.
///
/// Returns the encoding on success.
pub fn cross_validate<A: Assembler, D: Disassembler>(
    assembler: &A,
    disassembler: &D,
    instruction: &Instruction,
    at: VirtualAddress,
) -> Result<Vec<u8>, ValidationErrorKind> {
    let encoding = assembler
        .assemble(instruction, at)
        .map_err(|source| ValidationErrorKind::Encode {
            instruction: instruction.text(),
            source,
        })?;

    let declared = instruction.width().bytes();
    if encoding.len() != declared {
        return Err(ValidationErrorKind::WidthMismatch {
            instruction: instruction.text(),
            declared,
            encoded: encoding.len(),
        });
    }

    let decoded = disassembler
        .disassemble(&encoding, at, instruction.width())
        .map_err(|source| ValidationErrorKind::Decode {
            instruction: instruction.text(),
            source,
        })?;
    if !decoded.matches(instruction) {
        return Err(ValidationErrorKind::RoundTripMismatch {
            expected: instruction.text(),
            decoded: decoded.text(),
            bytes: encoding,
        });
    }

    trace!("{} at {} encodes as {:02x?}", instruction, at, encoding);
    Ok(encoding)
}

/// Cross-validates a run of instructions laid out back to back from `at`, concatenating the
/// encodings
pub fn cross_validate_all<A: Assembler, D: Disassembler>(
    assembler: &A,
    disassembler: &D,
    instructions: &[Instruction],
    at: VirtualAddress,
) -> Result<Vec<u8>, ValidationErrorKind> {
    let mut bytes = Vec::new();
    let mut cursor = at;
    for instruction in instructions {
        let encoding = cross_validate(assembler, disassembler, instruction, cursor)?;
        cursor = cursor.checked_add(encoding.len() as u64)?;
        bytes.extend_from_slice(&encoding);
    }
    Ok(bytes)
}
