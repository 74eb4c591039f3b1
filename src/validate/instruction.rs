//! Validation of [`InstructionPatch`]es

use log::warn;

use crate::code::{Assembler, Codec, Disassembler};
use crate::config::PatcherConfig;
use crate::image::Image;
use crate::patch::{InstructionPatch, LengthPolicy};

use super::cross::cross_validate_all;
use super::{Edit, ValidationErrorKind};

/// Checks an instruction patch against `image` and produces its edit.
///
/// When the patch declares original instructions, the span they cover is resolved, read and
/// disassembled one instruction at a time, and every instruction must match its declaration.
/// The patched instructions are then assembled back to back, each at its own address, and each
/// encoding must disassemble to exactly the instruction that was asked for. Finally the patched
/// length is checked against the patch's length policy.
pub(crate) fn validate<A: Assembler, D: Disassembler>(
    patch: &InstructionPatch,
    index: usize,
    image: &Image,
    codec: &Codec<A, D>,
    config: &PatcherConfig,
) -> Result<Edit, ValidationErrorKind> {
    let address = patch.address();

    if patch.original_instructions().is_empty() && patch.patched_instructions().is_empty() {
        return Err(ValidationErrorKind::EmptyPatch);
    }

    let checked = if patch.is_checked() {
        Some(check_originals(patch, image, codec)?)
    } else if config.allow_unchecked {
        warn!(
            "patch #{} at {} does not declare what it replaces, writing blind",
            index, address
        );
        None
    } else {
        return Err(ValidationErrorKind::UncheckedRejected);
    };

    let new_bytes = cross_validate_all(
        &codec.assembler,
        &codec.disassembler,
        patch.patched_instructions(),
        address,
    )?;

    if let Some(expected) = patch.expected_length() {
        if new_bytes.len() != expected {
            return Err(ValidationErrorKind::UnexpectedLength {
                expected,
                actual: new_bytes.len(),
            });
        }
    }

    // without declared originals the replaced span is whatever the new code covers
    let (file_offset, old_bytes) = match checked {
        Some(span) => span,
        None => {
            let range = image
                .segments()
                .resolve_range(address, new_bytes.len() as u64)?;
            (range.start, image.read(range)?.to_vec())
        }
    };

    let resizing = new_bytes.len() != old_bytes.len();
    if resizing {
        match patch.length_policy() {
            LengthPolicy::Exact => {
                return Err(ValidationErrorKind::LengthMismatch {
                    original: old_bytes.len(),
                    patched: new_bytes.len(),
                })
            }
            LengthPolicy::Resize if !config.allow_resizing => {
                return Err(ValidationErrorKind::ResizeDisabled {
                    delta: new_bytes.len() as i64 - old_bytes.len() as i64,
                })
            }
            LengthPolicy::Resize => {}
        }
    }

    Ok(Edit::new(
        index,
        address,
        file_offset,
        old_bytes,
        new_bytes,
        resizing,
    ))
}

/// Resolves and reads the declared original span, then checks each declared instruction against
/// what the disassembler finds there. Returns the span's file offset and bytes.
fn check_originals<A: Assembler, D: Disassembler>(
    patch: &InstructionPatch,
    image: &Image,
    codec: &Codec<A, D>,
) -> Result<(u64, Vec<u8>), ValidationErrorKind> {
    let range = image
        .segments()
        .resolve_range(patch.address(), patch.original_len() as u64)?;
    let old_bytes = image.read(range.clone())?;

    let mut cursor = 0usize;
    for (position, expected) in patch.original_instructions().iter().enumerate() {
        let width = expected.width().bytes();
        let bytes = &old_bytes[cursor..cursor + width];
        let at = patch.address().checked_add(cursor as u64)?;
        let found = match codec.disassemble(bytes, at, expected.width()) {
            Ok(found) if found.matches(expected) => None,
            Ok(found) => Some(found.text()),
            Err(err) => Some(format!("<{}>", err)),
        };
        if let Some(found) = found {
            return Err(ValidationErrorKind::OriginalMismatch {
                position,
                expected: expected.text(),
                found,
                bytes: bytes.to_vec(),
            });
        }
        cursor += width;
    }

    Ok((range.start, old_bytes.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::validate;
    use crate::code::{Architecture, Instruction, Thumb};
    use crate::config::PatcherConfig;
    use crate::image::{Image, ResolveError};
    use crate::patch::{InstructionPatch, LengthPolicy};
    use crate::validate::ValidationErrorKind;

    const BASE: u64 = 0x8400_0000;
    const SITE: u64 = 0x8401_0b96;

    /// Raw image with `ldrb r0, [r4]` at `SITE` and `nop` everywhere else
    fn image() -> Image {
        let mut bytes = [0x00, 0xbf].repeat(0x8800);
        let offset = (SITE - BASE) as usize;
        bytes[offset..offset + 2].copy_from_slice(&[0x20, 0x78]);
        Image::raw(bytes, BASE).unwrap()
    }

    fn check(patch: &InstructionPatch) -> Result<crate::validate::Edit, ValidationErrorKind> {
        validate(patch, 0, &image(), &Thumb::codec(), &PatcherConfig::default())
    }

    #[test]
    fn test_same_length_replacement() {
        let patch = InstructionPatch::new(
            SITE,
            vec![Instruction::narrow("ldrb r0, [r4]")],
            vec![Instruction::narrow("movs r0, #3")],
            "Force the check result",
        );
        let edit = check(&patch).unwrap();
        assert_eq!(edit.file_offset(), SITE - BASE);
        assert_eq!(edit.old_bytes(), [0x20, 0x78]);
        assert_eq!(edit.new_bytes(), [0x03, 0x20]);
        assert!(!edit.is_resizing());
    }

    #[test]
    /// A narrow original replaced by a wide instruction is rejected unless flagged as resizing
    fn test_length_policy() {
        let patch = InstructionPatch::new(
            SITE,
            vec![Instruction::narrow("ldrb r0, [r4]")],
            vec![Instruction::wide("bl #0x84000100")],
            "Too big",
        );
        assert_eq!(
            check(&patch).unwrap_err(),
            ValidationErrorKind::LengthMismatch {
                original: 2,
                patched: 4
            }
        );

        let edit = check(&patch.clone().resizing()).unwrap();
        assert!(edit.is_resizing());
        assert_eq!(edit.delta(), 2);

        let config = PatcherConfig {
            allow_resizing: false,
            ..Default::default()
        };
        let err = validate(&patch.resizing(), 0, &image(), &Thumb::codec(), &config).unwrap_err();
        assert_eq!(err, ValidationErrorKind::ResizeDisabled { delta: 2 });
    }

    #[test]
    /// Two narrow instructions in place of one are rejected under the exact policy
    fn test_length_policy_two_narrow() {
        let patch = InstructionPatch::new(
            SITE,
            vec![Instruction::narrow("ldrb r0, [r4]")],
            vec![Instruction::narrow("movs r0, #3"), Instruction::narrow("bx lr")],
            "Return early",
        );
        assert_eq!(patch.length_policy(), LengthPolicy::Exact);
        assert_eq!(
            check(&patch).unwrap_err(),
            ValidationErrorKind::LengthMismatch {
                original: 2,
                patched: 4
            }
        );

        let edit = check(&patch.resizing()).unwrap();
        assert_eq!(edit.old_bytes(), [0x20, 0x78]);
        assert_eq!(edit.new_bytes(), [0x03, 0x20, 0x70, 0x47]);
    }

    #[test]
    /// The declared originals must be what the image holds
    fn test_original_mismatch() {
        let patch = InstructionPatch::new(
            SITE,
            vec![Instruction::narrow("ldrb r1, [r4]")],
            vec![Instruction::narrow("movs r0, #3")],
            "Wrong build",
        );
        let err = check(&patch).unwrap_err();
        assert_eq!(
            err,
            ValidationErrorKind::OriginalMismatch {
                position: 0,
                expected: "ldrb r1, [r4]".to_string(),
                found: "ldrb r0, [r4]".to_string(),
                bytes: vec![0x20, 0x78],
            }
        );
    }

    #[test]
    /// The second declared instruction is decoded at its own address
    fn test_original_mismatch_position() {
        let patch = InstructionPatch::new(
            SITE - 2,
            vec![Instruction::narrow("nop"), Instruction::narrow("nop")],
            vec![Instruction::narrow("nop"), Instruction::narrow("movs r0, #3")],
            "Off by one",
        );
        let ValidationErrorKind::OriginalMismatch {
            position, found, ..
        } = check(&patch).unwrap_err()
        else {
            panic!("expected an original mismatch");
        };
        assert_eq!(position, 1);
        assert_eq!(found, "ldrb r0, [r4]");
    }

    #[test]
    fn test_expected_length() {
        let patch = InstructionPatch::new(
            SITE,
            vec![Instruction::narrow("ldrb r0, [r4]")],
            vec![Instruction::narrow("movs r0, #3")],
            "Guarded",
        );
        assert!(check(&patch.clone().expect_length(2)).is_ok());
        assert_eq!(
            check(&patch.expect_length(4)).unwrap_err(),
            ValidationErrorKind::UnexpectedLength {
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    /// Unchecked patches replace exactly the span they write
    fn test_unchecked() {
        let patch = InstructionPatch::branch_to(BASE + 0x8c8, BASE + 0x1_0000, "Jump to payload");
        let edit = check(&patch).unwrap();
        assert_eq!(edit.old_bytes(), [0x00, 0xbf, 0x00, 0xbf]);
        assert_eq!(edit.new_bytes().len(), 4);

        let config = PatcherConfig {
            allow_unchecked: false,
            ..Default::default()
        };
        let err = validate(&patch, 0, &image(), &Thumb::codec(), &config).unwrap_err();
        assert_eq!(err, ValidationErrorKind::UncheckedRejected);
    }

    #[test]
    fn test_empty_patch() {
        let patch = InstructionPatch::new(SITE, Vec::new(), Vec::new(), "Nothing");
        assert_eq!(check(&patch).unwrap_err(), ValidationErrorKind::EmptyPatch);
    }

    #[test]
    /// A patch running off the end of the image fails to resolve
    fn test_past_segment_end() {
        let end = BASE + 0x8800 * 2;
        let patch = InstructionPatch::new(
            end - 2,
            vec![Instruction::narrow("nop"), Instruction::narrow("nop")],
            vec![Instruction::narrow("nop"), Instruction::narrow("nop")],
            "Runs off the end",
        );
        assert!(matches!(
            check(&patch).unwrap_err(),
            ValidationErrorKind::Resolve(ResolveError::CrossesSegmentBoundary { .. })
        ));
    }
}
