//! # Validate
//!
//! Turns declared [`Patch`]es into concrete [`Edit`]s, reading the image but never writing it.
//!
//! Validation is idempotent: the same patch against the same image always yields the same edit
//! or the same error, so it can be run as many times as needed before anything is committed.

pub mod blob;
pub mod cross;
pub mod instruction;

use std::num::NonZeroUsize;
use std::ops::Range;
use std::{panic, thread};

use log::{debug, info, warn};
use thiserror::Error;

use crate::address::{AddressError, VirtualAddress};
use crate::code::{Assembler, Codec, DecodeError, Disassembler, EncodeError};
use crate::config::PatcherConfig;
use crate::image::{Image, ResolveError};
use crate::patch::{Patch, PatchSet};

pub use self::cross::{cross_validate, cross_validate_all};

/// A validated, concrete byte replacement.
///
/// Only validation produces edits, so holding one means its `old_bytes` were read from the image
/// and its `new_bytes` passed every check of the patch that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    /// Position of the producing patch in its set
    patch_index: usize,
    /// Virtual address of the replaced bytes
    address: VirtualAddress,
    /// File offset of the replaced bytes
    file_offset: u64,
    /// Bytes found in the image
    old_bytes: Vec<u8>,
    /// Bytes to write
    new_bytes: Vec<u8>,
    /// Whether the edit changes the size of the image
    resizing: bool,
}

impl Edit {
    /// Builds an edit. Only validation may do this.
    pub(crate) fn new(
        patch_index: usize,
        address: VirtualAddress,
        file_offset: u64,
        old_bytes: Vec<u8>,
        new_bytes: Vec<u8>,
        resizing: bool,
    ) -> Self {
        Self {
            patch_index,
            address,
            file_offset,
            old_bytes,
            new_bytes,
            resizing,
        }
    }

    /// Position of the producing patch in its set
    pub fn patch_index(&self) -> usize {
        self.patch_index
    }

    /// Virtual address of the replaced bytes
    pub fn address(&self) -> VirtualAddress {
        self.address
    }

    /// File offset of the replaced bytes
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Bytes found in the image
    pub fn old_bytes(&self) -> &[u8] {
        &self.old_bytes
    }

    /// Bytes to write
    pub fn new_bytes(&self) -> &[u8] {
        &self.new_bytes
    }

    /// Whether the edit changes the size of the image
    pub fn is_resizing(&self) -> bool {
        self.resizing
    }

    /// File range replaced in the unmodified image
    pub fn range(&self) -> Range<u64> {
        self.file_offset..self.file_offset + self.old_bytes.len() as u64
    }

    /// Change in image size once the edit is applied
    pub fn delta(&self) -> i64 {
        self.new_bytes.len() as i64 - self.old_bytes.len() as i64
    }
}

/// What went wrong while validating a patch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationErrorKind {
    /// The patch's range could not be resolved or read
    #[error("{0}")]
    Resolve(#[from] ResolveError),
    /// The image does not contain the declared original instruction
    #[error("original instruction {position} should be \"{expected}\", found \"{found}\" ({bytes:02x?})")]
    OriginalMismatch {
        /// Position of the instruction within the patch
        position: usize,
        /// Declared instruction
        expected: String,
        /// What the disassembler read instead
        found: String,
        /// Bytes at that position
        bytes: Vec<u8>,
    },
    /// A patched instruction could not be assembled
    #[error("cannot assemble \"{instruction}\": {source}")]
    Encode {
        /// Offending instruction
        instruction: String,
        /// Assembler error
        source: EncodeError,
    },
    /// The disassembler could not read back an assembled instruction
    #[error("cannot disassemble the encoding of \"{instruction}\": {source}")]
    Decode {
        /// Offending instruction
        instruction: String,
        /// Disassembler error
        source: DecodeError,
    },
    /// The disassembler read back a different instruction than was assembled
    #[error("assembled \"{expected}\" as {bytes:02x?}, which disassembles as \"{decoded}\"")]
    RoundTripMismatch {
        /// Instruction that was assembled
        expected: String,
        /// Instruction read back
        decoded: String,
        /// Produced encoding
        bytes: Vec<u8>,
    },
    /// An encoding's size differs from the instruction's declared width
    #[error("\"{instruction}\" was declared as {declared} bytes but assembled to {encoded}")]
    WidthMismatch {
        /// Offending instruction
        instruction: String,
        /// Declared size
        declared: usize,
        /// Encoded size
        encoded: usize,
    },
    /// Patched bytes do not exactly fill the replaced span
    #[error("patched code is {patched} bytes but replaces {original}")]
    LengthMismatch {
        /// Size of the replaced span
        original: usize,
        /// Size of the patched code
        patched: usize,
    },
    /// Patched bytes differ from the patch's expected length
    #[error("patched code is {actual} bytes, expected {expected}")]
    UnexpectedLength {
        /// Declared expected length
        expected: usize,
        /// Size of the patched code
        actual: usize,
    },
    /// A blob patch has no content
    #[error("blob has no content")]
    EmptyBlob,
    /// An instruction patch neither checks nor writes anything
    #[error("patch has no instructions")]
    EmptyPatch,
    /// The patch has no reason and reasons are required
    #[error("patch has no reason")]
    MissingReason,
    /// The patch declares no original instructions and unchecked patches are not allowed
    #[error("patch does not declare the instructions it replaces")]
    UncheckedRejected,
    /// The patch changes the image size and resizing is not allowed
    #[error("patch changes the image size by {delta} bytes, which is not allowed")]
    ResizeDisabled {
        /// Size change
        delta: i64,
    },
    /// Address arithmetic failed
    #[error("{0}")]
    Address(#[from] AddressError),
}

/// A patch that failed validation, labelled with enough context to find it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("patch #{index} at {address}{} ({reason:?}): {kind}", in_function(.function))]
pub struct ValidationError {
    /// Position of the patch in its set
    pub index: usize,
    /// Address the patch targets
    pub address: VirtualAddress,
    /// Function the patch is labelled with
    pub function: Option<String>,
    /// The patch's reason text
    pub reason: String,
    /// What went wrong
    pub kind: ValidationErrorKind,
}

/// ` in <name>` for labelled patches
fn in_function(function: &Option<String>) -> String {
    function
        .as_deref()
        .map(|name| format!(" in {}", name))
        .unwrap_or_default()
}

/// Function label of `patch`, if it has one
fn function_of(patch: &Patch) -> Option<&str> {
    match patch {
        Patch::Instruction(p) => p.function(),
        Patch::Blob(_) => None,
    }
}

/// Validates patches with one codec and configuration
#[derive(Debug)]
pub struct Validator<'a, A, D> {
    /// Assembler/disassembler pair
    codec: &'a Codec<A, D>,
    /// Settings
    config: &'a PatcherConfig,
}

impl<'a, A: Assembler, D: Disassembler> Validator<'a, A, D> {
    /// Creates a validator
    pub fn new(codec: &'a Codec<A, D>, config: &'a PatcherConfig) -> Self {
        Self { codec, config }
    }

    /// Validates one patch against the unmodified `image`
    pub fn validate(
        &self,
        index: usize,
        patch: &Patch,
        image: &Image,
    ) -> Result<Edit, ValidationError> {
        let function = function_of(patch).map(str::to_string);
        let fail = |kind: ValidationErrorKind| {
            let err = ValidationError {
                index,
                address: patch.address(),
                function: function.clone(),
                reason: patch.reason().to_string(),
                kind,
            };
            warn!("{}", err);
            err
        };

        if patch.reason().trim().is_empty() {
            if self.config.strict_reasons {
                return Err(fail(ValidationErrorKind::MissingReason));
            }
            warn!("patch #{} at {} has no reason", index, patch.address());
        }

        let edit = match patch {
            Patch::Instruction(p) => {
                instruction::validate(p, index, image, self.codec, self.config)
            }
            Patch::Blob(p) => blob::validate(p, index, image),
        }
        .map_err(fail)?;

        debug!(
            "patch #{} at {}{} ({}): {:02x?} -> {:02x?}",
            index,
            patch.address(),
            in_function(&function),
            patch.reason(),
            edit.old_bytes(),
            edit.new_bytes()
        );
        Ok(edit)
    }

    /// Validates every patch in declaration order, stopping at the first failure
    pub fn validate_all(
        &self,
        set: &PatchSet,
        image: &Image,
    ) -> Result<Vec<Edit>, ValidationError> {
        let edits = set
            .patches()
            .iter()
            .enumerate()
            .map(|(index, patch)| self.validate(index, patch, image))
            .collect::<Result<Vec<_>, _>>()?;
        info!("validated {} patch(es) in set \"{}\"", edits.len(), set.name());
        Ok(edits)
    }
}

impl<'a, A: Assembler + Sync, D: Disassembler + Sync> Validator<'a, A, D> {
    /// Validates every patch across `workers` threads against the same image snapshot.
    ///
    /// Edits come back in declaration order, and on failure the error of the first failing
    /// patch in declaration order is returned, exactly as with [`Validator::validate_all`].
    pub fn validate_parallel(
        &self,
        set: &PatchSet,
        image: &Image,
        workers: Option<usize>,
    ) -> Result<Vec<Edit>, ValidationError> {
        let patches = set.patches();
        let workers = workers
            .or(self.config.workers)
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, NonZeroUsize::get))
            .clamp(1, patches.len().max(1));
        if workers == 1 {
            return self.validate_all(set, image);
        }

        let chunk_len = patches.len().div_ceil(workers);
        debug!(
            "validating {} patch(es) on {} thread(s)",
            patches.len(),
            workers
        );
        let results: Vec<Result<Edit, ValidationError>> = thread::scope(|scope| {
            let handles = patches
                .chunks(chunk_len)
                .enumerate()
                .map(|(chunk, patches)| {
                    scope.spawn(move || {
                        patches
                            .iter()
                            .enumerate()
                            .map(|(i, patch)| self.validate(chunk * chunk_len + i, patch, image))
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .flat_map(|handle| match handle.join() {
                    Ok(results) => results,
                    Err(payload) => panic::resume_unwind(payload),
                })
                .collect()
        });

        let edits = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        info!("validated {} patch(es) in set \"{}\"", edits.len(), set.name());
        Ok(edits)
    }
}

/// Validates `set` against `image` on scoped threads.
///
/// `workers` of `None` uses the machine's available parallelism.
pub fn validate_parallel<A: Assembler + Sync, D: Disassembler + Sync>(
    set: &PatchSet,
    image: &Image,
    codec: &Codec<A, D>,
    workers: Option<usize>,
) -> Result<Vec<Edit>, ValidationError> {
    let config = PatcherConfig {
        workers,
        ..Default::default()
    };
    Validator::new(codec, &config).validate_parallel(set, image, workers)
}

#[cfg(test)]
mod tests {
    use super::{Validator, ValidationErrorKind};
    use crate::code::{Architecture, Instruction, Thumb};
    use crate::config::PatcherConfig;
    use crate::image::Image;
    use crate::patch::{BlobPatch, Function, FunctionTable, InstructionPatch, PatchSet};

    const BASE: u64 = 0x8400_0000;

    /// 64 bytes of `nop` loaded at `BASE`
    fn image() -> Image {
        Image::raw([0x00, 0xbf].repeat(32), BASE).unwrap()
    }

    #[test]
    fn test_empty_reason() {
        let codec = Thumb::codec();
        let patch = BlobPatch::new(BASE, [1u8, 2], "").into();

        let lenient = PatcherConfig::default();
        assert!(Validator::new(&codec, &lenient).validate(0, &patch, &image()).is_ok());

        let strict = PatcherConfig {
            strict_reasons: true,
            ..Default::default()
        };
        let err = Validator::new(&codec, &strict)
            .validate(3, &patch, &image())
            .unwrap_err();
        assert_eq!(err.index, 3);
        assert_eq!(err.kind, ValidationErrorKind::MissingReason);
    }

    #[test]
    /// Errors are labelled with the patch index, address and reason
    fn test_error_context() {
        let codec = Thumb::codec();
        let config = PatcherConfig::default();
        let set = PatchSet::new("test")
            .with(BlobPatch::new(BASE, [1u8], "first"))
            .with(BlobPatch::new(BASE + 0x100, [1u8], "unmapped"));
        let err = Validator::new(&codec, &config)
            .validate_all(&set, &image())
            .unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.address.get(), BASE + 0x100);
        assert_eq!(err.reason, "unmapped");
        assert!(matches!(err.kind, ValidationErrorKind::Resolve(_)));
        assert_eq!(err.function, None);
        assert!(err.to_string().starts_with("patch #1 at 0x84000100 ("));
    }

    #[test]
    /// Errors from labelled patches name the function they land in
    fn test_error_function() {
        let codec = Thumb::codec();
        let config = PatcherConfig::default();
        let functions = FunctionTable::new([
            Function::new("main_ibss", BASE),
            Function::new("image3_load_validate_signature", BASE + 0x20),
        ]);
        let site = BASE + 0x24;
        let function = functions.containing(site.into()).unwrap();
        let patch = InstructionPatch::new(
            site,
            vec![Instruction::narrow("ldrb r0, [r4]")],
            vec![Instruction::narrow("movs r0, #3")],
            "sig",
        )
        .in_function(function)
        .into();

        let err = Validator::new(&codec, &config)
            .validate(0, &patch, &image())
            .unwrap_err();
        assert_eq!(err.function.as_deref(), Some("image3_load_validate_signature"));
        assert!(matches!(err.kind, ValidationErrorKind::OriginalMismatch { .. }));
        assert!(err
            .to_string()
            .starts_with("patch #0 at 0x84000024 in image3_load_validate_signature (\"sig\"): "));
    }

    #[test]
    /// Threads see the same results as the sequential path, in the same order
    fn test_parallel_matches_sequential() {
        let codec = Thumb::codec();
        let config = PatcherConfig::default();
        let image = image();
        let mut set = PatchSet::new("many");
        for n in 0..16u64 {
            set.push(InstructionPatch::new(
                BASE + n * 2,
                vec![Instruction::narrow("nop")],
                vec![Instruction::narrow(&format!("movs r0, #{}", n))],
                "numbered",
            ));
        }
        let validator = Validator::new(&codec, &config);
        let sequential = validator.validate_all(&set, &image).unwrap();
        let parallel = validator.validate_parallel(&set, &image, Some(4)).unwrap();
        assert_eq!(sequential, parallel);

        // two failures: the earlier one wins on every path
        set.push(BlobPatch::new(0u64, [1u8], "unmapped"));
        let mut patches = set.patches().to_vec();
        patches.insert(5, BlobPatch::new(BASE, Vec::new(), "empty").into());
        let set: PatchSet = patches.into_iter().collect();
        let sequential = validator.validate_all(&set, &image).unwrap_err();
        let parallel = validator.validate_parallel(&set, &image, Some(3)).unwrap_err();
        assert_eq!(sequential, parallel);
        assert_eq!(parallel.index, 5);
        assert_eq!(parallel.kind, ValidationErrorKind::EmptyBlob);
    }

    #[test]
    /// Running validation twice gives the same edits
    fn test_idempotent() {
        let codec = Thumb::codec();
        let config = PatcherConfig::default();
        let image = image();
        let set = PatchSet::new("twice").with(InstructionPatch::new(
            BASE + 4,
            vec![Instruction::narrow("nop"), Instruction::narrow("nop")],
            vec![Instruction::wide("bl #0x84000100")],
            "call",
        ));
        let validator = Validator::new(&codec, &config);
        assert_eq!(
            validator.validate_all(&set, &image).unwrap(),
            validator.validate_all(&set, &image).unwrap()
        );
    }
}
