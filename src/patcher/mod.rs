//! # Patcher
//!
//! Commits validated [`Edit`]s to an [`Image`]. Either every edit lands or none of them do.

pub mod journal;

use std::ops::Range;

use log::{debug, info};
use thiserror::Error;

use crate::code::{Assembler, Codec, Disassembler};
use crate::config::PatcherConfig;
use crate::image::{Image, LayoutError};
use crate::patch::PatchSet;
use crate::validate::{Edit, ValidationError, Validator};

pub use self::journal::Journal;

/// Errors applying a set of edits. The image is unchanged whenever one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// A patch failed validation, so nothing was written
    #[error("{0}")]
    Validation(#[from] ValidationError),
    /// Two edits claim the same bytes
    #[error("patch #{first} ({first_range:#x?}) overlaps patch #{second} ({second_range:#x?})")]
    OverlappingEdits {
        /// Patch index of the edit starting first in the file
        first: usize,
        /// Patch index of the other edit
        second: usize,
        /// File range of `first`
        first_range: Range<u64>,
        /// File range of `second`
        second_range: Range<u64>,
    },
    /// An edit lies outside the image buffer
    #[error("patch #{index} writes {range:#x?}, outside the {len:#x} byte image")]
    OutOfBounds {
        /// Patch index of the edit
        index: usize,
        /// File range of the edit
        range: Range<u64>,
        /// Image length
        len: u64,
    },
    /// The bytes under an edit are not the ones it was validated against
    #[error("patch #{index} was validated against different bytes at {offset:#x}")]
    StaleEdit {
        /// Patch index of the edit
        index: usize,
        /// File offset of the edit
        offset: u64,
    },
    /// A size-changing edit left the segment map invalid
    #[error("resize failed: {0}")]
    Resize(#[from] LayoutError),
}

/// One committed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    /// Patch that produced the write
    pub patch_index: usize,
    /// File offset in the final patched image
    pub offset: u64,
    /// Bytes replaced
    pub old_bytes: Vec<u8>,
    /// Bytes written
    pub new_bytes: Vec<u8>,
}

/// Everything an apply wrote, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Committed writes
    pub writes: Vec<Write>,
}
impl ApplyReport {
    /// Net change in image size
    pub fn delta(&self) -> i64 {
        self.writes
            .iter()
            .map(|w| w.new_bytes.len() as i64 - w.old_bytes.len() as i64)
            .sum()
    }
}

/// Applies patch sets to images
#[derive(Debug, Clone, Default)]
pub struct Applier {
    /// Settings used when validating
    config: PatcherConfig,
}
impl Applier {
    /// Creates an applier
    pub fn new(config: PatcherConfig) -> Self {
        Self { config }
    }

    /// Settings in use
    pub fn config(&self) -> &PatcherConfig {
        &self.config
    }

    /// Validates every patch of `set` against `image`, then commits all of them.
    ///
    /// Nothing is written unless every patch validates.
    pub fn run<A: Assembler + Sync, D: Disassembler + Sync>(
        &self,
        image: &mut Image,
        set: &PatchSet,
        codec: &Codec<A, D>,
    ) -> Result<ApplyReport, ApplyError> {
        let validator = Validator::new(codec, &self.config);
        let edits = match self.config.workers {
            Some(1) => validator.validate_all(set, image)?,
            workers => validator.validate_parallel(set, image, workers)?,
        };
        self.apply(image, &edits)
    }

    /// Commits `edits`, which must have been validated against `image` as it is now.
    ///
    /// Every edit is checked against the buffer and against every other edit before the first
    /// byte is written. Edits are then written in declaration order. A size-changing edit moves
    /// everything after it, so later offsets are adjusted by the size changes of the edits that
    /// precede them in the file.
    pub fn apply(&self, image: &mut Image, edits: &[Edit]) -> Result<ApplyReport, ApplyError> {
        check_bounds(image, edits)?;
        check_overlaps(edits)?;

        let mut journal = Journal::new(image);
        let mut report = ApplyReport::default();
        for (n, edit) in edits.iter().enumerate() {
            let offset = shifted(edit, &edits[..n]);
            journal.write(offset as usize, edit.old_bytes().len(), edit.new_bytes())?;
            debug!(
                "patch #{} at {} (file {:#x}): {:02x?} -> {:02x?}",
                edit.patch_index(),
                edit.address(),
                offset,
                edit.old_bytes(),
                edit.new_bytes()
            );
            report.writes.push(Write {
                patch_index: edit.patch_index(),
                offset: shifted(edit, edits),
                old_bytes: edit.old_bytes().to_vec(),
                new_bytes: edit.new_bytes().to_vec(),
            });
        }
        journal.commit();

        info!(
            "applied {} edit(s), image size changed by {} byte(s)",
            report.writes.len(),
            report.delta()
        );
        Ok(report)
    }
}

/// Offset of `edit` once the size changes of `before` have been applied. Only resizing edits
/// located ahead of `edit` in the file move it.
fn shifted(edit: &Edit, before: &[Edit]) -> u64 {
    let shift: i64 = before
        .iter()
        .filter(|other| other.is_resizing() && other.file_offset() < edit.file_offset())
        .map(Edit::delta)
        .sum();
    (edit.file_offset() as i64 + shift) as u64
}

/// Checks every edit lies inside the buffer and still sees the bytes it was validated against
fn check_bounds(image: &Image, edits: &[Edit]) -> Result<(), ApplyError> {
    for edit in edits {
        let range = edit.range();
        let current = image.read(range.clone()).map_err(|_| ApplyError::OutOfBounds {
            index: edit.patch_index(),
            range: range.clone(),
            len: image.len() as u64,
        })?;
        if current != edit.old_bytes() {
            return Err(ApplyError::StaleEdit {
                index: edit.patch_index(),
                offset: range.start,
            });
        }
    }
    Ok(())
}

/// Checks no two edits share a byte
fn check_overlaps(edits: &[Edit]) -> Result<(), ApplyError> {
    let mut sorted: Vec<&Edit> = edits.iter().collect();
    sorted.sort_by_key(|edit| (edit.range().start, edit.range().end));
    for pair in sorted.windows(2) {
        let (first, second) = (pair[0], pair[1]);
        if first.range().end > second.range().start {
            return Err(ApplyError::OverlappingEdits {
                first: first.patch_index(),
                second: second.patch_index(),
                first_range: first.range(),
                second_range: second.range(),
            });
        }
    }
    Ok(())
}
