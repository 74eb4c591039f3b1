//! # Patch
//!
//! Declarative descriptions of changes to an image. A [`Patch`] only states what it expects and
//! what it wants written; turning it into bytes happens in [`validate`](crate::validate), and
//! writing those bytes happens in [`patcher`](crate::patcher).

pub mod blob;
pub mod function;
pub mod instruction;
pub mod set;

use crate::address::VirtualAddress;
use crate::code::{Assembler, Codec, Disassembler};
use crate::config::PatcherConfig;
use crate::image::Image;
use crate::validate::{Edit, ValidationError, Validator};

pub use self::blob::BlobPatch;
pub use self::function::{Function, FunctionTable};
pub use self::instruction::InstructionPatch;
pub use self::set::PatchSet;

/// How an instruction patch may relate to the size of the code it replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthPolicy {
    /// The patched bytes must exactly fill the original span
    #[default]
    Exact,
    /// The patched bytes may be longer or shorter than the original span. The image grows or
    /// shrinks and every later segment is moved.
    Resize,
}

/// Every kind of patch the engine knows how to validate
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// Instruction-level replacement with pre- and post-conditions
    Instruction(InstructionPatch),
    /// Unconditional overwrite with opaque bytes
    Blob(BlobPatch),
}
impl Patch {
    /// Address the patch targets
    pub fn address(&self) -> VirtualAddress {
        match self {
            Patch::Instruction(p) => p.address(),
            Patch::Blob(p) => p.address(),
        }
    }

    /// Justification text
    pub fn reason(&self) -> &str {
        match self {
            Patch::Instruction(p) => p.reason(),
            Patch::Blob(p) => p.reason(),
        }
    }

    /// Validates the patch against the unmodified `image` with the default configuration.
    ///
    /// `index` is the patch's position in its set and is only used to label errors.
    pub fn validate<A: Assembler, D: Disassembler>(
        &self,
        index: usize,
        image: &Image,
        codec: &Codec<A, D>,
    ) -> Result<Edit, ValidationError> {
        let config = PatcherConfig::default();
        Validator::new(codec, &config).validate(index, self, image)
    }
}

impl From<InstructionPatch> for Patch {
    fn from(patch: InstructionPatch) -> Self {
        Patch::Instruction(patch)
    }
}

impl From<BlobPatch> for Patch {
    fn from(patch: BlobPatch) -> Self {
        Patch::Blob(patch)
    }
}
