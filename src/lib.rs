#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod address;
pub mod code;
pub mod config;
pub mod describe;
pub mod image;
pub mod patch;
pub mod patcher;
pub mod validate;

pub use address::VirtualAddress;
pub use code::{Architecture, Codec, Instruction, Thumb, Width, X64};
pub use config::PatcherConfig;
pub use image::{Image, Segment, SegmentMap};
pub use patch::{BlobPatch, InstructionPatch, LengthPolicy, Patch, PatchSet};
pub use patcher::{Applier, ApplyError, ApplyReport};
pub use validate::{validate_parallel, Edit, ValidationError, ValidationErrorKind, Validator};
