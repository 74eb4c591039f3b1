//! Structured, instruction-level patches

use crate::address::VirtualAddress;
use crate::code::Instruction;

use super::{Function, LengthPolicy};

/// A small patch of specific instructions, validated against what the binary actually contains.
///
/// The patch writer states which instructions they expect to find at `address` and which
/// instructions should replace them. Before anything is written:
///
/// - the bytes at `address` are disassembled and must match `original_instructions`
/// - the patched instructions are assembled, then disassembled again, and must match themselves
/// - the patched bytes must exactly fill the original span, unless the patch was explicitly
///   declared as size-changing with [`InstructionPatch::resizing`]
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionPatch {
    /// Address of the first replaced instruction
    address: VirtualAddress,
    /// Instructions expected at `address` before patching
    original_instructions: Vec<Instruction>,
    /// Instructions written in their place
    patched_instructions: Vec<Instruction>,
    /// Why the patch exists
    reason: String,
    /// Function the patch lands in, for context in logs and errors
    function: Option<String>,
    /// Size policy
    length: LengthPolicy,
    /// Exact number of bytes the patched instructions must take, if known
    expected_length: Option<usize>,
}
impl InstructionPatch {
    /// Replaces `original_instructions` at `address` with `patched_instructions`
    pub fn new(
        address: impl Into<VirtualAddress>,
        original_instructions: Vec<Instruction>,
        patched_instructions: Vec<Instruction>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            original_instructions,
            patched_instructions,
            reason: reason.into(),
            function: None,
            length: LengthPolicy::Exact,
            expected_length: None,
        }
    }

    /// Writes `patched_instructions` at `address` without checking what was there.
    ///
    /// The round-trip check on the patched instructions still applies.
    pub fn unchecked(
        address: impl Into<VirtualAddress>,
        patched_instructions: Vec<Instruction>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(address, Vec::new(), patched_instructions, reason)
    }

    /// Redirects execution at `address` into a payload at `target` with a Thumb `bl`
    pub fn branch_to(
        address: impl Into<VirtualAddress>,
        target: impl Into<VirtualAddress>,
        reason: impl Into<String>,
    ) -> Self {
        let target = target.into();
        Self::unchecked(
            address,
            vec![Instruction::wide(&format!("bl #{}", target))],
            reason,
        )
    }

    /// Labels the patch with the function it modifies
    pub fn in_function(mut self, function: &Function) -> Self {
        self.function = Some(function.name().to_string());
        self
    }

    /// Marks the patch as size-changing
    pub fn resizing(mut self) -> Self {
        self.length = LengthPolicy::Resize;
        self
    }

    /// Requires the patched instructions to assemble to exactly `len` bytes
    pub fn expect_length(mut self, len: usize) -> Self {
        self.expected_length = Some(len);
        self
    }

    /// Address of the first replaced instruction
    pub fn address(&self) -> VirtualAddress {
        self.address
    }

    /// Instructions expected before patching
    pub fn original_instructions(&self) -> &[Instruction] {
        &self.original_instructions
    }

    /// Instructions written by the patch
    pub fn patched_instructions(&self) -> &[Instruction] {
        &self.patched_instructions
    }

    /// Justification text
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Function label, if any
    pub fn function(&self) -> Option<&str> {
        self.function.as_deref()
    }

    /// Size policy
    pub fn length_policy(&self) -> LengthPolicy {
        self.length
    }

    /// Expected patched length, if set
    pub fn expected_length(&self) -> Option<usize> {
        self.expected_length
    }

    /// Whether the original instructions are checked before patching
    pub fn is_checked(&self) -> bool {
        !self.original_instructions.is_empty()
    }

    /// Total declared size of the original instructions
    pub fn original_len(&self) -> usize {
        self.original_instructions
            .iter()
            .map(|i| i.width().bytes())
            .sum()
    }

    /// Restores a patch from its parts, used by the description format
    pub(crate) fn from_parts(
        address: VirtualAddress,
        original_instructions: Vec<Instruction>,
        patched_instructions: Vec<Instruction>,
        reason: String,
        function: Option<String>,
        length: LengthPolicy,
        expected_length: Option<usize>,
    ) -> Self {
        Self {
            address,
            original_instructions,
            patched_instructions,
            reason,
            function,
            length,
            expected_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::InstructionPatch;
    use crate::code::{Instruction, Width};
    use crate::patch::{Function, LengthPolicy};

    #[test]
    fn test_builders() {
        let function = Function::new("image3_load_validate_signature", 0x8400_568eu64);
        let patch = InstructionPatch::new(
            0x8400_56a0u64,
            vec![Instruction::narrow("ldrb r0, [r4]")],
            vec![Instruction::narrow("movs r0, #3")],
            "Pretend the signature check passed",
        )
        .in_function(&function);
        assert!(patch.is_checked());
        assert_eq!(patch.original_len(), 2);
        assert_eq!(patch.function(), Some("image3_load_validate_signature"));
        assert_eq!(patch.length_policy(), LengthPolicy::Exact);

        let grown = patch.clone().resizing().expect_length(4);
        assert_eq!(grown.length_policy(), LengthPolicy::Resize);
        assert_eq!(grown.expected_length(), Some(4));
    }

    #[test]
    fn test_branch_to() {
        let patch = InstructionPatch::branch_to(0x8400_08c8u64, 0x5ff0_00fcu64, "Jump to payload");
        assert!(!patch.is_checked());
        let [bl] = patch.patched_instructions() else {
            panic!("expected a single instruction");
        };
        assert_eq!(bl.to_string(), "bl #0x5ff000fc");
        assert_eq!(bl.width(), Width::Wide);
    }
}
