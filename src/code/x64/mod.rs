//! # x64
//!
//! Owned assembler for a small subset of x86-64, in the Intel syntax produced by
//! [`IcedDisassembler`](crate::code::iced::IcedDisassembler)

use crate::address::VirtualAddress;

use super::{Assembler, EncodeError, Instruction};

/// 64-bit general purpose registers, in encoding order
const REGS64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

/// 32-bit registers that don't need a REX prefix
const REGS32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];

/// Encoder for x86-64 code
#[derive(Debug, Default, Clone, Copy)]
pub struct X64Assembler;

impl X64Assembler {
    /// Creates a new [`X64Assembler`]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Parses `0x`-prefixed hex or decimal
fn number(text: &str) -> Option<u64> {
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Encodes a relative branch with opcode `opcode` and a displacement of `disp_len` bytes
fn rel_branch(
    instruction: &Instruction,
    at: VirtualAddress,
    opcode: u8,
    disp_len: usize,
) -> Result<Vec<u8>, EncodeError> {
    let ops = instruction.operands();
    let [target] = ops else {
        return Err(EncodeError::OperandCount {
            instruction: instruction.text(),
            expected: 1,
        });
    };
    let target_addr = number(target).ok_or_else(|| EncodeError::InvalidOperand {
        instruction: instruction.text(),
        operand: target.clone(),
    })?;

    // displacement is relative to the end of the instruction
    let next = at.checked_add(1 + disp_len as u64)?.get();
    let disp = i128::from(target_addr) - i128::from(next);
    let out_of_range = || EncodeError::BranchOutOfRange {
        instruction: instruction.text(),
        from: at,
        target: target_addr,
    };

    let mut bytes = vec![opcode];
    match disp_len {
        1 => bytes.push(i8::try_from(disp).map_err(|_| out_of_range())? as u8),
        _ => bytes.extend_from_slice(
            &i32::try_from(disp)
                .map_err(|_| out_of_range())?
                .to_le_bytes(),
        ),
    }
    Ok(bytes)
}

impl Assembler for X64Assembler {
    fn assemble(
        &self,
        instruction: &Instruction,
        at: VirtualAddress,
    ) -> Result<Vec<u8>, EncodeError> {
        let text = instruction.text();
        let width = instruction.width().bytes();
        let invalid = |operand: &str| EncodeError::InvalidOperand {
            instruction: text.clone(),
            operand: operand.to_string(),
        };
        let count = |expected: usize| EncodeError::OperandCount {
            instruction: text.clone(),
            expected,
        };
        let reg64 = |name: &str| REGS64.iter().position(|&r| r == name).map(|r| r as u8);
        let reg32 = |name: &str| REGS32.iter().position(|&r| r == name).map(|r| r as u8);

        let bytes = match (instruction.mnemonic(), instruction.operands()) {
            ("nop", []) => vec![0x90],
            ("ret", []) => vec![0xc3],
            ("int3", []) => vec![0xcc],
            ("hlt", []) => vec![0xf4],
            ("nop" | "ret" | "int3" | "hlt", _) => return Err(count(0)),
            (op @ ("push" | "pop"), [reg]) => {
                let r = reg64(reg.as_str()).ok_or_else(|| invalid(reg.as_str()))?;
                let base = if op == "push" { 0x50 } else { 0x58 };
                if r < 8 {
                    vec![base + r]
                } else {
                    // REX.B selects r8-r15
                    vec![0x41, base + (r - 8)]
                }
            }
            ("xor", [dst, src]) => {
                let d = reg32(dst.as_str()).ok_or_else(|| invalid(dst.as_str()))?;
                let s = reg32(src.as_str()).ok_or_else(|| invalid(src.as_str()))?;
                vec![0x31, 0xc0 | s << 3 | d]
            }
            ("mov", [dst, imm]) => {
                let d = reg32(dst.as_str()).ok_or_else(|| invalid(dst.as_str()))?;
                let value = number(imm).ok_or_else(|| invalid(imm.as_str()))?;
                let value = u32::try_from(value).map_err(|_| EncodeError::ImmediateOutOfRange {
                    instruction: text.clone(),
                    value: value as i64,
                })?;
                let mut bytes = vec![0xb8 + d];
                bytes.extend_from_slice(&value.to_le_bytes());
                bytes
            }
            ("jmp", _) if width == 2 => rel_branch(instruction, at, 0xeb, 1)?,
            ("jmp", _) => rel_branch(instruction, at, 0xe9, 4)?,
            ("call", _) => rel_branch(instruction, at, 0xe8, 4)?,
            ("push" | "pop", _) => return Err(count(1)),
            ("xor" | "mov", _) => return Err(count(2)),
            _ => return Err(EncodeError::Unsupported(text)),
        };

        if bytes.len() != width {
            return Err(EncodeError::WidthUnavailable {
                instruction: text,
                width: instruction.width(),
            });
        }
        Ok(bytes)
    }
}
