//! # Thumb
//!
//! Owned assembler for the subset of ARMv7 Thumb used when patching boot stages.
//!
//! The syntax accepted is capstone's, so the text of a patch can be compared directly against what
//! [`CapstoneDisassembler`](crate::code::capstone::CapstoneDisassembler) produces.

pub mod operand;

use log::trace;

use crate::address::VirtualAddress;

use super::{Assembler, EncodeError, Instruction, Width};

/// Thumb reads the PC as the address of the current instruction plus 4
const PC_OFFSET: u64 = 4;

/// Encoder for 16-bit and 32-bit Thumb instructions
#[derive(Debug, Default, Clone, Copy)]
pub struct ThumbAssembler;

impl ThumbAssembler {
    /// Creates a new [`ThumbAssembler`]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Assembler for ThumbAssembler {
    fn assemble(
        &self,
        instruction: &Instruction,
        at: VirtualAddress,
    ) -> Result<Vec<u8>, EncodeError> {
        if at.get() % 2 != 0 {
            return Err(EncodeError::Misaligned {
                instruction: instruction.text(),
                address: at.get(),
            });
        }

        let ctx = Context { instruction, at };
        let bytes = match instruction.mnemonic() {
            "bl" => ctx.wide_branch(0xd000)?,
            "b.w" => ctx.wide_branch(0x9000)?,
            _ => {
                let half = ctx.narrow()?;
                ctx.require(Width::Narrow)?;
                half.to_le_bytes().to_vec()
            }
        };
        trace!("assembled \"{}\" at {} -> {:02x?}", instruction, at, bytes);
        Ok(bytes)
    }
}

/// State for encoding one instruction
struct Context<'a> {
    /// Instruction being encoded
    instruction: &'a Instruction,
    /// Address it's being encoded at
    at: VirtualAddress,
}

impl Context<'_> {
    /// Fails unless the instruction was declared with `width`
    fn require(&self, width: Width) -> Result<(), EncodeError> {
        if self.instruction.width().bytes() != width.bytes() {
            return Err(EncodeError::WidthUnavailable {
                instruction: self.instruction.text(),
                width: self.instruction.width(),
            });
        }
        Ok(())
    }

    /// Returns exactly `N` operands
    fn operands<const N: usize>(&self) -> Result<[&str; N], EncodeError> {
        let ops = self.instruction.operands();
        if ops.len() != N {
            return Err(EncodeError::OperandCount {
                instruction: self.instruction.text(),
                expected: N,
            });
        }
        let mut out = [""; N];
        for (slot, op) in out.iter_mut().zip(ops) {
            *slot = op.as_str();
        }
        Ok(out)
    }

    /// Builds an invalid operand error
    fn invalid(&self, operand: &str) -> EncodeError {
        EncodeError::InvalidOperand {
            instruction: self.instruction.text(),
            operand: operand.to_string(),
        }
    }

    /// Parses a register that has to be r0-r7
    fn low(&self, token: &str) -> Result<u16, EncodeError> {
        operand::low_register(token)
            .map(u16::from)
            .ok_or_else(|| self.invalid(token))
    }

    /// Parses any register
    fn reg(&self, token: &str) -> Result<u16, EncodeError> {
        operand::register(token)
            .map(u16::from)
            .ok_or_else(|| self.invalid(token))
    }

    /// Parses an immediate in `0..=max` that is a multiple of `scale`, returning `value / scale`
    fn imm(&self, token: &str, max: i64, scale: i64) -> Result<u16, EncodeError> {
        let value = operand::immediate(token).ok_or_else(|| self.invalid(token))?;
        if !(0..=max).contains(&value) || value % scale != 0 {
            return Err(EncodeError::ImmediateOutOfRange {
                instruction: self.instruction.text(),
                value,
            });
        }
        Ok((value / scale) as u16)
    }

    /// Parses a `[rn, #imm]` operand with a low base register and a scaled 5-bit offset
    fn mem(&self, token: &str, scale: i64) -> Result<(u16, u16), EncodeError> {
        let (base, offset) = operand::memory(token).ok_or_else(|| self.invalid(token))?;
        if base >= 8 {
            return Err(self.invalid(token));
        }
        if !(0..=31 * scale).contains(&offset) || offset % scale != 0 {
            return Err(EncodeError::ImmediateOutOfRange {
                instruction: self.instruction.text(),
                value: offset,
            });
        }
        Ok((u16::from(base), (offset / scale) as u16))
    }

    /// Signed distance from this instruction's PC to a branch target, checked against `[min, max]`
    fn branch_offset(&self, token: &str, min: i64, max: i64) -> Result<i64, EncodeError> {
        let target = operand::target(token).ok_or_else(|| self.invalid(token))?;
        if target % 2 != 0 {
            return Err(EncodeError::Misaligned {
                instruction: self.instruction.text(),
                address: target,
            });
        }
        let pc = self.at.checked_add(PC_OFFSET)?.get();
        let offset = i128::from(target) - i128::from(pc);
        if offset < i128::from(min) || offset > i128::from(max) {
            return Err(EncodeError::BranchOutOfRange {
                instruction: self.instruction.text(),
                from: self.at,
                target,
            });
        }
        Ok(offset as i64)
    }

    /// Encodes a 16-bit instruction
    fn narrow(&self) -> Result<u16, EncodeError> {
        let mnemonic = self.instruction.mnemonic();
        let half = match mnemonic {
            "nop" => {
                self.operands::<0>()?;
                0xbf00
            }
            "movs" => {
                let [rd, src] = self.operands::<2>()?;
                if src.starts_with('#') {
                    0x2000 | self.low(rd)? << 8 | self.imm(src, 0xff, 1)?
                } else {
                    // lsls rd, rm, #0
                    self.low(src)? << 3 | self.low(rd)?
                }
            }
            "cmp" => {
                let [rn, imm] = self.operands::<2>()?;
                0x2800 | self.low(rn)? << 8 | self.imm(imm, 0xff, 1)?
            }
            "adds" | "subs" => {
                let [rdn, imm] = self.operands::<2>()?;
                let opcode = if mnemonic == "adds" { 0x3000 } else { 0x3800 };
                opcode | self.low(rdn)? << 8 | self.imm(imm, 0xff, 1)?
            }
            "mov" => {
                let [rd, rm] = self.operands::<2>()?;
                let (rd, rm) = (self.reg(rd)?, self.reg(rm)?);
                0x4600 | (rd & 0x8) << 4 | rm << 3 | (rd & 0x7)
            }
            "bx" | "blx" => {
                let [rm] = self.operands::<1>()?;
                let opcode = if mnemonic == "bx" { 0x4700 } else { 0x4780 };
                opcode | self.reg(rm)? << 3
            }
            "ldr" | "str" | "ldrb" | "strb" | "ldrh" | "strh" => self.load_store(mnemonic)?,
            "push" | "pop" => {
                let [list] = self.operands::<1>()?;
                let mask = operand::register_list(list).ok_or_else(|| self.invalid(list))?;
                // push may add lr, pop may add pc, nothing else above r7
                let (opcode, extra) = if mnemonic == "push" {
                    (0xb400, 14)
                } else {
                    (0xbc00, 15)
                };
                if mask & !(0xff | 1 << extra) != 0 {
                    return Err(self.invalid(list));
                }
                opcode | u16::from(mask & 1 << extra != 0) << 8 | (mask & 0xff)
            }
            "b" => {
                let [target] = self.operands::<1>()?;
                let offset = self.branch_offset(target, -2048, 2046)?;
                0xe000 | ((offset >> 1) as u16 & 0x7ff)
            }
            other => match operand::condition(other) {
                Some(cond) => {
                    let [target] = self.operands::<1>()?;
                    let offset = self.branch_offset(target, -256, 254)?;
                    0xd000 | u16::from(cond) << 8 | ((offset >> 1) as u16 & 0xff)
                }
                None => return Err(EncodeError::Unsupported(self.instruction.text())),
            },
        };
        Ok(half)
    }

    /// Encodes the immediate-offset load/store forms
    fn load_store(&self, mnemonic: &str) -> Result<u16, EncodeError> {
        let [rt, mem] = self.operands::<2>()?;
        let rt = self.low(rt)?;

        // sp-relative word access has its own encoding with an 8-bit offset
        if let Some((13, offset)) = operand::memory(mem) {
            let opcode = match mnemonic {
                "ldr" => 0x9800,
                "str" => 0x9000,
                _ => return Err(self.invalid(mem)),
            };
            if !(0..=1020).contains(&offset) || offset % 4 != 0 {
                return Err(EncodeError::ImmediateOutOfRange {
                    instruction: self.instruction.text(),
                    value: offset,
                });
            }
            return Ok(opcode | rt << 8 | (offset / 4) as u16);
        }

        let (opcode, scale) = match mnemonic {
            "str" => (0x6000, 4),
            "ldr" => (0x6800, 4),
            "strb" => (0x7000, 1),
            "ldrb" => (0x7800, 1),
            "strh" => (0x8000, 2),
            _ => (0x8800, 2),
        };
        let (rn, imm5) = self.mem(mem, scale)?;
        Ok(opcode | imm5 << 6 | rn << 3 | rt)
    }

    /// Encodes a 32-bit `bl` (`second` = 0xd000) or `b.w` (`second` = 0x9000)
    fn wide_branch(&self, second: u16) -> Result<Vec<u8>, EncodeError> {
        self.require(Width::Wide)?;
        let [target] = self.operands::<1>()?;
        let offset = self.branch_offset(target, -(1 << 24), (1 << 24) - 2)?;

        let s = ((offset >> 24) & 1) as u16;
        let i1 = ((offset >> 23) & 1) as u16;
        let i2 = ((offset >> 22) & 1) as u16;
        let imm10 = ((offset >> 12) & 0x3ff) as u16;
        let imm11 = ((offset >> 1) & 0x7ff) as u16;
        // I1 = NOT(J1 XOR S)
        let j1 = (i1 ^ 1) ^ s;
        let j2 = (i2 ^ 1) ^ s;

        let first = 0xf000 | s << 10 | imm10;
        let second = 0x8000 | second | j1 << 13 | j2 << 11 | imm11;
        let mut bytes = first.to_le_bytes().to_vec();
        bytes.extend_from_slice(&second.to_le_bytes());
        Ok(bytes)
    }
}
