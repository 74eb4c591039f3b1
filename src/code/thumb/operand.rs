//! Operand parsing for the Thumb assembler, in capstone's textual syntax

use std::collections::HashMap;

use lazy_static::lazy_static;

lazy_static! {
    /// Register names, including capstone's default aliases for r9-r15
    static ref REGISTERS: HashMap<&'static str, u8> = {
        let mut map = HashMap::new();
        for (idx, name) in [
            "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12",
            "r13", "r14", "r15",
        ]
        .into_iter()
        .enumerate()
        {
            map.insert(name, idx as u8);
        }
        map.insert("sb", 9);
        map.insert("sl", 10);
        map.insert("fp", 11);
        map.insert("ip", 12);
        map.insert("sp", 13);
        map.insert("lr", 14);
        map.insert("pc", 15);
        map
    };

    /// Condition code suffixes
    static ref CONDITIONS: HashMap<&'static str, u8> = [
        ("eq", 0x0),
        ("ne", 0x1),
        ("hs", 0x2),
        ("cs", 0x2),
        ("lo", 0x3),
        ("cc", 0x3),
        ("mi", 0x4),
        ("pl", 0x5),
        ("vs", 0x6),
        ("vc", 0x7),
        ("hi", 0x8),
        ("ls", 0x9),
        ("ge", 0xa),
        ("lt", 0xb),
        ("gt", 0xc),
        ("le", 0xd),
    ]
    .into_iter()
    .collect();
}

/// Register number for `token`
pub fn register(token: &str) -> Option<u8> {
    REGISTERS.get(token.trim()).copied()
}

/// Register number for `token`, restricted to r0-r7
pub fn low_register(token: &str) -> Option<u8> {
    register(token).filter(|&r| r < 8)
}

/// Condition code for a branch mnemonic such as `beq`
pub fn condition(mnemonic: &str) -> Option<u8> {
    mnemonic
        .strip_prefix('b')
        .and_then(|suffix| CONDITIONS.get(suffix).copied())
}

/// Parses a number written as decimal or `0x` hex, optionally negative
pub fn number(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    Some(if negative { -value } else { value })
}

/// Parses an immediate operand, `#3` or `#0x10`
pub fn immediate(token: &str) -> Option<i64> {
    number(token.trim().strip_prefix('#')?)
}

/// Parses a branch target. capstone writes them as immediates (`#0x84000100`); a bare number is
/// accepted as well.
pub fn target(token: &str) -> Option<u64> {
    let token = token.trim();
    let value = number(token.strip_prefix('#').unwrap_or(token))?;
    u64::try_from(value).ok()
}

/// Parses `[rn]` or `[rn, #imm]` into the base register and offset
pub fn memory(token: &str) -> Option<(u8, i64)> {
    let inner = token.trim().strip_prefix('[')?.strip_suffix(']')?;
    let mut parts = inner.split(',');
    let base = register(parts.next()?)?;
    let offset = match parts.next() {
        Some(imm) => immediate(imm)?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((base, offset))
}

/// Parses `{r4, r5, lr}` (ranges such as `r4-r7` allowed) into a bitmask of registers
pub fn register_list(token: &str) -> Option<u16> {
    let inner = token.trim().strip_prefix('{')?.strip_suffix('}')?;
    let mut mask = 0u16;
    for item in inner.split(',') {
        let item = item.trim();
        match item.split_once('-') {
            Some((first, last)) => {
                let (first, last) = (register(first)?, register(last)?);
                if first > last {
                    return None;
                }
                for r in first..=last {
                    mask |= 1 << r;
                }
            }
            None => mask |= 1 << register(item)?,
        }
    }
    (mask != 0).then_some(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers() {
        assert_eq!(register("r4"), Some(4));
        assert_eq!(register("sb"), Some(9));
        assert_eq!(register("lr"), Some(14));
        assert_eq!(low_register("r8"), None);
        assert_eq!(register("x0"), None);
    }

    #[test]
    fn test_operands() {
        assert_eq!(immediate("#3"), Some(3));
        assert_eq!(immediate("#0x10"), Some(16));
        assert_eq!(immediate("#-4"), Some(-4));
        assert_eq!(immediate("3"), None);
        assert_eq!(target("#0x5ff000fc"), Some(0x5ff0_00fc));
        assert_eq!(memory("[r4]"), Some((4, 0)));
        assert_eq!(memory("[sp, #8]"), Some((13, 8)));
        assert_eq!(memory("[r4, r5]"), None);
        assert_eq!(register_list("{r4, r5, r7, lr}"), Some(0x40b0));
        assert_eq!(register_list("{r4-r7}"), Some(0xf0));
        assert_eq!(condition("beq"), Some(0));
        assert_eq!(condition("ble"), Some(0xd));
        assert_eq!(condition("bl"), None);
    }
}
