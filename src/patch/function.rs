//! Named locations inside an image

use std::collections::HashMap;

use crate::address::VirtualAddress;

/// A known function in a specific build of an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// Symbol name
    name: String,
    /// Entry address
    address: VirtualAddress,
}
impl Function {
    /// Creates a function label
    pub fn new(name: impl Into<String>, address: impl Into<VirtualAddress>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Symbol name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry address
    pub fn address(&self) -> VirtualAddress {
        self.address
    }
}

/// Lookup of known functions by name
#[derive(Debug, Clone, Default)]
pub struct FunctionTable {
    /// Functions keyed by name
    functions: HashMap<String, Function>,
}
impl FunctionTable {
    /// Builds a table, later entries replacing earlier ones with the same name
    pub fn new(functions: impl IntoIterator<Item = Function>) -> Self {
        Self {
            functions: functions
                .into_iter()
                .map(|f| (f.name.clone(), f))
                .collect(),
        }
    }

    /// Looks up a function by name
    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    /// Function whose entry is the closest one at or below `addr`
    pub fn containing(&self, addr: VirtualAddress) -> Option<&Function> {
        self.functions
            .values()
            .filter(|f| f.address <= addr)
            .max_by_key(|f| f.address)
    }
}

#[cfg(test)]
mod tests {
    use super::{Function, FunctionTable};
    use crate::address::VirtualAddress;

    #[test]
    fn test_lookup() {
        let table = FunctionTable::new([
            Function::new("image3_load_validate_signature", 0x8400_568eu64),
            Function::new("main_ibss", 0x8400_08c8u64),
        ]);
        assert_eq!(
            table.get("main_ibss").map(Function::address),
            Some(VirtualAddress::new(0x8400_08c8))
        );
        assert!(table.get("missing").is_none());
        assert_eq!(
            table.containing(VirtualAddress::new(0x8400_56a0)).map(Function::name),
            Some("image3_load_validate_signature")
        );
        assert!(table.containing(VirtualAddress::new(0x8400_0000)).is_none());
    }
}
