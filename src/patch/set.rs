//! Ordered collections of patches

use super::Patch;

/// Patches applied together against one image, in declaration order.
///
/// Sets can be merged to group related patches; merging only appends, so the index of every
/// patch already in the set is unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchSet {
    /// Label used in logs
    name: String,
    /// Patches in declaration order
    patches: Vec<Patch>,
}
impl PatchSet {
    /// Creates an empty set
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            patches: Vec::new(),
        }
    }

    /// Appends a patch
    pub fn push(&mut self, patch: impl Into<Patch>) {
        self.patches.push(patch.into());
    }

    /// Builder form of [`PatchSet::push`]
    pub fn with(mut self, patch: impl Into<Patch>) -> Self {
        self.push(patch);
        self
    }

    /// Appends every patch of `other`
    pub fn extend(&mut self, other: PatchSet) {
        self.patches.extend(other.patches);
    }

    /// Label
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Patches in declaration order
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Number of patches
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

impl FromIterator<Patch> for PatchSet {
    fn from_iter<T: IntoIterator<Item = Patch>>(iter: T) -> Self {
        Self {
            name: String::new(),
            patches: iter.into_iter().collect(),
        }
    }
}
