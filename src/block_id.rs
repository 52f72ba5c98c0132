// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Identifies a single fixed-size block in the buffer cache.
///
/// Stored little-endian on disk inside internal blocks and reference words.
#[derive(Copy, Clone, Default, Debug, Hash, PartialEq, Eq, Ord, PartialOrd)]
pub struct BlockId(pub u64);

impl BlockId {
    /// Sentinel used to pre-fill unused slots of a freshly allocated internal block.
    pub const NULL: Self = Self(u64::MAX);

    pub const SERIALIZED_LEN: usize = std::mem::size_of::<u64>();

    #[must_use]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl std::ops::Deref for BlockId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u64> for BlockId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
