//! Operation identifiers and state vectors.

use std::collections::HashMap;

/// Unique identifier of a single CRDT operation element: `(client, clock)`.
///
/// Clocks are monotone per client. Ordering is lexicographic and total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id {
    pub client: u32,
    pub clock: u32,
}

impl Id {
    pub fn new(client: u32, clock: u32) -> Self {
        Self { client, clock }
    }
}

/// Block ids are plain strings: a UUIDv4 for regular blocks, `"@" + name` for
/// root blocks.
pub type BlockId = String;

/// Cross-block address of an item: which block owns it, and its first id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemAddr {
    pub block: BlockId,
    pub id: Id,
}

impl ItemAddr {
    pub fn new(block: impl Into<BlockId>, id: Id) -> Self {
        Self {
            block: block.into(),
            id,
        }
    }
}

/// Per-client next-clock map.
pub type StateVector = HashMap<u32, u32>;

/// Next clock for `client` according to `sv` (0 when unseen).
pub fn state_of(sv: &StateVector, client: u32) -> u32 {
    sv.get(&client).copied().unwrap_or(0)
}
