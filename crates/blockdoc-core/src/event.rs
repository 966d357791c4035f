//! Events and synchronous observer registries.
//!
//! Listeners are keyed by monotonically increasing subscription ids; dispatch
//! happens inside transaction cleanup, in the same thread of control. Every
//! callback receives the store so observers can open follow-up transactions.

use crate::id::BlockId;
use crate::store::Store;
use crate::types::{TypeId, TypePtr};
use std::collections::{BTreeMap, HashMap};

/// One step from a block's root type down to a nested type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(u32),
}

/// A change notification for one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub block: BlockId,
    pub target: TypePtr,
    /// Changed map keys; `None` entries mark sequence changes.
    pub keys: Vec<Option<String>>,
    /// Path from the block's root type to `target`.
    pub path: Vec<PathSegment>,
}

/// Payload for block lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEvent {
    pub block: BlockId,
    pub origin: Option<String>,
    pub local: bool,
}

/// Store-level cleanup payload: per-block update buffers of one store
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
    pub updates: Vec<(BlockId, Vec<u8>)>,
    pub origin: Option<String>,
    pub local: bool,
}

/// Per-block update payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockUpdateEvent {
    pub block: BlockId,
    pub update: Vec<u8>,
    pub origin: Option<String>,
    pub local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockEventKind {
    BeforeTransaction,
    BeforeObserverCalls,
    AfterTransaction,
    AfterTransactionCleanup,
    AfterAllTransactions,
}

pub(crate) type TypeCb = Box<dyn FnMut(&mut Store, &Event)>;
pub(crate) type DeepCb = Box<dyn FnMut(&mut Store, &[Event])>;
pub(crate) type BlockCb = Box<dyn FnMut(&mut Store, &TransactionEvent)>;
pub(crate) type BlockUpdateCb = Box<dyn FnMut(&mut Store, &BlockUpdateEvent)>;
pub(crate) type RootCb = Box<dyn FnMut(&mut Store, &[Event])>;
pub(crate) type StoreUpdateCb = Box<dyn FnMut(&mut Store, &UpdateEvent)>;
pub(crate) type StoreCleanupCb = Box<dyn FnMut(&mut Store, &UpdateEvent)>;

/// All observer registries of one store. Registries are taken out wholesale
/// for dispatch so callbacks can borrow the store mutably; ids created during
/// dispatch come from the store-wide counter and survive the restore.
#[derive(Default)]
pub(crate) struct Subscriptions {
    pub next_id: u64,
    pub types: HashMap<(BlockId, TypeId), BTreeMap<u64, TypeCb>>,
    pub deep: HashMap<(BlockId, TypeId), BTreeMap<u64, DeepCb>>,
    pub blocks: HashMap<(BlockId, BlockEventKind), BTreeMap<u64, BlockCb>>,
    pub block_updates: HashMap<BlockId, BTreeMap<u64, BlockUpdateCb>>,
    pub roots: HashMap<BlockId, BTreeMap<u64, RootCb>>,
    pub store_updates: BTreeMap<u64, StoreUpdateCb>,
    pub store_cleanup: BTreeMap<u64, StoreCleanupCb>,
}

impl Subscriptions {
    pub fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Remove the subscription with this id from whichever registry holds it.
    pub fn remove(&mut self, id: u64) -> bool {
        for map in self.types.values_mut() {
            if map.remove(&id).is_some() {
                return true;
            }
        }
        for map in self.deep.values_mut() {
            if map.remove(&id).is_some() {
                return true;
            }
        }
        for map in self.blocks.values_mut() {
            if map.remove(&id).is_some() {
                return true;
            }
        }
        for map in self.block_updates.values_mut() {
            if map.remove(&id).is_some() {
                return true;
            }
        }
        for map in self.roots.values_mut() {
            if map.remove(&id).is_some() {
                return true;
            }
        }
        if self.store_updates.remove(&id).is_some() {
            return true;
        }
        self.store_cleanup.remove(&id).is_some()
    }
}

/// Run one observer isolated from its siblings: a panic is caught and logged
/// instead of tearing down the dispatch loop.
pub(crate) fn call_isolated(f: impl FnOnce() + std::panic::UnwindSafe) {
    if std::panic::catch_unwind(f).is_err() {
        tracing::warn!("observer callback failed; continuing with siblings");
    }
}
