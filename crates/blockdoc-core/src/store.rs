//! The store: block registry, client identity, and transaction entry points.

use crate::block::{root_block_id, Block, GcFilter};
use crate::content::Content;
use crate::event::{
    BlockEventKind, BlockUpdateEvent, Event, Subscriptions, TransactionEvent, UpdateEvent,
};
use crate::id::{BlockId, Id, ItemAddr};
use crate::transaction::{StoreTransaction, Transaction};
use crate::types::{TypeId, TypeKind, TypePtr, TypeState};
use std::collections::HashSet;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown block: {0}")]
    MissingBlock(String),
    #[error("root blocks cannot be referenced: {0}")]
    RootRef(String),
    #[error("only a block's root type can be referenced")]
    ChildTypeRef,
    #[error("block {id} already exists with type {actual}, requested {requested}")]
    TypeMismatch {
        id: String,
        actual: &'static str,
        requested: &'static str,
    },
    #[error("block refs are disabled for this store")]
    RefsDisabled,
    #[error("unknown type in block: {0}")]
    UnknownType(String),
    #[error("broken item link in block: {0}")]
    BrokenLink(String),
    #[error("missing causal dependency in block: {0}")]
    MissingDependency(String),
    #[error("index out of bounds: {0}")]
    IndexOutOfBounds(u32),
    #[error("update decode failed: {0}")]
    Codec(#[from] crate::codec::CodecError),
}

/// Store construction options.
#[derive(Clone, Default)]
pub struct StoreOptions {
    pub gc: bool,
    pub gc_filter: Option<GcFilter>,
    pub auto_ref: bool,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self {
            gc: true,
            gc_filter: None,
            auto_ref: true,
        }
    }
}

/// Container of blocks sharing one client id and one active transaction.
pub struct Store {
    client_id: u32,
    pub(crate) blocks: HashMap<BlockId, Block>,
    pub(crate) roots: HashMap<String, BlockId>,
    pub(crate) txn: Option<StoreTransaction>,
    pub(crate) cleanups: Vec<Option<StoreTransaction>>,
    pub(crate) draining: bool,
    pub(crate) drained_blocks: Vec<BlockId>,
    pub(crate) options: StoreOptions,
    pub(crate) subs: Subscriptions,
    /// Bumped on every referrer change; invalidates root memoization.
    pub(crate) referrer_epoch: u64,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self::with_options(StoreOptions::new())
    }

    pub fn with_options(options: StoreOptions) -> Self {
        Self {
            client_id: crate::generate_client_id(),
            blocks: HashMap::new(),
            roots: HashMap::new(),
            txn: None,
            cleanups: Vec::new(),
            draining: false,
            drained_blocks: Vec::new(),
            options,
            subs: Subscriptions::default(),
            referrer_epoch: 0,
        }
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    /// A non-local transaction wrote into our clock range: another peer uses
    /// this client id. Pick a fresh one; the existing log keeps the old id.
    pub(crate) fn regenerate_client_id(&mut self) {
        let old = self.client_id;
        self.client_id = crate::generate_client_id();
        tracing::warn!(old, new = self.client_id, "client id collision; regenerated");
    }

    // ---- block registry ----

    pub fn get_block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    /// Ids of every block in the store, roots included.
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self.blocks.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Create a regular block. With `id = None` a fresh UUIDv4 is assigned.
    pub fn create_block(
        &mut self,
        kind: TypeKind,
        id: Option<BlockId>,
    ) -> Result<BlockId, StoreError> {
        self.transact_inner(None, true, move |s| {
            let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
            if let Some(existing) = s.blocks.get(&id) {
                if existing.kind != kind {
                    return Err(StoreError::TypeMismatch {
                        id,
                        actual: existing.kind.as_str(),
                        requested: kind.as_str(),
                    });
                }
                return Ok(id);
            }
            s.insert_block(id.clone(), false, kind);
            Ok(id)
        })
    }

    /// Look up a block, creating it when a remote ref names a block this
    /// store has not seen yet.
    pub fn get_or_create_block(
        &mut self,
        id: &str,
        kind: TypeKind,
    ) -> Result<BlockId, StoreError> {
        if let Some(existing) = self.blocks.get(id) {
            if existing.kind != kind {
                return Err(StoreError::TypeMismatch {
                    id: id.to_owned(),
                    actual: existing.kind.as_str(),
                    requested: kind.as_str(),
                });
            }
            return Ok(id.to_owned());
        }
        self.create_block(kind, Some(id.to_owned()))
    }

    /// Root types are created on first access; their block id derives from
    /// the name.
    pub fn get_or_create_root_type(
        &mut self,
        name: &str,
        kind: TypeKind,
    ) -> Result<TypePtr, StoreError> {
        if let Some(block_id) = self.roots.get(name) {
            let block = &self.blocks[block_id];
            if block.kind != kind {
                return Err(StoreError::TypeMismatch {
                    id: block_id.clone(),
                    actual: block.kind.as_str(),
                    requested: kind.as_str(),
                });
            }
            return Ok(TypePtr::root_of(block_id.clone()));
        }
        let name = name.to_owned();
        self.transact_inner(None, true, move |s| {
            let block_id = root_block_id(&name);
            s.insert_block(block_id.clone(), true, kind);
            s.roots.insert(name, block_id.clone());
            Ok(TypePtr::root_of(block_id))
        })
    }

    /// Root type handle of an existing block.
    pub fn root_type(&self, block_id: &str) -> Result<TypePtr, StoreError> {
        if !self.blocks.contains_key(block_id) {
            return Err(StoreError::MissingBlock(block_id.to_owned()));
        }
        Ok(TypePtr::root_of(block_id.to_owned()))
    }

    /// Block id behind a type handle; errors unless the handle is the
    /// block's root type (only roots may be referenced).
    pub fn block_of(&self, ptr: &TypePtr) -> Result<BlockId, StoreError> {
        if ptr.id != TypeId::root() {
            return Err(StoreError::ChildTypeRef);
        }
        if !self.blocks.contains_key(&ptr.block) {
            return Err(StoreError::MissingBlock(ptr.block.clone()));
        }
        Ok(ptr.block.clone())
    }

    fn insert_block(&mut self, id: BlockId, is_root: bool, kind: TypeKind) {
        let block = Block::new(
            id.clone(),
            is_root,
            kind,
            self.options.gc,
            self.options.gc_filter.clone(),
        );
        self.blocks.insert(id.clone(), block);
        if let Some(st) = self.txn.as_mut() {
            st.blocks_added.push(id);
        }
    }

    /// JSON view of a block's root type.
    pub fn block_to_json(&self, block_id: &str) -> Result<serde_json::Value, StoreError> {
        self.to_json(&TypePtr::root_of(block_id.to_owned()))
    }

    /// Walk the referrer chain to the owning root block. `None` for orphaned
    /// non-root blocks. Memoized per referrer epoch.
    pub fn get_root_block(&mut self, block_id: &str) -> Option<BlockId> {
        let epoch = self.referrer_epoch;
        if let Some(block) = self.blocks.get(block_id) {
            if let Some((cached_epoch, cached)) = &block.root_cache {
                if *cached_epoch == epoch {
                    return cached.clone();
                }
            }
        } else {
            return None;
        }
        let mut visited: HashSet<BlockId> = HashSet::new();
        let mut cur = block_id.to_owned();
        let root = loop {
            if !visited.insert(cur.clone()) {
                break None;
            }
            let Some(block) = self.blocks.get(&cur) else {
                break None;
            };
            if block.is_root {
                break Some(cur);
            }
            match &block.referrer {
                Some(addr) => cur = addr.block.clone(),
                None => break None,
            }
        };
        if let Some(block) = self.blocks.get_mut(block_id) {
            block.root_cache = Some((epoch, root.clone()));
        }
        root
    }

    // ---- transactions ----

    /// Run `f` inside a (re-entrant) transaction. Only the outermost call
    /// drains the cleanup queue.
    pub fn transact<R>(&mut self, f: impl FnOnce(&mut Store) -> R) -> R {
        self.transact_inner(None, true, f)
    }

    pub fn transact_with<R>(
        &mut self,
        origin: impl Into<String>,
        f: impl FnOnce(&mut Store) -> R,
    ) -> R {
        self.transact_inner(Some(origin.into()), true, f)
    }

    /// Block-scoped transact: same machinery, with the block's transaction
    /// created up front.
    pub fn transact_block<R>(
        &mut self,
        block_id: &str,
        origin: Option<String>,
        f: impl FnOnce(&mut Store) -> R,
    ) -> R {
        let block_id = block_id.to_owned();
        self.transact_inner(origin, true, move |s| {
            let _ = s.ensure_txn(&block_id);
            f(s)
        })
    }

    pub(crate) fn transact_inner<R>(
        &mut self,
        origin: Option<String>,
        local: bool,
        f: impl FnOnce(&mut Store) -> R,
    ) -> R {
        let initial = self.txn.is_none();
        if initial {
            self.txn = Some(StoreTransaction::new(origin, local));
        }
        let res = f(self);
        if initial {
            let st = self.txn.take().expect("active transaction");
            self.cleanups.push(Some(st));
            if !self.draining {
                self.draining = true;
                let mut i = 0;
                while i < self.cleanups.len() {
                    if let Some(st) = self.cleanups[i].take() {
                        crate::transaction::cleanup_store_transaction(self, st, i == 0);
                    }
                    i += 1;
                }
                self.cleanups.clear();
                self.draining = false;
                crate::transaction::emit_after_all_transactions(self);
            }
        }
        res
    }

    /// Create the per-block transaction record on first touch, firing the
    /// block's `beforeTransaction` event.
    pub(crate) fn ensure_txn(&mut self, block_id: &str) -> Result<(), StoreError> {
        if !self.blocks.contains_key(block_id) {
            return Err(StoreError::MissingBlock(block_id.to_owned()));
        }
        let created = {
            let Some(st) = self.txn.as_mut() else {
                return Ok(());
            };
            if st.txn(block_id).is_some() {
                false
            } else {
                let before = self.blocks[block_id].structs.state_vector();
                let txn = Transaction::new(block_id.to_owned(), before);
                st.txns.push(txn);
                true
            }
        };
        if created {
            crate::transaction::emit_block_event(self, block_id, BlockEventKind::BeforeTransaction);
        }
        Ok(())
    }

    pub(crate) fn current_txn_local(&self) -> bool {
        self.txn.as_ref().map(|t| t.local).unwrap_or(true)
    }

    pub(crate) fn current_txn_origin(&self) -> Option<String> {
        self.txn.as_ref().and_then(|t| t.origin.clone())
    }

    pub(crate) fn record_change(
        &mut self,
        block_id: &str,
        parent: TypeId,
        parent_sub: Option<String>,
    ) {
        let _ = self.ensure_txn(block_id);
        if let Some(st) = self.txn.as_mut() {
            if let Some(txn) = st.txn_mut(block_id) {
                txn.add_changed(parent, parent_sub);
            }
        }
    }

    pub(crate) fn record_delete(&mut self, block_id: &str, id: Id, len: u32) {
        let _ = self.ensure_txn(block_id);
        if let Some(st) = self.txn.as_mut() {
            if let Some(txn) = st.txn_mut(block_id) {
                txn.delete_set.add(id, len);
            }
        }
    }

    pub(crate) fn record_merge_candidate(&mut self, block_id: &str, id: Id) {
        if let Some(st) = self.txn.as_mut() {
            if let Some(txn) = st.txn_mut(block_id) {
                txn.merge_structs.push(id);
            }
        }
    }

    pub(crate) fn record_unref_added(&mut self, addr: ItemAddr) {
        if let Some(st) = self.txn.as_mut() {
            st.unrefs_added.push(addr);
        }
    }

    pub(crate) fn mark_formatting_cleanup(&mut self, block_id: &str) {
        if let Some(st) = self.txn.as_mut() {
            if let Some(txn) = st.txn_mut(block_id) {
                txn.need_formatting_cleanup = true;
            }
        }
    }

    // ---- internal accessors ----

    pub(crate) fn block(&self, id: &str) -> Result<&Block, StoreError> {
        self.blocks
            .get(id)
            .ok_or_else(|| StoreError::MissingBlock(id.to_owned()))
    }

    pub(crate) fn block_mut(&mut self, id: &str) -> Result<&mut Block, StoreError> {
        self.blocks
            .get_mut(id)
            .ok_or_else(|| StoreError::MissingBlock(id.to_owned()))
    }

    pub(crate) fn type_state(&self, ptr: &TypePtr) -> Result<&TypeState, StoreError> {
        self.block(&ptr.block)?
            .type_state(&ptr.id)
            .ok_or_else(|| StoreError::UnknownType(ptr.block.clone()))
    }

    /// Content for embedding `target` as a child block.
    pub(crate) fn ref_content_for(&mut self, target: &str) -> Result<Content, StoreError> {
        let block = self.block(target)?;
        if block.is_root {
            return Err(StoreError::RootRef(target.to_owned()));
        }
        Ok(Content::Ref {
            block_id: target.to_owned(),
            block_type: block.kind,
        })
    }

    pub(crate) fn bump_referrer_epoch(&mut self) {
        self.referrer_epoch += 1;
    }

    // ---- subscriptions ----

    /// Observe shallow changes on one type.
    pub fn observe(
        &mut self,
        ptr: &TypePtr,
        cb: impl FnMut(&mut Store, &Event) + 'static,
    ) -> u64 {
        let id = self.subs.next();
        self.subs
            .types
            .entry((ptr.block.clone(), ptr.id.clone()))
            .or_default()
            .insert(id, Box::new(cb));
        id
    }

    /// Observe a type and every type nested below it.
    pub fn observe_deep(
        &mut self,
        ptr: &TypePtr,
        cb: impl FnMut(&mut Store, &[Event]) + 'static,
    ) -> u64 {
        let id = self.subs.next();
        self.subs
            .deep
            .entry((ptr.block.clone(), ptr.id.clone()))
            .or_default()
            .insert(id, Box::new(cb));
        id
    }

    /// Observe a block lifecycle event.
    pub fn on_block_event(
        &mut self,
        block_id: &str,
        kind: BlockEventKind,
        cb: impl FnMut(&mut Store, &TransactionEvent) + 'static,
    ) -> u64 {
        let id = self.subs.next();
        self.subs
            .blocks
            .entry((block_id.to_owned(), kind))
            .or_default()
            .insert(id, Box::new(cb));
        id
    }

    /// Observe a single block's encoded updates.
    pub fn on_block_update_v2(
        &mut self,
        block_id: &str,
        cb: impl FnMut(&mut Store, &BlockUpdateEvent) + 'static,
    ) -> u64 {
        let id = self.subs.next();
        self.subs
            .block_updates
            .entry(block_id.to_owned())
            .or_default()
            .insert(id, Box::new(cb));
        id
    }

    /// Observe event batches reaching a root block from anywhere in its
    /// embedded subtree.
    pub fn observe_root_events(
        &mut self,
        root_block_id: &str,
        cb: impl FnMut(&mut Store, &[Event]) + 'static,
    ) -> u64 {
        let id = self.subs.next();
        self.subs
            .roots
            .entry(root_block_id.to_owned())
            .or_default()
            .insert(id, Box::new(cb));
        id
    }

    /// Observe the store-level per-transaction update map.
    pub fn on_update_v2(&mut self, cb: impl FnMut(&mut Store, &UpdateEvent) + 'static) -> u64 {
        let id = self.subs.next();
        self.subs.store_updates.insert(id, Box::new(cb));
        id
    }

    /// Observe the end of every store transaction cleanup.
    pub fn on_after_transaction_cleanup(
        &mut self,
        cb: impl FnMut(&mut Store, &UpdateEvent) + 'static,
    ) -> u64 {
        let id = self.subs.next();
        self.subs.store_cleanup.insert(id, Box::new(cb));
        id
    }

    /// Drop a subscription by id.
    pub fn unobserve(&mut self, id: u64) -> bool {
        self.subs.remove(id)
    }
}
