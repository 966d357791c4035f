//! Per-block transactions, the store transaction that aggregates them, and
//! the end-of-transaction cleanup pipeline.
//!
//! `Store::transact` is re-entrant; only the outermost call drains the FIFO
//! cleanup queue. Transactions opened by observer callbacks during cleanup
//! are appended to the tail and processed before the outer call returns,
//! never nested.

use crate::block::Block;
use crate::content::Content;
use crate::delete_set::DeleteSet;
use crate::event::{
    call_isolated, BlockEventKind, BlockUpdateEvent, Event, PathSegment, TransactionEvent,
    UpdateEvent,
};
use crate::id::{state_of, BlockId, Id, ItemAddr, StateVector};
use crate::store::Store;
use crate::struct_store::Struct;
use crate::types::{TypeId, TypePtr};
use std::panic::AssertUnwindSafe;

/// Change record of a single block inside one store transaction.
pub struct Transaction {
    pub block: BlockId,
    pub before_state: StateVector,
    pub after_state: StateVector,
    pub delete_set: DeleteSet,
    /// Changed types with their changed map keys, in first-touch order.
    /// `None` keys mark sequence changes.
    pub changed: Vec<(TypeId, Vec<Option<String>>)>,
    /// Structs whose merge opportunity was invalidated by a splice; retried
    /// during the merge pass.
    pub merge_structs: Vec<Id>,
    pub need_formatting_cleanup: bool,
}

impl Transaction {
    pub(crate) fn new(block: BlockId, before_state: StateVector) -> Self {
        Self {
            block,
            before_state,
            after_state: StateVector::new(),
            delete_set: DeleteSet::new(),
            changed: Vec::new(),
            merge_structs: Vec::new(),
            need_formatting_cleanup: false,
        }
    }

    pub(crate) fn add_changed(&mut self, parent: TypeId, parent_sub: Option<String>) {
        match self.changed.iter_mut().find(|(id, _)| *id == parent) {
            Some((_, keys)) => {
                if !keys.contains(&parent_sub) {
                    keys.push(parent_sub);
                }
            }
            None => self.changed.push((parent, vec![parent_sub])),
        }
    }
}

/// Store-scoped aggregation of per-block transactions plus the cross-block
/// ref bookkeeping of one user closure.
pub struct StoreTransaction {
    pub origin: Option<String>,
    pub local: bool,
    pub txns: Vec<Transaction>,
    pub blocks_added: Vec<BlockId>,
    pub refs_added: Vec<ItemAddr>,
    pub refs_removed: Vec<ItemAddr>,
    pub unrefs_added: Vec<ItemAddr>,
}

impl StoreTransaction {
    pub(crate) fn new(origin: Option<String>, local: bool) -> Self {
        Self {
            origin,
            local,
            txns: Vec::new(),
            blocks_added: Vec::new(),
            refs_added: Vec::new(),
            refs_removed: Vec::new(),
            unrefs_added: Vec::new(),
        }
    }

    pub(crate) fn txn(&self, block_id: &str) -> Option<&Transaction> {
        self.txns.iter().find(|t| t.block == block_id)
    }

    pub(crate) fn txn_mut(&mut self, block_id: &str) -> Option<&mut Transaction> {
        self.txns.iter_mut().find(|t| t.block == block_id)
    }
}

/// The cleanup pipeline for one finished store transaction.
///
/// `is_first` marks the outermost user transaction of the current drain; it
/// decides whether the `"cleanup"`-origin resolution transaction is opened
/// unconditionally (follow-up transactions open one only when they carry ref
/// or formatting work).
pub(crate) fn cleanup_store_transaction(store: &mut Store, mut st: StoreTransaction, is_first: bool) {
    // Finalize per-block records.
    for txn in &mut st.txns {
        txn.delete_set.sort_and_merge();
        if let Ok(block) = store.block(&txn.block) {
            txn.after_state = block.structs.state_vector();
        }
        store.drained_blocks.push(txn.block.clone());
    }

    // A non-local transaction that advanced our own clock means another peer
    // uses this client id.
    if !st.local {
        let cid = store.client_id();
        let collided = st
            .txns
            .iter()
            .any(|t| state_of(&t.after_state, cid) != state_of(&t.before_state, cid));
        if collided {
            store.regenerate_client_id();
        }
    }

    // Step 1: ref conflict / cycle resolution across the store.
    crate::block_ref::resolve_block_refs(store, &mut st, is_first);

    // Step 2: per-block observer dispatch.
    let mut all_events: Vec<(BlockId, Vec<Event>)> = Vec::new();
    for idx in 0..st.txns.len() {
        let block_id = st.txns[idx].block.clone();
        emit_block_event_with(
            store,
            &block_id,
            BlockEventKind::BeforeObserverCalls,
            st.origin.clone(),
            st.local,
        );
        let events = build_events(store, &st.txns[idx]);
        for ev in &events {
            dispatch_type_observers(store, ev);
        }
        dispatch_deep_observers(store, &block_id, &events);
        emit_block_event_with(
            store,
            &block_id,
            BlockEventKind::AfterTransaction,
            st.origin.clone(),
            st.local,
        );
        all_events.push((block_id, events));
    }

    // Step 3: root observers. Materialize the root of every added block
    // first so later lookups hit the cache.
    for block_id in &st.blocks_added {
        let _ = store.get_root_block(block_id);
    }
    let mut root_buckets: Vec<(BlockId, Vec<Event>)> = Vec::new();
    for (block_id, events) in &all_events {
        if events.is_empty() {
            continue;
        }
        if let Some(root) = store.get_root_block(block_id) {
            match root_buckets.iter_mut().find(|(r, _)| *r == root) {
                Some((_, bucket)) => bucket.extend(events.iter().cloned()),
                None => root_buckets.push((root, events.clone())),
            }
        }
    }
    for (root, events) in root_buckets {
        dispatch_root_observers(store, &root, &events);
    }

    // Step 4: per-block GC and struct merging.
    for txn in &st.txns {
        gc_and_merge(store, txn);
    }

    // Step 5: cleanup events and update emission.
    let mut updates: Vec<(BlockId, Vec<u8>)> = Vec::new();
    for txn in &st.txns {
        let changed = txn.after_state != txn.before_state || !txn.delete_set.is_empty();
        if !changed {
            continue;
        }
        if let Ok(block) = store.block(&txn.block) {
            let bytes = crate::update::encode_transaction_update(block, txn);
            updates.push((txn.block.clone(), bytes));
        }
    }
    for txn in &st.txns {
        emit_block_event_with(
            store,
            &txn.block,
            BlockEventKind::AfterTransactionCleanup,
            st.origin.clone(),
            st.local,
        );
    }
    for (block_id, bytes) in &updates {
        let ev = BlockUpdateEvent {
            block: block_id.clone(),
            update: bytes.clone(),
            origin: st.origin.clone(),
            local: st.local,
        };
        dispatch_block_update_observers(store, block_id, &ev);
    }
    let ev = UpdateEvent {
        updates,
        origin: st.origin.clone(),
        local: st.local,
    };
    dispatch_store_cleanup_observers(store, &ev);
    if !ev.updates.is_empty() {
        dispatch_store_update_observers(store, &ev);
    }
}

// ---- event construction ----

fn build_events(store: &Store, txn: &Transaction) -> Vec<Event> {
    let Ok(block) = store.block(&txn.block) else {
        return Vec::new();
    };
    let mut events = Vec::new();
    for (type_id, keys) in &txn.changed {
        // Types whose anchor item is deleted no longer produce events.
        if let TypeId::Nested(anchor) = type_id {
            let live = block
                .structs
                .item(*anchor)
                .map(|i| !i.deleted)
                .unwrap_or(false);
            if !live {
                continue;
            }
        }
        let Some(path) = compute_path(block, type_id) else {
            continue;
        };
        events.push(Event {
            block: txn.block.clone(),
            target: TypePtr::new(txn.block.clone(), type_id.clone()),
            keys: keys.clone(),
            path,
        });
    }
    events
}

/// Path from the block's root type down to `type_id`.
fn compute_path(block: &Block, type_id: &TypeId) -> Option<Vec<PathSegment>> {
    let mut segments = Vec::new();
    let mut cur = type_id.clone();
    loop {
        match cur {
            TypeId::Named(_) => break,
            TypeId::Nested(anchor) => {
                let item = block.structs.item(anchor)?;
                let segment = match &item.parent_sub {
                    Some(key) => PathSegment::Key(key.clone()),
                    None => PathSegment::Index(sequence_index_of(block, &item.parent, anchor)?),
                };
                segments.push(segment);
                cur = item.parent.clone();
            }
        }
    }
    segments.reverse();
    Some(segments)
}

fn sequence_index_of(block: &Block, parent: &TypeId, anchor: Id) -> Option<u32> {
    let ty = block.type_state(parent)?;
    let mut index = 0u32;
    let mut cur = ty.start;
    while let Some(id) = cur {
        if id == anchor {
            return Some(index);
        }
        let item = block.structs.item(id)?;
        if !item.deleted && item.countable() {
            index += item.len();
        }
        cur = item.right;
    }
    None
}

// ---- observer dispatch ----

pub(crate) fn emit_block_event(store: &mut Store, block_id: &str, kind: BlockEventKind) {
    let origin = store.current_txn_origin();
    let local = store.current_txn_local();
    emit_block_event_with(store, block_id, kind, origin, local);
}

pub(crate) fn emit_block_event_with(
    store: &mut Store,
    block_id: &str,
    kind: BlockEventKind,
    origin: Option<String>,
    local: bool,
) {
    let key = (block_id.to_owned(), kind);
    let Some(mut map) = store.subs.blocks.remove(&key) else {
        return;
    };
    let ev = TransactionEvent {
        block: block_id.to_owned(),
        origin,
        local,
    };
    for cb in map.values_mut() {
        call_isolated(AssertUnwindSafe(|| cb(store, &ev)));
    }
    let slot = store.subs.blocks.entry(key).or_default();
    for (id, cb) in map {
        slot.entry(id).or_insert(cb);
    }
}

fn dispatch_type_observers(store: &mut Store, ev: &Event) {
    let key = (ev.block.clone(), ev.target.id.clone());
    let Some(mut map) = store.subs.types.remove(&key) else {
        return;
    };
    for cb in map.values_mut() {
        call_isolated(AssertUnwindSafe(|| cb(store, ev)));
    }
    let slot = store.subs.types.entry(key).or_default();
    for (id, cb) in map {
        slot.entry(id).or_insert(cb);
    }
}

/// Deep observers see every event at or below their type, ordered ascending
/// by path length.
fn dispatch_deep_observers(store: &mut Store, block_id: &str, events: &[Event]) {
    if events.is_empty() {
        return;
    }
    let mut buckets: Vec<(TypeId, Vec<Event>)> = Vec::new();
    for ev in events {
        let mut cur = ev.target.id.clone();
        loop {
            if store
                .subs
                .deep
                .contains_key(&(block_id.to_owned(), cur.clone()))
            {
                match buckets.iter_mut().find(|(id, _)| *id == cur) {
                    Some((_, bucket)) => bucket.push(ev.clone()),
                    None => buckets.push((cur.clone(), vec![ev.clone()])),
                }
            }
            match cur {
                TypeId::Named(_) => break,
                TypeId::Nested(anchor) => {
                    let parent = store
                        .block(block_id)
                        .ok()
                        .and_then(|b| b.structs.item(anchor))
                        .map(|i| i.parent.clone());
                    match parent {
                        Some(p) => cur = p,
                        None => break,
                    }
                }
            }
        }
    }
    for (type_id, mut bucket) in buckets {
        bucket.sort_by_key(|ev| ev.path.len());
        let key = (block_id.to_owned(), type_id);
        let Some(mut map) = store.subs.deep.remove(&key) else {
            continue;
        };
        for cb in map.values_mut() {
            call_isolated(AssertUnwindSafe(|| cb(store, &bucket)));
        }
        let slot = store.subs.deep.entry(key).or_default();
        for (id, cb) in map {
            slot.entry(id).or_insert(cb);
        }
    }
}

fn dispatch_root_observers(store: &mut Store, root: &str, events: &[Event]) {
    let Some(mut map) = store.subs.roots.remove(root) else {
        return;
    };
    for cb in map.values_mut() {
        call_isolated(AssertUnwindSafe(|| cb(store, events)));
    }
    let slot = store.subs.roots.entry(root.to_owned()).or_default();
    for (id, cb) in map {
        slot.entry(id).or_insert(cb);
    }
}

fn dispatch_block_update_observers(store: &mut Store, block_id: &str, ev: &BlockUpdateEvent) {
    let Some(mut map) = store.subs.block_updates.remove(block_id) else {
        return;
    };
    for cb in map.values_mut() {
        call_isolated(AssertUnwindSafe(|| cb(store, ev)));
    }
    let slot = store.subs.block_updates.entry(block_id.to_owned()).or_default();
    for (id, cb) in map {
        slot.entry(id).or_insert(cb);
    }
}

fn dispatch_store_update_observers(store: &mut Store, ev: &UpdateEvent) {
    let mut map = std::mem::take(&mut store.subs.store_updates);
    for cb in map.values_mut() {
        call_isolated(AssertUnwindSafe(|| cb(store, ev)));
    }
    for (id, cb) in map {
        store.subs.store_updates.entry(id).or_insert(cb);
    }
}

fn dispatch_store_cleanup_observers(store: &mut Store, ev: &UpdateEvent) {
    let mut map = std::mem::take(&mut store.subs.store_cleanup);
    for cb in map.values_mut() {
        call_isolated(AssertUnwindSafe(|| cb(store, ev)));
    }
    for (id, cb) in map {
        store.subs.store_cleanup.entry(id).or_insert(cb);
    }
}

/// Fired once per touched block after the whole cleanup queue drained.
pub(crate) fn emit_after_all_transactions(store: &mut Store) {
    let mut blocks = std::mem::take(&mut store.drained_blocks);
    blocks.dedup();
    let mut seen: Vec<BlockId> = Vec::new();
    for block_id in blocks.drain(..) {
        if seen.contains(&block_id) {
            continue;
        }
        seen.push(block_id.clone());
        emit_block_event_with(
            store,
            &block_id,
            BlockEventKind::AfterAllTransactions,
            None,
            true,
        );
    }
}

// ---- GC and struct merging ----

fn gc_and_merge(store: &mut Store, txn: &Transaction) {
    let Ok(block) = store.block_mut(&txn.block) else {
        return;
    };

    if block.gc {
        for (client, ranges) in txn.delete_set.clients() {
            for range in ranges {
                gc_range(block, client, range.clock, range.end());
            }
        }
    }

    // Merge around the deleted regions.
    for (client, ranges) in txn.delete_set.clients() {
        for range in ranges {
            merge_range(block, client, range.clock, range.end());
        }
    }
    // Merge every newly written clock range, right to left.
    let mut clients: Vec<u32> = txn.after_state.keys().copied().collect();
    clients.sort_unstable();
    for client in clients {
        let before = state_of(&txn.before_state, client);
        let after = state_of(&txn.after_state, client);
        if before == after {
            continue;
        }
        let first_change = block
            .structs
            .find_index(client, before)
            .unwrap_or(0)
            .max(1);
        let len = block.structs.client_structs(client).len();
        let mut i = len.saturating_sub(1);
        while i >= first_change {
            try_merge_with_left(block, client, i);
            if i == 0 {
                break;
            }
            i -= 1;
        }
    }
    // Retry merges invalidated by splices.
    for id in &txn.merge_structs {
        if let Some(idx) = block.structs.find_index(id.client, id.clock) {
            try_merge_with_left(block, id.client, idx);
        }
        if let Some(idx) = block.structs.find_index(id.client, id.clock) {
            let next = idx + 1;
            if next < block.structs.client_structs(id.client).len() {
                try_merge_with_left(block, id.client, next);
            }
        }
    }
}

enum GcAction {
    Skip(u32),
    Reclaim { first: Id, next: u32 },
    ReplaceStruct { index: usize, next: u32 },
}

fn gc_range(block: &mut Block, client: u32, start: u32, end: u32) {
    let mut clock = start;
    while clock < end {
        let action = {
            let Some(idx) = block.structs.find_index(client, clock) else {
                break;
            };
            let s = &block.structs.client_structs(client)[idx];
            let next = s.id().clock + s.len();
            match s.as_item() {
                Some(item) if item.deleted && !item.keep => {
                    let filter_ok = block
                        .gc_filter
                        .as_ref()
                        .map(|f| f(item))
                        .unwrap_or(true);
                    if !filter_ok {
                        GcAction::Skip(next)
                    } else {
                        let parent_alive = match &item.parent {
                            TypeId::Named(_) => true,
                            TypeId::Nested(anchor) => block
                                .structs
                                .item(*anchor)
                                .map(|i| !i.deleted)
                                .unwrap_or(false),
                        };
                        if parent_alive {
                            GcAction::Reclaim {
                                first: item.id,
                                next,
                            }
                        } else {
                            GcAction::ReplaceStruct { index: idx, next }
                        }
                    }
                }
                _ => GcAction::Skip(next),
            }
        };
        match action {
            GcAction::Skip(next) => clock = next,
            GcAction::Reclaim { first, next } => {
                let dropped_type = {
                    let item = block.structs.item_mut(first).expect("item present");
                    let was_type = matches!(item.content, Content::Type(_));
                    item.content = Content::Deleted(item.content.len());
                    was_type
                };
                if dropped_type {
                    block.types.remove(&TypeId::Nested(first));
                }
                clock = next;
            }
            GcAction::ReplaceStruct { index, next } => {
                let first = block.structs.client_structs(client)[index].id();
                block.types.remove(&TypeId::Nested(first));
                block.structs.replace_with_gc(client, index);
                clock = next;
            }
        }
    }
}

fn merge_range(block: &mut Block, client: u32, start: u32, end: u32) {
    let Some(last_idx) = block.structs.find_index(client, end.saturating_sub(1)) else {
        return;
    };
    let mut i = last_idx;
    loop {
        let first_clock = block.structs.client_structs(client)[i].id().clock;
        if first_clock < start || i == 0 {
            break;
        }
        try_merge_with_left(block, client, i);
        if i == 0 {
            break;
        }
        i -= 1;
        if i >= block.structs.client_structs(client).len() {
            i = block.structs.client_structs(client).len().saturating_sub(1);
        }
    }
}

fn contents_compatible(a: &Content, b: &Content) -> bool {
    matches!(
        (a, b),
        (Content::Deleted(_), Content::Deleted(_))
            | (Content::Json(_), Content::Json(_))
            | (Content::String(_), Content::String(_))
    )
}

/// Collapse the struct at `idx` into its left neighbour when ids, links,
/// origins, deletion state, and contents all line up.
pub(crate) fn try_merge_with_left(block: &mut Block, client: u32, idx: usize) -> bool {
    let mergeable = {
        let vec = block.structs.client_structs(client);
        if idx == 0 || idx >= vec.len() {
            return false;
        }
        match (&vec[idx - 1], &vec[idx]) {
            (Struct::Gc { id: lid, len }, Struct::Gc { id: rid, .. }) => {
                lid.clock + len == rid.clock
            }
            (Struct::Item(l), Struct::Item(r)) => {
                l.id.clock + l.len() == r.id.clock
                    && l.right == Some(r.id)
                    && r.origin == Some(l.last_id())
                    && r.right_origin == l.right_origin
                    && l.deleted == r.deleted
                    && contents_compatible(&l.content, &r.content)
            }
            _ => false,
        }
    };
    if !mergeable {
        return false;
    }
    let removed = block.structs.client_structs_mut(client).remove(idx);
    match removed {
        Struct::Gc { len: rlen, .. } => {
            if let Struct::Gc { len, .. } = &mut block.structs.client_structs_mut(client)[idx - 1] {
                *len += rlen;
            }
        }
        Struct::Item(r) => {
            let l_id = {
                let l = block.structs.client_structs_mut(client)[idx - 1]
                    .as_item_mut()
                    .expect("left is item");
                let merged = l.content.merge_with(&r.content);
                debug_assert!(merged);
                l.right = r.right;
                l.keep = l.keep || r.keep;
                l.id
            };
            if let Some(rr) = r.right {
                if let Some(neigh) = block.structs.item_mut(rr) {
                    neigh.left = Some(l_id);
                }
            }
            if let Some(key) = &r.parent_sub {
                if let Some(ty) = block.type_state_mut(&r.parent) {
                    if ty.map.get(key) == Some(&r.id) {
                        ty.map.insert(key.clone(), l_id);
                    }
                }
            }
        }
        Struct::Skip { .. } => unreachable!("skips are never merged"),
    }
    true
}
