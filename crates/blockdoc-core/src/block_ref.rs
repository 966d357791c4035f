//! Block-reference content semantics: integration, deletion, unref emission,
//! and the store-level conflict and cycle resolver.
//!
//! At most one item in the store may embed a given block. Competing referrers
//! are resolved deterministically by cloning the loser's target; reference
//! cycles are broken by removing the offending item without replacement.

use crate::block::UNREFS_NAME;
use crate::content::Content;
use crate::id::{BlockId, ItemAddr};
use crate::item::delete_item;
use crate::store::{Store, StoreError};
use crate::transaction::StoreTransaction;
use crate::types::{
    insert_contents, integrate_content, populate_prelim_type, seq_find_boundary, In, PrelimType,
    TypeId, TypeKind, TypePtr,
};
use std::collections::HashSet;

/// Target and container info of a ref item, if it still is one.
fn ref_info(store: &Store, addr: &ItemAddr) -> Option<(BlockId, TypeKind, bool)> {
    let item = store.blocks.get(&addr.block)?.structs.item(addr.id)?;
    match &item.content {
        Content::Ref {
            block_id,
            block_type,
        } => Some((block_id.clone(), *block_type, item.deleted)),
        _ => None,
    }
}

/// Called when a `Ref` item integrates into its block.
///
/// Local integration resolves the target eagerly: install the referrer or
/// resolve the conflict on the spot, then check for cycles. Remote
/// integration only records the ref; everything else waits for
/// `resolve_block_refs` in the cleanup pipeline.
pub(crate) fn integrate_ref(
    store: &mut Store,
    addr: &ItemAddr,
    local: bool,
) -> Result<(), StoreError> {
    if let Some(st) = store.txn.as_mut() {
        st.refs_added.push(addr.clone());
    }
    if !local {
        return Ok(());
    }
    let Some((target_id, target_kind, deleted)) = ref_info(store, addr) else {
        return Ok(());
    };
    if deleted {
        return Ok(());
    }
    let target = store.get_or_create_block(&target_id, target_kind)?;
    if store.block(&target)?.is_root() {
        return Err(StoreError::RootRef(target));
    }
    let existing = store.block(&target)?.referrer().cloned();
    match existing {
        Some(ref r) if r != addr => resolve_ref_conflict(store, addr),
        _ => {
            store.block_mut(&target)?.referrer = Some(addr.clone());
            store.bump_referrer_epoch();
            validate_circular_ref(store, addr)
        }
    }
}

/// Called when a `Ref` item is tombstoned.
///
/// Clears the target's referrer backlink (remembering it in
/// `prev_referrer`), keeps the store transaction's add/remove sets
/// symmetric, and — for local transactions only — appends an `Unref` record
/// to the owning block's `"_unrefs"` log.
pub(crate) fn delete_ref(store: &mut Store, addr: &ItemAddr) -> Result<(), StoreError> {
    let Some((target_id, _, _)) = ref_info(store, addr) else {
        return Ok(());
    };
    if let Ok(target) = store.block_mut(&target_id) {
        if target.referrer.as_ref() == Some(addr) {
            target.prev_referrer = Some(addr.clone());
            target.referrer = None;
            store.bump_referrer_epoch();
        }
    }
    if let Some(st) = store.txn.as_mut() {
        st.refs_removed.push(addr.clone());
        st.refs_added.retain(|a| a != addr);
    }
    if store.current_txn_local() && store.blocks.contains_key(&addr.block) {
        append_unref(store, &addr.block.clone(), &target_id, addr)?;
    }
    Ok(())
}

/// Append one `Unref` item to the owning block's `"_unrefs"` array.
fn append_unref(
    store: &mut Store,
    owner: &str,
    target_id: &str,
    ref_addr: &ItemAddr,
) -> Result<(), StoreError> {
    store.ensure_txn(owner)?;
    let type_id = store
        .block_mut(owner)?
        .get_or_create_named_type(UNREFS_NAME, TypeKind::Array);
    let ptr = TypePtr::new(owner.to_owned(), type_id);
    let len = store.type_len(&ptr)?;
    let (origin, right) = seq_find_boundary(store, &ptr, len)?;
    insert_contents(
        store,
        &ptr,
        origin,
        right,
        vec![Content::Unref {
            block_id: target_id.to_owned(),
            client: ref_addr.id.client,
            clock: ref_addr.id.clock,
        }],
    )
}

/// Delete-then-clone resolution for the losing referrer.
///
/// The loser's item is removed from its container first so the clone cannot
/// inherit the conflicting reference, then a recursive clone of the target
/// is inserted at the same position.
pub(crate) fn resolve_ref_conflict(store: &mut Store, addr: &ItemAddr) -> Result<(), StoreError> {
    let (parent, parent_sub, target) = {
        let Ok(block) = store.block(&addr.block) else {
            return Ok(());
        };
        let Some(item) = block.structs.item(addr.id) else {
            return Ok(());
        };
        if item.deleted {
            return Ok(());
        }
        let Content::Ref { block_id, .. } = &item.content else {
            return Ok(());
        };
        (item.parent.clone(), item.parent_sub.clone(), block_id.clone())
    };
    tracing::warn!(
        block = %addr.block,
        target = %target,
        "block ref conflict; replacing loser with a clone"
    );
    let ptr = TypePtr::new(addr.block.clone(), parent);
    match parent_sub {
        Some(key) => {
            delete_item(store, &addr.block, addr.id)?;
            let clone_id = clone_block(store, &target)?;
            let content = ref_content(store, &clone_id)?;
            let origin = {
                let ty = store.type_state(&ptr)?;
                let head = ty.map.get(&key).copied();
                head.and_then(|h| {
                    store
                        .block(&ptr.block)
                        .ok()
                        .and_then(|b| b.structs.item(h))
                        .map(|i| i.last_id())
                })
            };
            integrate_content(store, &ptr, origin, None, content, Some(key))?;
        }
        None => {
            let index = sequence_position(store, &ptr, addr)?;
            delete_item(store, &addr.block, addr.id)?;
            let clone_id = clone_block(store, &target)?;
            let content = ref_content(store, &clone_id)?;
            let (origin, right) = seq_find_boundary(store, &ptr, index)?;
            integrate_content(store, &ptr, origin, right, content, None)?;
        }
    }
    Ok(())
}

fn ref_content(store: &Store, target: &str) -> Result<Content, StoreError> {
    let block = store.block(target)?;
    Ok(Content::Ref {
        block_id: target.to_owned(),
        block_type: block.kind(),
    })
}

/// Countable position of an item inside its sequence parent.
fn sequence_position(store: &Store, ptr: &TypePtr, addr: &ItemAddr) -> Result<u32, StoreError> {
    let block = store.block(&ptr.block)?;
    let ty = store.type_state(ptr)?;
    let mut index = 0u32;
    let mut cur = ty.start;
    while let Some(id) = cur {
        if id == addr.id {
            return Ok(index);
        }
        let item = block
            .structs
            .item(id)
            .ok_or(StoreError::BrokenLink(ptr.block.clone()))?;
        if !item.deleted && item.countable() {
            index += item.len();
        }
        cur = item.right;
    }
    Ok(index)
}

/// Recursive value-preserving clone: a fresh block whose root type carries an
/// independent copy of the source's content. Referenced child blocks are
/// themselves cloned, so every embedded subtree gets its own copy.
pub(crate) fn clone_block(store: &mut Store, block_id: &str) -> Result<BlockId, StoreError> {
    let kind = store.block(block_id)?.kind();
    let prelim = type_to_prelim(store, &TypePtr::root_of(block_id.to_owned()))?;
    let clone_id = store.create_block(kind, None)?;
    store.ensure_txn(&clone_id)?;
    populate_prelim_type(store, &TypePtr::root_of(clone_id.clone()), prelim)?;
    Ok(clone_id)
}

fn type_to_prelim(store: &mut Store, ptr: &TypePtr) -> Result<PrelimType, StoreError> {
    let kind = store.type_kind(ptr)?;
    let node_name = store.xml_node_name(ptr)?;
    let mut prelim = PrelimType {
        kind: Some(kind),
        node_name,
        ..Default::default()
    };
    if matches!(kind, TypeKind::Map | TypeKind::XmlElement) {
        for key in store.map_keys(ptr)? {
            if let Some(out) = store.map_get(ptr, &key)? {
                let value = out_to_in(store, out)?;
                prelim.entries.push((key, value));
            }
        }
    }
    if kind.is_text() {
        prelim.runs = store.text_diff(ptr)?;
    } else if kind.is_sequence() {
        for out in store.array_to_vec(ptr)? {
            let value = out_to_in(store, out)?;
            prelim.items.push(value);
        }
    }
    Ok(prelim)
}

fn out_to_in(store: &mut Store, out: crate::types::Out) -> Result<In, StoreError> {
    Ok(match out {
        crate::types::Out::Json(v) => In::Json(v),
        crate::types::Out::Bytes(b) => In::Bytes(b),
        crate::types::Out::Embed(v) => In::Embed(v),
        crate::types::Out::Type(ptr) => In::Type(type_to_prelim(store, &ptr)?),
        crate::types::Out::Block(child) => In::BlockRef(clone_block(store, &child)?),
    })
}

/// Walk the referrer chain upward from the item's owning block; if it
/// reaches the item's own target, the reference would close a cycle and the
/// item is removed without replacement.
pub(crate) fn validate_circular_ref(store: &mut Store, addr: &ItemAddr) -> Result<(), StoreError> {
    let Some((target, _, deleted)) = ref_info(store, addr) else {
        return Ok(());
    };
    if deleted {
        return Ok(());
    }
    let mut visited: HashSet<BlockId> = HashSet::new();
    let mut cur = addr.block.clone();
    loop {
        if cur == target {
            tracing::warn!(
                block = %addr.block,
                target = %target,
                "circular block ref; removing the offending item"
            );
            return delete_item(store, &addr.block, addr.id);
        }
        if !visited.insert(cur.clone()) {
            return Ok(());
        }
        match store.blocks.get(&cur).and_then(|b| b.referrer.clone()) {
            Some(r) => cur = r.block,
            None => return Ok(()),
        }
    }
}

/// Cycle check after a remote install: collect the chain's edges and pick a
/// deterministic loser (greatest item id, block id as final tie-break) so
/// every peer breaks the same edge.
fn remote_cycle_loser(store: &Store, addr: &ItemAddr, target: &str) -> Option<ItemAddr> {
    let mut edges = vec![addr.clone()];
    let mut visited: HashSet<BlockId> = HashSet::new();
    let mut cur = addr.block.clone();
    loop {
        if cur == target {
            return edges.into_iter().max_by(|a, b| {
                (a.id.client, a.id.clock, &a.block).cmp(&(b.id.client, b.id.clock, &b.block))
            });
        }
        if !visited.insert(cur.clone()) {
            return None;
        }
        let r = store.blocks.get(&cur).and_then(|b| b.referrer.clone())?;
        cur = r.block.clone();
        edges.push(r);
    }
}

/// Store-cleanup step: process the transaction's ref bookkeeping, install
/// referrers for unique added refs, and hand conflict losers, cycle edges,
/// and formatting cleanup to a nested `"cleanup"`-origin transaction.
pub(crate) fn resolve_block_refs(store: &mut Store, st: &mut StoreTransaction, is_first: bool) {
    // Removed refs whose item really was the referrer: clear the backlink.
    for addr in st.refs_removed.clone() {
        let Some((target, _, _)) = ref_info(store, &addr) else {
            continue;
        };
        if let Some(block) = store.blocks.get_mut(&target) {
            if block.referrer.as_ref() == Some(&addr) {
                block.prev_referrer = Some(addr.clone());
                block.referrer = None;
                store.bump_referrer_epoch();
            }
        }
    }

    // Bucket live added refs by target; extras beyond the first in a bucket
    // are conflict losers outright.
    let mut buckets: Vec<(BlockId, TypeKind, Vec<ItemAddr>)> = Vec::new();
    for addr in st.refs_added.clone() {
        let Some((target, kind, deleted)) = ref_info(store, &addr) else {
            continue;
        };
        if deleted {
            continue;
        }
        match buckets.iter_mut().find(|(t, _, _)| *t == target) {
            Some((_, _, entries)) => entries.push(addr),
            None => buckets.push((target, kind, vec![addr])),
        }
    }

    let mut losers: Vec<ItemAddr> = Vec::new();
    let mut cycle_losers: Vec<ItemAddr> = Vec::new();
    for (target, kind, entries) in buckets {
        let (winner, extras) = entries.split_first().expect("bucket is non-empty");
        losers.extend(extras.iter().cloned());
        if store.get_or_create_block(&target, kind).is_err() {
            tracing::warn!(target = %target, "ref target type mismatch; skipping install");
            continue;
        }
        if store.blocks[&target].is_root() {
            tracing::warn!(target = %target, "ref to root block ignored");
            continue;
        }
        let existing = store.blocks[&target].referrer.clone();
        match existing {
            Some(ref r) if r != winner => {
                if st.local {
                    // The newly added ref loses inside a local transaction.
                    losers.push(winner.clone());
                } else {
                    // Remote transactions win: swap the backlink, clone the
                    // pre-existing referrer away.
                    let block = store.blocks.get_mut(&target).expect("target exists");
                    block.prev_referrer = Some(r.clone());
                    block.referrer = Some(winner.clone());
                    store.bump_referrer_epoch();
                    losers.push(r.clone());
                    if let Some(loser) = remote_cycle_loser(store, winner, &target) {
                        cycle_losers.push(loser);
                    }
                }
            }
            _ => {
                store.blocks.get_mut(&target).expect("target exists").referrer =
                    Some(winner.clone());
                store.bump_referrer_epoch();
                if let Some(loser) = remote_cycle_loser(store, winner, &target) {
                    cycle_losers.push(loser);
                }
            }
        }
    }

    let flagged: Vec<BlockId> = if st.local {
        st.txns
            .iter()
            .filter(|t| t.need_formatting_cleanup)
            .map(|t| t.block.clone())
            .collect()
    } else {
        Vec::new()
    };

    // Loser handling runs inside a nested transaction so the cloning changes
    // group into the next cleanup pass. The outermost user transaction opens
    // it unconditionally; drained follow-ups only when they carry work. The
    // resolution transaction is scoped to the same blocks as the transaction
    // being cleaned up.
    if is_first || !losers.is_empty() || !cycle_losers.is_empty() || !flagged.is_empty() {
        let touched: Vec<BlockId> = st.txns.iter().map(|t| t.block.clone()).collect();
        store.transact_inner(Some("cleanup".into()), true, move |s| {
            for block_id in &touched {
                let _ = s.ensure_txn(block_id);
            }
            for addr in &cycle_losers {
                tracing::warn!(
                    block = %addr.block,
                    "breaking remote ref cycle deterministically"
                );
                let _ = delete_item(s, &addr.block, addr.id);
            }
            for addr in &losers {
                if let Err(err) = resolve_ref_conflict(s, addr) {
                    tracing::warn!(error = %err, "ref conflict resolution failed");
                }
            }
            for block_id in &flagged {
                if let Err(err) = formatting_cleanup(s, block_id) {
                    tracing::warn!(error = %err, "formatting cleanup failed");
                }
            }
        });
    }
}

/// Drop formatting boundaries that are immediately overridden by another
/// boundary with the same key (no visible content between them).
fn formatting_cleanup(store: &mut Store, block_id: &str) -> Result<(), StoreError> {
    let candidates = {
        let block = store.block(block_id)?;
        let mut to_delete = Vec::new();
        let mut type_ids: Vec<TypeId> = block
            .types
            .iter()
            .filter(|(_, ty)| ty.kind.is_text())
            .map(|(id, _)| id.clone())
            .collect();
        type_ids.sort_by_key(|id| match id {
            TypeId::Named(name) => (0, name.clone(), None),
            TypeId::Nested(anchor) => (1, String::new(), Some(*anchor)),
        });
        for type_id in type_ids {
            let Some(ty) = block.type_state(&type_id) else {
                continue;
            };
            let mut cur = ty.start;
            while let Some(id) = cur {
                let Some(item) = block.structs.item(id) else {
                    break;
                };
                if !item.deleted {
                    if let Content::Format { key, .. } = &item.content {
                        let mut next = item.right;
                        while let Some(next_id) = next {
                            let Some(n) = block.structs.item(next_id) else {
                                break;
                            };
                            if n.deleted {
                                next = n.right;
                                continue;
                            }
                            if let Content::Format { key: next_key, .. } = &n.content {
                                if next_key == key {
                                    to_delete.push(id);
                                }
                            }
                            break;
                        }
                    }
                }
                cur = item.right;
            }
        }
        to_delete
    };
    for id in candidates {
        delete_item(store, block_id, id)?;
    }
    Ok(())
}
