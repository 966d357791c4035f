//! The atomic CRDT operation: the item struct, integration into a block's
//! sequence/map projections, and tombstoning.

use crate::content::Content;
use crate::id::{Id, ItemAddr};
use crate::store::{Store, StoreError};
use crate::types::TypeId;
use std::collections::HashSet;

/// A single integrated (or about-to-integrate) operation.
///
/// `origin`/`right_origin` capture the insertion context and are immutable;
/// `left`/`right` are the resolved neighbour links maintained by integration,
/// splitting, and merging. Deletion is a tombstone flag mirrored by the
/// containing block's delete set.
#[derive(Debug, Clone)]
pub struct Item {
    /// First id of the run; the item spans `[id.clock, id.clock + len)`.
    pub id: Id,
    pub origin: Option<Id>,
    pub right_origin: Option<Id>,
    pub left: Option<Id>,
    pub right: Option<Id>,
    /// The type this item lives in, within the owning block.
    pub parent: TypeId,
    /// Map key when the item lives in a map; `None` for sequence position.
    pub parent_sub: Option<String>,
    pub content: Content,
    pub deleted: bool,
    /// Blocks GC when set; `Unref` items pin themselves with this.
    pub keep: bool,
}

impl Item {
    pub fn new(
        id: Id,
        origin: Option<Id>,
        right_origin: Option<Id>,
        parent: TypeId,
        parent_sub: Option<String>,
        content: Content,
    ) -> Self {
        let keep = matches!(content, Content::Unref { .. });
        Self {
            id,
            origin,
            right_origin,
            left: None,
            right: None,
            parent,
            parent_sub,
            content,
            deleted: false,
            keep,
        }
    }

    pub fn len(&self) -> u32 {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the last element in the run.
    pub fn last_id(&self) -> Id {
        Id::new(self.id.client, self.id.clock + self.len() - 1)
    }

    pub fn countable(&self) -> bool {
        self.content.countable()
    }

    /// Whether this item contains the element `id`.
    pub fn contains(&self, id: Id) -> bool {
        id.client == self.id.client
            && id.clock >= self.id.clock
            && id.clock < self.id.clock + self.len()
    }
}

enum DeleteEffect {
    None,
    Ref,
    Type,
}

/// Integrate `item` into its block. `offset` skips a prefix the receiver
/// already holds (duplicate suppression for partial remote runs).
///
/// Origins resolve to clean struct boundaries; among candidates inserted at
/// the same position the item with the greater `(client, clock)` wins the
/// left position.
pub(crate) fn integrate_item(
    store: &mut Store,
    block_id: &str,
    mut item: Item,
    offset: u32,
) -> Result<(), StoreError> {
    if offset > 0 {
        item.id.clock += offset;
        item.origin = Some(Id::new(item.id.client, item.id.clock - 1));
        item.content = item.content.splice(offset);
    }

    let mut delete_prev_head: Option<Id> = None;
    let self_delete;
    {
        let block = store.block_mut(block_id)?;

        // Resolve neighbour candidates from the immutable origins.
        let mut left: Option<Id> = match item.origin {
            Some(o) => Some(
                block
                    .structs
                    .get_item_clean_end(o)
                    .ok_or_else(|| StoreError::MissingDependency(block_id.to_owned()))?,
            ),
            None => None,
        };
        let right: Option<Id> = match item.right_origin {
            Some(o) => Some(
                block
                    .structs
                    .get_item_clean_start(o)
                    .ok_or_else(|| StoreError::MissingDependency(block_id.to_owned()))?,
            ),
            None => None,
        };

        // Scan for concurrent siblings between left and right.
        let scan_start: Option<Id> = match left {
            Some(l) => block.structs.item(l).and_then(|i| i.right),
            None => match &item.parent_sub {
                Some(key) => {
                    let mut r = block
                        .type_state(&item.parent)
                        .and_then(|ty| ty.map.get(key).copied());
                    while let Some(rid) = r {
                        match block.structs.item(rid).and_then(|i| i.left) {
                            Some(l) => r = Some(l),
                            None => break,
                        }
                    }
                    r
                }
                None => block.type_state(&item.parent).and_then(|ty| ty.start),
            },
        };
        let mut o = scan_start;
        let mut items_before_origin: HashSet<Id> = HashSet::new();
        let mut conflicting: HashSet<Id> = HashSet::new();
        while let Some(oid) = o {
            if Some(oid) == right {
                break;
            }
            items_before_origin.insert(oid);
            conflicting.insert(oid);
            let (o_origin, o_right_origin, o_right, o_first) = {
                let other = block
                    .structs
                    .item(oid)
                    .ok_or(StoreError::BrokenLink(block_id.to_owned()))?;
                (other.origin, other.right_origin, other.right, other.id)
            };
            if o_origin == item.origin {
                if (o_first.client, o_first.clock) > (item.id.client, item.id.clock) {
                    left = Some(oid);
                    conflicting.clear();
                } else if o_right_origin == item.right_origin {
                    break;
                }
            } else {
                match o_origin.and_then(|oo| block.structs.containing_id(oo)) {
                    Some(os) if items_before_origin.contains(&os) => {
                        if !conflicting.contains(&os) {
                            left = Some(oid);
                            conflicting.clear();
                        }
                    }
                    _ => break,
                }
            }
            o = o_right;
        }
        item.left = left;

        // Splice into the neighbour list and projections.
        if let Some(l) = item.left {
            let l_item = block
                .structs
                .item_mut(l)
                .ok_or(StoreError::BrokenLink(block_id.to_owned()))?;
            item.right = l_item.right;
            l_item.right = Some(item.id);
        } else {
            item.right = match &item.parent_sub {
                Some(key) => {
                    let mut r = block
                        .type_state(&item.parent)
                        .and_then(|ty| ty.map.get(key).copied());
                    while let Some(rid) = r {
                        match block.structs.item(rid).and_then(|i| i.left) {
                            Some(l) => r = Some(l),
                            None => break,
                        }
                    }
                    r
                }
                None => {
                    let ty = block
                        .type_state_mut(&item.parent)
                        .ok_or_else(|| StoreError::UnknownType(block_id.to_owned()))?;
                    let prev = ty.start;
                    ty.start = Some(item.id);
                    prev
                }
            };
        }
        if let Some(r) = item.right {
            let r_item = block
                .structs
                .item_mut(r)
                .ok_or(StoreError::BrokenLink(block_id.to_owned()))?;
            r_item.left = Some(item.id);
        } else if let Some(key) = &item.parent_sub {
            let ty = block
                .type_state_mut(&item.parent)
                .ok_or_else(|| StoreError::UnknownType(block_id.to_owned()))?;
            ty.map.insert(key.clone(), item.id);
            if let Some(l) = item.left {
                let live = block.structs.item(l).map(|i| !i.deleted).unwrap_or(false);
                if live {
                    delete_prev_head = Some(l);
                }
            }
        }
        if item.parent_sub.is_none() && item.countable() && !item.deleted {
            if let Some(ty) = block.type_state_mut(&item.parent) {
                ty.len += item.len();
            }
        }

        let parent_deleted = match &item.parent {
            TypeId::Nested(anchor) => block
                .structs
                .item(*anchor)
                .map(|i| i.deleted)
                .unwrap_or(true),
            TypeId::Named(_) => false,
        };
        self_delete = parent_deleted || (item.parent_sub.is_some() && item.right.is_some());

        if let Content::Type(def) = &item.content {
            block
                .types
                .insert(TypeId::Nested(item.id), crate::types::TypeState::from_def(def));
        }

        block.structs.insert_struct(crate::struct_store::Struct::Item(item.clone()));
    }

    // Content side effects that reach across blocks.
    let addr = ItemAddr::new(block_id, item.id);
    match &item.content {
        Content::Ref { .. } => {
            let local = store.current_txn_local();
            crate::block_ref::integrate_ref(store, &addr, local)?;
        }
        Content::Unref { .. } => {
            store.record_unref_added(addr.clone());
        }
        _ => {}
    }

    store.record_change(block_id, item.parent.clone(), item.parent_sub.clone());
    if let Some(o) = item.origin {
        store.record_merge_candidate(block_id, o);
    }
    if let Some(o) = item.right_origin {
        store.record_merge_candidate(block_id, o);
    }

    if let Some(prev) = delete_prev_head {
        delete_item(store, block_id, prev)?;
    }
    if self_delete {
        delete_item(store, block_id, item.id)?;
    }
    Ok(())
}

/// Tombstone the item whose first id is `id`, propagating type-length
/// bookkeeping, delete-set recording, and content-specific teardown.
pub(crate) fn delete_item(store: &mut Store, block_id: &str, id: Id) -> Result<(), StoreError> {
    let (parent, parent_sub, len, effect) = {
        let block = store.block_mut(block_id)?;
        let Some(item) = block.structs.item_mut(id) else {
            return Ok(());
        };
        if item.deleted {
            return Ok(());
        }
        item.deleted = true;
        let parent = item.parent.clone();
        let parent_sub = item.parent_sub.clone();
        let len = item.len();
        let countable = item.countable();
        let first = item.id;
        let effect = match &item.content {
            Content::Ref { .. } => DeleteEffect::Ref,
            Content::Type(_) => DeleteEffect::Type,
            _ => DeleteEffect::None,
        };
        if parent_sub.is_none() && countable {
            if let Some(ty) = block.type_state_mut(&parent) {
                ty.len -= len;
            }
        }
        (parent, parent_sub, (first, len), effect)
    };

    let (first, span) = len;
    store.record_delete(block_id, first, span);
    store.record_change(block_id, parent, parent_sub);

    match effect {
        DeleteEffect::Ref => {
            crate::block_ref::delete_ref(store, &ItemAddr::new(block_id, first))?;
        }
        DeleteEffect::Type => {
            delete_type_children(store, block_id, TypeId::Nested(first))?;
        }
        DeleteEffect::None => {}
    }
    Ok(())
}

/// Recursively tombstone every live item of a nested type.
fn delete_type_children(
    store: &mut Store,
    block_id: &str,
    type_id: TypeId,
) -> Result<(), StoreError> {
    let mut to_delete: Vec<Id> = Vec::new();
    {
        let block = store.block(block_id)?;
        let Some(ty) = block.type_state(&type_id) else {
            return Ok(());
        };
        let mut cur = ty.start;
        while let Some(id) = cur {
            let Some(item) = block.structs.item(id) else {
                break;
            };
            if !item.deleted {
                to_delete.push(id);
            }
            cur = item.right;
        }
        for head in ty.map.values() {
            let mut cur = Some(*head);
            while let Some(id) = cur {
                let Some(item) = block.structs.item(id) else {
                    break;
                };
                if !item.deleted {
                    to_delete.push(id);
                }
                cur = item.left;
            }
        }
    }
    for id in to_delete {
        delete_item(store, block_id, id)?;
    }
    Ok(())
}
