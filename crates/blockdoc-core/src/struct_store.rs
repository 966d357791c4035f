//! Per-client append-only operation logs.

use crate::delete_set::DeleteSet;
use crate::id::{Id, StateVector};
use crate::item::Item;
use std::collections::HashMap;

/// One entry in a client log: a live item, a reclaimed range, or a gap
/// marker from a partial update.
#[derive(Debug, Clone)]
pub enum Struct {
    Item(Item),
    Gc { id: Id, len: u32 },
    Skip { id: Id, len: u32 },
}

impl Struct {
    pub fn id(&self) -> Id {
        match self {
            Struct::Item(item) => item.id,
            Struct::Gc { id, .. } | Struct::Skip { id, .. } => *id,
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            Struct::Item(item) => item.len(),
            Struct::Gc { len, .. } | Struct::Skip { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_clock(&self) -> u32 {
        self.id().clock + self.len() - 1
    }

    pub fn as_item(&self) -> Option<&Item> {
        match self {
            Struct::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn as_item_mut(&mut self) -> Option<&mut Item> {
        match self {
            Struct::Item(item) => Some(item),
            _ => None,
        }
    }
}

/// Map `client -> sorted vector of structs`, the operation log of one block.
#[derive(Debug, Clone, Default)]
pub struct StructStore {
    clients: HashMap<u32, Vec<Struct>>,
}

impl StructStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clients(&self) -> impl Iterator<Item = (u32, &[Struct])> {
        self.clients.iter().map(|(c, v)| (*c, v.as_slice()))
    }

    pub fn client_structs(&self, client: u32) -> &[Struct] {
        self.clients.get(&client).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn client_structs_mut(&mut self, client: u32) -> &mut Vec<Struct> {
        self.clients.entry(client).or_default()
    }

    /// Next clock expected from `client`.
    pub fn get_state(&self, client: u32) -> u32 {
        self.clients
            .get(&client)
            .and_then(|v| v.last())
            .map(|s| s.id().clock + s.len())
            .unwrap_or(0)
    }

    pub fn state_vector(&self) -> StateVector {
        self.clients
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(client, v)| {
                let last = v.last().expect("non-empty checked");
                (*client, last.id().clock + last.len())
            })
            .collect()
    }

    /// Binary search for the struct whose clock range contains `clock`.
    pub fn find_index(&self, client: u32, clock: u32) -> Option<usize> {
        let structs = self.clients.get(&client)?;
        if structs.is_empty() {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = structs.len() - 1;
        while lo <= hi {
            let mid = (lo + hi) / 2;
            let s = &structs[mid];
            if clock < s.id().clock {
                if mid == 0 {
                    return None;
                }
                hi = mid - 1;
            } else if clock > s.last_clock() {
                lo = mid + 1;
                if lo >= structs.len() {
                    return None;
                }
            } else {
                return Some(mid);
            }
        }
        None
    }

    /// The item containing element `id`, if any.
    pub fn item(&self, id: Id) -> Option<&Item> {
        let idx = self.find_index(id.client, id.clock)?;
        self.clients[&id.client][idx].as_item()
    }

    pub fn item_mut(&mut self, id: Id) -> Option<&mut Item> {
        let idx = self.find_index(id.client, id.clock)?;
        self.clients.get_mut(&id.client)?[idx].as_item_mut()
    }

    /// First id of the struct containing `id` (useful as a stable address).
    pub fn containing_id(&self, id: Id) -> Option<Id> {
        let idx = self.find_index(id.client, id.clock)?;
        Some(self.clients[&id.client][idx].id())
    }

    /// Insert keeping the per-client vector sorted by clock. Appends are the
    /// common case.
    pub fn insert_struct(&mut self, s: Struct) {
        let structs = self.clients.entry(s.id().client).or_default();
        match structs.last() {
            Some(last) if last.id().clock < s.id().clock => structs.push(s),
            None => structs.push(s),
            _ => {
                let pos = structs
                    .binary_search_by_key(&s.id().clock, |x| x.id().clock)
                    .unwrap_or_else(|e| e);
                structs.insert(pos, s);
            }
        }
    }

    /// Split the item at `index` so the left part keeps `diff` elements.
    /// Fixes the neighbour links of the surrounding items and returns the
    /// first id of the right part.
    pub fn split_item(&mut self, client: u32, index: usize, diff: u32) -> Id {
        let (right_item, old_right) = {
            let structs = self.clients.get_mut(&client).expect("client exists");
            let item = structs[index].as_item_mut().expect("split target is item");
            debug_assert!(diff > 0 && diff < item.len());
            let right_content = item.content.splice(diff);
            let right_id = Id::new(item.id.client, item.id.clock + diff);
            let right = Item {
                id: right_id,
                origin: Some(Id::new(item.id.client, item.id.clock + diff - 1)),
                right_origin: item.right_origin,
                left: Some(item.id),
                right: item.right,
                parent: item.parent.clone(),
                parent_sub: item.parent_sub.clone(),
                content: right_content,
                deleted: item.deleted,
                keep: item.keep,
            };
            let old_right = item.right;
            item.right = Some(right_id);
            (right, old_right)
        };
        let right_id = right_item.id;
        self.clients
            .get_mut(&client)
            .expect("client exists")
            .insert(index + 1, Struct::Item(right_item));
        if let Some(r) = old_right {
            if let Some(neigh) = self.item_mut(r) {
                neigh.left = Some(right_id);
            }
        }
        right_id
    }

    /// Ensure a struct boundary exists exactly at `id.clock`; returns the
    /// first id of the struct starting there.
    pub fn get_item_clean_start(&mut self, id: Id) -> Option<Id> {
        let idx = self.find_index(id.client, id.clock)?;
        let s = &self.clients[&id.client][idx];
        if s.id().clock == id.clock {
            return Some(s.id());
        }
        if s.as_item().is_none() {
            return Some(s.id());
        }
        let diff = id.clock - s.id().clock;
        Some(self.split_item(id.client, idx, diff))
    }

    /// Ensure a struct boundary exists right after `id.clock`; returns the
    /// first id of the struct ending there.
    pub fn get_item_clean_end(&mut self, id: Id) -> Option<Id> {
        let idx = self.find_index(id.client, id.clock)?;
        let s = &self.clients[&id.client][idx];
        if s.last_clock() == id.clock {
            return Some(s.id());
        }
        if s.as_item().is_none() {
            return Some(s.id());
        }
        let first = s.id();
        let diff = id.clock - s.id().clock + 1;
        self.split_item(id.client, idx, diff);
        Some(first)
    }

    /// Replace the item at `index` with a GC struct occupying the same clock
    /// range. Content is lost; the id range survives.
    pub fn replace_with_gc(&mut self, client: u32, index: usize) {
        let structs = self.clients.get_mut(&client).expect("client exists");
        let (id, len) = {
            let s = &structs[index];
            (s.id(), s.len())
        };
        structs[index] = Struct::Gc { id, len };
    }

    /// Delete ranges currently observable in this store: tombstoned items and
    /// reclaimed GC ranges.
    pub fn full_delete_set(&self) -> DeleteSet {
        let mut ds = DeleteSet::new();
        for (client, structs) in &self.clients {
            for s in structs {
                let deleted = match s {
                    Struct::Item(item) => item.deleted,
                    Struct::Gc { .. } => true,
                    Struct::Skip { .. } => false,
                };
                if deleted {
                    ds.add(Id::new(*client, s.id().clock), s.len());
                }
            }
        }
        ds.sort_and_merge();
        ds
    }
}
