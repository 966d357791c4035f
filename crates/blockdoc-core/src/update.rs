//! UpdateV2 wire grammar: encode a block's structs and delete set against a
//! state vector, decode and integrate remote payloads.
//!
//! Structs whose causal dependencies have not arrived are parked on the block
//! and retried after each subsequent apply, so out-of-order delivery
//! converges without error.

use crate::block::Block;
use crate::codec::{Reader, Writer};
use crate::content::{Content, TAG_GC, TAG_SKIP};
use crate::delete_set::DeleteSet;
use crate::id::{state_of, BlockId, Id, StateVector};
use crate::item::{delete_item, integrate_item, Item};
use crate::store::{Store, StoreError};
use crate::struct_store::Struct;
use crate::transaction::Transaction;
use crate::types::TypeId;

#[derive(Debug, Clone)]
pub(crate) enum DecodedParent {
    Named(String),
    Nested(Id),
}

#[derive(Debug, Clone)]
pub(crate) struct DecodedItem {
    pub origin: Option<Id>,
    pub right_origin: Option<Id>,
    pub parent: Option<DecodedParent>,
    pub parent_sub: Option<String>,
    pub content: Content,
}

#[derive(Debug, Clone)]
pub(crate) enum DecodedBody {
    Gc { len: u32 },
    Skip { len: u32 },
    Item(DecodedItem),
}

#[derive(Debug, Clone)]
pub(crate) struct DecodedStruct {
    pub id: Id,
    pub body: DecodedBody,
}

impl DecodedStruct {
    fn len(&self) -> u32 {
        match &self.body {
            DecodedBody::Gc { len } | DecodedBody::Skip { len } => *len,
            DecodedBody::Item(item) => item.content.len(),
        }
    }
}

/// Structs (and a delete set) that could not integrate yet.
#[derive(Debug, Clone, Default)]
pub struct PendingUpdate {
    pub(crate) structs: Vec<DecodedStruct>,
    pub(crate) delete_set: DeleteSet,
}

const FLAG_ORIGIN: u8 = 0x80;
const FLAG_RIGHT_ORIGIN: u8 = 0x40;
const FLAG_PARENT_SUB: u8 = 0x20;
const TAG_MASK: u8 = 0x1f;

fn write_id(w: &mut Writer, id: Id) {
    w.write_var_u32(id.client);
    w.write_var_u32(id.clock);
}

fn read_id(r: &mut Reader<'_>) -> Result<Id, StoreError> {
    let client = r.read_var_u32()?;
    let clock = r.read_var_u32()?;
    Ok(Id::new(client, clock))
}

fn write_struct(w: &mut Writer, s: &Struct, offset: u32) {
    match s {
        Struct::Gc { len, .. } => {
            w.write_u8(TAG_GC);
            w.write_var_u32(len - offset);
        }
        Struct::Skip { len, .. } => {
            w.write_u8(TAG_SKIP);
            w.write_var_u32(len - offset);
        }
        Struct::Item(item) => {
            let origin = if offset > 0 {
                Some(Id::new(item.id.client, item.id.clock + offset - 1))
            } else {
                item.origin
            };
            let content = if offset > 0 {
                let mut head = item.content.clone();
                head.splice(offset)
            } else {
                item.content.clone()
            };
            let parent_needed = origin.is_none() && item.right_origin.is_none();
            let write_parent_sub = parent_needed && item.parent_sub.is_some();
            let mut info = content.tag();
            if origin.is_some() {
                info |= FLAG_ORIGIN;
            }
            if item.right_origin.is_some() {
                info |= FLAG_RIGHT_ORIGIN;
            }
            if write_parent_sub {
                info |= FLAG_PARENT_SUB;
            }
            w.write_u8(info);
            if let Some(o) = origin {
                write_id(w, o);
            }
            if let Some(o) = item.right_origin {
                write_id(w, o);
            }
            if parent_needed {
                match &item.parent {
                    TypeId::Named(name) => {
                        w.write_u8(1);
                        w.write_string(name);
                    }
                    TypeId::Nested(anchor) => {
                        w.write_u8(0);
                        write_id(w, *anchor);
                    }
                }
            }
            if write_parent_sub {
                w.write_string(item.parent_sub.as_deref().unwrap_or_default());
            }
            content.write(w);
        }
    }
}

/// Encode everything in `block` past `sv`, followed by `ds`.
pub(crate) fn encode_update(block: &Block, sv: &StateVector, ds: &DeleteSet) -> Vec<u8> {
    let mut w = Writer::new();
    let mut clients: Vec<u32> = block
        .structs
        .clients()
        .filter(|(client, structs)| {
            !structs.is_empty() && block.structs.get_state(*client) > state_of(sv, *client)
        })
        .map(|(client, _)| client)
        .collect();
    clients.sort_unstable();
    w.write_var_u32(clients.len() as u32);
    for client in clients {
        let structs = block.structs.client_structs(client);
        let from = state_of(sv, client);
        let start = block
            .structs
            .find_index(client, from)
            .unwrap_or(structs.len());
        w.write_var_u32(client);
        w.write_var_u32(from);
        w.write_var_u32((structs.len() - start) as u32);
        for (i, s) in structs.iter().enumerate().skip(start) {
            let offset = if i == start { from - s.id().clock } else { 0 };
            write_struct(&mut w, s, offset);
        }
    }
    ds.write(&mut w);
    w.into_inner()
}

/// Update payload for one finished per-block transaction.
pub(crate) fn encode_transaction_update(block: &Block, txn: &Transaction) -> Vec<u8> {
    encode_update(block, &txn.before_state, &txn.delete_set)
}

pub(crate) fn decode_update(data: &[u8]) -> Result<(Vec<DecodedStruct>, DeleteSet), StoreError> {
    let mut r = Reader::new(data);
    let num_clients = r.read_var_u32()?;
    let mut structs = Vec::new();
    for _ in 0..num_clients {
        let client = r.read_var_u32()?;
        let mut clock = r.read_var_u32()?;
        let num = r.read_var_u32()?;
        for _ in 0..num {
            let info = r.read_u8()?;
            let tag = info & TAG_MASK;
            let body = match tag {
                TAG_GC => DecodedBody::Gc {
                    len: r.read_var_u32()?,
                },
                TAG_SKIP => DecodedBody::Skip {
                    len: r.read_var_u32()?,
                },
                _ => {
                    let origin = if info & FLAG_ORIGIN != 0 {
                        Some(read_id(&mut r)?)
                    } else {
                        None
                    };
                    let right_origin = if info & FLAG_RIGHT_ORIGIN != 0 {
                        Some(read_id(&mut r)?)
                    } else {
                        None
                    };
                    let parent = if origin.is_none() && right_origin.is_none() {
                        Some(if r.read_u8()? == 1 {
                            DecodedParent::Named(r.read_string()?)
                        } else {
                            DecodedParent::Nested(read_id(&mut r)?)
                        })
                    } else {
                        None
                    };
                    let parent_sub = if info & FLAG_PARENT_SUB != 0 {
                        Some(r.read_string()?)
                    } else {
                        None
                    };
                    let content = Content::read(tag, &mut r)?;
                    DecodedBody::Item(DecodedItem {
                        origin,
                        right_origin,
                        parent,
                        parent_sub,
                        content,
                    })
                }
            };
            let s = DecodedStruct {
                id: Id::new(client, clock),
                body,
            };
            clock += s.len();
            structs.push(s);
        }
    }
    let ds = DeleteSet::read(&mut r)?;
    Ok((structs, ds))
}

enum Attempt {
    Applied,
    Deferred(DecodedStruct),
}

fn try_integrate(store: &mut Store, block_id: &str, dec: DecodedStruct) -> Result<Attempt, StoreError> {
    let state = store.block(block_id)?.structs.get_state(dec.id.client);
    if dec.id.clock > state {
        return Ok(Attempt::Deferred(dec));
    }
    let len = dec.len();
    let offset = state - dec.id.clock;
    if offset >= len {
        // Entirely known already.
        return Ok(Attempt::Applied);
    }
    match dec.body {
        DecodedBody::Gc { len } => {
            store.block_mut(block_id)?.structs.insert_struct(Struct::Gc {
                id: Id::new(dec.id.client, state),
                len: len - offset,
            });
            Ok(Attempt::Applied)
        }
        DecodedBody::Skip { .. } => Ok(Attempt::Applied),
        DecodedBody::Item(item) => {
            // Causal dependency checks.
            let block = store.block(block_id)?;
            let missing = |id: Option<Id>| {
                id.map(|o| o.clock >= block.structs.get_state(o.client))
                    .unwrap_or(false)
            };
            if missing(item.origin) || missing(item.right_origin) {
                return Ok(Attempt::Deferred(DecodedStruct {
                    id: dec.id,
                    body: DecodedBody::Item(item),
                }));
            }
            if let Some(DecodedParent::Nested(anchor)) = &item.parent {
                if anchor.clock >= block.structs.get_state(anchor.client) {
                    return Ok(Attempt::Deferred(DecodedStruct {
                        id: dec.id,
                        body: DecodedBody::Item(item),
                    }));
                }
            }
            // Resolve the parent type, deriving it from a neighbour when the
            // wire omitted it.
            let resolved: Option<(TypeId, Option<String>)> = match &item.parent {
                Some(DecodedParent::Named(name)) => {
                    let name = name.clone();
                    let tid = store
                        .block_mut(block_id)?
                        .get_or_create_named_type(&name, crate::types::TypeKind::Array);
                    Some((tid, item.parent_sub.clone()))
                }
                Some(DecodedParent::Nested(anchor)) => block
                    .structs
                    .containing_id(*anchor)
                    .and_then(|first| {
                        block.structs.item(first).and_then(|i| {
                            matches!(i.content, Content::Type(_))
                                .then(|| (TypeId::Nested(first), item.parent_sub.clone()))
                        })
                    }),
                None => {
                    let neighbour = item
                        .origin
                        .or(item.right_origin)
                        .expect("parent omitted only when an origin exists");
                    block
                        .structs
                        .item(neighbour)
                        .map(|n| (n.parent.clone(), n.parent_sub.clone()))
                }
            };
            match resolved {
                Some((parent, parent_sub)) => {
                    let new_item = Item::new(
                        dec.id,
                        item.origin,
                        item.right_origin,
                        parent,
                        parent_sub,
                        item.content,
                    );
                    integrate_item(store, block_id, new_item, offset)?;
                    Ok(Attempt::Applied)
                }
                None => {
                    // The surrounding structure was reclaimed; keep the clock
                    // range as an orphaned tombstone.
                    insert_orphan(store, block_id, dec.id, item.content, offset)?;
                    Ok(Attempt::Applied)
                }
            }
        }
    }
}

fn insert_orphan(
    store: &mut Store,
    block_id: &str,
    id: Id,
    mut content: Content,
    offset: u32,
) -> Result<(), StoreError> {
    let id = Id::new(id.client, id.clock + offset);
    if offset > 0 {
        content = content.splice(offset);
    }
    let len = content.len();
    let mut item = Item::new(id, None, None, TypeId::root(), None, content);
    item.deleted = true;
    store.block_mut(block_id)?.structs.insert_struct(Struct::Item(item));
    store.record_delete(block_id, id, len);
    Ok(())
}

fn apply_structs(
    store: &mut Store,
    block_id: &str,
    mut queue: Vec<DecodedStruct>,
) -> Result<(), StoreError> {
    loop {
        let mut progress = false;
        let mut rest = Vec::new();
        for dec in queue {
            match try_integrate(store, block_id, dec)? {
                Attempt::Applied => progress = true,
                Attempt::Deferred(dec) => rest.push(dec),
            }
        }
        if rest.is_empty() {
            return Ok(());
        }
        if !progress {
            store.block_mut(block_id)?.pending.push(PendingUpdate {
                structs: rest,
                delete_set: DeleteSet::new(),
            });
            return Ok(());
        }
        queue = rest;
    }
}

fn apply_delete_set(store: &mut Store, block_id: &str, ds: DeleteSet) -> Result<(), StoreError> {
    let mut leftover = DeleteSet::new();
    for (client, ranges) in ds.clients() {
        for range in ranges {
            let state = store.block(block_id)?.structs.get_state(client);
            if range.end() > state {
                let from = state.max(range.clock);
                leftover.add(Id::new(client, from), range.end() - from);
            }
            let end = range.end().min(state);
            let mut clock = range.clock;
            while clock < end {
                let found = {
                    let block = store.block(block_id)?;
                    block.structs.find_index(client, clock).map(|idx| {
                        let s = &block.structs.client_structs(client)[idx];
                        (
                            s.id().clock,
                            s.len(),
                            s.as_item().map(|i| i.deleted),
                        )
                    })
                };
                let Some((first_clock, slen, item_state)) = found else {
                    break;
                };
                match item_state {
                    Some(false) => {
                        let last = {
                            let block = store.block_mut(block_id)?;
                            block
                                .structs
                                .get_item_clean_start(Id::new(client, clock))
                                .ok_or(StoreError::BrokenLink(block_id.to_owned()))?;
                            let last = block
                                .structs
                                .item(Id::new(client, clock))
                                .ok_or(StoreError::BrokenLink(block_id.to_owned()))?
                                .last_id()
                                .clock;
                            if last >= end {
                                block.structs.get_item_clean_end(Id::new(client, end - 1));
                            }
                            last
                        };
                        delete_item(store, block_id, Id::new(client, clock))?;
                        clock = (last + 1).min(end);
                    }
                    _ => {
                        clock = first_clock + slen;
                    }
                }
            }
        }
    }
    if !leftover.is_empty() {
        store.block_mut(block_id)?.pending.push(PendingUpdate {
            structs: Vec::new(),
            delete_set: leftover,
        });
    }
    Ok(())
}

impl Store {
    /// Apply a remote update to one block.
    pub fn apply_update_v2(&mut self, block_id: &str, update: &[u8]) -> Result<(), StoreError> {
        self.apply_update_inner(block_id, update, false)
    }

    pub(crate) fn apply_update_inner(
        &mut self,
        block_id: &str,
        update: &[u8],
        local: bool,
    ) -> Result<(), StoreError> {
        let data = update.to_vec();
        let block_id = block_id.to_owned();
        self.transact_inner(None, local, move |s| {
            s.ensure_txn(&block_id)?;
            let (mut structs, mut ds) = decode_update(&data)?;
            let stashed = std::mem::take(&mut s.block_mut(&block_id)?.pending);
            for pending in stashed {
                structs.extend(pending.structs);
                ds.merge(&pending.delete_set);
            }
            apply_structs(s, &block_id, structs)?;
            apply_delete_set(s, &block_id, ds)?;
            Ok(())
        })
    }

    /// Encode a block's state (or the part the remote is missing).
    pub fn encode_state_as_update_v2(
        &self,
        block_id: &str,
        remote_sv: Option<&StateVector>,
    ) -> Result<Vec<u8>, StoreError> {
        let block = self.block(block_id)?;
        let empty = StateVector::new();
        let sv = remote_sv.unwrap_or(&empty);
        Ok(encode_update(block, sv, &block.structs.full_delete_set()))
    }

    pub fn state_vector(&self, block_id: &str) -> Result<StateVector, StoreError> {
        Ok(self.block(block_id)?.structs.state_vector())
    }

    pub fn encode_state_vector(&self, block_id: &str) -> Result<Vec<u8>, StoreError> {
        let sv = self.state_vector(block_id)?;
        let mut w = Writer::new();
        let mut clients: Vec<u32> = sv.keys().copied().collect();
        clients.sort_unstable();
        w.write_var_u32(clients.len() as u32);
        for client in clients {
            w.write_var_u32(client);
            w.write_var_u32(sv[&client]);
        }
        Ok(w.into_inner())
    }

    pub fn decode_state_vector(data: &[u8]) -> Result<StateVector, StoreError> {
        let mut r = Reader::new(data);
        let num = r.read_var_u32()?;
        let mut sv = StateVector::new();
        for _ in 0..num {
            let client = r.read_var_u32()?;
            let clock = r.read_var_u32()?;
            sv.insert(client, clock);
        }
        Ok(sv)
    }

    /// Independent CRDT copy of a block: a fresh block fed the source's full
    /// state. Ref descendants are cloned by the conflict resolver, which sees
    /// the copied refs lose against the originals.
    pub fn clone_block(&mut self, block_id: &str) -> Result<BlockId, StoreError> {
        let kind = self.block(block_id)?.kind();
        let update = self.encode_state_as_update_v2(block_id, None)?;
        let clone_id = self.create_block(kind, None)?;
        self.apply_update_inner(&clone_id, &update, true)?;
        Ok(clone_id)
    }
}
