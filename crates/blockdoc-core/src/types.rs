//! In-memory type projections and the user-level mutation surface.
//!
//! A type is identified inside its block either by a share name (the empty
//! name is the block's root type) or by the item that anchors it. All
//! mutations run through the owning store so cross-block effects (refs,
//! unrefs) are coordinated by the active store transaction.

use crate::content::{Content, TypeDef};
use crate::id::{BlockId, Id};
use crate::item::{delete_item, integrate_item};
use crate::store::{Store, StoreError};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Array,
    Map,
    Text,
    XmlFragment,
    XmlElement,
    XmlText,
}

impl TypeKind {
    pub fn tag(self) -> u8 {
        match self {
            TypeKind::Array => 0,
            TypeKind::Map => 1,
            TypeKind::Text => 2,
            TypeKind::XmlFragment => 3,
            TypeKind::XmlElement => 4,
            TypeKind::XmlText => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => TypeKind::Array,
            1 => TypeKind::Map,
            2 => TypeKind::Text,
            3 => TypeKind::XmlFragment,
            4 => TypeKind::XmlElement,
            5 => TypeKind::XmlText,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TypeKind::Array => "array",
            TypeKind::Map => "map",
            TypeKind::Text => "text",
            TypeKind::XmlFragment => "xml-fragment",
            TypeKind::XmlElement => "xml-element",
            TypeKind::XmlText => "xml-text",
        }
    }

    pub fn from_str_name(name: &str) -> Option<Self> {
        Some(match name {
            "array" => TypeKind::Array,
            "map" => TypeKind::Map,
            "text" => TypeKind::Text,
            "xml-fragment" => TypeKind::XmlFragment,
            "xml-element" => TypeKind::XmlElement,
            "xml-text" => TypeKind::XmlText,
            _ => return None,
        })
    }

    /// Sequence kinds keep a countable `_length`.
    pub fn is_sequence(self) -> bool {
        !matches!(self, TypeKind::Map)
    }

    pub fn is_text(self) -> bool {
        matches!(self, TypeKind::Text | TypeKind::XmlText)
    }
}

/// Identity of a type within one block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeId {
    /// A share entry; the empty name is the root type.
    Named(String),
    /// A nested type anchored at the item with this first id.
    Nested(Id),
}

impl TypeId {
    pub fn root() -> Self {
        TypeId::Named(String::new())
    }
}

/// Public handle to a type: block + in-block identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypePtr {
    pub block: BlockId,
    pub id: TypeId,
}

impl TypePtr {
    pub fn new(block: impl Into<BlockId>, id: TypeId) -> Self {
        Self {
            block: block.into(),
            id,
        }
    }

    pub fn root_of(block: impl Into<BlockId>) -> Self {
        Self::new(block, TypeId::root())
    }
}

/// Materialized projection state of one type.
#[derive(Debug, Clone)]
pub struct TypeState {
    pub kind: TypeKind,
    pub node_name: Option<String>,
    /// First item of the sequence list (includes tombstones and format
    /// boundaries).
    pub start: Option<Id>,
    /// Latest-wins head item per map key.
    pub map: HashMap<String, Id>,
    /// Countable visible length; sequences only.
    pub len: u32,
}

impl TypeState {
    pub fn new(kind: TypeKind, node_name: Option<String>) -> Self {
        Self {
            kind,
            node_name,
            start: None,
            map: HashMap::new(),
            len: 0,
        }
    }

    pub fn from_def(def: &TypeDef) -> Self {
        Self::new(def.kind, def.node_name.clone())
    }
}

/// Prelim input values for inserts.
#[derive(Debug, Clone)]
pub enum In {
    Json(Value),
    Bytes(Vec<u8>),
    Embed(Value),
    Type(PrelimType),
    /// Embed an existing block as a child; integration wraps this in a `Ref`.
    BlockRef(BlockId),
}

/// A nested type under construction.
#[derive(Debug, Clone, Default)]
pub struct PrelimType {
    pub kind: Option<TypeKind>,
    pub node_name: Option<String>,
    pub items: Vec<In>,
    pub entries: Vec<(String, In)>,
    pub text: String,
    /// Formatted text runs; used when cloning text preserves attributes.
    pub runs: Vec<TextRun>,
}

impl PrelimType {
    pub fn array(items: Vec<In>) -> Self {
        Self {
            kind: Some(TypeKind::Array),
            items,
            ..Default::default()
        }
    }

    pub fn map(entries: Vec<(String, In)>) -> Self {
        Self {
            kind: Some(TypeKind::Map),
            entries,
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: Some(TypeKind::Text),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn xml_element(name: impl Into<String>) -> Self {
        Self {
            kind: Some(TypeKind::XmlElement),
            node_name: Some(name.into()),
            ..Default::default()
        }
    }

    fn resolved_kind(&self) -> TypeKind {
        self.kind.unwrap_or(TypeKind::Array)
    }
}

/// Values read back out of a type.
#[derive(Debug, Clone, PartialEq)]
pub enum Out {
    Json(Value),
    Bytes(Vec<u8>),
    Embed(Value),
    Type(TypePtr),
    /// A referenced child block.
    Block(BlockId),
}

/// One run of a text diff.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub insert: Value,
    pub attributes: Option<Map<String, Value>>,
}

impl Store {
    pub fn type_kind(&self, ptr: &TypePtr) -> Result<TypeKind, StoreError> {
        Ok(self.type_state(ptr)?.kind)
    }

    pub fn type_len(&self, ptr: &TypePtr) -> Result<u32, StoreError> {
        Ok(self.type_state(ptr)?.len)
    }

    pub fn xml_node_name(&self, ptr: &TypePtr) -> Result<Option<String>, StoreError> {
        Ok(self.type_state(ptr)?.node_name.clone())
    }

    // ---- sequence operations ----

    pub fn array_insert(
        &mut self,
        ptr: &TypePtr,
        index: u32,
        values: Vec<In>,
    ) -> Result<(), StoreError> {
        ensure_refs_allowed(self, &values)?;
        let ptr = ptr.clone();
        self.transact_inner(None, true, move |s| {
            s.ensure_txn(&ptr.block)?;
            let (origin, right) = seq_find_boundary(s, &ptr, index)?;
            insert_between(s, &ptr, origin, right, values)
        })
    }

    pub fn array_push(&mut self, ptr: &TypePtr, values: Vec<In>) -> Result<(), StoreError> {
        let len = self.type_len(ptr)?;
        self.array_insert(ptr, len, values)
    }

    pub fn array_delete(&mut self, ptr: &TypePtr, index: u32, len: u32) -> Result<(), StoreError> {
        let ptr = ptr.clone();
        self.transact_inner(None, true, move |s| {
            s.ensure_txn(&ptr.block)?;
            seq_delete(s, &ptr, index, len)
        })
    }

    pub fn array_get(&self, ptr: &TypePtr, index: u32) -> Result<Option<Out>, StoreError> {
        let block = self.block(&ptr.block)?;
        let ty = self.type_state(ptr)?;
        let mut cur = ty.start;
        let mut remaining = index;
        while let Some(id) = cur {
            let item = block
                .structs
                .item(id)
                .ok_or(StoreError::BrokenLink(ptr.block.clone()))?;
            if !item.deleted && item.countable() {
                let len = item.len();
                if remaining < len {
                    return Ok(Some(content_element(&ptr.block, item.id, &item.content, remaining)));
                }
                remaining -= len;
            }
            cur = item.right;
        }
        Ok(None)
    }

    pub fn array_to_vec(&self, ptr: &TypePtr) -> Result<Vec<Out>, StoreError> {
        let block = self.block(&ptr.block)?;
        let ty = self.type_state(ptr)?;
        let mut out = Vec::new();
        let mut cur = ty.start;
        while let Some(id) = cur {
            let item = block
                .structs
                .item(id)
                .ok_or(StoreError::BrokenLink(ptr.block.clone()))?;
            if !item.deleted && item.countable() {
                for offset in 0..item.len() {
                    out.push(content_element(&ptr.block, item.id, &item.content, offset));
                }
            }
            cur = item.right;
        }
        Ok(out)
    }

    // ---- map operations ----

    pub fn map_set(&mut self, ptr: &TypePtr, key: &str, value: In) -> Result<(), StoreError> {
        ensure_refs_allowed(self, std::slice::from_ref(&value))?;
        let ptr = ptr.clone();
        let key = key.to_owned();
        self.transact_inner(None, true, move |s| {
            s.ensure_txn(&ptr.block)?;
            map_set_inner(s, &ptr, &key, value)
        })
    }

    pub fn map_get(&self, ptr: &TypePtr, key: &str) -> Result<Option<Out>, StoreError> {
        let block = self.block(&ptr.block)?;
        let ty = self.type_state(ptr)?;
        let Some(&head) = ty.map.get(key) else {
            return Ok(None);
        };
        let item = block
            .structs
            .item(head)
            .ok_or(StoreError::BrokenLink(ptr.block.clone()))?;
        if item.deleted {
            return Ok(None);
        }
        let offset = item.len().saturating_sub(1);
        Ok(Some(content_element(
            &ptr.block,
            item.id,
            &item.content,
            offset,
        )))
    }

    pub fn map_delete(&mut self, ptr: &TypePtr, key: &str) -> Result<(), StoreError> {
        let ptr = ptr.clone();
        let key = key.to_owned();
        self.transact_inner(None, true, move |s| {
            s.ensure_txn(&ptr.block)?;
            let head = {
                let ty = s.type_state(&ptr)?;
                ty.map.get(&key).copied()
            };
            if let Some(head) = head {
                let deleted = s
                    .block(&ptr.block)?
                    .structs
                    .item(head)
                    .map(|i| i.deleted)
                    .unwrap_or(true);
                if !deleted {
                    delete_item(s, &ptr.block, head)?;
                }
            }
            Ok(())
        })
    }

    pub fn map_keys(&self, ptr: &TypePtr) -> Result<Vec<String>, StoreError> {
        let block = self.block(&ptr.block)?;
        let ty = self.type_state(ptr)?;
        let mut keys: Vec<String> = ty
            .map
            .iter()
            .filter(|(_, &head)| {
                block
                    .structs
                    .item(head)
                    .map(|item| !item.deleted)
                    .unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    // ---- text operations ----

    pub fn text_insert(&mut self, ptr: &TypePtr, index: u32, text: &str) -> Result<(), StoreError> {
        if text.is_empty() {
            return Ok(());
        }
        let ptr = ptr.clone();
        let text = text.to_owned();
        self.transact_inner(None, true, move |s| {
            s.ensure_txn(&ptr.block)?;
            let (origin, right) = seq_find_boundary(s, &ptr, index)?;
            insert_contents(s, &ptr, origin, right, vec![Content::String(text)])?;
            Ok(())
        })
    }

    pub fn text_insert_with_attributes(
        &mut self,
        ptr: &TypePtr,
        index: u32,
        text: &str,
        attributes: Map<String, Value>,
    ) -> Result<(), StoreError> {
        if text.is_empty() {
            return Ok(());
        }
        let ptr = ptr.clone();
        let text = text.to_owned();
        self.transact_inner(None, true, move |s| {
            s.ensure_txn(&ptr.block)?;
            let (origin, right) = seq_find_boundary(s, &ptr, index)?;
            let mut contents = Vec::with_capacity(attributes.len() * 2 + 1);
            let mut keys: Vec<&String> = attributes.keys().collect();
            keys.sort_unstable();
            for key in &keys {
                contents.push(Content::Format {
                    key: (*key).clone(),
                    value: attributes[*key].clone(),
                });
            }
            contents.push(Content::String(text));
            for key in keys.iter().rev() {
                contents.push(Content::Format {
                    key: (*key).clone(),
                    value: Value::Null,
                });
            }
            insert_contents(s, &ptr, origin, right, contents)?;
            s.mark_formatting_cleanup(&ptr.block);
            Ok(())
        })
    }

    pub fn text_delete(&mut self, ptr: &TypePtr, index: u32, len: u32) -> Result<(), StoreError> {
        self.array_delete(ptr, index, len)
    }

    pub fn text_format(
        &mut self,
        ptr: &TypePtr,
        index: u32,
        len: u32,
        attributes: Map<String, Value>,
    ) -> Result<(), StoreError> {
        if attributes.is_empty() || len == 0 {
            return Ok(());
        }
        let ptr = ptr.clone();
        self.transact_inner(None, true, move |s| {
            s.ensure_txn(&ptr.block)?;
            let (origin, right) = seq_find_boundary(s, &ptr, index)?;
            let mut keys: Vec<&String> = attributes.keys().collect();
            keys.sort_unstable();
            let opens: Vec<Content> = keys
                .iter()
                .map(|k| Content::Format {
                    key: (*k).clone(),
                    value: attributes[*k].clone(),
                })
                .collect();
            insert_contents(s, &ptr, origin, right, opens)?;
            let (end_origin, end_right) = seq_find_boundary(s, &ptr, index + len)?;
            let closes: Vec<Content> = keys
                .iter()
                .rev()
                .map(|k| Content::Format {
                    key: (*k).clone(),
                    value: Value::Null,
                })
                .collect();
            insert_contents(s, &ptr, end_origin, end_right, closes)?;
            s.mark_formatting_cleanup(&ptr.block);
            Ok(())
        })
    }

    pub fn text_to_string(&self, ptr: &TypePtr) -> Result<String, StoreError> {
        let block = self.block(&ptr.block)?;
        let ty = self.type_state(ptr)?;
        let mut out = String::new();
        let mut cur = ty.start;
        while let Some(id) = cur {
            let item = block
                .structs
                .item(id)
                .ok_or(StoreError::BrokenLink(ptr.block.clone()))?;
            if !item.deleted {
                if let Content::String(s) = &item.content {
                    out.push_str(s);
                }
            }
            cur = item.right;
        }
        Ok(out)
    }

    /// Visible text split into runs of identical formatting attributes.
    pub fn text_diff(&self, ptr: &TypePtr) -> Result<Vec<TextRun>, StoreError> {
        let block = self.block(&ptr.block)?;
        let ty = self.type_state(ptr)?;
        let mut runs: Vec<TextRun> = Vec::new();
        let mut attrs: Map<String, Value> = Map::new();
        let mut cur = ty.start;
        while let Some(id) = cur {
            let item = block
                .structs
                .item(id)
                .ok_or(StoreError::BrokenLink(ptr.block.clone()))?;
            if !item.deleted {
                match &item.content {
                    Content::Format { key, value } => {
                        if value.is_null() {
                            attrs.remove(key);
                        } else {
                            attrs.insert(key.clone(), value.clone());
                        }
                    }
                    Content::String(s) => {
                        push_run(&mut runs, Value::String(s.clone()), &attrs);
                    }
                    Content::Embed(v) => {
                        push_run(&mut runs, v.clone(), &attrs);
                    }
                    _ => {}
                }
            }
            cur = item.right;
        }
        Ok(runs)
    }

    // ---- views ----

    /// Render a type (recursively) to JSON.
    pub fn to_json(&self, ptr: &TypePtr) -> Result<Value, StoreError> {
        let ty = self.type_state(ptr)?;
        match ty.kind {
            TypeKind::Map => {
                let mut map = Map::new();
                for key in self.map_keys(ptr)? {
                    if let Some(out) = self.map_get(ptr, &key)? {
                        map.insert(key, self.out_to_json(&out)?);
                    }
                }
                Ok(Value::Object(map))
            }
            TypeKind::Text | TypeKind::XmlText => {
                Ok(Value::String(self.text_to_string(ptr)?))
            }
            TypeKind::Array | TypeKind::XmlFragment => {
                let mut items = Vec::new();
                for out in self.array_to_vec(ptr)? {
                    items.push(self.out_to_json(&out)?);
                }
                Ok(Value::Array(items))
            }
            TypeKind::XmlElement => {
                let mut attrs = Map::new();
                for key in self.map_keys(ptr)? {
                    if let Some(out) = self.map_get(ptr, &key)? {
                        attrs.insert(key, self.out_to_json(&out)?);
                    }
                }
                let mut children = Vec::new();
                for out in self.array_to_vec(ptr)? {
                    children.push(self.out_to_json(&out)?);
                }
                let mut obj = Map::new();
                obj.insert(
                    "tag".into(),
                    ty.node_name.clone().map(Value::String).unwrap_or(Value::Null),
                );
                obj.insert("attrs".into(), Value::Object(attrs));
                obj.insert("children".into(), Value::Array(children));
                Ok(Value::Object(obj))
            }
        }
    }

    fn out_to_json(&self, out: &Out) -> Result<Value, StoreError> {
        Ok(match out {
            Out::Json(v) | Out::Embed(v) => v.clone(),
            Out::Bytes(bytes) => Value::Array(
                bytes
                    .iter()
                    .map(|b| Value::Number((*b).into()))
                    .collect(),
            ),
            Out::Type(ptr) => self.to_json(ptr)?,
            Out::Block(block_id) => self.to_json(&TypePtr::root_of(block_id.clone()))?,
        })
    }
}

fn push_run(runs: &mut Vec<TextRun>, insert: Value, attrs: &Map<String, Value>) {
    let attributes = if attrs.is_empty() {
        None
    } else {
        Some(attrs.clone())
    };
    if let (Some(last), Value::String(s)) = (runs.last_mut(), &insert) {
        if last.attributes == attributes {
            if let Value::String(existing) = &mut last.insert {
                existing.push_str(s);
                return;
            }
        }
    }
    runs.push(TextRun { insert, attributes });
}

/// Whether disabled stores are trying to embed blocks through this insert.
fn ensure_refs_allowed(store: &Store, values: &[In]) -> Result<(), StoreError> {
    fn has_ref(value: &In) -> bool {
        match value {
            In::BlockRef(_) => true,
            In::Type(prelim) => {
                prelim.items.iter().any(has_ref)
                    || prelim.entries.iter().any(|(_, v)| has_ref(v))
            }
            _ => false,
        }
    }
    if !store.options.auto_ref && values.iter().any(has_ref) {
        return Err(StoreError::RefsDisabled);
    }
    Ok(())
}

fn content_element(block_id: &str, item_id: Id, content: &Content, offset: u32) -> Out {
    match content {
        Content::Json(values) => Out::Json(values[offset as usize].clone()),
        Content::Binary(bytes) => Out::Bytes(bytes.clone()),
        Content::String(s) => Out::Json(Value::String(
            s.chars().nth(offset as usize).map(String::from).unwrap_or_default(),
        )),
        Content::Embed(v) => Out::Embed(v.clone()),
        Content::Type(_) => Out::Type(TypePtr::new(block_id, TypeId::Nested(item_id))),
        Content::Ref { block_id: target, .. } => Out::Block(target.clone()),
        Content::Unref {
            block_id: target,
            client,
            clock,
        } => Out::Json(serde_json::json!({
            "block_id": target,
            "client": client,
            "clock": clock,
        })),
        Content::Deleted(_) | Content::Format { .. } => Out::Json(Value::Null),
    }
}

/// Find the insert boundary at `index`: the origin (last element id of the
/// predecessor) and the first id of the item that will sit to the right.
pub(crate) fn seq_find_boundary(
    store: &mut Store,
    ptr: &TypePtr,
    index: u32,
) -> Result<(Option<Id>, Option<Id>), StoreError> {
    let block = store.block_mut(&ptr.block)?;
    let start = block
        .type_state(&ptr.id)
        .ok_or_else(|| StoreError::UnknownType(ptr.block.clone()))?
        .start;
    let mut cur = start;
    let mut remaining = index;
    let mut origin: Option<Id> = None;
    while let Some(id) = cur {
        let (visible, len, right, client, clock) = {
            let item = block
                .structs
                .item(id)
                .ok_or(StoreError::BrokenLink(ptr.block.clone()))?;
            (
                !item.deleted && item.countable(),
                item.len(),
                item.right,
                item.id.client,
                item.id.clock,
            )
        };
        if !visible {
            cur = right;
            continue;
        }
        if remaining == 0 {
            return Ok((origin, Some(id)));
        }
        if remaining < len {
            let split_clock = clock + remaining;
            let right_id = block
                .structs
                .get_item_clean_start(Id::new(client, split_clock))
                .ok_or(StoreError::BrokenLink(ptr.block.clone()))?;
            return Ok((Some(Id::new(client, split_clock - 1)), Some(right_id)));
        }
        remaining -= len;
        origin = Some(Id::new(client, clock + len - 1));
        cur = right;
    }
    if remaining == 0 {
        Ok((origin, None))
    } else {
        Err(StoreError::IndexOutOfBounds(index))
    }
}

/// Turn prelims into contents and integrate them between `origin` and
/// `right`. Consecutive JSON values coalesce into one run.
pub(crate) fn insert_between(
    store: &mut Store,
    ptr: &TypePtr,
    origin: Option<Id>,
    right: Option<Id>,
    values: Vec<In>,
) -> Result<(), StoreError> {
    let mut origin = origin;
    let mut json_run: Vec<Value> = Vec::new();
    for value in values {
        match value {
            In::Json(v) => json_run.push(v),
            other => {
                if !json_run.is_empty() {
                    let run = std::mem::take(&mut json_run);
                    origin = Some(integrate_content(store, ptr, origin, right, Content::Json(run), None)?);
                }
                origin = Some(insert_single(store, ptr, origin, right, other)?);
            }
        }
    }
    if !json_run.is_empty() {
        integrate_content(store, ptr, origin, right, Content::Json(json_run), None)?;
    }
    Ok(())
}

fn insert_single(
    store: &mut Store,
    ptr: &TypePtr,
    origin: Option<Id>,
    right: Option<Id>,
    value: In,
) -> Result<Id, StoreError> {
    match value {
        In::Json(v) => integrate_content(store, ptr, origin, right, Content::Json(vec![v]), None),
        In::Bytes(bytes) => integrate_content(store, ptr, origin, right, Content::Binary(bytes), None),
        In::Embed(v) => integrate_content(store, ptr, origin, right, Content::Embed(v), None),
        In::Type(prelim) => {
            let def = TypeDef {
                kind: prelim.resolved_kind(),
                node_name: prelim.node_name.clone(),
            };
            let last = integrate_content(store, ptr, origin, right, Content::Type(def), None)?;
            let anchor = Id::new(last.client, last.clock);
            populate_prelim_type(
                store,
                &TypePtr::new(ptr.block.clone(), TypeId::Nested(anchor)),
                prelim,
            )?;
            Ok(last)
        }
        In::BlockRef(target) => {
            let content = store.ref_content_for(&target)?;
            integrate_content(store, ptr, origin, right, content, None)
        }
    }
}

/// Integrate a chain of raw contents between `origin` and `right`.
pub(crate) fn insert_contents(
    store: &mut Store,
    ptr: &TypePtr,
    origin: Option<Id>,
    right: Option<Id>,
    contents: Vec<Content>,
) -> Result<(), StoreError> {
    let mut origin = origin;
    for content in contents {
        origin = Some(integrate_content(store, ptr, origin, right, content, None)?);
    }
    Ok(())
}

/// Create and integrate one item; returns the last element id of the new
/// item (origin for a following sibling).
pub(crate) fn integrate_content(
    store: &mut Store,
    ptr: &TypePtr,
    origin: Option<Id>,
    right_origin: Option<Id>,
    content: Content,
    parent_sub: Option<String>,
) -> Result<Id, StoreError> {
    let client = store.client_id();
    let clock = store.block(&ptr.block)?.structs.get_state(client);
    let item = crate::item::Item::new(
        Id::new(client, clock),
        origin,
        right_origin,
        ptr.id.clone(),
        parent_sub,
        content,
    );
    let last = item.last_id();
    integrate_item(store, &ptr.block, item, 0)?;
    Ok(last)
}

fn map_set_inner(store: &mut Store, ptr: &TypePtr, key: &str, value: In) -> Result<(), StoreError> {
    let head = {
        let ty = store.type_state(ptr)?;
        ty.map.get(key).copied()
    };
    let origin = head
        .map(|h| {
            store
                .block(&ptr.block)?
                .structs
                .item(h)
                .map(|i| i.last_id())
                .ok_or(StoreError::BrokenLink(ptr.block.clone()))
        })
        .transpose()?;
    match value {
        In::Json(v) => {
            integrate_content(
                store,
                ptr,
                origin,
                None,
                Content::Json(vec![v]),
                Some(key.to_owned()),
            )?;
        }
        In::Bytes(bytes) => {
            integrate_content(
                store,
                ptr,
                origin,
                None,
                Content::Binary(bytes),
                Some(key.to_owned()),
            )?;
        }
        In::Embed(v) => {
            integrate_content(store, ptr, origin, None, Content::Embed(v), Some(key.to_owned()))?;
        }
        In::Type(prelim) => {
            let def = TypeDef {
                kind: prelim.resolved_kind(),
                node_name: prelim.node_name.clone(),
            };
            let last = integrate_content(
                store,
                ptr,
                origin,
                None,
                Content::Type(def),
                Some(key.to_owned()),
            )?;
            populate_prelim_type(
                store,
                &TypePtr::new(ptr.block.clone(), TypeId::Nested(last)),
                prelim,
            )?;
        }
        In::BlockRef(target) => {
            let content = store.ref_content_for(&target)?;
            integrate_content(store, ptr, origin, None, content, Some(key.to_owned()))?;
        }
    }
    Ok(())
}

/// Fill a freshly integrated nested type from its prelim description.
pub(crate) fn populate_prelim_type(
    store: &mut Store,
    ptr: &TypePtr,
    prelim: PrelimType,
) -> Result<(), StoreError> {
    for (key, value) in prelim.entries {
        map_set_inner(store, ptr, &key, value)?;
    }
    if !prelim.text.is_empty() {
        let text = prelim.text;
        let (origin, right) = seq_find_boundary(store, ptr, 0)?;
        insert_contents(store, ptr, origin, right, vec![Content::String(text)])?;
    }
    for run in prelim.runs {
        let len = store.type_len(ptr)?;
        match run.insert {
            Value::String(s) => {
                if let Some(attrs) = run.attributes {
                    store.text_insert_with_attributes(ptr, len, &s, attrs)?;
                } else {
                    store.text_insert(ptr, len, &s)?;
                }
            }
            other => {
                let (origin, right) = seq_find_boundary(store, ptr, len)?;
                insert_contents(store, ptr, origin, right, vec![Content::Embed(other)])?;
            }
        }
    }
    if !prelim.items.is_empty() {
        let len = store.type_len(ptr)?;
        let (origin, right) = seq_find_boundary(store, ptr, len)?;
        insert_between(store, ptr, origin, right, prelim.items)?;
    }
    Ok(())
}

fn seq_delete(store: &mut Store, ptr: &TypePtr, index: u32, len: u32) -> Result<(), StoreError> {
    if len == 0 {
        return Ok(());
    }
    let (_, right) = seq_find_boundary(store, ptr, index)?;
    let mut cur = right;
    let mut remaining = len;
    while remaining > 0 {
        let Some(id) = cur else {
            return Err(StoreError::IndexOutOfBounds(index + len));
        };
        let (visible, item_len, right_link, client, clock) = {
            let block = store.block(&ptr.block)?;
            let item = block
                .structs
                .item(id)
                .ok_or(StoreError::BrokenLink(ptr.block.clone()))?;
            (
                !item.deleted && item.countable(),
                item.len(),
                item.right,
                item.id.client,
                item.id.clock,
            )
        };
        if !visible {
            cur = right_link;
            continue;
        }
        if item_len > remaining {
            let block = store.block_mut(&ptr.block)?;
            block
                .structs
                .get_item_clean_start(Id::new(client, clock + remaining))
                .ok_or(StoreError::BrokenLink(ptr.block.clone()))?;
        }
        let (next, covered) = {
            let block = store.block(&ptr.block)?;
            let item = block
                .structs
                .item(id)
                .ok_or(StoreError::BrokenLink(ptr.block.clone()))?;
            (item.right, item.len())
        };
        delete_item(store, &ptr.block, id)?;
        remaining -= covered;
        cur = next;
    }
    Ok(())
}
