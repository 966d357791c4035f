//! A block: one CRDT document with its own operation log and root type.

use crate::id::{BlockId, ItemAddr, StateVector};
use crate::item::Item;
use crate::struct_store::StructStore;
use crate::types::{TypeId, TypeKind, TypeState};
use crate::update::PendingUpdate;
use std::collections::HashMap;
use std::rc::Rc;

/// Internal share name of the unref log every block carries.
pub const UNREFS_NAME: &str = "_unrefs";

pub(crate) type GcFilter = Rc<dyn Fn(&Item) -> bool>;

/// One independently mutable CRDT document.
///
/// A block is created by its store (regular blocks get a UUIDv4 id, root
/// blocks derive theirs from the root name) and lives until the store does.
/// At most one item in the whole store may currently embed it; that item is
/// tracked through the `referrer` backlink.
pub struct Block {
    pub(crate) id: BlockId,
    pub(crate) is_root: bool,
    pub(crate) kind: TypeKind,
    pub(crate) structs: StructStore,
    /// Share registry: named types (empty name = root type) plus nested
    /// types keyed by their anchor item.
    pub(crate) types: HashMap<TypeId, TypeState>,
    /// The item whose `Ref` content currently embeds this block.
    pub(crate) referrer: Option<ItemAddr>,
    /// The last referrer before it was cleared; drives `Unref` emission.
    pub(crate) prev_referrer: Option<ItemAddr>,
    pub(crate) gc: bool,
    pub(crate) gc_filter: Option<GcFilter>,
    /// Memoized root lookup, valid while the store's referrer epoch matches.
    pub(crate) root_cache: Option<(u64, Option<BlockId>)>,
    /// Remote structs whose causal dependencies have not arrived yet.
    pub(crate) pending: Vec<PendingUpdate>,
}

impl Block {
    pub(crate) fn new(id: BlockId, is_root: bool, kind: TypeKind, gc: bool, gc_filter: Option<GcFilter>) -> Self {
        let mut types = HashMap::new();
        types.insert(TypeId::root(), TypeState::new(kind, None));
        types.insert(
            TypeId::Named(UNREFS_NAME.to_owned()),
            TypeState::new(TypeKind::Array, None),
        );
        Self {
            id,
            is_root,
            kind,
            structs: StructStore::new(),
            types,
            referrer: None,
            prev_referrer: None,
            gc,
            gc_filter,
            root_cache: None,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn referrer(&self) -> Option<&ItemAddr> {
        self.referrer.as_ref()
    }

    pub fn prev_referrer(&self) -> Option<&ItemAddr> {
        self.prev_referrer.as_ref()
    }

    pub fn state_vector(&self) -> StateVector {
        self.structs.state_vector()
    }

    /// Number of structs currently held for one client; merging keeps this
    /// small for runs of local edits.
    pub fn struct_count(&self, client: u32) -> usize {
        self.structs.client_structs(client).len()
    }

    /// Reassigning an already assigned id is ignored; the source logs and
    /// returns, and so do we.
    pub fn set_id(&mut self, id: impl Into<BlockId>) {
        let id = id.into();
        if !self.id.is_empty() && self.id != id {
            tracing::warn!(current = %self.id, requested = %id, "ignoring block id reassignment");
            return;
        }
        self.id = id;
    }

    pub(crate) fn type_state(&self, id: &TypeId) -> Option<&TypeState> {
        self.types.get(id)
    }

    pub(crate) fn type_state_mut(&mut self, id: &TypeId) -> Option<&mut TypeState> {
        self.types.get_mut(id)
    }

    /// Look up or create a share entry. Named types other than the root use
    /// the given kind on first access.
    pub(crate) fn get_or_create_named_type(&mut self, name: &str, kind: TypeKind) -> TypeId {
        let id = TypeId::Named(name.to_owned());
        self.types
            .entry(id.clone())
            .or_insert_with(|| TypeState::new(kind, None));
        id
    }

    /// Names of all share entries (root type is the empty name).
    pub fn share_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .types
            .keys()
            .filter_map(|id| match id {
                TypeId::Named(name) => Some(name.clone()),
                TypeId::Nested(_) => None,
            })
            .collect();
        names.sort_unstable();
        names
    }
}

/// Derive a root block's id from its name.
pub(crate) fn root_block_id(name: &str) -> BlockId {
    format!("@{name}")
}
