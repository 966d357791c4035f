//! Core primitives for blockdoc-rs.
//!
//! A store owns a set of independently mutable CRDT documents ("blocks") that
//! can embed one another by reference. The interesting machinery lives in the
//! transaction layer: store-wide transactions bundle per-block change records,
//! resolve competing block references by cloning, detect reference cycles, and
//! run observer dispatch and garbage collection across every touched block.

pub mod block;
pub mod block_ref;
pub mod codec;
pub mod content;
pub mod delete_set;
pub mod event;
pub mod id;
pub mod item;
pub mod store;
pub mod struct_store;
pub mod transaction;
pub mod types;
pub mod update;

pub use block::Block;
pub use content::Content;
pub use delete_set::DeleteSet;
pub use event::{
    BlockEventKind, BlockUpdateEvent, Event, PathSegment, TransactionEvent, UpdateEvent,
};
pub use id::{Id, ItemAddr, StateVector};
pub use item::Item;
pub use store::{Store, StoreError, StoreOptions};
pub use types::{In, Out, PrelimType, TextRun, TypeId, TypeKind, TypePtr};

use rand::Rng;

/// Generates a random client id for a new store.
pub fn generate_client_id() -> u32 {
    let mut rng = rand::thread_rng();
    rng.gen_range(1..=u32::MAX)
}

/// Returns the crate version at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
