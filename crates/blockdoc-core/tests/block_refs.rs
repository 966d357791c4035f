use blockdoc_core::{In, Out, Store, StoreError, TypeId, TypeKind, TypePtr};
use serde_json::json;

type Snapshot = Vec<(String, bool, TypeKind, Vec<u8>)>;

fn snapshot(store: &Store) -> Snapshot {
    store
        .block_ids()
        .into_iter()
        .map(|id| {
            let block = store.get_block(&id).expect("listed block exists");
            let update = store
                .encode_state_as_update_v2(&id, None)
                .expect("encode state");
            (id.clone(), block.is_root(), block.kind(), update)
        })
        .collect()
}

fn apply_snapshot(store: &mut Store, snap: &Snapshot) {
    for (id, is_root, kind, update) in snap {
        if *is_root {
            store
                .get_or_create_root_type(&id[1..], *kind)
                .expect("root type");
        } else {
            store.get_or_create_block(id, *kind).expect("block");
        }
        store.apply_update_v2(id, update).expect("apply state");
    }
}

fn sync_pair(a: &mut Store, b: &mut Store) {
    let from_a = snapshot(a);
    let from_b = snapshot(b);
    apply_snapshot(b, &from_a);
    apply_snapshot(a, &from_b);
}

fn block_of(out: Option<Out>) -> String {
    match out {
        Some(Out::Block(id)) => id,
        other => panic!("expected a block ref, got {other:?}"),
    }
}

#[test]
fn local_ref_conflict_clones_the_second_referrer() {
    let mut s = Store::new();
    let root = s
        .get_or_create_root_type("R", TypeKind::Map)
        .expect("root");
    let child = s.create_block(TypeKind::Array, None).expect("child");
    let child_root = s.root_type(&child).expect("child root");
    s.array_push(&child_root, vec![In::Json(json!(1)), In::Json(json!(2))])
        .expect("fill child");

    s.transact(|s| {
        s.map_set(&root, "a", In::BlockRef(child.clone()))?;
        s.map_set(&root, "b", In::BlockRef(child.clone()))
    })
    .expect("two refs to one block");

    let a = block_of(s.map_get(&root, "a").expect("get a"));
    let b = block_of(s.map_get(&root, "b").expect("get b"));
    assert_eq!(a, child, "the first referrer keeps the original");
    assert_ne!(b, child, "the second referrer got a clone");
    assert_eq!(
        s.block_to_json(&a).expect("view a"),
        s.block_to_json(&b).expect("view b"),
        "the clone carries identical content"
    );

    // At most one referrer per block, and it is installed.
    let child_block = s.get_block(&child).expect("child");
    assert_eq!(child_block.referrer().expect("referrer").block, "@R");
    let clone_block = s.get_block(&b).expect("clone");
    assert_eq!(clone_block.referrer().expect("referrer").block, "@R");
}

#[test]
fn circular_refs_are_removed() {
    let mut s = Store::new();
    let b1 = s.create_block(TypeKind::Map, None).expect("b1");
    let b2 = s.create_block(TypeKind::Map, None).expect("b2");
    let r1 = s.root_type(&b1).expect("r1");
    let r2 = s.root_type(&b2).expect("r2");

    s.map_set(&r1, "x", In::BlockRef(b2.clone())).expect("first ref");
    s.map_set(&r2, "y", In::BlockRef(b1.clone())).expect("second ref");

    // The offending item was removed, nothing replaced it.
    assert!(s.map_get(&r2, "y").expect("get y").is_none());
    assert_eq!(block_of(s.map_get(&r1, "x").expect("get x")), b2);
    assert!(s.get_block(&b1).expect("b1").referrer().is_none());
    assert_eq!(
        s.get_block(&b2).expect("b2").referrer().expect("referrer").block,
        b1
    );
}

#[test]
fn deleting_a_ref_emits_an_unref_record() {
    let mut s = Store::new();
    let root = s
        .get_or_create_root_type("R", TypeKind::Map)
        .expect("root");
    let b = s.create_block(TypeKind::Array, None).expect("block");

    s.transact(|s| {
        s.map_set(&root, "c", In::BlockRef(b.clone()))?;
        s.map_delete(&root, "c")
    })
    .expect("ref then delete");

    assert!(s.map_get(&root, "c").expect("get").is_none());
    let unrefs = TypePtr::new("@R".to_owned(), TypeId::Named("_unrefs".to_owned()));
    let records = s.array_to_vec(&unrefs).expect("unref log");
    assert_eq!(records.len(), 1, "exactly one unref per local ref deletion");
    match &records[0] {
        Out::Json(record) => {
            assert_eq!(record["block_id"], json!(b));
            assert!(record["client"].is_u64());
            assert!(record["clock"].is_u64());
        }
        other => panic!("expected an unref record, got {other:?}"),
    }

    let block = s.get_block(&b).expect("block");
    assert!(block.referrer().is_none());
    assert!(block.prev_referrer().is_some());
}

#[test]
fn remote_conflicting_refs_settle_into_clones() {
    let mut s1 = Store::new();
    let mut s2 = Store::new();
    let r1 = s1
        .get_or_create_root_type("R", TypeKind::Map)
        .expect("root");
    let r2 = s2
        .get_or_create_root_type("R", TypeKind::Map)
        .expect("root");

    s1.create_block(TypeKind::Array, Some("shared".to_owned()))
        .expect("shared on s1");
    let shared_root = s1.root_type("shared").expect("shared root");
    s1.array_push(&shared_root, vec![In::Json(json!("payload"))])
        .expect("content");
    sync_pair(&mut s1, &mut s2);

    // Concurrent refs to the same block from different keys.
    s1.map_set(&r1, "x", In::BlockRef("shared".to_owned()))
        .expect("ref x");
    s2.map_set(&r2, "y", In::BlockRef("shared".to_owned()))
        .expect("ref y");

    sync_pair(&mut s1, &mut s2);
    sync_pair(&mut s1, &mut s2);
    sync_pair(&mut s1, &mut s2);

    let v1 = s1.to_json(&r1).expect("view s1");
    let v2 = s2.to_json(&r2).expect("view s2");
    assert_eq!(v1, v2, "stores converge after resolution rounds");
    assert_eq!(v1["x"], json!(["payload"]));
    assert_eq!(v1["y"], json!(["payload"]));

    // Each surviving ref has its own block, each with one referrer.
    let x1 = block_of(s1.map_get(&r1, "x").expect("x"));
    let y1 = block_of(s1.map_get(&r1, "y").expect("y"));
    assert_ne!(x1, y1);
    assert_eq!(block_of(s2.map_get(&r2, "x").expect("x")), x1);
    assert_eq!(block_of(s2.map_get(&r2, "y").expect("y")), y1);
    for store in [&s1, &s2] {
        for id in [&x1, &y1] {
            assert_eq!(
                store.get_block(id).expect("block").referrer().expect("ref").block,
                "@R"
            );
        }
    }
}

#[test]
fn remote_cycles_break_identically_on_both_stores() {
    let mut s1 = Store::new();
    let mut s2 = Store::new();
    s1.create_block(TypeKind::Map, Some("b1".to_owned())).expect("b1");
    s1.create_block(TypeKind::Map, Some("b2".to_owned())).expect("b2");
    sync_pair(&mut s1, &mut s2);

    let r1a = s1.root_type("b1").expect("r1");
    let r2b = s2.root_type("b2").expect("r2");
    s1.map_set(&r1a, "x", In::BlockRef("b2".to_owned())).expect("x");
    s2.map_set(&r2b, "y", In::BlockRef("b1".to_owned())).expect("y");

    sync_pair(&mut s1, &mut s2);
    sync_pair(&mut s1, &mut s2);

    let v1 = (
        s1.to_json(&s1.root_type("b1").expect("h")).expect("b1"),
        s1.to_json(&s1.root_type("b2").expect("h")).expect("b2"),
    );
    let v2 = (
        s2.to_json(&s2.root_type("b1").expect("h")).expect("b1"),
        s2.to_json(&s2.root_type("b2").expect("h")).expect("b2"),
    );
    assert_eq!(v1, v2, "both stores broke the same edge");

    // No referrer chain loops back on itself.
    for store in [&s1, &s2] {
        for start in ["b1", "b2"] {
            let mut seen = vec![start.to_owned()];
            let mut cur = start.to_owned();
            while let Some(addr) = store.get_block(&cur).expect("block").referrer() {
                cur = addr.block.clone();
                assert!(!seen.contains(&cur), "referrer chain must be acyclic");
                seen.push(cur.clone());
            }
        }
    }
}

#[test]
fn root_blocks_cannot_be_referenced() {
    let mut s = Store::new();
    let root = s
        .get_or_create_root_type("R", TypeKind::Map)
        .expect("root");
    s.get_or_create_root_type("other", TypeKind::Array)
        .expect("other root");

    let err = s
        .map_set(&root, "bad", In::BlockRef("@other".to_owned()))
        .expect_err("refs to roots are rejected");
    assert!(matches!(err, StoreError::RootRef(_)));
}

#[test]
fn only_root_types_resolve_to_blocks() {
    use blockdoc_core::PrelimType;

    let mut s = Store::new();
    let root = s
        .get_or_create_root_type("R", TypeKind::Map)
        .expect("root");
    s.map_set(&root, "nested", In::Type(PrelimType::map(vec![])))
        .expect("nested");
    let nested = match s.map_get(&root, "nested").expect("get") {
        Some(Out::Type(ptr)) => ptr,
        other => panic!("expected nested type, got {other:?}"),
    };
    let err = s.block_of(&nested).expect_err("child types are not blocks");
    assert!(matches!(err, StoreError::ChildTypeRef));
    assert!(s.block_of(&root).is_ok());
}

#[test]
fn block_clone_resolves_embedded_refs_by_cloning_children() {
    let mut s = Store::new();
    let root = s
        .get_or_create_root_type("R", TypeKind::Map)
        .expect("root");
    let parent = s.create_block(TypeKind::Map, None).expect("parent");
    let child = s.create_block(TypeKind::Array, None).expect("child");
    let child_root = s.root_type(&child).expect("child root");
    s.array_push(&child_root, vec![In::Json(json!("inner"))])
        .expect("child content");
    let parent_root = s.root_type(&parent).expect("parent root");
    s.map_set(&parent_root, "kid", In::BlockRef(child.clone()))
        .expect("embed child");
    s.map_set(&root, "p", In::BlockRef(parent.clone()))
        .expect("embed parent");

    let copy = s.clone_block(&parent).expect("clone");
    assert_ne!(copy, parent);
    assert_eq!(
        s.block_to_json(&copy).expect("copy view"),
        s.block_to_json(&parent).expect("parent view"),
    );

    // The original child still belongs to the original parent; the copy got
    // its own child.
    assert_eq!(
        s.get_block(&child).expect("child").referrer().expect("ref").block,
        parent
    );
    let copy_root = s.root_type(&copy).expect("copy root");
    let copied_child = block_of(s.map_get(&copy_root, "kid").expect("kid"));
    assert_ne!(copied_child, child);
    assert_eq!(
        s.get_block(&copied_child)
            .expect("copied child")
            .referrer()
            .expect("ref")
            .block,
        copy
    );
}

#[test]
fn root_lookup_walks_the_referrer_chain() {
    let mut s = Store::new();
    s.get_or_create_root_type("R", TypeKind::Map).expect("root");
    let root = s.root_type("@R").expect("handle");
    let a = s.create_block(TypeKind::Map, None).expect("a");
    let b = s.create_block(TypeKind::Array, None).expect("b");
    let a_root = s.root_type(&a).expect("a root");

    s.map_set(&root, "a", In::BlockRef(a.clone())).expect("embed a");
    s.map_set(&a_root, "b", In::BlockRef(b.clone())).expect("embed b");

    assert_eq!(s.get_root_block(&b), Some("@R".to_owned()));
    assert_eq!(s.get_root_block(&a), Some("@R".to_owned()));
    assert_eq!(s.get_root_block("@R"), Some("@R".to_owned()));

    let orphan = s.create_block(TypeKind::Map, None).expect("orphan");
    assert_eq!(s.get_root_block(&orphan), None);
}
