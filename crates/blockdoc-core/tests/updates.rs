use blockdoc_core::{In, Store, TypeKind};
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn out_of_order_updates_are_buffered_until_dependencies_arrive() {
    let mut s1 = Store::new();
    let t1 = s1
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");

    let captured: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = captured.clone();
    s1.on_update_v2(move |_, ev| {
        for (block, update) in &ev.updates {
            if block == "@T" {
                sink.borrow_mut().push(update.clone());
            }
        }
    });

    s1.text_insert(&t1, 0, "ab").expect("first");
    s1.text_insert(&t1, 2, "cd").expect("second");
    let updates = captured.borrow().clone();
    assert_eq!(updates.len(), 2, "one update per transaction");

    let mut s2 = Store::new();
    let t2 = s2
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");

    // Apply the later update first: its structs park as pending.
    s2.apply_update_v2("@T", &updates[1]).expect("late first");
    assert_eq!(s2.text_to_string(&t2).expect("read"), "");

    s2.apply_update_v2("@T", &updates[0]).expect("early second");
    assert_eq!(s2.text_to_string(&t2).expect("read"), "abcd");
}

#[test]
fn state_vector_codec_roundtrip() {
    let mut s = Store::new();
    let t = s
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");
    s.text_insert(&t, 0, "abc").expect("insert");

    let sv = s.state_vector("@T").expect("sv");
    let encoded = s.encode_state_vector("@T").expect("encode");
    let decoded = Store::decode_state_vector(&encoded).expect("decode");
    assert_eq!(decoded, sv);
    assert_eq!(decoded.get(&s.client_id()), Some(&3));
}

#[test]
fn diff_against_state_vector_sends_only_the_missing_suffix() {
    let mut s1 = Store::new();
    let t1 = s1
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");

    s1.text_insert(&t1, 0, "abc").expect("base");
    let base = s1.encode_state_as_update_v2("@T", None).expect("encode base");
    let sv = s1.state_vector("@T").expect("sv");

    s1.text_insert(&t1, 3, "def").expect("more");
    let diff = s1
        .encode_state_as_update_v2("@T", Some(&sv))
        .expect("encode diff");
    assert!(diff.len() < base.len() + 16, "diff stays small");

    let mut s2 = Store::new();
    let t2 = s2
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");
    s2.apply_update_v2("@T", &base).expect("apply base");
    s2.apply_update_v2("@T", &diff).expect("apply diff");
    assert_eq!(s2.text_to_string(&t2).expect("read"), "abcdef");
}

#[test]
fn malformed_updates_are_rejected() {
    let mut s = Store::new();
    s.get_or_create_root_type("T", TypeKind::Text).expect("root");

    let result = s.apply_update_v2("@T", &[0xff, 0xff, 0xff, 0xff, 0xff]);
    assert!(result.is_err(), "garbage must not decode");

    // A truncated but well-started payload fails too.
    let t = s.root_type("@T").expect("handle");
    s.text_insert(&t, 0, "abc").expect("insert");
    let full = s.encode_state_as_update_v2("@T", None).expect("encode");
    let mut s2 = Store::new();
    s2.get_or_create_root_type("T", TypeKind::Text).expect("root");
    assert!(s2.apply_update_v2("@T", &full[..full.len() / 2]).is_err());
}

#[test]
fn one_transaction_emits_updates_for_every_touched_block() {
    let mut s = Store::new();
    let root = s
        .get_or_create_root_type("R", TypeKind::Map)
        .expect("root");
    let child = s.create_block(TypeKind::Array, None).expect("child");
    let child_root = s.root_type(&child).expect("child root");

    let blocks: Rc<RefCell<Vec<Vec<String>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = blocks.clone();
    s.on_update_v2(move |_, ev| {
        let mut touched: Vec<String> = ev.updates.iter().map(|(b, _)| b.clone()).collect();
        touched.sort_unstable();
        sink.borrow_mut().push(touched);
    });

    let child_for_txn = child.clone();
    s.transact(|s| {
        s.map_set(&root, "c", In::BlockRef(child_for_txn.clone()))?;
        s.array_push(&child_root, vec![In::Json(json!("data"))])
    })
    .expect("mutate two blocks");

    let emitted = blocks.borrow().clone();
    assert_eq!(emitted.len(), 1, "one updateV2 event per store transaction");
    let mut expected = vec!["@R".to_owned(), child.clone()];
    expected.sort_unstable();
    assert_eq!(emitted[0], expected);
}

#[test]
fn binary_and_embed_contents_roundtrip() {
    let mut s1 = Store::new();
    let a1 = s1
        .get_or_create_root_type("A", TypeKind::Array)
        .expect("root");
    s1.array_push(
        &a1,
        vec![
            In::Json(json!({"n": 1})),
            In::Bytes(vec![0xde, 0xad, 0xbe, 0xef]),
            In::Embed(json!({"kind": "image"})),
        ],
    )
    .expect("push");

    let update = s1.encode_state_as_update_v2("@A", None).expect("encode");
    let mut s2 = Store::new();
    let a2 = s2
        .get_or_create_root_type("A", TypeKind::Array)
        .expect("root");
    s2.apply_update_v2("@A", &update).expect("apply");

    assert_eq!(
        s2.to_json(&a2).expect("view"),
        json!([{"n": 1}, [222, 173, 190, 239], {"kind": "image"}]),
    );
}

#[test]
fn formatted_text_survives_replication() {
    let mut s1 = Store::new();
    let t1 = s1
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");
    s1.text_insert(&t1, 0, "plain ").expect("plain");
    let mut attrs = serde_json::Map::new();
    attrs.insert("bold".to_owned(), json!(true));
    s1.text_insert_with_attributes(&t1, 6, "strong", attrs)
        .expect("formatted");

    let mut s2 = Store::new();
    let t2 = s2
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");
    let update = s1.encode_state_as_update_v2("@T", None).expect("encode");
    s2.apply_update_v2("@T", &update).expect("apply");

    assert_eq!(s2.text_to_string(&t2).expect("read"), "plain strong");
    let runs = s2.text_diff(&t2).expect("diff");
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].insert, json!("plain "));
    assert!(runs[0].attributes.is_none());
    assert_eq!(runs[1].insert, json!("strong"));
    assert_eq!(
        runs[1].attributes.as_ref().expect("attrs")["bold"],
        json!(true)
    );
}
