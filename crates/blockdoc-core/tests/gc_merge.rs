use blockdoc_core::{Store, StoreOptions, TypeKind};

fn replicate(from: &Store, block_id: &str, to: &mut Store) {
    let src = from.get_block(block_id).expect("block exists");
    if src.is_root() {
        to.get_or_create_root_type(&block_id[1..], src.kind())
            .expect("root type");
    } else {
        to.get_or_create_block(block_id, src.kind()).expect("block");
    }
    let update = from
        .encode_state_as_update_v2(block_id, None)
        .expect("encode");
    to.apply_update_v2(block_id, &update).expect("apply");
}

#[test]
fn sequential_appends_merge_into_one_struct() {
    let mut s = Store::new();
    let t = s
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");

    s.text_insert(&t, 0, "a").expect("a");
    s.text_insert(&t, 1, "b").expect("b");
    s.text_insert(&t, 2, "c").expect("c");

    assert_eq!(s.text_to_string(&t).expect("read"), "abc");
    let block = s.get_block("@T").expect("block");
    assert_eq!(
        block.struct_count(s.client_id()),
        1,
        "adjacent runs collapse during cleanup"
    );
}

#[test]
fn merging_preserves_observable_content() {
    let mut s = Store::new();
    let t = s
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");
    for (i, ch) in "hello".chars().enumerate() {
        s.text_insert(&t, i as u32, &ch.to_string()).expect("insert");
    }

    let mut replica = Store::new();
    replicate(&s, "@T", &mut replica);
    let t2 = replica.root_type("@T").expect("handle");
    assert_eq!(replica.text_to_string(&t2).expect("read"), "hello");

    // Merging is idempotent: a second replication changes nothing.
    replicate(&s, "@T", &mut replica);
    assert_eq!(replica.text_to_string(&t2).expect("read"), "hello");
}

#[test]
fn gc_reclaims_content_but_keeps_clock_ranges() {
    let mut s = Store::new();
    let t = s
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");
    s.text_insert(&t, 0, "hello").expect("insert");
    s.text_delete(&t, 1, 3).expect("delete ell");

    assert_eq!(s.text_to_string(&t).expect("read"), "ho");
    let state = s.state_vector("@T").expect("sv");
    assert_eq!(
        state.get(&s.client_id()),
        Some(&5),
        "reclaimed ranges keep their clocks"
    );

    // The reclaimed block still replicates to the same visible state.
    let mut replica = Store::new();
    replicate(&s, "@T", &mut replica);
    let t2 = replica.root_type("@T").expect("handle");
    assert_eq!(replica.text_to_string(&t2).expect("read"), "ho");
}

#[test]
fn deletes_merge_into_single_ranges() {
    let mut s = Store::new();
    let t = s
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");
    s.text_insert(&t, 0, "abcdef").expect("insert");

    // Delete in two touching pieces within one transaction.
    s.transact(|s| {
        s.text_delete(&t, 1, 2)?;
        s.text_delete(&t, 1, 2)
    })
    .expect("deletes");

    assert_eq!(s.text_to_string(&t).expect("read"), "af");
    let block = s.get_block("@T").expect("block");
    // a | bcde (tombstone, merged) | f
    assert_eq!(block.struct_count(s.client_id()), 3);
}

#[test]
fn gc_disabled_stores_still_converge() {
    let mut opts = StoreOptions::new();
    opts.gc = false;
    let mut s = Store::with_options(opts);
    let t = s
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");
    s.text_insert(&t, 0, "keep and drop").expect("insert");
    s.text_delete(&t, 4, 9).expect("delete");

    assert_eq!(s.text_to_string(&t).expect("read"), "keep");
    let mut replica = Store::new();
    replicate(&s, "@T", &mut replica);
    let t2 = replica.root_type("@T").expect("handle");
    assert_eq!(replica.text_to_string(&t2).expect("read"), "keep");
}

#[test]
fn splice_then_delete_roundtrips() {
    let mut s = Store::new();
    let t = s
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");
    s.text_insert(&t, 0, "abc").expect("insert");
    s.text_insert(&t, 1, "x").expect("splice in");
    s.text_delete(&t, 1, 1).expect("delete x");

    assert_eq!(s.text_to_string(&t).expect("read"), "abc");
    let mut replica = Store::new();
    replicate(&s, "@T", &mut replica);
    let t2 = replica.root_type("@T").expect("handle");
    assert_eq!(replica.text_to_string(&t2).expect("read"), "abc");
}
