use blockdoc_core::{BlockEventKind, In, PrelimType, Store, TypeKind};
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn observer_transactions_are_queued_not_nested() {
    let mut s = Store::new();
    let t = s
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");
    let block_id = "@T";

    let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let seen = log.clone();
    let ptr = t.clone();
    s.on_block_event(block_id, BlockEventKind::AfterTransaction, move |s, ev| {
        let origin = ev.origin.clone().unwrap_or_else(|| "-".to_owned());
        seen.borrow_mut().push(origin.clone());
        if origin == "first" {
            let ptr = ptr.clone();
            s.transact_block("@T", Some("nested".to_owned()), move |s| {
                s.text_insert(&ptr, 0, "x").expect("nested insert");
            });
        }
    });

    s.transact_block(block_id, Some("first".to_owned()), |s| {
        s.text_insert(&t, 0, "0").expect("insert");
    });

    assert_eq!(
        log.borrow().as_slice(),
        ["first", "cleanup", "nested"],
        "cleanup transactions drain in FIFO order"
    );
    assert_eq!(s.text_to_string(&t).expect("read"), "x0");
}

#[test]
fn nested_transact_shares_the_outer_transaction() {
    let mut s = Store::new();
    let t = s
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");

    let origins: Rc<RefCell<Vec<Option<String>>>> = Rc::new(RefCell::new(Vec::new()));
    let seen = origins.clone();
    s.on_block_event("@T", BlockEventKind::AfterTransaction, move |_, ev| {
        seen.borrow_mut().push(ev.origin.clone());
    });

    s.transact_with("outer", |s| {
        s.text_insert(&t, 0, "a").expect("insert");
        // Re-entrant call joins the active transaction.
        s.transact(|s| {
            s.text_insert(&t, 1, "b").expect("nested insert");
        });
    });

    assert_eq!(s.text_to_string(&t).expect("read"), "ab");
    assert_eq!(
        origins.borrow().as_slice(),
        [Some("outer".to_owned()), Some("cleanup".to_owned())],
        "one user transaction plus the resolution pass"
    );
}

#[test]
fn shallow_observers_fire_before_deep_and_deep_events_sort_by_depth() {
    let mut s = Store::new();
    let root = s
        .get_or_create_root_type("R", TypeKind::Map)
        .expect("root");
    s.map_set(&root, "n", In::Type(PrelimType::map(vec![])))
        .expect("nested");
    let nested = match s.map_get(&root, "n").expect("get") {
        Some(blockdoc_core::Out::Type(ptr)) => ptr,
        other => panic!("expected nested type, got {other:?}"),
    };

    let order: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let shallow_log = order.clone();
    s.observe(&nested, move |_, ev| {
        shallow_log
            .borrow_mut()
            .push(format!("shallow:{}", ev.path.len()));
    });
    let deep_log = order.clone();
    s.observe_deep(&root, move |_, events| {
        let depths: Vec<usize> = events.iter().map(|ev| ev.path.len()).collect();
        deep_log.borrow_mut().push(format!("deep:{depths:?}"));
    });

    s.transact(|s| {
        s.map_set(&root, "k", In::Json(json!(1)))?;
        s.map_set(&nested, "inner", In::Json(json!(2)))
    })
    .expect("mutate both levels");

    let observed = order.borrow().clone();
    assert_eq!(
        observed,
        ["shallow:1".to_owned(), "deep:[0, 1]".to_owned()],
        "shallow first, then deep events ascending by path length"
    );
}

#[test]
fn observer_panics_do_not_stop_siblings() {
    let mut s = Store::new();
    let t = s
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");

    s.on_block_event("@T", BlockEventKind::AfterTransaction, |_, _| {
        panic!("noisy observer");
    });
    let ran: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
    let counter = ran.clone();
    s.on_block_event("@T", BlockEventKind::AfterTransaction, move |_, _| {
        *counter.borrow_mut() += 1;
    });

    s.text_insert(&t, 0, "a").expect("insert");
    assert!(*ran.borrow() >= 1, "the second observer still ran");
}

#[test]
fn block_lifecycle_events_fire_in_order() {
    let mut s = Store::new();
    let t = s
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");

    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    for (kind, tag) in [
        (BlockEventKind::BeforeTransaction, "before"),
        (BlockEventKind::BeforeObserverCalls, "observers"),
        (BlockEventKind::AfterTransaction, "after"),
        (BlockEventKind::AfterTransactionCleanup, "cleanup"),
        (BlockEventKind::AfterAllTransactions, "all"),
    ] {
        let sink = log.clone();
        s.on_block_event("@T", kind, move |_, _| {
            sink.borrow_mut().push(tag);
        });
    }

    s.transact_with("edit", |s| {
        s.text_insert(&t, 0, "hi").expect("insert");
    });

    let observed = log.borrow().clone();
    let first_positions: Vec<usize> = ["before", "observers", "after", "cleanup", "all"]
        .iter()
        .map(|tag| {
            observed
                .iter()
                .position(|o| o == tag)
                .unwrap_or_else(|| panic!("{tag} event missing from {observed:?}"))
        })
        .collect();
    let mut sorted = first_positions.clone();
    sorted.sort_unstable();
    assert_eq!(first_positions, sorted, "lifecycle order holds: {observed:?}");
    assert_eq!(
        observed.iter().filter(|o| **o == "all").count(),
        1,
        "afterAllTransactions fires once per drain"
    );
}

#[test]
fn root_observers_receive_events_from_embedded_blocks() {
    let mut s = Store::new();
    let root = s
        .get_or_create_root_type("R", TypeKind::Map)
        .expect("root");
    let child = s.create_block(TypeKind::Array, None).expect("child");
    s.map_set(&root, "child", In::BlockRef(child.clone()))
        .expect("embed");

    let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    s.observe_root_events("@R", move |_, events| {
        for ev in events {
            sink.borrow_mut().push(ev.block.clone());
        }
    });

    let child_root = s.root_type(&child).expect("child root");
    s.array_push(&child_root, vec![In::Json(json!("x"))])
        .expect("edit child");

    assert!(
        seen.borrow().iter().any(|b| *b == child),
        "child edits bubble to the root block's observers: {:?}",
        seen.borrow()
    );
}

#[test]
fn transaction_errors_do_not_roll_back() {
    let mut s = Store::new();
    let t = s
        .get_or_create_root_type("T", TypeKind::Text)
        .expect("root");

    let result: Result<(), blockdoc_core::StoreError> = s.transact(|s| {
        s.text_insert(&t, 0, "kept")?;
        s.text_insert(&t, 99, "out of bounds")
    });
    assert!(result.is_err());
    assert_eq!(
        s.text_to_string(&t).expect("read"),
        "kept",
        "partial mutations stay applied"
    );
}
