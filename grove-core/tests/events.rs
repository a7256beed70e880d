//! Trace and notification delivery: masks, filters, coalescing,
//! re-entrancy guards, and the callback-error side channel.

use grove_core::{
    NotifyMask, NotifySpec, OpenFlags, TraceMask, TraceSpec, TreeClient, TreeError, TreeRegistry,
};
use std::cell::RefCell;
use std::rc::Rc;

fn shared_pair(name: &str) -> (TreeRegistry, TreeClient, TreeClient) {
    let registry = TreeRegistry::new();
    let a = registry.open(Some(name), OpenFlags::create()).unwrap();
    let b = registry.open(Some(name), OpenFlags::default()).unwrap();
    (registry, a, b)
}

#[test]
fn test_write_trace_fires() {
    let (_r, t, _b) = shared_pair("w");
    let root = t.root().unwrap();
    let hits = Rc::new(RefCell::new(Vec::new()));
    let hits2 = hits.clone();
    t.add_trace(
        TraceSpec {
            mask: TraceMask::WRITE | TraceMask::CREATE,
            ..Default::default()
        },
        move |ev| {
            hits2
                .borrow_mut()
                .push((ev.node, ev.key.as_str().to_string(), ev.mask));
            Ok(())
        },
    )
    .unwrap();

    t.set_value(root, "x", 1i64).unwrap();
    t.set_value(root, "x", 2i64).unwrap();
    let hits = hits.borrow();
    assert_eq!(hits.len(), 2);
    assert!(hits[0].2.contains(TraceMask::CREATE));
    assert!(hits[0].2.contains(TraceMask::WRITE));
    assert!(!hits[1].2.contains(TraceMask::CREATE));
    assert_eq!(hits[1].1, "x");
}

#[test]
fn test_read_and_unset_traces() {
    let (_r, t, _b) = shared_pair("ru");
    let root = t.root().unwrap();
    let reads = Rc::new(RefCell::new(0));
    let unsets = Rc::new(RefCell::new(0));
    let r2 = reads.clone();
    t.add_trace(
        TraceSpec {
            mask: TraceMask::READ,
            ..Default::default()
        },
        move |_| {
            *r2.borrow_mut() += 1;
            Ok(())
        },
    )
    .unwrap();
    let u2 = unsets.clone();
    t.add_trace(
        TraceSpec {
            mask: TraceMask::UNSET,
            ..Default::default()
        },
        move |_| {
            *u2.borrow_mut() += 1;
            Ok(())
        },
    )
    .unwrap();

    t.set_value(root, "x", 1i64).unwrap();
    assert_eq!(*reads.borrow(), 0);
    t.get_value(root, "x").unwrap();
    assert_eq!(*reads.borrow(), 1);
    t.unset_value(root, "x").unwrap();
    assert_eq!(*unsets.borrow(), 1);
    // Unset of a missing value fires nothing
    t.unset_value(root, "x").unwrap();
    assert_eq!(*unsets.borrow(), 1);
}

#[test]
fn test_trace_filters() {
    let (_r, t, _b) = shared_pair("filters");
    let root = t.root().unwrap();
    let a = t.create_node(root, Some("a"), None).unwrap();
    let b = t.create_node(root, Some("b"), None).unwrap();
    t.add_tag(b, "watched").unwrap();

    let pattern_hits = Rc::new(RefCell::new(0));
    let p2 = pattern_hits.clone();
    t.add_trace(
        TraceSpec {
            pattern: Some("size*".to_string()),
            mask: TraceMask::WRITE,
            ..Default::default()
        },
        move |_| {
            *p2.borrow_mut() += 1;
            Ok(())
        },
    )
    .unwrap();

    let node_hits = Rc::new(RefCell::new(0));
    let n2 = node_hits.clone();
    t.add_trace(
        TraceSpec {
            node: Some(a),
            mask: TraceMask::WRITE,
            ..Default::default()
        },
        move |_| {
            *n2.borrow_mut() += 1;
            Ok(())
        },
    )
    .unwrap();

    let tag_hits = Rc::new(RefCell::new(0));
    let t2 = tag_hits.clone();
    t.add_trace(
        TraceSpec {
            tag: Some("watched".to_string()),
            mask: TraceMask::WRITE,
            ..Default::default()
        },
        move |_| {
            *t2.borrow_mut() += 1;
            Ok(())
        },
    )
    .unwrap();

    t.set_value(a, "size_x", 1i64).unwrap(); // pattern + node
    t.set_value(b, "color", 2i64).unwrap(); // tag only
    t.set_value(a, "color", 3i64).unwrap(); // node only

    assert_eq!(*pattern_hits.borrow(), 1);
    assert_eq!(*node_hits.borrow(), 2);
    assert_eq!(*tag_hits.borrow(), 1);
}

#[test]
fn test_trace_coalescing_when_deferred() {
    let (_r, t, _b) = shared_pair("coalesce");
    let root = t.root().unwrap();
    let hits = Rc::new(RefCell::new(Vec::new()));
    let hits2 = hits.clone();
    let reader = t.clone();
    t.add_trace(
        TraceSpec {
            mask: TraceMask::WRITE | TraceMask::CREATE,
            deferred: true,
            ..Default::default()
        },
        move |ev| {
            let v = reader.get_value(ev.node, ev.key.as_str())?;
            hits2.borrow_mut().push(v.as_long());
            Ok(())
        },
    )
    .unwrap();

    for i in 1..=5i64 {
        t.set_value(root, "x", i).unwrap();
    }
    assert!(hits.borrow().is_empty());
    // The creating write queued one task (WRITE|CREATE); the four
    // re-writes share one (WRITE) combination and coalesced into one
    assert_eq!(t.pending_deferred().unwrap(), 2);
    let ran = t.drain_deferred().unwrap();
    assert_eq!(ran, 2);
    assert_eq!(*hits.borrow(), vec![Some(5), Some(5)]);
    assert_eq!(t.pending_deferred().unwrap(), 0);

    // With the value in place, five re-writes of the same (node, key)
    // are exactly one pending task and one callback, payload reflecting
    // the final write
    hits.borrow_mut().clear();
    for i in 10..=14i64 {
        t.set_value(root, "x", i).unwrap();
    }
    assert_eq!(t.pending_deferred().unwrap(), 1);
    assert_eq!(t.drain_deferred().unwrap(), 1);
    assert_eq!(*hits.borrow(), vec![Some(14)]);
}

#[test]
fn test_foreign_only_traces() {
    let (_r, a, b) = shared_pair("foreign");
    let root = a.root().unwrap();
    let hits = Rc::new(RefCell::new(0));
    let h2 = hits.clone();
    a.add_trace(
        TraceSpec {
            mask: TraceMask::WRITE | TraceMask::CREATE,
            foreign_only: true,
            ..Default::default()
        },
        move |_| {
            *h2.borrow_mut() += 1;
            Ok(())
        },
    )
    .unwrap();

    a.set_value(root, "x", 1i64).unwrap(); // own write: suppressed
    assert_eq!(*hits.borrow(), 0);
    b.set_value(root, "x", 2i64).unwrap(); // foreign write: delivered
    assert_eq!(*hits.borrow(), 1);
}

#[test]
fn test_multi_client_isolation() {
    let (_r, a, b) = shared_pair("isolation");
    let root = a.root().unwrap();

    let a_hits = Rc::new(RefCell::new(0));
    let ah = a_hits.clone();
    a.add_trace(TraceSpec::default(), move |_| {
        *ah.borrow_mut() += 1;
        Ok(())
    })
    .unwrap();

    // B sees A's public value writes...
    a.set_value(root, "shared", 1i64).unwrap();
    assert_eq!(b.get_value(root, "shared").unwrap().as_long(), Some(1));
    // ...but B registered nothing, so only A's trace counted, and A's
    // trace fires for B's writes as well (same core, A's registration)
    let before = *a_hits.borrow();
    b.set_value(root, "shared", 2i64).unwrap();
    assert_eq!(*a_hits.borrow(), before + 1);
}

#[test]
fn test_trace_recursion_guard() {
    let (_r, t, _b) = shared_pair("recursion");
    let root = t.root().unwrap();
    let hits = Rc::new(RefCell::new(0));
    let h2 = hits.clone();
    let writer = t.clone();
    t.add_trace(
        TraceSpec {
            mask: TraceMask::WRITE | TraceMask::CREATE,
            ..Default::default()
        },
        move |ev| {
            *h2.borrow_mut() += 1;
            // Re-writes the same value; the per-node active flag must
            // stop this from firing traces again
            writer.set_value(ev.node, ev.key.as_str(), 99i64)?;
            Ok(())
        },
    )
    .unwrap();

    t.set_value(root, "x", 1i64).unwrap();
    assert_eq!(*hits.borrow(), 1);
    assert_eq!(t.get_value(root, "x").unwrap().as_long(), Some(99));
}

#[test]
fn test_notify_masks_and_payloads() {
    let (_r, t, _b) = shared_pair("notify");
    let root = t.root().unwrap();
    let events = Rc::new(RefCell::new(Vec::new()));
    let e2 = events.clone();
    t.add_notifier(NotifySpec::default(), move |ev| {
        e2.borrow_mut().push((ev.event, ev.node));
        Ok(())
    })
    .unwrap();

    let a = t.create_node(root, Some("a"), None).unwrap();
    let b = t.create_node(root, Some("b"), None).unwrap();
    t.move_node(b, a, None).unwrap();
    t.relabel_node(a, "renamed").unwrap();
    t.sort_children_by_label(root).unwrap();

    let events = events.borrow();
    let kinds: Vec<NotifyMask> = events.iter().map(|(k, _)| *k).collect();
    assert_eq!(
        kinds,
        vec![
            NotifyMask::CREATE,
            NotifyMask::CREATE,
            NotifyMask::MOVE,
            NotifyMask::RELABEL,
            NotifyMask::SORT,
        ]
    );
    assert_eq!(events[2].1, b);
    assert_eq!(events[4].1, root);
}

#[test]
fn test_delete_notifies_descendants_postorder() {
    let (_r, t, b_client) = shared_pair("cascade");
    let root = t.root().unwrap();
    let a = t.create_node(root, Some("a"), None).unwrap();
    let a1 = t.create_node(a, Some("a1"), None).unwrap();
    let a2 = t.create_node(a, Some("a2"), None).unwrap();
    let a1x = t.create_node(a1, Some("a1x"), None).unwrap();

    // Both clients observe the cascade, children before parents
    let seen = Rc::new(RefCell::new(Vec::new()));
    let s2 = seen.clone();
    b_client
        .add_notifier(
            NotifySpec {
                mask: NotifyMask::DELETE,
                ..Default::default()
            },
            move |ev| {
                s2.borrow_mut().push(ev.node);
                Ok(())
            },
        )
        .unwrap();

    t.delete_node(a).unwrap();
    assert_eq!(*seen.borrow(), vec![a1x, a1, a2, a]);
}

#[test]
fn test_foreign_only_notify() {
    let (_r, a, b) = shared_pair("fnotify");
    let root = a.root().unwrap();
    let hits = Rc::new(RefCell::new(0));
    let h2 = hits.clone();
    a.add_notifier(
        NotifySpec {
            foreign_only: true,
            ..Default::default()
        },
        move |_| {
            *h2.borrow_mut() += 1;
            Ok(())
        },
    )
    .unwrap();

    a.create_node(root, Some("own"), None).unwrap();
    assert_eq!(*hits.borrow(), 0);
    b.create_node(root, Some("foreign"), None).unwrap();
    assert_eq!(*hits.borrow(), 1);
}

#[test]
fn test_deferred_notify_latest_event_wins() {
    let (_r, t, _b) = shared_pair("dnotify");
    let root = t.root().unwrap();
    let events = Rc::new(RefCell::new(Vec::new()));
    let e2 = events.clone();
    t.add_notifier(
        NotifySpec {
            deferred: true,
            ..Default::default()
        },
        move |ev| {
            e2.borrow_mut().push((ev.event, ev.node));
            Ok(())
        },
    )
    .unwrap();

    let a = t.create_node(root, Some("a"), None).unwrap();
    let b = t.create_node(root, Some("b"), None).unwrap();
    t.move_node(b, a, None).unwrap();
    // Three firings of one handler coalesce to a single pending task
    assert_eq!(t.pending_deferred().unwrap(), 1);

    t.drain_deferred().unwrap();
    let events = events.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], (NotifyMask::MOVE, b));
}

#[test]
fn test_notify_reentrancy_skips_active_handler() {
    let (_r, t, _b) = shared_pair("nrecur");
    let root = t.root().unwrap();
    let depth = Rc::new(RefCell::new(0));
    let d2 = depth.clone();
    let t2 = t.clone();
    t.add_notifier(
        NotifySpec {
            mask: NotifyMask::CREATE,
            ..Default::default()
        },
        move |ev| {
            let mut d = d2.borrow_mut();
            *d += 1;
            assert!(*d <= 3, "re-entrant cascade was not stopped");
            drop(d);
            // Creating another node from inside the handler must not
            // re-enter this handler (it is active)
            if t2.node_count().unwrap() < 4 {
                t2.create_node(ev.node, None, None).unwrap();
            }
            Ok(())
        },
    )
    .unwrap();

    t.create_node(root, Some("seed"), None).unwrap();
    assert_eq!(*depth.borrow(), 1);
}

#[test]
fn test_callback_errors_never_abort_mutation() {
    let (_r, t, _b) = shared_pair("errs");
    let root = t.root().unwrap();
    t.add_trace(
        TraceSpec {
            mask: TraceMask::WRITE | TraceMask::CREATE,
            ..Default::default()
        },
        |_| Err(TreeError::invalid("listener exploded")),
    )
    .unwrap();

    // The write itself succeeds
    t.set_value(root, "x", 1i64).unwrap();
    assert_eq!(t.get_value(root, "x").unwrap().as_long(), Some(1));

    let errors = t.drain_callback_errors().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], TreeError::InvalidOperation(_)));
    assert!(t.drain_callback_errors().unwrap().is_empty());
}

#[test]
fn test_delete_trace_cancels_pending() {
    let (_r, t, _b) = shared_pair("cancel");
    let root = t.root().unwrap();
    let hits = Rc::new(RefCell::new(0));
    let h2 = hits.clone();
    let id = t
        .add_trace(
            TraceSpec {
                mask: TraceMask::WRITE | TraceMask::CREATE,
                deferred: true,
                ..Default::default()
            },
            move |_| {
                *h2.borrow_mut() += 1;
                Ok(())
            },
        )
        .unwrap();

    t.set_value(root, "x", 1i64).unwrap();
    assert_eq!(t.pending_deferred().unwrap(), 1);
    t.delete_trace(id).unwrap();
    assert_eq!(t.pending_deferred().unwrap(), 0);
    assert_eq!(t.drain_deferred().unwrap(), 0);
    assert_eq!(*hits.borrow(), 0);

    // Deleting it again is not-found
    assert!(t.delete_trace(id).unwrap_err().is_not_found());
}
