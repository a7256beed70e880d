//! Structural engine tests: ids, depths, ordering, moves, sorting.

use grove_core::{NodeId, OpenFlags, TreeClient, TreeError, TreeRegistry, WalkControl, WalkOrder};

fn open(name: &str) -> (TreeRegistry, TreeClient) {
    let registry = TreeRegistry::new();
    let tree = registry.open(Some(name), OpenFlags::create()).unwrap();
    (registry, tree)
}

#[test]
fn test_ids_unique_across_deletions() {
    let (_r, t) = open("ids");
    let root = t.root().unwrap();
    let mut seen = std::collections::HashSet::new();
    seen.insert(root);
    for _ in 0..3 {
        let batch: Vec<NodeId> = (0..20)
            .map(|_| t.create_node(root, None, None).unwrap())
            .collect();
        for id in &batch {
            assert!(seen.insert(*id), "id {id} was reused");
        }
        for id in batch {
            t.delete_node(id).unwrap();
        }
    }
    assert_eq!(t.node_count().unwrap(), 1);
}

#[test]
fn test_depth_invariant_after_moves() {
    let (_r, t) = open("depths");
    let root = t.root().unwrap();
    let a = t.create_node(root, Some("a"), None).unwrap();
    let b = t.create_node(root, Some("b"), None).unwrap();
    let b1 = t.create_node(b, Some("b1"), None).unwrap();
    let b2 = t.create_node(b1, Some("b2"), None).unwrap();

    t.move_node(b, a, None).unwrap();
    t.move_node(b2, root, None).unwrap();

    // depth(child) == depth(parent) + 1 everywhere, root is 0
    assert_eq!(t.depth(root).unwrap(), 0);
    t.walk(root, WalkOrder::Pre, |n| {
        if let Some(p) = t.parent(n).unwrap() {
            assert_eq!(t.depth(n).unwrap(), t.depth(p).unwrap() + 1);
        }
        Ok(WalkControl::Continue)
    })
    .unwrap();
    assert_eq!(t.depth(b1).unwrap(), 3);
    assert_eq!(t.depth(b2).unwrap(), 1);
}

#[test]
fn test_move_cycle_rejected() {
    let (_r, t) = open("cycles");
    let root = t.root().unwrap();
    let a = t.create_node(root, Some("a"), None).unwrap();
    let b = t.create_node(a, Some("b"), None).unwrap();
    let c = t.create_node(a, Some("c"), None).unwrap();

    // Shuffling b under its sibling is fine; b stays below a
    t.move_node(b, c, None).unwrap();
    assert!(t.is_ancestor(a, b));

    // a under its own descendant b is a cycle
    let err = t.move_node(a, b, None).unwrap_err();
    assert!(matches!(err, TreeError::InvalidOperation(_)));
    // Self-parenting too
    assert!(t.move_node(a, a, None).is_err());
    // The failed moves changed nothing
    assert_eq!(t.parent(a).unwrap(), Some(root));
    assert_eq!(t.parent(b).unwrap(), Some(c));
}

#[test]
fn test_move_before_sibling() {
    let (_r, t) = open("positions");
    let root = t.root().unwrap();
    let a = t.create_node(root, Some("a"), None).unwrap();
    let b = t.create_node(root, Some("b"), None).unwrap();
    let c = t.create_node(root, Some("c"), None).unwrap();

    t.move_node(c, root, Some(a)).unwrap();
    assert_eq!(t.children(root).unwrap(), vec![c, a, b]);
    assert_eq!(t.position(a).unwrap(), 1);
    assert_eq!(t.first_child(root).unwrap(), Some(c));
    assert_eq!(t.last_child(root).unwrap(), Some(b));
    assert_eq!(t.prev_sibling(a).unwrap(), Some(c));

    // `before` must actually be a child of the new parent
    let d = t.create_node(a, Some("d"), None).unwrap();
    assert!(t.move_node(b, root, Some(d)).is_err());
}

#[test]
fn test_delete_root_rejected() {
    let (_r, t) = open("guard");
    let root = t.root().unwrap();
    let err = t.delete_node(root).unwrap_err();
    assert!(matches!(err, TreeError::InvalidOperation(_)));
}

#[test]
fn test_find_child_and_relabel() {
    let (_r, t) = open("labels");
    let root = t.root().unwrap();
    let a = t.create_node(root, Some("alpha"), None).unwrap();
    assert_eq!(t.find_child(root, "alpha").unwrap(), Some(a));
    assert_eq!(t.find_child(root, "beta").unwrap(), None);

    t.relabel_node(a, "beta").unwrap();
    assert_eq!(&*t.label(a).unwrap(), "beta");
    assert_eq!(t.find_child(root, "alpha").unwrap(), None);
    assert_eq!(t.find_child(root, "beta").unwrap(), Some(a));
}

#[test]
fn test_find_child_stays_correct_through_hysteresis() {
    // The label index is built above the high-water mark and dropped
    // below the low-water mark; lookups must agree in every state.
    let (_r, t) = open("hysteresis");
    let root = t.root().unwrap();
    let kids: Vec<NodeId> = (0..15)
        .map(|i| t.create_node(root, Some(&format!("c{i}")), None).unwrap())
        .collect();
    for (i, kid) in kids.iter().enumerate() {
        assert_eq!(t.find_child(root, &format!("c{i}")).unwrap(), Some(*kid));
    }
    // Delete down to 3 children (below any plausible low-water mark)
    for kid in &kids[..12] {
        t.delete_node(*kid).unwrap();
    }
    assert_eq!(t.degree(root).unwrap(), 3);
    for (i, kid) in kids.iter().enumerate().skip(12) {
        assert_eq!(t.find_child(root, &format!("c{i}")).unwrap(), Some(*kid));
    }
    assert_eq!(t.find_child(root, "c0").unwrap(), None);
}

#[test]
fn test_document_order() {
    let (_r, t) = open("order");
    let root = t.root().unwrap();
    let a = t.create_node(root, Some("a"), None).unwrap();
    let a1 = t.create_node(a, Some("a1"), None).unwrap();
    let b = t.create_node(root, Some("b"), None).unwrap();

    assert_eq!(t.next_in_order(root).unwrap(), Some(a));
    assert_eq!(t.next_in_order(a).unwrap(), Some(a1));
    assert_eq!(t.next_in_order(a1).unwrap(), Some(b));
    assert_eq!(t.next_in_order(b).unwrap(), None);

    assert_eq!(t.prev_in_order(b).unwrap(), Some(a1));
    assert_eq!(t.prev_in_order(a1).unwrap(), Some(a));
    assert_eq!(t.prev_in_order(a).unwrap(), Some(root));
    assert_eq!(t.prev_in_order(root).unwrap(), None);
}

#[test]
fn test_sort_children() {
    let (_r, t) = open("sorting");
    let root = t.root().unwrap();
    for name in ["pear", "apple", "quince", "fig"] {
        t.create_node(root, Some(name), None).unwrap();
    }
    let labels: Vec<String> = t
        .children(root)
        .unwrap()
        .into_iter()
        .map(|n| t.label(n).unwrap().to_string())
        .collect();
    assert_eq!(labels, vec!["pear", "apple", "quince", "fig"]);

    t.sort_children_by_label(root).unwrap();
    let labels: Vec<String> = t
        .children(root)
        .unwrap()
        .into_iter()
        .map(|n| t.label(n).unwrap().to_string())
        .collect();
    assert_eq!(labels, vec!["apple", "fig", "pear", "quince"]);

    // Custom comparator: reverse by label
    let t3 = t.clone();
    t.sort_children(root, |a, b| {
        t3.label(b).unwrap().cmp(&t3.label(a).unwrap())
    })
    .unwrap();
    let labels: Vec<String> = t
        .children(root)
        .unwrap()
        .into_iter()
        .map(|n| t.label(n).unwrap().to_string())
        .collect();
    assert_eq!(labels, vec!["quince", "pear", "fig", "apple"]);
}

#[test]
fn test_subtree_size_and_counts() {
    let (_r, t) = open("counts");
    let root = t.root().unwrap();
    let a = t.create_node(root, Some("a"), None).unwrap();
    t.create_node(a, None, None).unwrap();
    t.create_node(a, None, None).unwrap();
    t.create_node(root, Some("b"), None).unwrap();

    assert_eq!(t.node_count().unwrap(), 5);
    assert_eq!(t.subtree_size(a).unwrap(), 3);
    assert_eq!(t.subtree_size(root).unwrap(), 5);
    assert_eq!(t.max_depth().unwrap(), 2);

    t.delete_node(a).unwrap();
    assert_eq!(t.node_count().unwrap(), 2);
}

#[test]
fn test_default_labels() {
    let (_r, t) = open("defaults");
    let root = t.root().unwrap();
    let n = t.create_node(root, None, None).unwrap();
    assert_eq!(&*t.label(n).unwrap(), format!("node{n}").as_str());
    assert_eq!(&*t.label(root).unwrap(), "defaults");
}

#[test]
fn test_create_node_with_id() {
    let (_r, t) = open("explicit");
    let root = t.root().unwrap();
    let n = t.create_node_with_id(root, Some("fixed"), None, 77).unwrap();
    assert_eq!(n, NodeId(77));
    let err = t
        .create_node_with_id(root, Some("dup"), None, 77)
        .unwrap_err();
    assert!(matches!(err, TreeError::InvalidOperation(_)));
}
