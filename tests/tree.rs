use std::{cell::RefCell, collections::HashMap, rc::Rc};

use hta::{
    alloc::{DlMalloc, Limited},
    AllocError, Config, Malloc, Node, RawAllocator, Ta,
};
use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

fn record_on_free<A: RawAllocator>(ta: &mut Ta<A>, node: Node, log: &Rc<RefCell<Vec<Node>>>) {
    let log = Rc::clone(log);
    ta.set_destructor(node, move |_, node| log.borrow_mut().push(node));
}

#[test]
fn cascading_release_of_a_small_tree() {
    // root -> A -> {B, C}, B -> D
    let mut ta = Ta::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let root = ta.new_context(None).unwrap();
    let a = ta.alloc_size(root, 16).unwrap();
    let b = ta.alloc_size(a, 16).unwrap();
    let c = ta.alloc_size(a, 16).unwrap();
    let d = ta.alloc_size(b, 16).unwrap();
    for node in [root, a, b, c, d] {
        record_on_free(&mut ta, node, &log);
    }

    ta.free(a);

    let freed = log.borrow().clone();
    assert_eq!(freed.len(), 4);
    assert_eq!(freed[0], a);
    let mut rest = freed[1..].to_vec();
    rest.sort();
    let mut expected = vec![b, c, d];
    expected.sort();
    assert_eq!(rest, expected);
    assert!(ta.contains(root));
    assert_eq!(ta.children(root).count(), 0);
    ta.verify().unwrap();

    ta.free(root);
    assert_eq!(log.borrow().last(), Some(&root));
    assert!(ta.is_empty());
}

#[test]
fn destructors_can_free_more_nodes() {
    let mut ta = Ta::new();
    let owner = ta.new_context(None).unwrap();
    let side = ta.new_context(None).unwrap();
    let side_child = ta.strdup(side, "owned elsewhere").unwrap();
    ta.set_destructor(owner, move |ta, _| ta.free(side));
    ta.free(owner);
    assert!(!ta.contains(side));
    assert!(!ta.contains(side_child));
    assert!(ta.is_empty());
}

#[test]
fn relocation_keeps_every_link() {
    let mut moved = 0;
    for mut ta in [
        Ta::with_allocator(hta::alloc::SystemAlloc::Malloc(Malloc)),
        Ta::with_allocator(hta::alloc::SystemAlloc::DlMalloc(DlMalloc::new())),
    ] {
        let parent = ta.new_context(None).unwrap();
        let before = ta.new_context(parent).unwrap();
        let node = ta.memdup(parent, b"payload").unwrap();
        let after = ta.new_context(parent).unwrap();
        let kids: Vec<Node> = (0..4).map(|_| ta.new_context(node).unwrap()).collect();
        let old_ptr = ta.as_ptr::<u8>(node);

        // interleave another allocation so the block cannot simply grow in place
        let blocker = ta.alloc_size(None, 7).unwrap();
        let node = ta.realloc_size(node, 256 * 1024).unwrap();
        if old_ptr != ta.as_ptr::<u8>(node) {
            moved += 1;
        }

        assert_eq!(&ta.bytes(node)[..7], b"payload");
        assert_eq!(
            ta.children(parent).collect::<Vec<_>>(),
            [before, node, after]
        );
        for kid in &kids {
            assert_eq!(ta.find_parent(*kid), Some(node));
        }
        assert_eq!(ta.children(node).collect::<Vec<_>>(), kids);
        ta.verify().unwrap();
        ta.free(blocker);
        ta.free(parent);
        assert!(ta.is_empty());
    }
    // a 7-byte block cannot grow to 256 KiB in place with a neighbour behind it
    assert!(moved > 0, "no backend relocated the block");
}

#[test]
fn allocation_failure_has_no_side_effects() {
    let mut ta = Ta::with_allocator(Limited::new(Malloc, 100));
    let root = ta.alloc_size(None, 90).unwrap();
    let count = ta.len();
    assert_eq!(
        ta.alloc_size(root, 11),
        Err(AllocError::OutOfMemory { size: 11 })
    );
    assert!(ta.strdup(root, "0123456789").is_err());
    assert!(ta.memdup(None, &[0; 64]).is_err());
    assert_eq!(ta.len(), count);
    assert_eq!(ta.children(root).count(), 0);
    assert_eq!(ta.allocator().used(), 90);

    ta.allocator_mut().set_limit(1000);
    ta.alloc_size(root, 11).unwrap();
    ta.verify().unwrap();
}

#[test]
fn random_operations_keep_destructor_counts_exact() {
    Config::init_logging();
    let mut rng = StdRng::seed_from_u64(0x7a11_0c);
    let mut ta = Ta::new();
    let counts: Rc<RefCell<HashMap<Node, u32>>> = Rc::default();
    let mut live: Vec<Node> = Vec::new();
    let mut allocated = 0u32;

    for step in 0..20_000 {
        match rng.gen_range(0..10) {
            0..=4 => {
                let parent = if live.is_empty() || rng.gen_bool(0.1) {
                    None
                } else {
                    Some(live[rng.gen_range(0..live.len())])
                };
                let node = ta.alloc_size(parent, rng.gen_range(0..128)).unwrap();
                let counts = Rc::clone(&counts);
                ta.set_destructor(node, move |_, node| {
                    *counts.borrow_mut().entry(node).or_default() += 1;
                });
                live.push(node);
                allocated += 1;
            }
            5 | 6 if !live.is_empty() => {
                let node = live[rng.gen_range(0..live.len())];
                ta.free(node);
            }
            7 if !live.is_empty() => {
                let node = live[rng.gen_range(0..live.len())];
                let size = rng.gen_range(0..512);
                ta.realloc_size(node, size).unwrap();
            }
            8 if !live.is_empty() => {
                let node = live[rng.gen_range(0..live.len())];
                ta.free_children(node);
            }
            _ if live.len() >= 2 => {
                let node = live[rng.gen_range(0..live.len())];
                let parent = live[rng.gen_range(0..live.len())];
                let mut cursor = Some(parent);
                let mut cyclic = false;
                while let Some(current) = cursor {
                    if current == node {
                        cyclic = true;
                        break;
                    }
                    cursor = ta.find_parent(current);
                }
                if !cyclic {
                    ta.set_parent(node, parent);
                }
            }
            _ => {}
        }
        live.retain(|&node| ta.contains(node));
        if step % 1000 == 0 {
            ta.verify().unwrap();
        }
    }

    let roots: Vec<Node> = ta.roots().collect();
    for root in roots {
        ta.free(root);
    }
    assert!(ta.is_empty());
    let counts = counts.borrow();
    assert_eq!(counts.len() as u32, allocated);
    assert!(counts.values().all(|&count| count == 1));
}

#[derive(Clone, Debug)]
enum Op {
    Alloc { parent: Option<usize>, size: usize },
    Free(usize),
    FreeChildren(usize),
    Realloc(usize, usize),
    SetParent(usize, Option<usize>),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (any::<Option<usize>>(), 0usize..256)
            .prop_map(|(parent, size)| Op::Alloc { parent, size }),
        1 => any::<usize>().prop_map(Op::Free),
        1 => any::<usize>().prop_map(Op::FreeChildren),
        1 => (any::<usize>(), 0usize..1024).prop_map(|(node, size)| Op::Realloc(node, size)),
        2 => (any::<usize>(), any::<Option<usize>>())
            .prop_map(|(node, parent)| Op::SetParent(node, parent)),
    ]
}

/// What the tree should look like: node -> parent
type Model = HashMap<Node, Option<Node>>;

fn descendants_of(model: &Model, node: Node) -> Vec<Node> {
    let mut found = vec![node];
    let mut i = 0;
    while i < found.len() {
        let current = found[i];
        found.extend(
            model
                .iter()
                .filter(|(_, parent)| **parent == Some(current))
                .map(|(child, _)| *child),
        );
        i += 1;
    }
    found
}

fn pick(live: &[Node], i: usize) -> Node {
    live[i % live.len()]
}

proptest! {
    #[test]
    fn children_always_match_recorded_parents(ops in prop::collection::vec(op(), 1..200)) {
        let mut ta = Ta::new();
        let mut model = Model::new();
        let mut live: Vec<Node> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc { parent, size } => {
                    let parent = parent.filter(|_| !live.is_empty()).map(|i| pick(&live, i));
                    let node = ta.alloc_size(parent, size).unwrap();
                    model.insert(node, parent);
                }
                Op::Free(i) if !live.is_empty() => {
                    let node = pick(&live, i);
                    for gone in descendants_of(&model, node) {
                        model.remove(&gone);
                    }
                    ta.free(node);
                }
                Op::FreeChildren(i) if !live.is_empty() => {
                    let node = pick(&live, i);
                    for gone in descendants_of(&model, node).into_iter().skip(1) {
                        model.remove(&gone);
                    }
                    ta.free_children(node);
                }
                Op::Realloc(i, size) if !live.is_empty() => {
                    let node = pick(&live, i);
                    prop_assert_eq!(ta.realloc_size(node, size), Ok(node));
                    prop_assert_eq!(ta.get_size(node), size);
                }
                Op::SetParent(i, parent) if !live.is_empty() => {
                    let node = pick(&live, i);
                    let parent = parent.map(|j| pick(&live, j));
                    let cyclic = parent
                        .map(|p| descendants_of(&model, node).contains(&p))
                        .unwrap_or(false);
                    if !cyclic {
                        ta.set_parent(node, parent);
                        model.insert(node, parent);
                    }
                }
                _ => {}
            }
            live = model.keys().copied().collect();
            live.sort();

            prop_assert!(ta.verify().is_ok());
            prop_assert_eq!(ta.len(), model.len());
            for (&node, &parent) in &model {
                prop_assert_eq!(ta.find_parent(node), parent);
                let mut expected: Vec<Node> = model
                    .iter()
                    .filter(|(_, p)| **p == Some(node))
                    .map(|(child, _)| *child)
                    .collect();
                let mut actual: Vec<Node> = ta.children(node).collect();
                expected.sort();
                actual.sort();
                prop_assert_eq!(actual, expected);
            }
        }
    }

    #[test]
    fn resize_preserves_the_common_prefix(
        content in prop::collection::vec(any::<u8>(), 0..2048),
        new_size in 0usize..8192,
        kids in 0usize..4,
    ) {
        let mut ta = Ta::new();
        let parent = ta.new_context(None).unwrap();
        let node = ta.memdup(parent, &content).unwrap();
        let children: Vec<Node> = (0..kids).map(|_| ta.new_context(node).unwrap()).collect();

        let node = ta.realloc_size(node, new_size).unwrap();

        let common = content.len().min(new_size);
        prop_assert_eq!(&ta.bytes(node)[..common], &content[..common]);
        prop_assert_eq!(ta.get_size(node), new_size);
        prop_assert_eq!(ta.find_parent(node), Some(parent));
        prop_assert_eq!(ta.children(node).collect::<Vec<_>>(), children);
    }
}
