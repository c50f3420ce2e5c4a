//! Property-based tests for tidal-incremental using proptest.
//!
//! Random mutation scripts (structural changes and in-place rekeys) are run
//! against a source; after every step the incrementally maintained views
//! must equal a from-scratch evaluation of the current source.

use proptest::prelude::*;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tidal_core::{Error, Item, ItemId, Value};
use tidal_incremental::{
    Change, Count, Element, ElementId, Group, GroupBy, ObservableVec, OperationContext, Scalar,
    Select, Sequence, SequenceExt, Where,
};

type GroupRef = Rc<Group<i64, Item>>;

/// Generated key that makes the key selector fail.
const UNKEYED: u8 = 5;

#[derive(Clone, Debug)]
enum Op {
    Insert { at: usize, key: u8 },
    Duplicate { at: usize, pick: usize },
    Remove { at: usize },
    Replace { at: usize, key: u8 },
    Move { from: usize, to: usize },
    Rekey { pick: usize, key: u8 },
    Reset { keys: Vec<u8> },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (any::<usize>(), 0u8..=UNKEYED).prop_map(|(at, key)| Op::Insert { at, key }),
        1 => (any::<usize>(), any::<usize>()).prop_map(|(at, pick)| Op::Duplicate { at, pick }),
        3 => any::<usize>().prop_map(|at| Op::Remove { at }),
        2 => (any::<usize>(), 0u8..=UNKEYED).prop_map(|(at, key)| Op::Replace { at, key }),
        2 => (any::<usize>(), any::<usize>()).prop_map(|(from, to)| Op::Move { from, to }),
        4 => (any::<usize>(), 0u8..=UNKEYED).prop_map(|(pick, key)| Op::Rekey { pick, key }),
        1 => prop::collection::vec(0u8..=UNKEYED, 0..8).prop_map(|keys| Op::Reset { keys }),
    ]
}

fn key_value(key: u8) -> Value {
    if key == UNKEYED {
        Value::Null
    } else {
        Value::Int64(key as i64)
    }
}

fn make_item(key: u8) -> Item {
    Item::new(vec![key_value(key), Value::Int64(0)])
}

fn key_of(item: &Item) -> Option<i64> {
    item.get(0).and_then(|v| v.as_i64())
}

fn group_by(ctx: &OperationContext, source: &Rc<ObservableVec<Item>>) -> Rc<GroupBy<i64, Item>> {
    GroupBy::<i64, Item>::new(ctx, source.clone(), |item: &Item| {
        key_of(item).ok_or_else(|| Error::key_selector(item.id(), "null key"))
    })
}

fn run(source: &ObservableVec<Item>, op: &Op) {
    let len = source.len();
    match op {
        Op::Insert { at, key } => source.insert(at % (len + 1), make_item(*key)).unwrap(),
        Op::Duplicate { at, pick } if len > 0 => {
            let item = source.get(pick % len).unwrap();
            source.insert(at % (len + 1), item).unwrap();
        }
        Op::Remove { at } if len > 0 => {
            source.remove(at % len).unwrap();
        }
        Op::Replace { at, key } if len > 0 => {
            source.replace(at % len, make_item(*key)).unwrap();
        }
        Op::Move { from, to } if len > 0 => source.move_item(from % len, to % len).unwrap(),
        Op::Rekey { pick, key } if len > 0 => {
            source.get(pick % len).unwrap().set(0, key_value(*key)).unwrap();
        }
        Op::Reset { keys } => source.reset(keys.iter().map(|k| make_item(*k)).collect()).unwrap(),
        _ => {}
    }
}

/// Groups of `snapshot` by a single front-to-back scan.
fn expected(snapshot: &[Item]) -> Vec<(i64, Vec<ItemId>)> {
    let mut groups: Vec<(i64, Vec<ItemId>)> = Vec::new();
    for item in snapshot {
        let Some(key) = key_of(item) else { continue };
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(item.id()),
            None => groups.push((key, vec![item.id()])),
        }
    }
    groups
}

fn observed(groups: &GroupBy<i64, Item>) -> Vec<(i64, Vec<ItemId>)> {
    groups
        .groups()
        .iter()
        .map(|g| (*g.key(), g.snapshot().iter().map(Item::id).collect()))
        .collect()
}

/// A copy of the group sequence and of every group's members, maintained
/// only from published changes.
struct Mirror {
    groups: Rc<RefCell<Vec<GroupRef>>>,
    members: Rc<RefCell<HashMap<ElementId, Vec<Item>>>>,
}

fn follow_members(group: &GroupRef, members: &Rc<RefCell<HashMap<ElementId, Vec<Item>>>>) {
    let id = group.element_id();
    members.borrow_mut().insert(id, group.snapshot());
    let m = members.clone();
    group.observe(move |c: &Change<Item>| {
        if let Some(mirror) = m.borrow_mut().get_mut(&id) {
            c.apply_to(mirror);
        }
    });
}

impl Mirror {
    fn attach(groups: &GroupBy<i64, Item>) -> Self {
        let structure = Rc::new(RefCell::new(groups.snapshot()));
        let members = Rc::new(RefCell::new(HashMap::new()));
        for group in groups.groups() {
            follow_members(&group, &members);
        }

        let s = structure.clone();
        let m = members.clone();
        groups.observe(move |c: &Change<GroupRef>| {
            c.apply_to(&mut s.borrow_mut());
            match c {
                Change::Insert { item, .. } => follow_members(item, &m),
                Change::Remove { item, .. } => {
                    m.borrow_mut().remove(&item.element_id());
                }
                Change::Reset { items } => {
                    m.borrow_mut().clear();
                    for group in items {
                        follow_members(group, &m);
                    }
                }
                _ => {}
            }
        });

        Self {
            groups: structure,
            members,
        }
    }

    fn matches(&self, groups: &GroupBy<i64, Item>) -> bool {
        let actual = groups.groups();
        let mirrored = self.groups.borrow();
        let members = self.members.borrow();
        mirrored.len() == actual.len()
            && members.len() == actual.len()
            && mirrored.iter().zip(&actual).all(|(a, b)| Rc::ptr_eq(a, b))
            && actual
                .iter()
                .all(|g| members.get(&g.element_id()) == Some(&g.snapshot()))
    }
}

proptest! {
    /// Incremental grouping always equals a fresh scan of the source.
    #[test]
    fn group_by_matches_rebuild(
        initial in prop::collection::vec(0u8..=UNKEYED, 0..10),
        ops in prop::collection::vec(op_strategy(), 1..40)
    ) {
        let ctx = OperationContext::new();
        let source = Rc::new(ObservableVec::from_vec(initial.iter().map(|k| make_item(*k)).collect()));
        let groups = group_by(&ctx, &source);
        let mirror = Mirror::attach(&groups);

        for op in &ops {
            run(&source, op);
            let snapshot = source.snapshot();

            // Membership, cardinality and first-occurrence order.
            prop_assert_eq!(observed(&groups), expected(&snapshot), "after {:?}", op);

            // No empty or closed group is observable.
            for group in groups.groups() {
                prop_assert!(!group.is_empty());
                prop_assert!(!group.is_closed());
            }

            let keyed = snapshot.iter().filter(|i| key_of(i).is_some()).count();
            let total: usize = groups.groups().iter().map(|g| g.len()).sum();
            prop_assert_eq!(total, keyed);
            prop_assert_eq!(groups.unkeyed().len(), snapshot.len() - keyed);

            // Same table as a from-scratch build.
            let fresh_ctx = OperationContext::new();
            let fresh = group_by(&fresh_ctx, &source);
            prop_assert_eq!(observed(&fresh), observed(&groups));
            fresh_ctx.dispose();

            // Published changes alone reproduce the table.
            prop_assert!(mirror.matches(&groups), "mirror diverged after {:?}", op);
        }

        ctx.dispose();
        prop_assert!(source.snapshot().iter().all(|i| i.watcher_count() == 0));
    }

    /// Filter, projection and count stay equal to their recomputation.
    #[test]
    fn simple_operators_match_recompute(
        initial in prop::collection::vec(0u8..=UNKEYED, 0..10),
        ops in prop::collection::vec(op_strategy(), 1..30)
    ) {
        let ctx = OperationContext::new();
        let source = Rc::new(ObservableVec::from_vec(initial.iter().map(|k| make_item(*k)).collect()));
        let even = Where::<Item>::new(&ctx, source.clone(), |item: &Item| {
            key_of(item).map(|k| k % 2 == 0).unwrap_or(false)
        });
        let keys = Select::<Item, Option<i64>>::new(&ctx, even.clone(), key_of);
        let count = Count::<Option<i64>>::new(&ctx, keys.clone());

        let mirrored = Rc::new(RefCell::new(keys.snapshot()));
        let m = mirrored.clone();
        keys.observe(move |c: &Change<Option<i64>>| c.apply_to(&mut m.borrow_mut()));

        for op in &ops {
            run(&source, op);
            let expected: Vec<Option<i64>> = source
                .snapshot()
                .iter()
                .map(key_of)
                .filter(|k| k.map(|k| k % 2 == 0).unwrap_or(false))
                .collect();
            prop_assert_eq!(keys.snapshot(), expected.clone(), "after {:?}", op);
            prop_assert_eq!(mirrored.borrow().clone(), expected.clone());
            prop_assert_eq!(count.value(), expected.len());
        }
    }
}
