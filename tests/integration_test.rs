//! End-to-end tests of the proxy models against a mutable in-memory store.
//!
//! `TestStore` is a small signal-emitting tree model (it does not
//! implement reference counting, so like the simplest backing stores it
//! always emits all signals). The scenarios below exercise the filter and
//! sort proxies through the public `TreeModel` surface only.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use serde_json::json;

use rvista::{
    ColumnType, FilterModel, FlatFilter, ListModel, ListModelObserver, ModelFlags, ObserverId,
    RowRefPool, SignalEmitter, SortModel, SortOrder, TreeIter, TreeModel, TreeModelObserver,
    TreePath, Value,
};

const STORE_STAMP: u32 = 7;

struct StoreNode {
    values: Vec<Value>,
    parent: Option<u64>,
    children: Vec<u64>,
}

struct StoreInner {
    nodes: HashMap<u64, StoreNode>,
    roots: Vec<u64>,
    next_id: u64,
}

/// Mutable tree store emitting the five row signals.
struct TestStore {
    columns: Vec<ColumnType>,
    inner: RefCell<StoreInner>,
    emitter: SignalEmitter,
}

impl TestStore {
    fn new(columns: Vec<ColumnType>) -> Rc<Self> {
        Rc::new(Self {
            columns,
            inner: RefCell::new(StoreInner {
                nodes: HashMap::new(),
                roots: Vec::new(),
                next_id: 1,
            }),
            emitter: SignalEmitter::new(),
        })
    }

    fn iter_of(&self, id: u64) -> TreeIter {
        TreeIter {
            stamp: STORE_STAMP,
            slot: id,
            slot2: 0,
        }
    }

    fn node_path(&self, id: u64) -> TreePath {
        let inner = self.inner.borrow();
        let mut path = TreePath::new();
        let mut cur = Some(id);
        while let Some(node_id) = cur {
            let node = &inner.nodes[&node_id];
            let siblings = match node.parent {
                Some(parent) => &inner.nodes[&parent].children,
                None => &inner.roots,
            };
            let index = siblings.iter().position(|&c| c == node_id).unwrap();
            path.prepend_index(index);
            cur = node.parent;
        }
        path
    }

    fn insert(&self, parent: Option<u64>, index: usize, values: Vec<Value>) -> u64 {
        let (id, first_child) = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.nodes.insert(
                id,
                StoreNode {
                    values,
                    parent,
                    children: Vec::new(),
                },
            );
            let first_child = match parent {
                Some(p) => {
                    let children = &mut inner.nodes.get_mut(&p).unwrap().children;
                    children.insert(index.min(children.len()), id);
                    children.len() == 1
                }
                None => {
                    let index = index.min(inner.roots.len());
                    inner.roots.insert(index, id);
                    false
                }
            };
            (id, first_child)
        };

        let path = self.node_path(id);
        self.emitter.emit_row_inserted(&path, &self.iter_of(id));
        if first_child {
            let parent = parent.unwrap();
            let ppath = self.node_path(parent);
            self.emitter
                .emit_row_has_child_toggled(&ppath, &self.iter_of(parent));
        }
        id
    }

    fn append(&self, parent: Option<u64>, values: Vec<Value>) -> u64 {
        let index = {
            let inner = self.inner.borrow();
            match parent {
                Some(p) => inner.nodes[&p].children.len(),
                None => inner.roots.len(),
            }
        };
        self.insert(parent, index, values)
    }

    fn set(&self, id: u64, column: usize, value: Value) {
        {
            let mut inner = self.inner.borrow_mut();
            let node = inner.nodes.get_mut(&id).unwrap();
            node.values[column] = value;
        }
        let path = self.node_path(id);
        self.emitter.emit_row_changed(&path, &self.iter_of(id));
    }

    fn remove(&self, id: u64) {
        let path = self.node_path(id);
        let emptied_parent = {
            let mut inner = self.inner.borrow_mut();
            let parent = inner.nodes[&id].parent;

            // drop the whole subtree from the map
            let mut stack = vec![id];
            while let Some(cur) = stack.pop() {
                if let Some(node) = inner.nodes.remove(&cur) {
                    stack.extend(node.children);
                }
            }

            match parent {
                Some(p) => {
                    let children = &mut inner.nodes.get_mut(&p).unwrap().children;
                    children.retain(|&c| c != id);
                    children.is_empty().then_some(p)
                }
                None => {
                    inner.roots.retain(|&c| c != id);
                    None
                }
            }
        };

        self.emitter.emit_row_deleted(&path);
        if let Some(parent) = emptied_parent {
            let ppath = self.node_path(parent);
            self.emitter
                .emit_row_has_child_toggled(&ppath, &self.iter_of(parent));
        }
    }

    /// Permutes the children of `parent`: the row now at position `i` was
    /// previously at `new_order[i]`.
    fn reorder(&self, parent: Option<u64>, new_order: &[usize]) {
        {
            let mut inner = self.inner.borrow_mut();
            let children = match parent {
                Some(p) => inner.nodes.get_mut(&p).unwrap().children.clone(),
                None => inner.roots.clone(),
            };
            let reordered: Vec<u64> = new_order.iter().map(|&old| children[old]).collect();
            match parent {
                Some(p) => inner.nodes.get_mut(&p).unwrap().children = reordered,
                None => inner.roots = reordered,
            }
        }

        match parent {
            Some(p) => {
                let ppath = self.node_path(p);
                self.emitter
                    .emit_rows_reordered(&ppath, Some(&self.iter_of(p)), new_order);
            }
            None => {
                self.emitter
                    .emit_rows_reordered(&TreePath::new(), None, new_order);
            }
        }
    }

    fn resolve(&self, path: &TreePath) -> Option<u64> {
        let inner = self.inner.borrow();
        let mut siblings = inner.roots.clone();
        let mut found = None;
        for &index in path.indices() {
            let id = *siblings.get(index)?;
            siblings = inner.nodes[&id].children.clone();
            found = Some(id);
        }
        found
    }
}

impl TreeModel for TestStore {
    fn flags(&self) -> ModelFlags {
        ModelFlags {
            iters_persist: true,
            list_only: false,
        }
    }

    fn n_columns(&self) -> usize {
        self.columns.len()
    }

    fn column_type(&self, column: usize) -> ColumnType {
        self.columns[column]
    }

    fn iter(&self, path: &TreePath) -> Option<TreeIter> {
        self.resolve(path).map(|id| self.iter_of(id))
    }

    fn path(&self, iter: &TreeIter) -> Option<TreePath> {
        if iter.stamp != STORE_STAMP || !self.inner.borrow().nodes.contains_key(&iter.slot) {
            return None;
        }
        Some(self.node_path(iter.slot))
    }

    fn value(&self, iter: &TreeIter, column: usize) -> Value {
        let inner = self.inner.borrow();
        inner
            .nodes
            .get(&iter.slot)
            .and_then(|n| n.values.get(column))
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn iter_next(&self, iter: &TreeIter) -> Option<TreeIter> {
        let inner = self.inner.borrow();
        let node = inner.nodes.get(&iter.slot)?;
        let siblings = match node.parent {
            Some(parent) => &inner.nodes[&parent].children,
            None => &inner.roots,
        };
        let pos = siblings.iter().position(|&c| c == iter.slot)?;
        siblings.get(pos + 1).map(|&id| self.iter_of(id))
    }

    fn iter_previous(&self, iter: &TreeIter) -> Option<TreeIter> {
        let inner = self.inner.borrow();
        let node = inner.nodes.get(&iter.slot)?;
        let siblings = match node.parent {
            Some(parent) => &inner.nodes[&parent].children,
            None => &inner.roots,
        };
        let pos = siblings.iter().position(|&c| c == iter.slot)?;
        if pos == 0 {
            return None;
        }
        Some(self.iter_of(siblings[pos - 1]))
    }

    fn iter_children(&self, parent: Option<&TreeIter>) -> Option<TreeIter> {
        let inner = self.inner.borrow();
        let first = match parent {
            Some(p) => *inner.nodes.get(&p.slot)?.children.first()?,
            None => *inner.roots.first()?,
        };
        Some(self.iter_of(first))
    }

    fn iter_has_child(&self, iter: &TreeIter) -> bool {
        self.inner
            .borrow()
            .nodes
            .get(&iter.slot)
            .map_or(false, |n| !n.children.is_empty())
    }

    fn iter_n_children(&self, iter: Option<&TreeIter>) -> usize {
        let inner = self.inner.borrow();
        match iter {
            Some(it) => inner.nodes.get(&it.slot).map_or(0, |n| n.children.len()),
            None => inner.roots.len(),
        }
    }

    fn iter_nth_child(&self, parent: Option<&TreeIter>, n: usize) -> Option<TreeIter> {
        let inner = self.inner.borrow();
        let id = match parent {
            Some(p) => *inner.nodes.get(&p.slot)?.children.get(n)?,
            None => *inner.roots.get(n)?,
        };
        Some(self.iter_of(id))
    }

    fn iter_parent(&self, child: &TreeIter) -> Option<TreeIter> {
        let inner = self.inner.borrow();
        inner
            .nodes
            .get(&child.slot)?
            .parent
            .map(|id| self.iter_of(id))
    }

    fn connect(&self, observer: Weak<dyn TreeModelObserver>) -> ObserverId {
        self.emitter.connect(observer)
    }

    fn disconnect(&self, id: ObserverId) {
        self.emitter.disconnect(id);
    }
}

/// Records every signal a proxy emits, as (kind, path, order) rows.
#[derive(Default)]
struct Recorder {
    events: RefCell<Vec<(String, String, Vec<usize>)>>,
}

impl Recorder {
    fn take(&self) -> Vec<(String, String, Vec<usize>)> {
        self.events.borrow_mut().drain(..).collect()
    }

    fn push(&self, kind: &str, path: &TreePath, order: &[usize]) {
        self.events
            .borrow_mut()
            .push((kind.to_string(), path.to_string(), order.to_vec()));
    }
}

impl TreeModelObserver for Recorder {
    fn row_changed(&self, path: &TreePath, _iter: &TreeIter) {
        self.push("changed", path, &[]);
    }
    fn row_inserted(&self, path: &TreePath, _iter: &TreeIter) {
        self.push("inserted", path, &[]);
    }
    fn row_has_child_toggled(&self, path: &TreePath, _iter: &TreeIter) {
        self.push("toggled", path, &[]);
    }
    fn row_deleted(&self, path: &TreePath) {
        self.push("deleted", path, &[]);
    }
    fn rows_reordered(&self, path: &TreePath, _iter: Option<&TreeIter>, new_order: &[usize]) {
        self.push("reordered", path, new_order);
    }
}

fn attach_recorder(model: &Rc<dyn TreeModel>) -> Rc<Recorder> {
    let recorder = Rc::new(Recorder::default());
    model.connect(Rc::downgrade(&recorder) as Weak<dyn TreeModelObserver>);
    recorder
}

/// Two name/visible columns used by most filter tests.
fn name_visible_store() -> Rc<TestStore> {
    TestStore::new(vec![ColumnType::Str, ColumnType::Bool])
}

fn row(name: &str, visible: bool) -> Vec<Value> {
    vec![json!(name), json!(visible)]
}

fn name_at(model: &dyn TreeModel, path: &str) -> Option<String> {
    let path: TreePath = path.parse().unwrap();
    let iter = model.iter(&path)?;
    model.value(&iter, 0).as_str().map(|s| s.to_string())
}

fn walk_children(model: &dyn TreeModel, parent: Option<&TreeIter>) -> usize {
    let mut count = 0;
    let mut iter = model.iter_children(parent);
    while let Some(it) = iter {
        count += 1;
        iter = model.iter_next(&it);
    }
    count
}

// ===== filter model =====

#[test]
fn test_filter_hides_rows_by_column() {
    let store = name_visible_store();
    store.append(None, row("a", true));
    store.append(None, row("b", false));
    store.append(None, row("c", true));

    let filter = FilterModel::new(store.clone());
    filter.set_visible_column(1);

    assert_eq!(filter.iter_n_children(None), 2);
    assert_eq!(name_at(&*filter, "0").as_deref(), Some("a"));
    assert_eq!(name_at(&*filter, "1").as_deref(), Some("c"));
    assert!(filter.iter(&"2".parse().unwrap()).is_none());
}

#[test]
fn test_filter_insert_into_filtered_out_region() {
    // scenario: [A invisible, B visible], then C visible lands at the front
    let store = name_visible_store();
    store.append(None, row("A", false));
    let _b = store.append(None, row("B", true));

    let filter = FilterModel::new(store.clone());
    filter.set_visible_column(1);
    assert_eq!(filter.iter_n_children(None), 1);

    let recorder = {
        let as_model: Rc<dyn TreeModel> = filter.clone();
        attach_recorder(&as_model)
    };

    store.insert(None, 0, row("C", true));

    let events = recorder.take();
    let inserted: Vec<_> = events.iter().filter(|(k, _, _)| k == "inserted").collect();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].1, "0");

    assert_eq!(name_at(&*filter, "0").as_deref(), Some("C"));
    assert_eq!(name_at(&*filter, "1").as_deref(), Some("B"));
    assert_eq!(filter.iter_n_children(None), 2);
}

#[test]
fn test_filter_value_change_flips_visibility_off() {
    let store = name_visible_store();
    let a = store.append(None, row("A", true));

    let filter = FilterModel::new(store.clone());
    filter.set_visible_column(1);
    assert_eq!(filter.iter_n_children(None), 1);

    let recorder = {
        let as_model: Rc<dyn TreeModel> = filter.clone();
        attach_recorder(&as_model)
    };

    store.set(a, 1, json!(false));

    let events = recorder.take();
    let deleted: Vec<_> = events.iter().filter(|(k, _, _)| k == "deleted").collect();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].1, "0");
    assert_eq!(filter.iter_n_children(None), 0);
}

#[test]
fn test_filter_parent_visibility_driven_by_children() {
    // a node is visible iff it has at least one child
    let store = name_visible_store();
    let _leaf = store.append(None, row("leaf", true));
    let parent = store.append(None, row("parent", true));

    let filter = FilterModel::new(store.clone());
    filter.set_visible_func(|model, iter| model.iter_has_child(iter));
    assert_eq!(filter.iter_n_children(None), 0);

    let recorder = {
        let as_model: Rc<dyn TreeModel> = filter.clone();
        attach_recorder(&as_model)
    };

    // inserting a child must surface the parent itself
    store.append(Some(parent), row("child", true));

    let events = recorder.take();
    let inserted: Vec<_> = events.iter().filter(|(k, _, _)| k == "inserted").collect();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].1, "0");
    assert_eq!(name_at(&*filter, "0").as_deref(), Some("parent"));
    assert_eq!(filter.iter_n_children(None), 1);
}

#[test]
fn test_filter_round_trip_path_conversion() {
    let store = name_visible_store();
    store.append(None, row("a", false));
    let b = store.append(None, row("b", true));
    store.append(Some(b), row("b0", false));
    store.append(Some(b), row("b1", true));

    let filter = FilterModel::new(store.clone());
    filter.set_visible_column(1);

    // b is filter row 0, b1 is filter row 0:0
    let child_path: TreePath = "1:1".parse().unwrap();
    let path = filter.convert_child_path_to_path(&child_path).unwrap();
    assert_eq!(path.to_string(), "0:0");
    assert_eq!(
        filter.convert_path_to_child_path(&path).unwrap(),
        child_path
    );

    // a filtered-out row converts to nothing
    assert!(filter
        .convert_child_path_to_path(&"0".parse().unwrap())
        .is_none());
}

#[test]
fn test_filter_count_consistency_with_walk() {
    let store = name_visible_store();
    let a = store.append(None, row("a", true));
    store.append(Some(a), row("a0", true));
    store.append(Some(a), row("a1", false));
    store.append(Some(a), row("a2", true));
    store.append(None, row("b", false));
    store.append(None, row("c", true));

    let filter = FilterModel::new(store.clone());
    filter.set_visible_column(1);

    assert_eq!(filter.iter_n_children(None), walk_children(&*filter, None));
    let a_iter = filter.iter(&"0".parse().unwrap()).unwrap();
    assert_eq!(
        filter.iter_n_children(Some(&a_iter)),
        walk_children(&*filter, Some(&a_iter))
    );
    assert_eq!(filter.iter_n_children(Some(&a_iter)), 2);
}

#[test]
fn test_filter_refilter_is_idempotent() {
    let threshold = Rc::new(RefCell::new(10_i64));
    let store = TestStore::new(vec![ColumnType::Int]);
    store.append(None, vec![json!(5)]);
    store.append(None, vec![json!(15)]);
    store.append(None, vec![json!(25)]);

    let filter = FilterModel::new(store.clone());
    let t = threshold.clone();
    filter.set_visible_func(move |model, iter| {
        model.value(iter, 0).as_i64().unwrap_or(0) >= *t.borrow()
    });
    assert_eq!(filter.iter_n_children(None), 2);

    let recorder = {
        let as_model: Rc<dyn TreeModel> = filter.clone();
        attach_recorder(&as_model)
    };

    // tighten the threshold without any store signal, then refilter
    *threshold.borrow_mut() = 20;
    filter.refilter();
    assert_eq!(filter.iter_n_children(None), 1);
    let first = recorder.take();
    assert!(first.iter().any(|(k, _, _)| k == "deleted"));

    // a second refilter settles with no residual changes
    filter.refilter();
    assert_eq!(filter.iter_n_children(None), 1);
    assert!(recorder.take().is_empty());
}

#[test]
fn test_filter_deletion_cascade_orders_signals() {
    let store = name_visible_store();
    let parent = store.append(None, row("parent", true));
    let child = store.append(Some(parent), row("child", true));

    let filter = FilterModel::new(store.clone());
    filter.set_visible_column(1);

    // navigate in and reference both rows like a displaying client would
    let p_iter = filter.iter(&"0".parse().unwrap()).unwrap();
    filter.ref_node(&p_iter);
    assert_eq!(filter.iter_n_children(Some(&p_iter)), 1);
    let c_iter = filter.iter(&"0:0".parse().unwrap()).unwrap();
    filter.ref_node(&c_iter);

    let recorder = {
        let as_model: Rc<dyn TreeModel> = filter.clone();
        attach_recorder(&as_model)
    };

    store.remove(child);

    let events = recorder.take();
    let deleted_pos = events.iter().position(|(k, _, _)| k == "deleted");
    let toggled_pos = events
        .iter()
        .position(|(k, p, _)| k == "toggled" && p == "0");
    assert!(deleted_pos.is_some(), "child deletion must be reported");
    assert!(toggled_pos.is_some(), "parent must report losing children");
    assert!(deleted_pos < toggled_pos, "row_deleted must come first");
}

#[test]
fn test_filter_reorder_translates_permutation() {
    let store = name_visible_store();
    store.append(None, row("x", true));
    store.append(None, row("y", true));
    store.append(None, row("z", true));

    let filter = FilterModel::new(store.clone());
    // no policy set: everything visible
    assert_eq!(filter.iter_n_children(None), 3);

    let recorder = {
        let as_model: Rc<dyn TreeModel> = filter.clone();
        attach_recorder(&as_model)
    };

    store.reorder(None, &[2, 0, 1]);

    let events = recorder.take();
    let reordered: Vec<_> = events.iter().filter(|(k, _, _)| k == "reordered").collect();
    assert_eq!(reordered.len(), 1);
    assert_eq!(reordered[0].2, vec![2, 0, 1]);

    // proxy rows follow the new backing order exactly
    assert_eq!(name_at(&*filter, "0").as_deref(), Some("z"));
    assert_eq!(name_at(&*filter, "1").as_deref(), Some("x"));
    assert_eq!(name_at(&*filter, "2").as_deref(), Some("y"));
}

#[test]
fn test_filter_reorder_permutation_covers_visible_rows_only() {
    let store = name_visible_store();
    store.append(None, row("a", true));
    store.append(None, row("b", false));
    store.append(None, row("c", true));

    let filter = FilterModel::new(store.clone());
    filter.set_visible_column(1);
    assert_eq!(filter.iter_n_children(None), 2);

    let recorder = {
        let as_model: Rc<dyn TreeModel> = filter.clone();
        attach_recorder(&as_model)
    };

    // backing becomes [c, b, a]; visible order flips from [a, c] to [c, a]
    store.reorder(None, &[2, 1, 0]);

    let events = recorder.take();
    let reordered: Vec<_> = events.iter().filter(|(k, _, _)| k == "reordered").collect();
    assert_eq!(reordered.len(), 1);
    assert_eq!(reordered[0].2.len(), 2, "only visible rows are listed");
    assert_eq!(reordered[0].2, vec![1, 0]);
    assert_eq!(name_at(&*filter, "0").as_deref(), Some("c"));
    assert_eq!(name_at(&*filter, "1").as_deref(), Some("a"));
}

#[test]
fn test_filter_visibility_invariant_after_mutations() {
    let store = name_visible_store();
    let a = store.append(None, row("a", true));
    store.append(Some(a), row("a0", false));
    store.append(Some(a), row("a1", true));
    store.append(None, row("b", false));

    let filter = FilterModel::new(store.clone());
    filter.set_visible_column(1);

    // touch everything so the cache is live
    assert_eq!(filter.iter_n_children(None), 1);
    let a_iter = filter.iter(&"0".parse().unwrap()).unwrap();
    assert_eq!(filter.iter_n_children(Some(&a_iter)), 1);

    store.set(a, 1, json!(true)); // unchanged, still visible
    let b2 = store.append(None, row("b2", true));
    store.set(b2, 1, json!(false));
    store.append(Some(a), row("a2", true));

    // every exposed row satisfies the predicate
    let count = filter.iter_n_children(None);
    for i in 0..count {
        let path = TreePath::from_indices(vec![i]);
        let iter = filter.iter(&path).unwrap();
        assert_eq!(filter.value(&iter, 1), json!(true));

        let children = filter.iter_n_children(Some(&iter));
        for j in 0..children {
            let path = TreePath::from_indices(vec![i, j]);
            let iter = filter.iter(&path).unwrap();
            assert_eq!(filter.value(&iter, 1), json!(true));
        }
    }
    assert_eq!(filter.iter_n_children(None), 1);
    let a_iter = filter.iter(&"0".parse().unwrap()).unwrap();
    assert_eq!(filter.iter_n_children(Some(&a_iter)), 2);
}

#[test]
fn test_filter_virtual_root_re_roots_the_tree() {
    let store = name_visible_store();
    let top = store.append(None, row("top", true));
    store.append(Some(top), row("x", true));
    store.append(Some(top), row("y", true));
    store.append(None, row("other", true));

    let filter = FilterModel::with_virtual_root(store.clone(), "0".parse().unwrap());

    assert_eq!(filter.iter_n_children(None), 2);
    assert_eq!(name_at(&*filter, "0").as_deref(), Some("x"));
    assert_eq!(name_at(&*filter, "1").as_deref(), Some("y"));

    // paths convert through the virtual root
    let child_path = filter
        .convert_path_to_child_path(&"1".parse().unwrap())
        .unwrap();
    assert_eq!(child_path.to_string(), "0:1");
}

#[test]
fn test_filter_virtual_root_deletion_empties_proxy() {
    let store = name_visible_store();
    let top = store.append(None, row("top", true));
    store.append(Some(top), row("x", true));
    store.append(Some(top), row("y", true));

    let filter = FilterModel::with_virtual_root(store.clone(), "0".parse().unwrap());
    assert_eq!(filter.iter_n_children(None), 2);

    let recorder = {
        let as_model: Rc<dyn TreeModel> = filter.clone();
        attach_recorder(&as_model)
    };

    store.remove(top);

    let events = recorder.take();
    let deleted: Vec<_> = events.iter().filter(|(k, _, _)| k == "deleted").collect();
    assert_eq!(deleted.len(), 2);
    // every removal is reported at position 0 as the rows shift up
    assert!(deleted.iter().all(|(_, p, _)| p == "0"));
    assert_eq!(filter.iter_n_children(None), 0);
}

#[test]
fn test_filter_ref_counts_restore_on_unref() {
    let store = name_visible_store();
    store.append(None, row("a", true));

    let filter = FilterModel::new(store.clone());
    let iter = filter.iter(&"0".parse().unwrap()).unwrap();
    filter.ref_node(&iter);
    filter.unref_node(&iter);
    // double unref is a warning no-op, not a crash or underflow
    filter.unref_node(&iter);
    assert_eq!(filter.iter_n_children(None), 1);
}

// ===== sort model =====

/// One int key column plus a name column.
fn keyed_store(keys: &[i64]) -> Rc<TestStore> {
    let store = TestStore::new(vec![ColumnType::Int, ColumnType::Str]);
    for (i, &k) in keys.iter().enumerate() {
        store.append(None, vec![json!(k), json!(format!("row{}", i))]);
    }
    store
}

fn keys_in_order(model: &dyn TreeModel) -> Vec<i64> {
    let mut out = Vec::new();
    let mut iter = model.iter_children(None);
    while let Some(it) = iter {
        out.push(model.value(&it, 0).as_i64().unwrap());
        iter = model.iter_next(&it);
    }
    out
}

#[test]
fn test_sort_orders_rows_by_column() {
    let store = keyed_store(&[3, 1, 2]);
    let sort = SortModel::new(store.clone());
    sort.set_sort_column(0, SortOrder::Ascending);

    assert_eq!(keys_in_order(&*sort), vec![1, 2, 3]);

    // offsets map back to the child model
    let child_path = sort
        .convert_path_to_child_path(&"0".parse().unwrap())
        .unwrap();
    assert_eq!(child_path.to_string(), "1");
    let path = sort
        .convert_child_path_to_path(&"0".parse().unwrap())
        .unwrap();
    assert_eq!(path.to_string(), "2");
}

#[test]
fn test_sort_descending_negates_comparator() {
    let store = keyed_store(&[3, 1, 2]);
    let sort = SortModel::new(store.clone());
    sort.set_sort_column(0, SortOrder::Descending);
    assert_eq!(keys_in_order(&*sort), vec![3, 2, 1]);
}

#[test]
fn test_sort_single_value_change_moves_one_row() {
    let store = keyed_store(&[3, 1, 2]);
    let sort = SortModel::new(store.clone());
    sort.set_sort_column(0, SortOrder::Ascending);
    assert_eq!(keys_in_order(&*sort), vec![1, 2, 3]);

    let recorder = {
        let as_model: Rc<dyn TreeModel> = sort.clone();
        attach_recorder(&as_model)
    };

    // the row with key 1 (child offset 1) becomes key 5 and moves last
    store.set(store.resolve(&"1".parse().unwrap()).unwrap(), 0, json!(5));

    let events = recorder.take();
    let reordered: Vec<_> = events.iter().filter(|(k, _, _)| k == "reordered").collect();
    assert_eq!(reordered.len(), 1);
    // positions 0..2 shift up, the moved row lands at the end
    assert_eq!(reordered[0].2, vec![1, 2, 0]);
    let changed: Vec<_> = events.iter().filter(|(k, _, _)| k == "changed").collect();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].1, "2");

    assert_eq!(keys_in_order(&*sort), vec![2, 3, 5]);

    // a full re-sort finds nothing left to move
    sort.resort();
    assert!(recorder.take().is_empty());
    assert_eq!(keys_in_order(&*sort), vec![2, 3, 5]);
}

#[test]
fn test_sort_insert_lands_at_comparator_position() {
    let store = keyed_store(&[3, 1, 2]);
    let sort = SortModel::new(store.clone());
    sort.set_sort_column(0, SortOrder::Ascending);
    assert_eq!(keys_in_order(&*sort), vec![1, 2, 3]);

    let recorder = {
        let as_model: Rc<dyn TreeModel> = sort.clone();
        attach_recorder(&as_model)
    };

    store.append(None, vec![json!(2), json!("late")]);

    let events = recorder.take();
    let inserted: Vec<_> = events.iter().filter(|(k, _, _)| k == "inserted").collect();
    assert_eq!(inserted.len(), 1);
    // key 2 sorts after the existing 2 (stable for ties) and before 3
    assert_eq!(inserted[0].1, "2");
    assert_eq!(keys_in_order(&*sort), vec![1, 2, 2, 3]);
}

#[test]
fn test_sort_deletion_reports_sorted_position() {
    let store = keyed_store(&[3, 1, 2]);
    let sort = SortModel::new(store.clone());
    sort.set_sort_column(0, SortOrder::Ascending);
    assert_eq!(keys_in_order(&*sort), vec![1, 2, 3]);

    let recorder = {
        let as_model: Rc<dyn TreeModel> = sort.clone();
        attach_recorder(&as_model)
    };

    // child row 0 holds key 3, which sits at sorted position 2
    store.remove(store.resolve(&"0".parse().unwrap()).unwrap());

    let events = recorder.take();
    let deleted: Vec<_> = events.iter().filter(|(k, _, _)| k == "deleted").collect();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].1, "2");
    assert_eq!(keys_in_order(&*sort), vec![1, 2]);
}

#[test]
fn test_sort_unsorted_mirrors_child_reorder() {
    let store = keyed_store(&[10, 20, 30]);
    let sort = SortModel::new(store.clone());
    // build the level in unsorted state
    assert_eq!(keys_in_order(&*sort), vec![10, 20, 30]);

    let recorder = {
        let as_model: Rc<dyn TreeModel> = sort.clone();
        attach_recorder(&as_model)
    };

    store.reorder(None, &[2, 0, 1]);

    let events = recorder.take();
    let reordered: Vec<_> = events.iter().filter(|(k, _, _)| k == "reordered").collect();
    assert_eq!(reordered.len(), 1);
    assert_eq!(reordered[0].2, vec![2, 0, 1]);
    assert_eq!(keys_in_order(&*sort), vec![30, 10, 20]);
}

#[test]
fn test_sort_with_comparator_ignores_child_reorder() {
    let store = keyed_store(&[3, 1, 2]);
    let sort = SortModel::new(store.clone());
    sort.set_sort_column(0, SortOrder::Ascending);
    assert_eq!(keys_in_order(&*sort), vec![1, 2, 3]);

    let recorder = {
        let as_model: Rc<dyn TreeModel> = sort.clone();
        attach_recorder(&as_model)
    };

    store.reorder(None, &[2, 0, 1]);

    let events = recorder.take();
    assert!(events.iter().all(|(k, _, _)| k != "reordered"));
    assert_eq!(keys_in_order(&*sort), vec![1, 2, 3]);
}

#[test]
fn test_sort_custom_comparator_and_registry() {
    let store = TestStore::new(vec![ColumnType::Str]);
    store.append(None, vec![json!("pear")]);
    store.append(None, vec![json!("fig")]);
    store.append(None, vec![json!("banana")]);

    let sort = SortModel::new(store.clone());
    // order by string length instead of lexicographically
    sort.set_sort_func(0, |model, a, b| {
        let la = model.value(a, 0).as_str().map_or(0, |s| s.len());
        let lb = model.value(b, 0).as_str().map_or(0, |s| s.len());
        la.cmp(&lb)
    });
    sort.set_sort_column(0, SortOrder::Ascending);

    let names: Vec<String> = {
        let mut out = Vec::new();
        let mut iter = sort.iter_children(None);
        while let Some(it) = iter {
            out.push(sort.value(&it, 0).as_str().unwrap().to_string());
            iter = sort.iter_next(&it);
        }
        out
    };
    assert_eq!(names, vec!["fig", "pear", "banana"]);
}

// ===== stacking =====

#[test]
fn test_sort_stacks_on_filter() {
    let store = name_visible_store();
    store.append(None, row("delta", true));
    store.append(None, row("alpha", false));
    store.append(None, row("charlie", true));
    store.append(None, row("bravo", true));

    let filter = FilterModel::new(store.clone());
    filter.set_visible_column(1);
    let sort = SortModel::new(filter.clone() as Rc<dyn TreeModel>);
    sort.set_sort_func(0, |model, a, b| {
        let va = model.value(a, 0);
        let vb = model.value(b, 0);
        va.as_str().cmp(&vb.as_str())
    });
    sort.set_sort_column(0, SortOrder::Ascending);

    assert_eq!(sort.iter_n_children(None), 3);
    assert_eq!(name_at(&*sort, "0").as_deref(), Some("bravo"));
    assert_eq!(name_at(&*sort, "1").as_deref(), Some("charlie"));
    assert_eq!(name_at(&*sort, "2").as_deref(), Some("delta"));

    // a row surfacing in the filter flows through to the sorted view
    store.append(None, row("apple", true));
    assert_eq!(sort.iter_n_children(None), 4);
    assert_eq!(name_at(&*sort, "0").as_deref(), Some("apple"));
}

// ===== row references =====

#[test]
fn test_row_refs_follow_inserts_deletes_and_reorders() {
    let store = name_visible_store();
    store.append(None, row("a", true));
    store.append(None, row("b", true));
    let c = store.append(None, row("c", true));
    store.append(Some(c), row("c0", true));

    let pool = RowRefPool::new(store.clone() as Rc<dyn TreeModel>);
    // registration order deliberately differs from row order
    let r_c0 = pool.reference("2:0".parse().unwrap()).unwrap();
    let r_a = pool.reference("0".parse().unwrap()).unwrap();

    store.insert(None, 0, row("front", true));
    assert_eq!(r_a.path().unwrap().to_string(), "1");
    assert_eq!(r_c0.path().unwrap().to_string(), "3:0");

    store.reorder(None, &[3, 0, 1, 2]);
    assert_eq!(r_a.path().unwrap().to_string(), "2");
    assert_eq!(r_c0.path().unwrap().to_string(), "0:0");

    // deleting the referenced subtree invalidates, siblings survive
    store.remove(store.resolve(&"0".parse().unwrap()).unwrap());
    assert!(!r_c0.valid());
    assert_eq!(r_a.path().unwrap().to_string(), "1");
}

#[test]
fn test_row_ref_rejects_invalid_path() {
    let store = name_visible_store();
    store.append(None, row("a", true));
    let pool = RowRefPool::new(store.clone() as Rc<dyn TreeModel>);
    assert!(pool.reference("5".parse().unwrap()).is_none());
}

// ===== flat filter =====

struct VecListStore {
    items: RefCell<Vec<Value>>,
    emitter: ListEmitterShim,
}

#[derive(Default)]
struct ListEmitterShim {
    observers: RefCell<Vec<(ObserverId, Weak<dyn ListModelObserver>)>>,
    next: std::cell::Cell<u64>,
}

impl ListEmitterShim {
    fn emit(&self, position: usize, removed: usize, added: usize) {
        let snapshot: Vec<_> = self
            .observers
            .borrow()
            .iter()
            .map(|(_, w)| w.clone())
            .collect();
        for obs in snapshot {
            if let Some(obs) = obs.upgrade() {
                obs.items_changed(position, removed, added);
            }
        }
    }
}

impl VecListStore {
    fn new(items: Vec<Value>) -> Rc<Self> {
        Rc::new(Self {
            items: RefCell::new(items),
            emitter: ListEmitterShim::default(),
        })
    }

    fn splice(&self, position: usize, removed: usize, added: Vec<Value>) {
        let added_len = added.len();
        {
            let mut items = self.items.borrow_mut();
            items.splice(position..position + removed, added);
        }
        self.emitter.emit(position, removed, added_len);
    }
}

impl ListModel for VecListStore {
    fn n_items(&self) -> usize {
        self.items.borrow().len()
    }

    fn item(&self, position: usize) -> Option<Value> {
        self.items.borrow().get(position).cloned()
    }

    fn connect(&self, observer: Weak<dyn ListModelObserver>) -> ObserverId {
        let id = ObserverId(self.emitter.next.get());
        self.emitter.next.set(id.0 + 1);
        self.emitter.observers.borrow_mut().push((id, observer));
        id
    }

    fn disconnect(&self, id: ObserverId) {
        self.emitter
            .observers
            .borrow_mut()
            .retain(|(oid, _)| *oid != id);
    }
}

#[derive(Default)]
struct SpliceRecorder {
    events: RefCell<Vec<(usize, usize, usize)>>,
}

impl ListModelObserver for SpliceRecorder {
    fn items_changed(&self, position: usize, removed: usize, added: usize) {
        self.events.borrow_mut().push((position, removed, added));
    }
}

#[test]
fn test_flat_filter_position_translation() {
    let store = VecListStore::new((0..10).map(|i| json!(i)).collect());
    let filter = FlatFilter::new(store.clone(), |v| v.as_i64().unwrap() % 2 == 0);

    assert_eq!(filter.n_items(), 5);
    assert_eq!(filter.item(2), Some(json!(4)));
    assert_eq!(filter.convert_position_to_child_position(3), Some(6));
    assert_eq!(filter.convert_child_position_to_position(6), Some(3));
    assert_eq!(filter.convert_child_position_to_position(3), None);
}

#[test]
fn test_flat_filter_coalesces_splices() {
    let store = VecListStore::new((0..6).map(|i| json!(i)).collect());
    let filter = FlatFilter::new(store.clone(), |v| v.as_i64().unwrap() % 2 == 0);
    assert_eq!(filter.n_items(), 3); // 0 2 4

    let recorder = Rc::new(SpliceRecorder::default());
    filter.connect(Rc::downgrade(&recorder) as Weak<dyn ListModelObserver>);

    // replace child rows 2..4 (values 2, 3) with 8, 9, 11
    store.splice(2, 2, vec![json!(8), json!(9), json!(11)]);

    let events = recorder.events.borrow().clone();
    assert_eq!(events, vec![(1, 1, 1)]);
    assert_eq!(filter.n_items(), 3); // 0 8 4
    assert_eq!(filter.item(1), Some(json!(8)));
}

#[test]
fn test_flat_filter_refilter_reports_minimal_span() {
    let store = VecListStore::new((0..8).map(|i| json!(i)).collect());
    let filter = FlatFilter::new(store.clone(), |v| v.as_i64().unwrap() % 2 == 0);
    assert_eq!(filter.n_items(), 4); // 0 2 4 6

    let recorder = Rc::new(SpliceRecorder::default());
    filter.connect(Rc::downgrade(&recorder) as Weak<dyn ListModelObserver>);

    // switch parity: first flip is child 1, last is child 7; child 0 keeps
    // its visibility, so the span starts at filtered position 0... after 0
    filter.set_filter_func(|v| {
        let n = v.as_i64().unwrap();
        n % 2 == 1 || n == 0
    });

    let events = recorder.events.borrow().clone();
    assert_eq!(events.len(), 1);
    let (position, removed, added) = events[0];
    assert_eq!(position, 1, "unchanged prefix stays out of the span");
    assert_eq!(removed, 3); // 2 4 6
    assert_eq!(added, 4); // 1 3 5 7
    assert_eq!(filter.n_items(), 5); // 0 1 3 5 7
}
