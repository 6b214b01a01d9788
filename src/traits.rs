//! The tree model contract consumed and produced by the view-model layer.
//!
//! A `TreeModel` is an ordered forest of rows with typed columns. Rows are
//! addressed either structurally through a [`TreePath`] or through an opaque
//! [`TreeIter`] cursor handed out by the model. Models announce mutations
//! through the five row signals of [`TreeModelObserver`]; the proxy models in
//! this crate consume those signals from a child model and re-emit them in
//! their own coordinate space, which makes proxies valid child models in
//! turn (a sort model can wrap a filter model wrapping a store).

use std::cell::RefCell;
use std::rc::Weak;

use serde::{Deserialize, Serialize};

use crate::path::TreePath;

/// Cell value type. Rows expose one `Value` per column.
pub type Value = serde_json::Value;

/// Static type of a model column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Str,
    /// Any JSON value; no comparison semantics beyond equality.
    Any,
}

/// Capability flags reported by a model.
///
/// `iters_persist` promises that a [`TreeIter`] stays valid across
/// mutations of the model (proxies cache child cursors only when the child
/// model makes this promise). `list_only` promises a flat model: no row
/// will ever report children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelFlags {
    pub iters_persist: bool,
    pub list_only: bool,
}

/// Opaque cursor into a [`TreeModel`].
///
/// `stamp` is the generation counter of the issuing model; a cursor whose
/// stamp no longer matches must be rejected by every operation. `slot` and
/// `slot2` are private to the issuing model (the proxies store arena ids in
/// them, concrete stores typically use a node id and leave `slot2` zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeIter {
    pub stamp: u32,
    pub slot: u64,
    pub slot2: u64,
}

/// Receiver half of the row-change signals.
///
/// All methods default to no-ops so observers implement only what they
/// watch. Paths are always expressed in the emitting model's own coordinate
/// space, and for `rows_reordered` the permutation maps new position `i` to
/// old position `new_order[i]`.
pub trait TreeModelObserver {
    fn row_changed(&self, _path: &TreePath, _iter: &TreeIter) {}
    fn row_inserted(&self, _path: &TreePath, _iter: &TreeIter) {}
    fn row_has_child_toggled(&self, _path: &TreePath, _iter: &TreeIter) {}
    fn row_deleted(&self, _path: &TreePath) {}
    fn rows_reordered(&self, _path: &TreePath, _iter: Option<&TreeIter>, _new_order: &[usize]) {}
}

/// Handle returned by [`TreeModel::connect`], used to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// The hierarchical model contract.
///
/// Navigation never panics on bad input: out-of-range paths, stale cursors
/// and boundary steps all report failure by returning `None` (or 0 for the
/// counting operations).
pub trait TreeModel {
    fn flags(&self) -> ModelFlags;

    fn n_columns(&self) -> usize;

    fn column_type(&self, column: usize) -> ColumnType;

    /// Resolves a path to a cursor. Fails if any index is out of range.
    fn iter(&self, path: &TreePath) -> Option<TreeIter>;

    /// Returns the path of a cursor, or `None` for a stale cursor.
    fn path(&self, iter: &TreeIter) -> Option<TreePath>;

    /// Fetches one cell. Returns `Value::Null` for stale cursors or
    /// out-of-range columns.
    fn value(&self, iter: &TreeIter, column: usize) -> Value;

    /// Steps to the next sibling; fails at the end of the sibling group.
    fn iter_next(&self, iter: &TreeIter) -> Option<TreeIter>;

    /// Steps to the previous sibling; fails at the start.
    fn iter_previous(&self, iter: &TreeIter) -> Option<TreeIter>;

    /// First child of `parent`, or first top-level row for `None`.
    fn iter_children(&self, parent: Option<&TreeIter>) -> Option<TreeIter>;

    fn iter_has_child(&self, iter: &TreeIter) -> bool;

    /// Child count of `iter`, or the top-level row count for `None`.
    fn iter_n_children(&self, iter: Option<&TreeIter>) -> usize;

    fn iter_nth_child(&self, parent: Option<&TreeIter>, n: usize) -> Option<TreeIter>;

    fn iter_parent(&self, child: &TreeIter) -> Option<TreeIter>;

    /// Caching hint: the node is being observed. Models that fan out
    /// signals only to referenced regions rely on this; others may ignore
    /// it, which is why the default is a no-op.
    fn ref_node(&self, _iter: &TreeIter) {}

    /// Releases a `ref_node` reference.
    fn unref_node(&self, _iter: &TreeIter) {}

    /// Registers an observer for the five row signals. The model holds the
    /// observer weakly; a dropped observer is pruned on the next emission.
    fn connect(&self, observer: Weak<dyn TreeModelObserver>) -> ObserverId;

    fn disconnect(&self, id: ObserverId);
}

/// Ordered, weakly held observer list shared by every model in this crate.
///
/// Emission iterates over a snapshot so observers may connect or disconnect
/// from inside a callback; entries whose observer has been dropped are
/// pruned after each emission.
#[derive(Default)]
pub struct SignalEmitter {
    observers: RefCell<Vec<(ObserverId, Weak<dyn TreeModelObserver>)>>,
    next_id: std::cell::Cell<u64>,
}

impl SignalEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, observer: Weak<dyn TreeModelObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.observers.borrow_mut().push((id, observer));
        id
    }

    pub fn disconnect(&self, id: ObserverId) {
        self.observers.borrow_mut().retain(|(oid, _)| *oid != id);
    }

    fn snapshot(&self) -> Vec<Weak<dyn TreeModelObserver>> {
        self.observers
            .borrow()
            .iter()
            .map(|(_, w)| w.clone())
            .collect()
    }

    fn prune(&self) {
        self.observers
            .borrow_mut()
            .retain(|(_, w)| w.strong_count() > 0);
    }

    pub fn emit_row_changed(&self, path: &TreePath, iter: &TreeIter) {
        for obs in self.snapshot() {
            if let Some(obs) = obs.upgrade() {
                obs.row_changed(path, iter);
            }
        }
        self.prune();
    }

    pub fn emit_row_inserted(&self, path: &TreePath, iter: &TreeIter) {
        for obs in self.snapshot() {
            if let Some(obs) = obs.upgrade() {
                obs.row_inserted(path, iter);
            }
        }
        self.prune();
    }

    pub fn emit_row_has_child_toggled(&self, path: &TreePath, iter: &TreeIter) {
        for obs in self.snapshot() {
            if let Some(obs) = obs.upgrade() {
                obs.row_has_child_toggled(path, iter);
            }
        }
        self.prune();
    }

    pub fn emit_row_deleted(&self, path: &TreePath) {
        for obs in self.snapshot() {
            if let Some(obs) = obs.upgrade() {
                obs.row_deleted(path);
            }
        }
        self.prune();
    }

    pub fn emit_rows_reordered(
        &self,
        path: &TreePath,
        iter: Option<&TreeIter>,
        new_order: &[usize],
    ) {
        for obs in self.snapshot() {
            if let Some(obs) = obs.upgrade() {
                obs.rows_reordered(path, iter, new_order);
            }
        }
        self.prune();
    }
}

/// Depth-first pre-order walk over every row of `model`.
///
/// The callback receives the row's path and cursor and returns `true` to
/// stop the walk early. Used by the filter model's refilter replay and
/// handy for tests.
pub fn foreach(model: &dyn TreeModel, f: &mut dyn FnMut(&TreePath, &TreeIter) -> bool) {
    let mut path = TreePath::first();
    let mut iter = match model.iter_children(None) {
        Some(it) => it,
        None => return,
    };

    loop {
        if f(&path, &iter) {
            return;
        }

        if let Some(child) = model.iter_children(Some(&iter)) {
            path.down();
            iter = child;
            continue;
        }

        loop {
            if let Some(next) = model.iter_next(&iter) {
                path.next();
                iter = next;
                break;
            }

            // exhausted this sibling group, pop back up
            if !path.up() || path.depth() == 0 {
                return;
            }
            iter = match model.iter(&path) {
                Some(it) => it,
                None => return,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Default)]
    struct CountingObserver {
        changed: Cell<usize>,
        deleted: Cell<usize>,
    }

    impl TreeModelObserver for CountingObserver {
        fn row_changed(&self, _path: &TreePath, _iter: &TreeIter) {
            self.changed.set(self.changed.get() + 1);
        }
        fn row_deleted(&self, _path: &TreePath) {
            self.deleted.set(self.deleted.get() + 1);
        }
    }

    #[test]
    fn test_emitter_delivers_to_connected_observers() {
        let emitter = SignalEmitter::new();
        let obs = Rc::new(CountingObserver::default());
        emitter.connect(Rc::downgrade(&obs) as Weak<dyn TreeModelObserver>);

        let path = TreePath::first();
        emitter.emit_row_changed(&path, &TreeIter::default());
        emitter.emit_row_deleted(&path);

        assert_eq!(obs.changed.get(), 1);
        assert_eq!(obs.deleted.get(), 1);
    }

    #[test]
    fn test_emitter_disconnect_stops_delivery() {
        let emitter = SignalEmitter::new();
        let obs = Rc::new(CountingObserver::default());
        let id = emitter.connect(Rc::downgrade(&obs) as Weak<dyn TreeModelObserver>);
        emitter.disconnect(id);

        emitter.emit_row_changed(&TreePath::first(), &TreeIter::default());
        assert_eq!(obs.changed.get(), 0);
    }

    #[test]
    fn test_emitter_prunes_dropped_observers() {
        let emitter = SignalEmitter::new();
        {
            let obs = Rc::new(CountingObserver::default());
            emitter.connect(Rc::downgrade(&obs) as Weak<dyn TreeModelObserver>);
        }
        // must not panic, and the dead entry is pruned
        emitter.emit_row_deleted(&TreePath::first());
        assert!(emitter.observers.borrow().is_empty());
    }
}
