//! The filtering proxy model.
//!
//! `FilterModel` wraps a child `TreeModel` and exposes only the rows that
//! pass a visibility policy (a predicate function, a boolean column, or
//! nothing, meaning everything is visible). The child tree is mirrored
//! lazily: a cache level is materialized the first time a client navigates
//! into its parent, and evicted again once reference counts show nothing
//! observes it.
//!
//! Two coordinate systems are in play throughout: child-model offsets
//! (stored per cached elt, shifted on insert/delete) and the proxy's own
//! visible positions (positions in each level's visible sequence). Paths
//! in signals always use the latter.
//!
//! Signal handling discipline: every child-signal handler finishes all of
//! its cache edits first and only then emits its own signals, so an
//! observer that immediately calls back into navigation sees a fully
//! consistent cache. Handlers stage emissions in a queue which is drained
//! after the state borrow is released.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::warn;

use crate::arena::Arena;
use crate::path::TreePath;
use crate::rowref::{shift_for_delete, shift_for_insert};
use crate::traits::{
    foreach, ColumnType, ModelFlags, ObserverId, SignalEmitter, TreeIter, TreeModel,
    TreeModelObserver, Value,
};

use super::level::{
    decrease_offsets, increase_offsets, position_of_offset, search_by_offset, EltId, FilterElt,
    FilterLevel, LevelId,
};

/// Visibility decision function: child model and a cursor into it.
pub type VisibleFunc = Rc<dyn Fn(&dyn TreeModel, &TreeIter) -> bool>;

#[derive(Clone)]
enum VisiblePolicy {
    /// No policy set: every row is visible.
    Always,
    Func(VisibleFunc),
    /// A boolean child column decides.
    Column(usize),
}

/// A staged outgoing signal. Paths are captured at the point the reference
/// behavior would have emitted; iters are materialized at drain time so
/// they carry the handler's final stamp.
enum Pending {
    Changed {
        path: TreePath,
        level: LevelId,
        elt: EltId,
    },
    Inserted {
        path: TreePath,
        level: LevelId,
        elt: EltId,
    },
    HasChildToggled {
        path: TreePath,
        level: LevelId,
        elt: EltId,
        /// Suppress level builds while the client reacts (used for the
        /// toggle that follows a row deletion).
        guard: bool,
    },
    Deleted {
        path: TreePath,
    },
    Reordered {
        path: TreePath,
        parent: Option<(LevelId, EltId)>,
        order: Vec<usize>,
    },
}

struct FilterState {
    levels: Arena<FilterLevel>,
    elts: Arena<FilterElt>,
    root: Option<LevelId>,
    stamp: u32,
    /// Count of non-root levels whose external ref count is zero.
    zero_ref_count: usize,
    virtual_root: Option<TreePath>,
    virtual_root_deleted: bool,
    /// Set while emitting the has-child-toggled that follows a deletion;
    /// level builds are suppressed for its duration.
    in_row_deleted: bool,
    policy: VisiblePolicy,
    policy_set: bool,
    child_flags: ModelFlags,
}

/// A `TreeModel` hiding the child-model rows that fail a visibility test.
///
/// Create with [`FilterModel::new`] (or [`FilterModel::with_virtual_root`]
/// to re-root the view on a child subtree), then configure the policy once
/// with [`FilterModel::set_visible_func`] or
/// [`FilterModel::set_visible_column`].
pub struct FilterModel {
    child: Rc<dyn TreeModel>,
    state: RefCell<FilterState>,
    emitter: SignalEmitter,
    subscription: Cell<Option<ObserverId>>,
}

impl FilterModel {
    pub fn new(child: Rc<dyn TreeModel>) -> Rc<Self> {
        Self::with_root(child, None)
    }

    /// Creates a filter presenting the subtree below `root` as its own
    /// top level. The root path is kept correct under child mutations; if
    /// the root row (or an ancestor) is deleted, the filter empties.
    pub fn with_virtual_root(child: Rc<dyn TreeModel>, root: TreePath) -> Rc<Self> {
        Self::with_root(child, Some(root))
    }

    fn with_root(child: Rc<dyn TreeModel>, virtual_root: Option<TreePath>) -> Rc<Self> {
        let child_flags = child.flags();
        let mut stamp: u32 = rand::random();
        if stamp == 0 {
            stamp = 1;
        }

        if let Some(root) = &virtual_root {
            // hold the virtual root's ancestor chain alive in the child
            let mut p = root.clone();
            while p.depth() > 0 {
                match child.iter(&p) {
                    Some(iter) => child.ref_node(&iter),
                    None => warn!(path = %p, "virtual root path does not resolve"),
                }
                p.up();
            }
        }

        let model = Rc::new(FilterModel {
            child: child.clone(),
            state: RefCell::new(FilterState {
                levels: Arena::new(),
                elts: Arena::new(),
                root: None,
                stamp,
                zero_ref_count: 0,
                virtual_root,
                virtual_root_deleted: false,
                in_row_deleted: false,
                policy: VisiblePolicy::Always,
                policy_set: false,
                child_flags,
            }),
            emitter: SignalEmitter::new(),
            subscription: Cell::new(None),
        });

        let id = child.connect(Rc::downgrade(&model) as Weak<dyn TreeModelObserver>);
        model.subscription.set(Some(id));
        model
    }

    pub fn child_model(&self) -> Rc<dyn TreeModel> {
        self.child.clone()
    }

    pub fn virtual_root(&self) -> Option<TreePath> {
        self.state.borrow().virtual_root.clone()
    }

    /// Sets the visibility predicate. The policy can be set only once per
    /// model; a second attempt is a warning no-op.
    pub fn set_visible_func(&self, f: impl Fn(&dyn TreeModel, &TreeIter) -> bool + 'static) {
        let mut st = self.state.borrow_mut();
        if st.policy_set {
            warn!("visibility policy can only be set once per filter model");
            return;
        }
        st.policy = VisiblePolicy::Func(Rc::new(f));
        st.policy_set = true;
    }

    /// Designates a boolean child column as the visibility source.
    pub fn set_visible_column(&self, column: usize) {
        let mut st = self.state.borrow_mut();
        if st.policy_set {
            warn!("visibility policy can only be set once per filter model");
            return;
        }
        st.policy = VisiblePolicy::Column(column);
        st.policy_set = true;
    }

    /// Re-evaluates visibility of every child row, emitting the resulting
    /// insertions/removals. Implemented as a row-changed replay over an
    /// in-order walk of the child model.
    pub fn refilter(&self) {
        let child = self.child.clone();
        foreach(&*child, &mut |path, iter| {
            self.row_changed(path, iter);
            false
        });
    }

    /// Evicts every cache subtree that nothing external observes. Purely a
    /// memory-pressure valve; no query result changes.
    pub fn clear_cache(&self) {
        let mut queue = Vec::new();
        {
            let mut st = self.state.borrow_mut();
            self.clear_cache_in(&mut st, &mut queue);
        }
        self.drain(queue);
    }

    /// Maps a child-model path to the filter's coordinates. Fails if the
    /// row (or an ancestor) is filtered out.
    pub fn convert_child_path_to_path(&self, child_path: &TreePath) -> Option<TreePath> {
        let mut queue = Vec::new();
        let result = {
            let mut st = self.state.borrow_mut();
            self.real_convert(&mut st, &mut queue, child_path, true, true)
                .and_then(|(level, elt)| self.path_of_elt_visible(&st, level, elt))
        };
        self.drain(queue);
        result
    }

    /// Maps a filter path back to child-model coordinates.
    pub fn convert_path_to_child_path(&self, path: &TreePath) -> Option<TreePath> {
        let mut queue = Vec::new();
        let result = {
            let mut st = self.state.borrow_mut();
            self.path_to_child_path_in(&mut st, &mut queue, path)
        };
        self.drain(queue);
        result
    }

    pub fn convert_iter_to_child_iter(&self, iter: &TreeIter) -> Option<TreeIter> {
        let st = self.state.borrow();
        let (level, elt) = self.ids_of(&st, iter)?;
        self.child_iter_for(&st, level, elt)
    }

    pub fn convert_child_iter_to_iter(&self, child_iter: &TreeIter) -> Option<TreeIter> {
        let child_path = self.child.path(child_iter)?;
        let path = self.convert_child_path_to_path(&child_path)?;
        self.iter(&path)
    }

    // ---- cursor plumbing ----

    fn make_iter(&self, st: &FilterState, level: LevelId, elt: EltId) -> TreeIter {
        TreeIter {
            stamp: st.stamp,
            slot: level as u64,
            slot2: elt as u64,
        }
    }

    fn ids_of(&self, st: &FilterState, iter: &TreeIter) -> Option<(LevelId, EltId)> {
        if iter.stamp != st.stamp {
            return None;
        }
        let level = iter.slot as LevelId;
        let elt = iter.slot2 as EltId;
        if !st.levels.contains(level) || !st.elts.contains(elt) {
            return None;
        }
        Some((level, elt))
    }

    /// Child-model path of a cached elt (virtual root applied).
    fn elt_child_path(&self, st: &FilterState, mut level: LevelId, mut elt: EltId) -> TreePath {
        let mut rel = TreePath::new();
        loop {
            rel.prepend_index(st.elts[elt].offset);
            match st.levels[level].parent {
                Some((pl, pe)) => {
                    level = pl;
                    elt = pe;
                }
                None => break,
            }
        }
        match &st.virtual_root {
            Some(root) => TreePath::concat(root, &rel),
            None => rel,
        }
    }

    fn child_iter_for(&self, st: &FilterState, level: LevelId, elt: EltId) -> Option<TreeIter> {
        if let Some(iter) = st.elts[elt].child_iter {
            return Some(iter);
        }
        let path = self.elt_child_path(st, level, elt);
        self.child.iter(&path)
    }

    /// Path in visible coordinates; fails if the elt or any ancestor is
    /// currently invisible.
    fn path_of_elt_visible(
        &self,
        st: &FilterState,
        mut level: LevelId,
        mut elt: EltId,
    ) -> Option<TreePath> {
        let mut path = TreePath::new();
        loop {
            if !st.elts[elt].visible {
                return None;
            }
            let offset = st.elts[elt].offset;
            let pos = position_of_offset(&st.elts, &st.levels[level].visible, offset)?;
            path.prepend_index(pos);
            match st.levels[level].parent {
                Some((pl, pe)) => {
                    level = pl;
                    elt = pe;
                }
                None => break,
            }
        }
        Some(path)
    }

    fn elt_is_visible_in_target(&self, st: &FilterState, level: LevelId, elt: EltId) -> bool {
        if !st.elts[elt].visible {
            return false;
        }
        let mut cur = st.levels[level].parent;
        while let Some((pl, pe)) = cur {
            if !st.elts[pe].visible {
                return false;
            }
            cur = st.levels[pl].parent;
        }
        true
    }

    // ---- visibility policy ----

    fn is_visible(&self, st: &FilterState, child_iter: &TreeIter) -> bool {
        match &st.policy {
            VisiblePolicy::Always => true,
            VisiblePolicy::Func(f) => f(&*self.child, child_iter),
            VisiblePolicy::Column(column) => self
                .child
                .value(child_iter, *column)
                .as_bool()
                .unwrap_or(false),
        }
    }

    fn make_visible(&self, st: &mut FilterState, level: LevelId, elt: EltId) {
        if st.elts[elt].visible {
            return;
        }
        st.elts[elt].visible = true;
        let offset = st.elts[elt].offset;
        let pos = match search_by_offset(&st.elts, &st.levels[level].visible, offset) {
            Ok(p) | Err(p) => p,
        };
        st.levels[level].visible.insert(pos, elt);
    }

    fn make_invisible(&self, st: &mut FilterState, level: LevelId, elt: EltId) {
        if !st.elts[elt].visible {
            return;
        }
        st.elts[elt].visible = false;
        let offset = st.elts[elt].offset;
        if let Some(pos) = position_of_offset(&st.elts, &st.levels[level].visible, offset) {
            st.levels[level].visible.remove(pos);
        }
    }

    // ---- reference counting ----

    fn real_ref(&self, st: &mut FilterState, level: LevelId, elt: EltId, external: bool) {
        if let Some(child_iter) = self.child_iter_for(st, level, elt) {
            self.child.ref_node(&child_iter);
        }

        st.elts[elt].ref_count += 1;
        st.levels[level].ref_count += 1;

        if external {
            st.elts[elt].ext_ref_count += 1;
            st.levels[level].ext_ref_count += 1;

            if st.levels[level].ext_ref_count == 1 {
                // level leaves the zero-external set
                let mut cur = st.levels[level].parent;
                while let Some((pl, pe)) = cur {
                    st.elts[pe].zero_ref_count -= 1;
                    cur = st.levels[pl].parent;
                }
                if st.root != Some(level) {
                    st.zero_ref_count -= 1;
                }
            }
        }

        debug_assert!(st.elts[elt].ref_count >= st.elts[elt].ext_ref_count);
    }

    fn real_unref(
        &self,
        st: &mut FilterState,
        level: LevelId,
        elt: EltId,
        external: bool,
        propagate: bool,
    ) {
        if propagate {
            if let Some(child_iter) = self.child_iter_for(st, level, elt) {
                self.child.unref_node(&child_iter);
            }
        }

        if st.elts[elt].ref_count == 0 || (external && st.elts[elt].ext_ref_count == 0) {
            warn!("unref of a node with no matching reference");
            return;
        }

        st.elts[elt].ref_count -= 1;
        st.levels[level].ref_count -= 1;

        if external {
            st.elts[elt].ext_ref_count -= 1;
            st.levels[level].ext_ref_count -= 1;

            if st.levels[level].ext_ref_count == 0 {
                // level joins the zero-external set
                let mut cur = st.levels[level].parent;
                while let Some((pl, pe)) = cur {
                    st.elts[pe].zero_ref_count += 1;
                    cur = st.levels[pl].parent;
                }
                if st.root != Some(level) {
                    st.zero_ref_count += 1;
                }
            }
        }

        debug_assert!(st.elts[elt].ref_count >= st.elts[elt].ext_ref_count);
    }

    /// Moves the internal first-of-level reference between two elts.
    fn transfer_first_ref(&self, st: &mut FilterState, level: LevelId, from: EltId, to: EltId) {
        self.real_ref(st, level, to, false);
        self.real_unref(st, level, from, false, true);
    }

    // ---- level construction and teardown ----

    /// Materializes the child level of `parent` (the root level for
    /// `None`). With `emit_inserted`, a row-inserted is staged for every
    /// visible row and their children are probed for monitoring; this mode
    /// is used when the build happens in response to a live insertion
    /// rather than lazy navigation.
    fn build_level(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        parent: Option<(LevelId, EltId)>,
        emit_inserted: bool,
    ) {
        if st.in_row_deleted {
            return;
        }
        match parent {
            Some((_, pe)) => {
                if st.elts[pe].children.is_some() {
                    return;
                }
            }
            None => {
                if st.root.is_some() {
                    return;
                }
            }
        }

        let (first, len) = match parent {
            None => match st.virtual_root.clone() {
                Some(vroot) => {
                    let root_iter = match self.child.iter(&vroot) {
                        Some(it) => it,
                        None => return,
                    };
                    let first = match self.child.iter_children(Some(&root_iter)) {
                        Some(it) => it,
                        None => return,
                    };
                    (first, self.child.iter_n_children(Some(&root_iter)))
                }
                None => {
                    let first = match self.child.iter_children(None) {
                        Some(it) => it,
                        None => return,
                    };
                    (first, self.child.iter_n_children(None))
                }
            },
            Some((pl, pe)) => {
                let parent_iter = match self.child_iter_for(st, pl, pe) {
                    Some(it) => it,
                    None => return,
                };
                let first = match self.child.iter_children(Some(&parent_iter)) {
                    Some(it) => it,
                    None => return,
                };
                let len = self.child.iter_n_children(Some(&parent_iter));
                // hold the parent alive while its child level exists
                self.real_ref(st, pl, pe, false);
                (first, len)
            }
        };

        if len == 0 {
            warn!("child model reported children but yields none");
            return;
        }

        let level = st.levels.insert(FilterLevel::new(parent));
        match parent {
            Some((_, pe)) => st.elts[pe].children = Some(level),
            None => st.root = Some(level),
        }

        // a fresh level starts with zero external references
        let mut cur = parent;
        while let Some((pl, pe)) = cur {
            st.elts[pe].zero_ref_count += 1;
            cur = st.levels[pl].parent;
        }
        if parent.is_some() {
            st.zero_ref_count += 1;
        }

        let cache_iters = st.child_flags.iters_persist;
        let mut iter = first;
        let mut offset = 0;
        let mut any_visible = false;
        loop {
            let visible = self.is_visible(st, &iter);
            let mut elt = FilterElt::new(offset, cache_iters.then_some(iter));
            elt.visible = visible;
            let elt = st.elts.insert(elt);
            st.levels[level].seq.push(elt);
            if visible {
                st.levels[level].visible.push(elt);
                any_visible = true;
                if emit_inserted {
                    if let Some(path) = self.path_of_elt_visible(st, level, elt) {
                        queue.push(Pending::Inserted { path, level, elt });
                    }
                    if self.child.iter_has_child(&iter) {
                        self.update_children(st, queue, level, elt);
                    }
                }
            }

            offset += 1;
            match self.child.iter_next(&iter) {
                Some(next) => iter = next,
                None => break,
            }
        }

        if offset != len {
            warn!(
                expected = len,
                got = offset,
                "child model advertises a wrong length for this level"
            );
        }

        // A level with nothing visible is only worth keeping when changes
        // in it can still matter to an observed parent.
        if !any_visible {
            if let Some((pl, _)) = parent {
                if st.levels[pl].ext_ref_count == 0 {
                    self.free_level(st, queue, level, false, true, false);
                    return;
                }
            }
        }

        // reference the first elt so the child model keeps signalling here
        let head = st.levels[level].seq[0];
        self.real_ref(st, level, head, false);
    }

    /// Tears a level down. `unref_self` releases the first-elt monitor
    /// reference, `unref_parent` propagates the parent release to the
    /// child model, `unref_external` also drops forwarded client
    /// references (used when rows vanish without the client unreffing).
    fn free_level(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        level: LevelId,
        unref_self: bool,
        unref_parent: bool,
        unref_external: bool,
    ) {
        let seq = st.levels[level].seq.clone();
        for &elt in &seq {
            if let Some(children) = st.elts[elt].children {
                let child_unref_parent = if unref_self { unref_parent } else { false };
                self.free_level(st, queue, children, unref_self, child_unref_parent, unref_external);
            }
            if unref_external {
                while st.elts[elt].ext_ref_count > 0 {
                    self.real_unref(st, level, elt, true, unref_self);
                }
            }
        }

        if unref_self {
            let head = st.levels[level].seq[0];
            self.real_unref(st, level, head, false, true);
        }

        if st.levels[level].ext_ref_count == 0 {
            let mut cur = st.levels[level].parent;
            while let Some((pl, pe)) = cur {
                st.elts[pe].zero_ref_count -= 1;
                cur = st.levels[pl].parent;
            }
            if st.root != Some(level) {
                st.zero_ref_count -= 1;
            }
        }

        match st.levels[level].parent {
            Some((pl, pe)) => {
                self.real_unref(st, pl, pe, false, unref_parent);
                st.elts[pe].children = None;
            }
            None => st.root = None,
        }

        for &elt in &st.levels[level].seq.clone() {
            st.elts.remove(elt);
        }
        st.levels.remove(level);
    }

    /// Prunes a level to its first elt, kept invisible purely to preserve
    /// the change-notification subscription for the parent.
    fn prune_level(&self, st: &mut FilterState, queue: &mut Vec<Pending>, level: LevelId) {
        for &elt in &st.levels[level].seq.clone() {
            if let Some(children) = st.elts[elt].children {
                self.free_level(st, queue, children, true, true, true);
            }
        }

        let head = st.levels[level].seq[0];
        while st.elts[head].ext_ref_count > 0 {
            self.real_unref(st, level, head, true, true);
        }
        self.make_invisible(st, level, head);

        let rest: Vec<EltId> = st.levels[level].seq[1..].to_vec();
        for &elt in &rest {
            while st.elts[elt].ext_ref_count > 0 {
                self.real_unref(st, level, elt, true, true);
            }
            while st.elts[elt].ref_count > 0 {
                self.real_unref(st, level, elt, false, true);
            }
            self.make_invisible(st, level, elt);
        }
        st.levels[level].seq.truncate(1);
        for &elt in &rest {
            st.elts.remove(elt);
        }
    }

    /// Inserts an invisible elt for `offset`, keeping `seq` offset-sorted
    /// and moving the first-of-level reference if it lands at position 0.
    fn insert_elt_in_level(
        &self,
        st: &mut FilterState,
        child_iter: Option<TreeIter>,
        level: LevelId,
        offset: usize,
    ) -> (EltId, usize) {
        let cached = if st.child_flags.iters_persist {
            child_iter
        } else {
            None
        };
        let elt = st.elts.insert(FilterElt::new(offset, cached));
        let pos = match search_by_offset(&st.elts, &st.levels[level].seq, offset) {
            Ok(p) => {
                warn!(offset, "duplicate offset in level");
                p
            }
            Err(p) => p,
        };
        st.levels[level].seq.insert(pos, elt);
        if pos == 0 && st.levels[level].seq.len() > 1 {
            let old_first = st.levels[level].seq[1];
            self.transfer_first_ref(st, level, old_first, elt);
        }
        (elt, pos)
    }

    /// Pulls a not-yet-cached child at `offset` into `level`, provided it
    /// exists and is visible.
    fn fetch_child(
        &self,
        st: &mut FilterState,
        level: LevelId,
        offset: usize,
    ) -> Option<(EltId, usize)> {
        let parent_path = match st.levels[level].parent {
            Some((pl, pe)) => Some(self.elt_child_path(st, pl, pe)),
            None => st.virtual_root.clone(),
        };

        let (len, child_path) = match &parent_path {
            Some(p) => {
                let parent_iter = self.child.iter(p)?;
                let mut cp = p.clone();
                cp.append_index(offset);
                (self.child.iter_n_children(Some(&parent_iter)), cp)
            }
            None => (
                self.child.iter_n_children(None),
                TreePath::from_indices(vec![offset]),
            ),
        };

        let child_iter = self.child.iter(&child_path)?;
        if offset >= len || !self.is_visible(st, &child_iter) {
            return None;
        }
        Some(self.insert_elt_in_level(st, Some(child_iter), level, offset))
    }

    /// Handles a cached elt turning invisible while its row still exists
    /// in the child model: drops it from the visible sequence, emits
    /// row-deleted, and decides what of the surrounding cache survives.
    fn remove_elt_from_level(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        level: LevelId,
        elt: EltId,
    ) {
        let orig_ext = st.levels[level].ext_ref_count;
        let parent = st.levels[level].parent;
        let path = if parent.is_none() || orig_ext > 0 {
            self.path_of_elt_visible(st, level, elt)
        } else {
            None
        };

        self.make_invisible(st, level, elt);

        let emit_child_toggled = st.root != Some(level)
            && st.levels[level].visible.is_empty()
            && parent.map_or(false, |(_, pe)| st.elts[pe].visible);

        // the client has been told the row is gone; its references will
        // not come back
        while st.elts[elt].ext_ref_count > 0 {
            self.real_unref(st, level, elt, true, true);
        }

        if st.levels[level].seq.len() > 1 {
            if let Some(children) = st.elts[elt].children {
                self.free_level(st, queue, children, true, true, true);
            }
        } else {
            // single-sibling level: decide whether it survives at all
            let keep = st.root == Some(level)
                || parent.map_or(false, |(pl, _)| {
                    st.root == Some(pl) || st.levels[pl].ext_ref_count > 0
                });
            if !keep {
                self.free_level(st, queue, level, true, true, true);
            } else if st.root != Some(level) {
                if let Some(children) = st.elts[elt].children {
                    self.free_level(st, queue, children, true, true, true);
                }
            } else if let Some(children) = st.elts[elt].children {
                self.prune_level(st, queue, children);
            }
        }

        self.increment_stamp(st, queue);

        if let Some(path) = path {
            queue.push(Pending::Deleted { path });
        }

        if emit_child_toggled {
            if let Some((pl, pe)) = parent {
                if st.elts[pe].ext_ref_count > 0 {
                    if let Some(ppath) = self.path_of_elt_visible(st, pl, pe) {
                        queue.push(Pending::HasChildToggled {
                            path: ppath,
                            level: pl,
                            elt: pe,
                            guard: false,
                        });
                    }
                }
            }
        }
    }

    /// Builds the child level of a newly visible elt when monitoring is
    /// required, announcing the appearance of children to the client.
    fn update_children(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        level: LevelId,
        elt: EltId,
    ) {
        if !st.elts[elt].visible {
            return;
        }
        let child_iter = match self.child_iter_for(st, level, elt) {
            Some(it) => it,
            None => return,
        };

        let parent_observed = match st.levels[level].parent {
            None => true,
            Some((pl, _)) => st.levels[pl].ext_ref_count > 0,
        };
        if !parent_observed || !self.child.iter_has_child(&child_iter) {
            return;
        }

        if st.elts[elt].children.is_none() {
            self.build_level(st, queue, Some((level, elt)), false);
        }

        if st.elts[elt].ext_ref_count > 0 {
            if let Some(children) = st.elts[elt].children {
                if !st.levels[children].seq.is_empty() {
                    if let Some(path) = self.path_of_elt_visible(st, level, elt) {
                        queue.push(Pending::HasChildToggled {
                            path,
                            level,
                            elt,
                            guard: false,
                        });
                    }
                }
            }
        }
    }

    /// Walks every ancestor of a mutated row and reconciles visibility
    /// states that may have flipped as a side effect.
    fn check_ancestors(&self, st: &mut FilterState, queue: &mut Vec<Pending>, rel_path: &TreePath) {
        let Some(mut level) = st.root else { return };
        let vroot = st.virtual_root.clone();
        let abs_prefix = |prefix: &[usize]| -> TreePath {
            let rel = TreePath::from_indices(prefix.to_vec());
            match &vroot {
                Some(root) => TreePath::concat(root, &rel),
                None => rel,
            }
        };

        let indices = rel_path.indices().to_vec();
        let mut i = 0;
        while i + 1 < indices.len() {
            let offset = indices[i];
            let child_path = abs_prefix(&indices[..=i]);
            let Some(child_iter) = self.child.iter(&child_path) else {
                return;
            };
            let requested = self.is_visible(st, &child_iter);
            let found = position_of_offset(&st.elts, &st.levels[level].seq, offset)
                .map(|p| st.levels[level].seq[p]);

            let elt = match found {
                None => {
                    if !requested {
                        return;
                    }
                    // ancestor not cached and should now be visible:
                    // report it exactly like a fresh insertion
                    let (elt, _) = self.insert_elt_in_level(st, Some(child_iter), level, offset);
                    self.make_visible(st, level, elt);
                    self.emit_row_inserted_for_path(st, queue, &child_path, Some(&child_iter));
                    return;
                }
                Some(elt) => elt,
            };

            if st.elts[elt].visible {
                if !requested {
                    // the ancestor turned invisible, which hides this
                    // whole branch; no point looking further up
                    self.remove_elt_from_level(st, queue, level, elt);
                    return;
                }
                // visible and staying visible, continue up the chain
            } else if requested {
                self.make_visible(st, level, elt);
                match st.levels[level].parent {
                    Some((pl, pe)) => {
                        if let Some(ppath) = self.path_of_elt_visible(st, pl, pe) {
                            queue.push(Pending::HasChildToggled {
                                path: ppath,
                                level: pl,
                                elt: pe,
                                guard: false,
                            });
                        }
                    }
                    None => {
                        self.emit_row_inserted_for_path(st, queue, &child_path, Some(&child_iter));
                    }
                }
                return;
            } else {
                // invisible and staying invisible
                return;
            }

            let Some(children) = st.elts[elt].children else {
                // children of this elt are not monitored; their signals
                // would be ignored anyway
                return;
            };
            level = children;
            i += 1;
        }
    }

    /// Makes the row at `child_path` visible in the cache and stages the
    /// row-inserted (plus parent toggle / child monitoring) that a client
    /// must see.
    fn emit_row_inserted_for_path(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        child_path: &TreePath,
        child_iter: Option<&TreeIter>,
    ) {
        let mut signals_emitted = false;
        if st.root.is_none() {
            // first exposure of the root level announces every visible row
            self.build_level(st, queue, None, true);
            if let Some(root) = st.root {
                if !st.levels[root].visible.is_empty() {
                    signals_emitted = true;
                }
            }
        }

        self.increment_stamp(st, queue);

        let Some((level, elt)) = self.real_convert(st, queue, child_path, false, true) else {
            // parent is being filtered out
            return;
        };

        if !st.elts[elt].visible {
            self.make_visible(st, level, elt);
        }

        if !self.elt_is_visible_in_target(st, level, elt) {
            return;
        }

        let level_observed =
            st.levels[level].parent.is_none() || st.levels[level].ext_ref_count > 0;
        if let Some(path) = self.path_of_elt_visible(st, level, elt) {
            if !signals_emitted && level_observed {
                queue.push(Pending::Inserted { path, level, elt });
            }
        }

        if let Some((pl, pe)) = st.levels[level].parent {
            if st.elts[pe].ext_ref_count > 0 && st.levels[level].visible.len() == 1 {
                // first visible child: the parent's has-child state flipped
                if let Some(ppath) = self.path_of_elt_visible(st, pl, pe) {
                    queue.push(Pending::HasChildToggled {
                        path: ppath,
                        level: pl,
                        elt: pe,
                        guard: false,
                    });
                }
            }
        }

        let has_children = match child_iter {
            Some(ci) => self.child.iter_has_child(ci),
            None => self
                .child
                .iter(child_path)
                .map_or(false, |ci| self.child.iter_has_child(&ci)),
        };
        if !signals_emitted && has_children {
            self.update_children(st, queue, level, elt);
        }
    }

    // ---- lookups and conversions ----

    /// Walks cached levels matching child offsets along `rel_path`.
    fn find_elt_by_offsets(
        &self,
        st: &FilterState,
        rel_path: &TreePath,
    ) -> Option<(LevelId, EltId)> {
        let mut level = st.root?;
        let mut found = None;
        for (i, &offset) in rel_path.indices().iter().enumerate() {
            let pos = position_of_offset(&st.elts, &st.levels[level].seq, offset)?;
            let elt = st.levels[level].seq[pos];
            found = Some((level, elt));
            if i + 1 < rel_path.depth() {
                level = st.elts[elt].children?;
            }
        }
        found
    }

    /// Resolves a child-model path against the cache. `build_levels`
    /// materializes missing levels on the way down, `fetch_children`
    /// pulls in not-yet-cached elts (visible ones only).
    fn real_convert(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        child_path: &TreePath,
        build_levels: bool,
        fetch_children: bool,
    ) -> Option<(LevelId, EltId)> {
        let rel = match &st.virtual_root {
            Some(root) => child_path.strip_prefix(root)?,
            None => child_path.clone(),
        };
        if rel.depth() == 0 {
            return None;
        }

        if st.root.is_none() && build_levels {
            self.build_level(st, queue, None, false);
        }

        let mut level_opt = st.root;
        let mut result = None;
        for (i, &offset) in rel.indices().iter().enumerate() {
            let level = level_opt?;
            let elt = match position_of_offset(&st.elts, &st.levels[level].seq, offset) {
                Some(pos) => st.levels[level].seq[pos],
                None => {
                    if !fetch_children {
                        return None;
                    }
                    let (elt, _) = self.fetch_child(st, level, offset)?;
                    elt
                }
            };
            if st.elts[elt].children.is_none() && build_levels {
                self.build_level(st, queue, Some((level, elt)), false);
            }
            result = Some((level, elt));
            if i + 1 < rel.depth() {
                level_opt = st.elts[elt].children;
            }
        }
        result
    }

    fn path_to_child_path_in(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        path: &TreePath,
    ) -> Option<TreePath> {
        if path.depth() == 0 {
            return None;
        }
        if st.root.is_none() {
            self.build_level(st, queue, None, false);
        }
        let mut level = st.root?;
        let mut rel = TreePath::new();
        for (i, &idx) in path.indices().iter().enumerate() {
            let elt = *st.levels[level].visible.get(idx)?;
            rel.append_index(st.elts[elt].offset);
            if i + 1 < path.depth() {
                if st.elts[elt].children.is_none() {
                    self.build_level(st, queue, Some((level, elt)), false);
                }
                level = st.elts[elt].children?;
            }
        }
        Some(match &st.virtual_root {
            Some(root) => TreePath::concat(root, &rel),
            None => rel,
        })
    }

    fn iter_in(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        path: &TreePath,
    ) -> Option<TreeIter> {
        if path.depth() == 0 {
            return None;
        }
        if st.root.is_none() {
            self.build_level(st, queue, None, false);
        }
        let mut level = st.root?;
        let mut result = None;
        for (i, &idx) in path.indices().iter().enumerate() {
            let elt = *st.levels[level].visible.get(idx)?;
            if i + 1 < path.depth() {
                if st.elts[elt].children.is_none() {
                    self.build_level(st, queue, Some((level, elt)), false);
                }
                level = st.elts[elt].children?;
            } else {
                result = Some(self.make_iter(st, level, elt));
            }
        }
        result
    }

    // ---- stamp and cache eviction ----

    fn increment_stamp(&self, st: &mut FilterState, queue: &mut Vec<Pending>) {
        st.stamp = st.stamp.wrapping_add(1);
        if st.stamp == 0 {
            st.stamp = 1;
        }
        self.clear_cache_in(st, queue);
    }

    fn clear_cache_in(&self, st: &mut FilterState, queue: &mut Vec<Pending>) {
        if st.zero_ref_count > 0 {
            if let Some(root) = st.root {
                self.clear_cache_helper(st, queue, root);
            }
        }
    }

    fn clear_cache_helper(&self, st: &mut FilterState, queue: &mut Vec<Pending>, level: LevelId) {
        for &elt in &st.levels[level].seq.clone() {
            if st.elts.contains(elt) && st.elts[elt].zero_ref_count > 0 {
                if let Some(children) = st.elts[elt].children {
                    self.clear_cache_helper(st, queue, children);
                }
            }
        }

        // An unobserved level may still be monitoring for a parent whose
        // visibility depends on it; only evict when the parent level is
        // unobserved too. Levels directly under the root stay cached.
        if !st.levels.contains(level) || st.levels[level].ext_ref_count > 0 {
            return;
        }
        if st.root == Some(level) {
            return;
        }
        if let Some((pl, _)) = st.levels[level].parent {
            if st.root != Some(pl) && st.levels[pl].ext_ref_count == 0 {
                self.free_level(st, queue, level, true, true, false);
            }
        }
    }

    // ---- signal handlers (child model coordinates in, ours out) ----

    fn handle_row_changed(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        c_path: &TreePath,
        c_iter: &TreeIter,
    ) {
        let rel_path = match &st.virtual_root {
            Some(root) => match c_path.strip_prefix(root) {
                Some(p) => p,
                // at, above, or outside the virtual root
                None => return,
            },
            None => c_path.clone(),
        };

        let requested = self.is_visible(st, c_iter);
        let found = self.real_convert(st, queue, c_path, false, false);
        let current = found.map_or(false, |(_, elt)| st.elts[elt].visible);

        if !current && !requested {
            return;
        }

        if current && !requested {
            if let Some((level, elt)) = found {
                self.remove_elt_from_level(st, queue, level, elt);
            }
            self.check_ancestors(st, queue, &rel_path);
            return;
        }

        if current && requested {
            if let Some((level, elt)) = found {
                if self.elt_is_visible_in_target(st, level, elt) {
                    if st.levels[level].ext_ref_count > 0 {
                        if let Some(path) = self.path_of_elt_visible(st, level, elt) {
                            queue.push(Pending::Changed { path, level, elt });
                        }
                    }
                    // a value change can reveal or hide grandchildren
                    if self.child.iter_has_child(c_iter) {
                        self.update_children(st, queue, level, elt);
                    }
                }
            }
            self.check_ancestors(st, queue, &rel_path);
            return;
        }

        // invisible before, visible now: pull the row in
        self.check_ancestors(st, queue, &rel_path);
        self.emit_row_inserted_for_path(st, queue, c_path, Some(c_iter));
    }

    fn handle_row_inserted(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        c_path: &TreePath,
        c_iter: &TreeIter,
    ) {
        // the row is already in; fix the virtual root first
        if let Some(vroot) = &mut st.virtual_root {
            shift_for_insert(vroot, c_path);
        }

        let rel_path = match &st.virtual_root {
            Some(root) => c_path.strip_prefix(root),
            None => Some(c_path.clone()),
        };

        let mut emit = false;
        'cache: {
            let Some(rel) = &rel_path else { break 'cache };

            if st.root.is_none() {
                // the root level announces everything itself when first built
                self.build_level(st, queue, None, true);
                if st.root.is_some() {
                    break 'cache;
                }
            }

            let (parent, level) = if rel.depth() >= 2 {
                let mut parent_path = rel.clone();
                parent_path.up();
                match self.find_elt_by_offsets(st, &parent_path) {
                    Some((pl, pe)) => (Some((pl, pe)), st.elts[pe].children),
                    // parent not cached, probably filtered out
                    None => break 'cache,
                }
            } else {
                (None, st.root)
            };

            let Some(level) = level else {
                // the target level is unbuilt; a visible parent may now
                // report children where it had none
                if let Some((pl, pe)) = parent {
                    if st.elts[pe].visible {
                        if let Some(ppath) = self.path_of_elt_visible(st, pl, pe) {
                            queue.push(Pending::HasChildToggled {
                                path: ppath,
                                level: pl,
                                elt: pe,
                                guard: false,
                            });
                        }
                    }
                }
                break 'cache;
            };

            let Some(&offset) = rel.indices().last() else {
                break 'cache;
            };
            increase_offsets(&mut st.elts, &st.levels[level].seq.clone(), offset);

            if self.is_visible(st, c_iter) {
                let (elt, _) = self.insert_elt_in_level(st, Some(*c_iter), level, offset);
                self.make_visible(st, level, elt);
                emit = true;
            }
        }

        if let Some(rel) = &rel_path {
            self.check_ancestors(st, queue, rel);
        }
        if emit {
            self.emit_row_inserted_for_path(st, queue, c_path, Some(c_iter));
        }
    }

    fn handle_row_has_child_toggled(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        c_path: &TreePath,
        c_iter: &TreeIter,
    ) {
        if st.root.is_none() {
            if let Some(vroot) = &st.virtual_root {
                if vroot == c_path {
                    // the virtual root grew its first children
                    self.build_level(st, queue, None, true);
                    return;
                }
            }
        }

        let Some((level, elt)) = self.real_convert(st, queue, c_path, false, true) else {
            return;
        };

        let requested = self.is_visible(st, c_iter);
        if !st.elts[elt].visible && !requested {
            return;
        }
        if st.elts[elt].visible && !requested {
            self.remove_elt_from_level(st, queue, level, elt);
            return;
        }
        if !st.elts[elt].visible && requested {
            self.make_visible(st, level, elt);
            if self.elt_is_visible_in_target(st, level, elt) {
                if let Some(path) = self.path_of_elt_visible(st, level, elt) {
                    queue.push(Pending::Inserted { path, level, elt });
                }
            }
        }

        // referenced nodes with fresh children need their level built so
        // visibility changes driven from below keep arriving
        if st.elts[elt].ref_count > 1
            && st.elts[elt].children.is_none()
            && self.child.iter_has_child(c_iter)
        {
            self.build_level(st, queue, Some((level, elt)), false);
        }

        if let Some(path) = self.path_of_elt_visible(st, level, elt) {
            queue.push(Pending::HasChildToggled {
                path,
                level,
                elt,
                guard: false,
            });
        }
    }

    fn handle_row_deleted(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        c_path: &TreePath,
    ) {
        if let Some(vroot) = st.virtual_root.clone() {
            if c_path.is_ancestor_of(&vroot) || *c_path == vroot {
                self.handle_virtual_root_deleted(st, queue, &vroot, c_path);
                return;
            }
        }
        if let Some(vroot) = &mut st.virtual_root {
            shift_for_delete(vroot, c_path);
        }

        let found = self.real_convert(st, queue, c_path, false, false);
        let Some((level, elt)) = found else {
            self.row_deleted_uncached(st, c_path);
            return;
        };

        let offset = st.elts[elt].offset;
        let orig_ext = st.levels[level].ext_ref_count;
        let parent = st.levels[level].parent;

        let mut deleted_path = None;
        let mut emit_child_toggled = None;
        if st.elts[elt].visible {
            deleted_path = self.path_of_elt_visible(st, level, elt);
            if st.levels[level].visible.len() == 1 {
                emit_child_toggled = parent;
            }
        }

        // the row no longer exists in the child model, so references are
        // released without propagating
        while st.elts[elt].ext_ref_count > 0 {
            self.real_unref(st, level, elt, true, false);
        }
        if st.elts[elt].children.is_some() {
            // the child level's reference on this elt dies with the level
            while st.elts[elt].ref_count > 1 {
                self.real_unref(st, level, elt, false, false);
            }
        } else {
            while st.elts[elt].ref_count > 0 {
                self.real_unref(st, level, elt, false, false);
            }
        }

        if st.levels[level].seq.len() == 1 {
            self.free_level(st, queue, level, false, true, false);
        } else {
            let was_first = st.levels[level].seq[0] == elt;
            if let Some(children) = st.elts[elt].children {
                self.free_level(st, queue, children, false, false, false);
            }
            self.make_invisible(st, level, elt);
            if let Some(pos) = position_of_offset(&st.elts, &st.levels[level].seq, offset) {
                st.levels[level].seq.remove(pos);
            }
            decrease_offsets(&mut st.elts, &st.levels[level].seq.clone(), offset);
            st.elts.remove(elt);
            if was_first {
                let head = st.levels[level].seq[0];
                self.real_ref(st, level, head, false);
            }
        }

        if deleted_path.is_some() {
            self.increment_stamp(st, queue);
            if parent.is_none() || orig_ext > 0 {
                if let Some(path) = deleted_path {
                    queue.push(Pending::Deleted { path });
                }
            }
        }

        if let Some((pl, pe)) = emit_child_toggled {
            if st.levels.contains(pl) && st.elts.contains(pe) {
                if let Some(ppath) = self.path_of_elt_visible(st, pl, pe) {
                    queue.push(Pending::HasChildToggled {
                        path: ppath,
                        level: pl,
                        elt: pe,
                        guard: true,
                    });
                }
            }
        }

        let rel = match &st.virtual_root {
            Some(root) => c_path.strip_prefix(root),
            None => Some(c_path.clone()),
        };
        if let Some(rel) = rel {
            self.check_ancestors(st, queue, &rel);
        }
    }

    /// The deleted row was not cached: only the stored offsets of its
    /// cached siblings need fixing.
    fn row_deleted_uncached(&self, st: &mut FilterState, c_path: &TreePath) {
        if st.root.is_none() {
            return;
        }
        let rel = match &st.virtual_root {
            Some(root) => match c_path.strip_prefix(root) {
                Some(p) => p,
                None => return,
            },
            None => c_path.clone(),
        };
        if rel.depth() == 0 {
            return;
        }

        let level = if rel.depth() >= 2 {
            let mut parent_path = rel.clone();
            parent_path.up();
            match self.find_elt_by_offsets(st, &parent_path) {
                Some((_, pe)) => st.elts[pe].children,
                None => return,
            }
        } else {
            st.root
        };
        let Some(level) = level else { return };
        let Some(&offset) = rel.indices().last() else {
            return;
        };
        decrease_offsets(&mut st.elts, &st.levels[level].seq.clone(), offset);
    }

    /// The virtual root or one of its ancestors is gone: all our content
    /// disappears. Every previously visible top-level row is reported
    /// deleted at position 0 (each removal shifts the rest down).
    fn handle_virtual_root_deleted(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        vroot: &TreePath,
        c_path: &TreePath,
    ) {
        // release constructor references on the surviving ancestors only
        let mut p = vroot.clone();
        while p.depth() > 0 {
            if p.depth() < c_path.depth() {
                if let Some(iter) = self.child.iter(&p) {
                    self.child.unref_node(&iter);
                }
            }
            p.up();
        }
        st.virtual_root_deleted = true;

        let Some(root) = st.root else { return };
        let visible_rows = st.levels[root].visible.len();

        // unrefs must not propagate; the child rows are already gone
        self.free_level(st, queue, root, false, true, false);
        self.increment_stamp(st, queue);

        let first = TreePath::first();
        for _ in 0..visible_rows {
            queue.push(Pending::Deleted { path: first.clone() });
        }
    }

    fn handle_rows_reordered(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        c_path: &TreePath,
        c_iter: Option<&TreeIter>,
        new_order: &[usize],
    ) {
        let (level, parent) = if c_path.depth() == 0 {
            if let Some(vroot) = &mut st.virtual_root {
                // only our anchor among the reordered top level matters
                let anchor = vroot.indices()[0];
                if let Some(new_pos) = new_order.iter().position(|&o| o == anchor) {
                    vroot.indices_mut()[0] = new_pos;
                }
                return;
            }
            (st.root, None)
        } else {
            if let Some(vroot) = st.virtual_root.clone() {
                if c_path.is_ancestor_of(&vroot) {
                    let depth = c_path.depth();
                    let anchor = vroot.indices()[depth];
                    if let Some(new_pos) = new_order.iter().position(|&o| o == anchor) {
                        if let Some(vroot) = &mut st.virtual_root {
                            vroot.indices_mut()[depth] = new_pos;
                        }
                    }
                    return;
                }
            }
            match self.real_convert(st, queue, c_path, false, false) {
                Some((pl, pe)) => match st.elts[pe].children {
                    Some(children) => (Some(children), Some((pl, pe))),
                    None => return,
                },
                None => match &st.virtual_root {
                    // a reorder directly under the virtual root hits our
                    // root level
                    Some(vroot) if vroot == c_path => (st.root, None),
                    _ => return,
                },
            }
        };
        let _ = c_iter;

        let Some(level) = level else { return };
        if st.levels[level].seq.is_empty() {
            return;
        }

        let old_first = st.levels[level].seq[0];
        let old_visible_pos: std::collections::HashMap<EltId, usize> = st.levels[level]
            .visible
            .iter()
            .enumerate()
            .map(|(pos, &id)| (id, pos))
            .collect();

        let mut old_seq = std::mem::take(&mut st.levels[level].seq);
        let mut new_seq = Vec::with_capacity(old_seq.len());
        let mut order_out = Vec::new();
        for (new_offset, &old_offset) in new_order.iter().enumerate() {
            if let Some(pos) = position_of_offset(&st.elts, &old_seq, old_offset) {
                let elt = old_seq.remove(pos);
                if st.elts[elt].visible {
                    if let Some(&vp) = old_visible_pos.get(&elt) {
                        order_out.push(vp);
                    }
                }
                st.elts[elt].offset = new_offset;
                new_seq.push(elt);
            }
        }
        if !old_seq.is_empty() {
            warn!(
                leftover = old_seq.len(),
                "reorder permutation did not cover every cached offset"
            );
            new_seq.extend(old_seq);
        }
        st.levels[level].seq = new_seq;

        let mut visible = std::mem::take(&mut st.levels[level].visible);
        visible.sort_by_key(|&id| st.elts[id].offset);
        st.levels[level].visible = visible;

        if st.levels[level].seq.first() != Some(&old_first) {
            let new_first = st.levels[level].seq[0];
            self.transfer_first_ref(st, level, old_first, new_first);
        }

        if !st.levels[level].visible.is_empty() && !order_out.is_empty() {
            match parent {
                None => queue.push(Pending::Reordered {
                    path: TreePath::new(),
                    parent: None,
                    order: order_out,
                }),
                Some((pl, pe)) => {
                    if let Some(ppath) = self.path_of_elt_visible(st, pl, pe) {
                        queue.push(Pending::Reordered {
                            path: ppath,
                            parent: Some((pl, pe)),
                            order: order_out,
                        });
                    }
                }
            }
        }
    }

    // ---- staged emission ----

    fn try_iter(&self, level: LevelId, elt: EltId) -> Option<TreeIter> {
        let st = self.state.borrow();
        if st.levels.contains(level) && st.elts.contains(elt) {
            Some(self.make_iter(&st, level, elt))
        } else {
            None
        }
    }

    fn drain(&self, queue: Vec<Pending>) {
        for pending in queue {
            match pending {
                Pending::Changed { path, level, elt } => {
                    if let Some(iter) = self.try_iter(level, elt) {
                        self.emitter.emit_row_changed(&path, &iter);
                    }
                }
                Pending::Inserted { path, level, elt } => {
                    if let Some(iter) = self.try_iter(level, elt) {
                        self.emitter.emit_row_inserted(&path, &iter);
                    }
                }
                Pending::HasChildToggled {
                    path,
                    level,
                    elt,
                    guard,
                } => {
                    if let Some(iter) = self.try_iter(level, elt) {
                        if guard {
                            self.state.borrow_mut().in_row_deleted = true;
                        }
                        self.emitter.emit_row_has_child_toggled(&path, &iter);
                        if guard {
                            self.state.borrow_mut().in_row_deleted = false;
                        }
                    }
                }
                Pending::Deleted { path } => {
                    self.emitter.emit_row_deleted(&path);
                }
                Pending::Reordered {
                    path,
                    parent,
                    order,
                } => {
                    let iter = parent.and_then(|(l, e)| self.try_iter(l, e));
                    self.emitter.emit_rows_reordered(&path, iter.as_ref(), &order);
                }
            }
        }
    }
}

impl TreeModelObserver for FilterModel {
    fn row_changed(&self, path: &TreePath, iter: &TreeIter) {
        let mut queue = Vec::new();
        {
            let mut st = self.state.borrow_mut();
            self.handle_row_changed(&mut st, &mut queue, path, iter);
        }
        self.drain(queue);
    }

    fn row_inserted(&self, path: &TreePath, iter: &TreeIter) {
        let mut queue = Vec::new();
        {
            let mut st = self.state.borrow_mut();
            self.handle_row_inserted(&mut st, &mut queue, path, iter);
        }
        self.drain(queue);
    }

    fn row_has_child_toggled(&self, path: &TreePath, iter: &TreeIter) {
        let mut queue = Vec::new();
        {
            let mut st = self.state.borrow_mut();
            self.handle_row_has_child_toggled(&mut st, &mut queue, path, iter);
        }
        self.drain(queue);
    }

    fn row_deleted(&self, path: &TreePath) {
        let mut queue = Vec::new();
        {
            let mut st = self.state.borrow_mut();
            self.handle_row_deleted(&mut st, &mut queue, path);
        }
        self.drain(queue);
    }

    fn rows_reordered(&self, path: &TreePath, iter: Option<&TreeIter>, new_order: &[usize]) {
        let mut queue = Vec::new();
        {
            let mut st = self.state.borrow_mut();
            self.handle_rows_reordered(&mut st, &mut queue, path, iter, new_order);
        }
        self.drain(queue);
    }
}

impl TreeModel for FilterModel {
    fn flags(&self) -> ModelFlags {
        ModelFlags {
            iters_persist: false,
            list_only: self.child.flags().list_only,
        }
    }

    fn n_columns(&self) -> usize {
        self.child.n_columns()
    }

    fn column_type(&self, column: usize) -> ColumnType {
        self.child.column_type(column)
    }

    fn iter(&self, path: &TreePath) -> Option<TreeIter> {
        let mut queue = Vec::new();
        let result = {
            let mut st = self.state.borrow_mut();
            self.iter_in(&mut st, &mut queue, path)
        };
        self.drain(queue);
        result
    }

    fn path(&self, iter: &TreeIter) -> Option<TreePath> {
        let st = self.state.borrow();
        let (level, elt) = self.ids_of(&st, iter)?;
        self.path_of_elt_visible(&st, level, elt)
    }

    fn value(&self, iter: &TreeIter, column: usize) -> Value {
        let child_iter = {
            let st = self.state.borrow();
            self.ids_of(&st, iter)
                .and_then(|(level, elt)| self.child_iter_for(&st, level, elt))
        };
        match child_iter {
            Some(ci) => self.child.value(&ci, column),
            None => Value::Null,
        }
    }

    fn iter_next(&self, iter: &TreeIter) -> Option<TreeIter> {
        let st = self.state.borrow();
        let (level, elt) = self.ids_of(&st, iter)?;
        if !st.elts[elt].visible {
            return None;
        }
        let pos = position_of_offset(&st.elts, &st.levels[level].visible, st.elts[elt].offset)?;
        let next = *st.levels[level].visible.get(pos + 1)?;
        Some(self.make_iter(&st, level, next))
    }

    fn iter_previous(&self, iter: &TreeIter) -> Option<TreeIter> {
        let st = self.state.borrow();
        let (level, elt) = self.ids_of(&st, iter)?;
        if !st.elts[elt].visible {
            return None;
        }
        let pos = position_of_offset(&st.elts, &st.levels[level].visible, st.elts[elt].offset)?;
        if pos == 0 {
            return None;
        }
        let prev = st.levels[level].visible[pos - 1];
        Some(self.make_iter(&st, level, prev))
    }

    fn iter_children(&self, parent: Option<&TreeIter>) -> Option<TreeIter> {
        let mut queue = Vec::new();
        let result = {
            let mut st = self.state.borrow_mut();
            self.iter_children_in(&mut st, &mut queue, parent)
        };
        self.drain(queue);
        result
    }

    fn iter_has_child(&self, iter: &TreeIter) -> bool {
        self.iter_n_children(Some(iter)) > 0
    }

    fn iter_n_children(&self, iter: Option<&TreeIter>) -> usize {
        let mut queue = Vec::new();
        let result = {
            let mut st = self.state.borrow_mut();
            self.n_children_in(&mut st, &mut queue, iter)
        };
        self.drain(queue);
        result
    }

    fn iter_nth_child(&self, parent: Option<&TreeIter>, n: usize) -> Option<TreeIter> {
        let mut queue = Vec::new();
        let result = {
            let mut st = self.state.borrow_mut();
            let first = self.iter_children_in(&mut st, &mut queue, parent)?;
            let (level, _) = self.ids_of(&st, &first)?;
            let elt = *st.levels[level].visible.get(n)?;
            Some(self.make_iter(&st, level, elt))
        };
        self.drain(queue);
        result
    }

    fn iter_parent(&self, child: &TreeIter) -> Option<TreeIter> {
        let st = self.state.borrow();
        let (level, _) = self.ids_of(&st, child)?;
        let (pl, pe) = st.levels[level].parent?;
        Some(self.make_iter(&st, pl, pe))
    }

    fn ref_node(&self, iter: &TreeIter) {
        let mut st = self.state.borrow_mut();
        if let Some((level, elt)) = self.ids_of(&st, iter) {
            self.real_ref(&mut st, level, elt, true);
        }
    }

    fn unref_node(&self, iter: &TreeIter) {
        let mut st = self.state.borrow_mut();
        if let Some((level, elt)) = self.ids_of(&st, iter) {
            self.real_unref(&mut st, level, elt, true, true);
        }
    }

    fn connect(&self, observer: Weak<dyn TreeModelObserver>) -> ObserverId {
        self.emitter.connect(observer)
    }

    fn disconnect(&self, id: ObserverId) {
        self.emitter.disconnect(id);
    }
}

impl FilterModel {
    fn iter_children_in(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        parent: Option<&TreeIter>,
    ) -> Option<TreeIter> {
        match parent {
            None => {
                if st.root.is_none() {
                    self.build_level(st, queue, None, false);
                }
                let root = st.root?;
                let first = *st.levels[root].visible.first()?;
                Some(self.make_iter(st, root, first))
            }
            Some(parent) => {
                let (level, elt) = self.ids_of(st, parent)?;
                if st.elts[elt].children.is_none() {
                    self.build_level(st, queue, Some((level, elt)), false);
                }
                let children = st.elts[elt].children?;
                let first = *st.levels[children].visible.first()?;
                Some(self.make_iter(st, children, first))
            }
        }
    }

    fn n_children_in(
        &self,
        st: &mut FilterState,
        queue: &mut Vec<Pending>,
        iter: Option<&TreeIter>,
    ) -> usize {
        match iter {
            None => {
                if st.root.is_none() {
                    self.build_level(st, queue, None, false);
                }
                match st.root {
                    Some(root) => st.levels[root].visible.len(),
                    None => 0,
                }
            }
            Some(iter) => {
                let Some((level, elt)) = self.ids_of(st, iter) else {
                    return 0;
                };
                if !st.elts[elt].visible {
                    return 0;
                }
                if st.elts[elt].children.is_none() {
                    let has_child = self
                        .child_iter_for(st, level, elt)
                        .map_or(false, |ci| self.child.iter_has_child(&ci));
                    if has_child {
                        self.build_level(st, queue, Some((level, elt)), false);
                    }
                }
                match st.elts[elt].children {
                    Some(children) => st.levels[children].visible.len(),
                    None => 0,
                }
            }
        }
    }
}

impl Drop for FilterModel {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.child.disconnect(id);
        }

        let mut queue = Vec::new();
        let mut st = self.state.borrow_mut();

        if let Some(vroot) = st.virtual_root.clone() {
            if !st.virtual_root_deleted {
                let mut p = vroot;
                while p.depth() > 0 {
                    if let Some(iter) = self.child.iter(&p) {
                        self.child.unref_node(&iter);
                    }
                    p.up();
                }
            }
        }

        if let Some(root) = st.root {
            self.free_level(&mut st, &mut queue, root, true, true, false);
        }
        // queued signals die with the model; nobody can observe it anymore
    }
}
