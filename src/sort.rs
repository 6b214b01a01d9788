//! The sorting proxy model.
//!
//! `SortModel` wraps a child `TreeModel` and re-exposes the same tree with
//! every sibling group held in comparator order. Unlike the filtering
//! proxy there is no visibility concept: every child row is represented,
//! so each cache level keeps a single sequence, ordered by the active
//! comparator, with the child-model offset tracked per elt to map back.
//!
//! The active comparator is selected by a [`SortSource`]: a sort column
//! (with a registered function or the built-in by-value comparison), one
//! caller-supplied default function, or the unsorted state in which the
//! apparent order equals the child order. The ascending/descending flag is
//! applied by negating comparator results, never by reversing iteration,
//! so ties stay stable.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::arena::Arena;
use crate::path::TreePath;
use crate::traits::{
    ColumnType, ModelFlags, ObserverId, SignalEmitter, TreeIter, TreeModel, TreeModelObserver,
    Value,
};

type LevelId = u32;
type EltId = u32;

/// Comparator: child model and two cursors into it.
pub type SortFunc = Rc<dyn Fn(&dyn TreeModel, &TreeIter, &TreeIter) -> Ordering>;

/// Which comparator is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortSource {
    /// No comparator; sibling order mirrors the child model.
    Unsorted,
    /// Sort by a column, through its registered function or the built-in
    /// by-value comparison.
    Column(usize),
    /// Sort by the caller-supplied default function.
    Default,
}

/// Sort direction, applied by negating comparator results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

struct SortElt {
    /// Offset among the child model's siblings.
    offset: usize,
    child_iter: Option<TreeIter>,
    children: Option<LevelId>,
    ref_count: usize,
    /// Number of descendant levels with zero references.
    zero_ref_count: usize,
    /// Snapshot position, only meaningful during a re-sort.
    old_index: usize,
}

impl SortElt {
    fn new(offset: usize, child_iter: Option<TreeIter>) -> Self {
        Self {
            offset,
            child_iter,
            children: None,
            ref_count: 0,
            zero_ref_count: 0,
            old_index: 0,
        }
    }
}

struct SortLevel {
    /// Elts in comparator order.
    seq: Vec<EltId>,
    ref_count: usize,
    parent: Option<(LevelId, EltId)>,
}

impl SortLevel {
    fn new(parent: Option<(LevelId, EltId)>) -> Self {
        Self {
            seq: Vec::new(),
            ref_count: 0,
            parent,
        }
    }
}

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

struct SortState {
    levels: Arena<SortLevel>,
    elts: Arena<SortElt>,
    root: Option<LevelId>,
    stamp: u32,
    zero_ref_count: usize,
    child_flags: ModelFlags,
    source: SortSource,
    order: SortOrder,
    column_funcs: HashMap<usize, SortFunc>,
    default_func: Option<SortFunc>,
}

/// A `TreeModel` presenting a child model in sorted sibling order.
pub struct SortModel {
    child: Rc<dyn TreeModel>,
    state: RefCell<SortState>,
    emitter: SignalEmitter,
    subscription: Cell<Option<ObserverId>>,
}

impl SortModel {
    pub fn new(child: Rc<dyn TreeModel>) -> Rc<Self> {
        let child_flags = child.flags();
        let mut stamp: u32 = rand::random();
        if stamp == 0 {
            stamp = 1;
        }

        let model = Rc::new(SortModel {
            child: child.clone(),
            state: RefCell::new(SortState {
                levels: Arena::new(),
                elts: Arena::new(),
                root: None,
                stamp,
                zero_ref_count: 0,
                child_flags,
                source: SortSource::Unsorted,
                order: SortOrder::Ascending,
                column_funcs: HashMap::new(),
                default_func: None,
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

    pub fn sort_source(&self) -> SortSource {
        self.state.borrow().source
    }

    pub fn sort_order(&self) -> SortOrder {
        self.state.borrow().order
    }

    /// Registers a comparator for a column. Takes effect immediately if
    /// that column is the active sort source.
    pub fn set_sort_func(
        &self,
        column: usize,
        func: impl Fn(&dyn TreeModel, &TreeIter, &TreeIter) -> Ordering + 'static,
    ) {
        let resort = {
            let mut st = self.state.borrow_mut();
            st.column_funcs.insert(column, Rc::new(func));
            st.source == SortSource::Column(column)
        };
        if resort {
            self.resort();
        }
    }

    /// Sets the default comparator used by [`SortSource::Default`].
    pub fn set_default_sort_func(
        &self,
        func: impl Fn(&dyn TreeModel, &TreeIter, &TreeIter) -> Ordering + 'static,
    ) {
        let resort = {
            let mut st = self.state.borrow_mut();
            st.default_func = Some(Rc::new(func));
            st.source == SortSource::Default
        };
        if resort {
            self.resort();
        }
    }

    /// Activates sorting by `column` in the given direction. Columns
    /// without a registered function fall back to comparing the column
    /// values directly.
    pub fn set_sort_column(&self, column: usize, order: SortOrder) {
        {
            let mut st = self.state.borrow_mut();
            if st.source == SortSource::Column(column) && st.order == order {
                return;
            }
            st.source = SortSource::Column(column);
            st.order = order;
        }
        self.resort();
    }

    /// Activates the default comparator.
    pub fn set_default_sort(&self, order: SortOrder) {
        {
            let mut st = self.state.borrow_mut();
            if st.default_func.is_none() {
                warn!("no default sort function has been set");
                return;
            }
            st.source = SortSource::Default;
            st.order = order;
        }
        self.resort();
    }

    /// Returns to the unsorted state: sibling order mirrors the child
    /// model again.
    pub fn set_unsorted(&self) {
        {
            let mut st = self.state.borrow_mut();
            if st.source == SortSource::Unsorted {
                return;
            }
            st.source = SortSource::Unsorted;
            st.order = SortOrder::Ascending;
        }
        self.resort();
    }

    /// Re-sorts every built level, emitting one `rows_reordered` per level
    /// whose order actually changed.
    pub fn resort(&self) {
        let mut queue = Vec::new();
        {
            let mut st = self.state.borrow_mut();
            if let Some(root) = st.root {
                self.sort_level(&mut st, &mut queue, root, true, true);
            }
        }
        self.drain(queue);
    }

    /// Evicts cache levels that nothing references.
    pub fn clear_cache(&self) {
        let mut queue = Vec::new();
        {
            let mut st = self.state.borrow_mut();
            self.clear_cache_in(&mut st, &mut queue);
        }
        self.drain(queue);
    }

    /// Maps a child-model path into sorted coordinates.
    pub fn convert_child_path_to_path(&self, child_path: &TreePath) -> Option<TreePath> {
        let mut queue = Vec::new();
        let result = {
            let mut st = self.state.borrow_mut();
            self.convert_child_path_in(&mut st, &mut queue, child_path, true)
                .map(|(level, elt)| self.path_of_elt(&st, level, elt))
        };
        self.drain(queue);
        result
    }

    /// Maps a sorted path back to child-model coordinates.
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

    fn make_iter(&self, st: &SortState, level: LevelId, elt: EltId) -> TreeIter {
        TreeIter {
            stamp: st.stamp,
            slot: level as u64,
            slot2: elt as u64,
        }
    }

    fn ids_of(&self, st: &SortState, iter: &TreeIter) -> Option<(LevelId, EltId)> {
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

    fn seq_position(&self, st: &SortState, level: LevelId, elt: EltId) -> Option<usize> {
        st.levels[level].seq.iter().position(|&id| id == elt)
    }

    fn offset_position(&self, st: &SortState, level: LevelId, offset: usize) -> Option<usize> {
        st.levels[level]
            .seq
            .iter()
            .position(|&id| st.elts[id].offset == offset)
    }

    /// Path in sorted coordinates.
    fn path_of_elt(&self, st: &SortState, mut level: LevelId, mut elt: EltId) -> TreePath {
        let mut path = TreePath::new();
        loop {
            let pos = self.seq_position(st, level, elt).unwrap_or(0);
            path.prepend_index(pos);
            match st.levels[level].parent {
                Some((pl, pe)) => {
                    level = pl;
                    elt = pe;
                }
                None => break,
            }
        }
        path
    }

    /// Child-model path of a cached elt.
    fn elt_child_path(&self, st: &SortState, mut level: LevelId, mut elt: EltId) -> TreePath {
        let mut path = TreePath::new();
        loop {
            path.prepend_index(st.elts[elt].offset);
            match st.levels[level].parent {
                Some((pl, pe)) => {
                    level = pl;
                    elt = pe;
                }
                None => break,
            }
        }
        path
    }

    fn child_iter_for(&self, st: &SortState, level: LevelId, elt: EltId) -> Option<TreeIter> {
        if let Some(iter) = st.elts[elt].child_iter {
            return Some(iter);
        }
        let path = self.elt_child_path(st, level, elt);
        self.child.iter(&path)
    }

    // ---- comparators ----

    fn active_func(&self, st: &SortState) -> Option<SortFunc> {
        match st.source {
            SortSource::Unsorted => None,
            SortSource::Column(column) => Some(
                st.column_funcs
                    .get(&column)
                    .cloned()
                    .unwrap_or_else(|| builtin_column_cmp(column)),
            ),
            SortSource::Default => st.default_func.clone(),
        }
    }

    /// Compares two elts with the active comparator (offsets when
    /// unsorted), applying the direction by negation.
    fn cmp_elts(&self, st: &SortState, level: LevelId, a: EltId, b: EltId) -> Ordering {
        let result = match self.active_func(st) {
            Some(func) => {
                let ia = self.child_iter_for(st, level, a);
                let ib = self.child_iter_for(st, level, b);
                match (ia, ib) {
                    (Some(ia), Some(ib)) => func(&*self.child, &ia, &ib),
                    _ => Ordering::Equal,
                }
            }
            None => st.elts[a].offset.cmp(&st.elts[b].offset),
        };
        match st.order {
            SortOrder::Ascending => result,
            SortOrder::Descending => result.reverse(),
        }
    }

    /// Comparator-correct insertion position for `elt` in `level`.
    fn insertion_position(&self, st: &SortState, level: LevelId, elt: EltId) -> usize {
        let seq = &st.levels[level].seq;
        seq.partition_point(|&other| self.cmp_elts(st, level, other, elt) != Ordering::Greater)
    }

    // ---- reference counting ----

    fn real_ref(&self, st: &mut SortState, level: LevelId, elt: EltId) {
        if let Some(child_iter) = self.child_iter_for(st, level, elt) {
            self.child.ref_node(&child_iter);
        }

        st.elts[elt].ref_count += 1;
        st.levels[level].ref_count += 1;

        if st.levels[level].ref_count == 1 {
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

    fn real_unref(&self, st: &mut SortState, level: LevelId, elt: EltId, propagate: bool) {
        if propagate {
            if let Some(child_iter) = self.child_iter_for(st, level, elt) {
                self.child.unref_node(&child_iter);
            }
        }

        if st.elts[elt].ref_count == 0 {
            warn!("unref of a node with no matching reference");
            return;
        }

        st.elts[elt].ref_count -= 1;
        st.levels[level].ref_count -= 1;

        if st.levels[level].ref_count == 0 {
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

    // ---- level construction and teardown ----

    fn build_level(
        &self,
        st: &mut SortState,
        queue: &mut Vec<Pending>,
        parent: Option<(LevelId, EltId)>,
    ) {
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
            None => {
                let first = match self.child.iter_children(None) {
                    Some(it) => it,
                    None => return,
                };
                (first, self.child.iter_n_children(None))
            }
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
                self.real_ref(st, pl, pe);
                (first, len)
            }
        };

        if len == 0 {
            warn!("child model reported children but yields none");
            return;
        }

        let level = st.levels.insert(SortLevel::new(parent));
        match parent {
            Some((_, pe)) => st.elts[pe].children = Some(level),
            None => st.root = Some(level),
        }

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
        loop {
            let elt = st
                .elts
                .insert(SortElt::new(offset, cache_iters.then_some(iter)));
            st.levels[level].seq.push(elt);

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

        // insertion happened in child order; establish comparator order
        self.sort_level(st, queue, level, false, false);
    }

    fn free_level(
        &self,
        st: &mut SortState,
        queue: &mut Vec<Pending>,
        level: LevelId,
        unref: bool,
    ) {
        for &elt in &st.levels[level].seq.clone() {
            if let Some(children) = st.elts[elt].children {
                self.free_level(st, queue, children, unref);
            }
        }

        if st.levels[level].ref_count == 0 {
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
                if unref {
                    self.real_unref(st, pl, pe, true);
                }
                st.elts[pe].children = None;
            }
            None => st.root = None,
        }

        for &elt in &st.levels[level].seq.clone() {
            st.elts.remove(elt);
        }
        st.levels.remove(level);
    }

    /// Re-sorts one level (and optionally its descendants), emitting a
    /// permutation when the order changed.
    fn sort_level(
        &self,
        st: &mut SortState,
        queue: &mut Vec<Pending>,
        level: LevelId,
        recurse: bool,
        emit: bool,
    ) {
        if st.levels[level].seq.is_empty() {
            return;
        }

        // keep the level alive across reentrant child access
        let head = st.levels[level].seq[0];
        self.real_ref(st, level, head);

        for (i, &elt) in st.levels[level].seq.clone().iter().enumerate() {
            st.elts[elt].old_index = i;
        }

        let mut seq = std::mem::take(&mut st.levels[level].seq);
        {
            let st_ref: &SortState = st;
            seq.sort_by(|&a, &b| self.cmp_elts(st_ref, level, a, b));
        }
        st.levels[level].seq = seq;

        let new_order: Vec<usize> = st.levels[level]
            .seq
            .iter()
            .map(|&elt| st.elts[elt].old_index)
            .collect();
        let changed = new_order.iter().enumerate().any(|(i, &o)| i != o);

        if emit && changed {
            self.increment_stamp(st, queue);
            match st.levels[level].parent {
                Some((pl, pe)) => {
                    let path = self.path_of_elt(st, pl, pe);
                    queue.push(Pending::Reordered {
                        path,
                        parent: Some((pl, pe)),
                        order: new_order,
                    });
                }
                None => {
                    queue.push(Pending::Reordered {
                        path: TreePath::new(),
                        parent: None,
                        order: new_order,
                    });
                }
            }
        }

        if recurse {
            for &elt in &st.levels[level].seq.clone() {
                if let Some(children) = st.elts[elt].children {
                    self.sort_level(st, queue, children, true, emit);
                }
            }
        }

        self.real_unref(st, level, head, true);
    }

    fn increment_stamp(&self, st: &mut SortState, queue: &mut Vec<Pending>) {
        st.stamp = st.stamp.wrapping_add(1);
        if st.stamp == 0 {
            st.stamp = 1;
        }
        self.clear_cache_in(st, queue);
    }

    fn clear_cache_in(&self, st: &mut SortState, queue: &mut Vec<Pending>) {
        if st.zero_ref_count > 0 {
            if let Some(root) = st.root {
                self.clear_cache_helper(st, queue, root);
            }
        }
    }

    fn clear_cache_helper(&self, st: &mut SortState, queue: &mut Vec<Pending>, level: LevelId) {
        for &elt in &st.levels[level].seq.clone() {
            if st.elts.contains(elt) && st.elts[elt].zero_ref_count > 0 {
                if let Some(children) = st.elts[elt].children {
                    self.clear_cache_helper(st, queue, children);
                }
            }
        }
        if st.levels.contains(level)
            && st.levels[level].ref_count == 0
            && st.root != Some(level)
        {
            self.free_level(st, queue, level, true);
        }
    }

    // ---- lookups ----

    /// Walks built levels matching child offsets along `child_path`.
    /// `build_levels` materializes missing levels on the way.
    fn convert_child_path_in(
        &self,
        st: &mut SortState,
        queue: &mut Vec<Pending>,
        child_path: &TreePath,
        build_levels: bool,
    ) -> Option<(LevelId, EltId)> {
        if child_path.depth() == 0 {
            return None;
        }
        if st.root.is_none() && build_levels {
            self.build_level(st, queue, None);
        }

        let mut level_opt = st.root;
        let mut result = None;
        for (i, &offset) in child_path.indices().iter().enumerate() {
            let level = level_opt?;
            let pos = self.offset_position(st, level, offset)?;
            let elt = st.levels[level].seq[pos];
            if st.elts[elt].children.is_none() && build_levels {
                self.build_level(st, queue, Some((level, elt)));
            }
            result = Some((level, elt));
            if i + 1 < child_path.depth() {
                level_opt = st.elts[elt].children;
            }
        }
        result
    }

    fn path_to_child_path_in(
        &self,
        st: &mut SortState,
        queue: &mut Vec<Pending>,
        path: &TreePath,
    ) -> Option<TreePath> {
        if path.depth() == 0 {
            return None;
        }
        if st.root.is_none() {
            self.build_level(st, queue, None);
        }
        let mut level = st.root?;
        let mut child_path = TreePath::new();
        for (i, &idx) in path.indices().iter().enumerate() {
            let elt = *st.levels[level].seq.get(idx)?;
            child_path.append_index(st.elts[elt].offset);
            if i + 1 < path.depth() {
                if st.elts[elt].children.is_none() {
                    self.build_level(st, queue, Some((level, elt)));
                }
                level = st.elts[elt].children?;
            }
        }
        Some(child_path)
    }

    fn iter_in(
        &self,
        st: &mut SortState,
        queue: &mut Vec<Pending>,
        path: &TreePath,
    ) -> Option<TreeIter> {
        if path.depth() == 0 {
            return None;
        }
        if st.root.is_none() {
            self.build_level(st, queue, None);
        }
        let mut level = st.root?;
        let mut result = None;
        for (i, &idx) in path.indices().iter().enumerate() {
            let elt = *st.levels[level].seq.get(idx)?;
            if i + 1 < path.depth() {
                if st.elts[elt].children.is_none() {
                    self.build_level(st, queue, Some((level, elt)));
                }
                level = st.elts[elt].children?;
            } else {
                result = Some(self.make_iter(st, level, elt));
            }
        }
        result
    }

    // ---- signal handlers ----

    fn handle_row_changed(
        &self,
        st: &mut SortState,
        queue: &mut Vec<Pending>,
        c_path: &TreePath,
        _c_iter: &TreeIter,
    ) {
        let Some((level, elt)) = self.convert_child_path_in(st, queue, c_path, false) else {
            return;
        };

        self.real_ref(st, level, elt);

        // a single row or no comparator cannot reorder anything
        if st.levels[level].seq.len() < 2 || self.active_func(st).is_none() {
            let path = self.path_of_elt(st, level, elt);
            queue.push(Pending::Changed { path, level, elt });
            self.real_unref(st, level, elt, true);
            return;
        }

        let old_index = match self.seq_position(st, level, elt) {
            Some(pos) => pos,
            None => {
                self.real_unref(st, level, elt, true);
                return;
            }
        };

        // single-element reseat: remove, find the comparator-correct slot,
        // splice back in
        st.levels[level].seq.remove(old_index);
        let new_index = self.insertion_position(st, level, elt);
        st.levels[level].seq.insert(new_index, elt);

        self.increment_stamp(st, queue);

        if old_index != new_index {
            let len = st.levels[level].seq.len();
            let mut new_order = Vec::with_capacity(len);
            for j in 0..len {
                if new_index > old_index {
                    if j == new_index {
                        new_order.push(old_index);
                    } else if j >= old_index && j < new_index {
                        new_order.push(j + 1);
                    } else {
                        new_order.push(j);
                    }
                } else if j == new_index {
                    new_order.push(old_index);
                } else if j > new_index && j <= old_index {
                    new_order.push(j - 1);
                } else {
                    new_order.push(j);
                }
            }

            match st.levels[level].parent {
                Some((pl, pe)) => {
                    let path = self.path_of_elt(st, pl, pe);
                    queue.push(Pending::Reordered {
                        path,
                        parent: Some((pl, pe)),
                        order: new_order,
                    });
                }
                None => queue.push(Pending::Reordered {
                    path: TreePath::new(),
                    parent: None,
                    order: new_order,
                }),
            }
        }

        let path = self.path_of_elt(st, level, elt);
        queue.push(Pending::Changed { path, level, elt });
        self.real_unref(st, level, elt, true);
    }

    fn handle_row_inserted(
        &self,
        st: &mut SortState,
        queue: &mut Vec<Pending>,
        c_path: &TreePath,
        c_iter: &TreeIter,
    ) {
        if c_path.depth() == 0 {
            return;
        }

        if st.root.is_none() {
            // building the root picks the new row up along the way
            self.build_level(st, queue, None);
            self.submit_inserted(st, queue, c_path);
            return;
        }

        // find the level the insertion lands in
        let mut level = match st.root {
            Some(root) => root,
            None => return,
        };
        for &offset in &c_path.indices()[..c_path.depth() - 1] {
            let Some(pos) = self.offset_position(st, level, offset) else {
                // level chain not cached; nothing to update
                return;
            };
            let elt = st.levels[level].seq[pos];
            let Some(children) = st.elts[elt].children else {
                return;
            };
            level = children;
        }

        // an unreferenced level is not worth updating; drop it and let it
        // rebuild lazily
        if st.levels[level].ref_count == 0 && st.root != Some(level) {
            self.free_level(st, queue, level, true);
            return;
        }

        let Some(&offset) = c_path.indices().last() else {
            return;
        };
        for &id in &st.levels[level].seq.clone() {
            if st.elts[id].offset >= offset {
                st.elts[id].offset += 1;
            }
        }

        let cache_iters = st.child_flags.iters_persist;
        let elt = st
            .elts
            .insert(SortElt::new(offset, cache_iters.then_some(*c_iter)));
        let pos = self.insertion_position(st, level, elt);
        st.levels[level].seq.insert(pos, elt);

        self.submit_inserted(st, queue, c_path);
    }

    fn submit_inserted(&self, st: &mut SortState, queue: &mut Vec<Pending>, c_path: &TreePath) {
        let Some((level, elt)) = self.convert_child_path_in(st, queue, c_path, false) else {
            return;
        };
        self.increment_stamp(st, queue);
        let path = self.path_of_elt(st, level, elt);
        queue.push(Pending::Inserted { path, level, elt });
    }

    fn handle_row_has_child_toggled(
        &self,
        st: &mut SortState,
        queue: &mut Vec<Pending>,
        c_path: &TreePath,
        _c_iter: &TreeIter,
    ) {
        let Some((level, elt)) = self.convert_child_path_in(st, queue, c_path, false) else {
            return;
        };
        let path = self.path_of_elt(st, level, elt);
        queue.push(Pending::HasChildToggled { path, level, elt });
    }

    fn handle_row_deleted(&self, st: &mut SortState, queue: &mut Vec<Pending>, c_path: &TreePath) {
        let Some((level, elt)) = self.convert_child_path_in(st, queue, c_path, false) else {
            return;
        };

        // sorted position before anything moves
        let path = self.path_of_elt(st, level, elt);
        let offset = st.elts[elt].offset;

        // the row is gone in the child model; do not propagate
        while st.elts[elt].ref_count > 0 {
            self.real_unref(st, level, elt, false);
        }
        if let Some(children) = st.elts[elt].children {
            self.free_level(st, queue, children, false);
        }

        if st.levels[level].seq.len() == 1 {
            // deleting the last row empties the level
            let parent = st.levels[level].parent;
            self.free_level(st, queue, level, true);
            self.increment_stamp(st, queue);
            queue.push(Pending::Deleted { path });
            if let Some((pl, pe)) = parent {
                let ppath = self.path_of_elt(st, pl, pe);
                queue.push(Pending::HasChildToggled {
                    path: ppath,
                    level: pl,
                    elt: pe,
                });
            }
            return;
        }

        if let Some(pos) = self.seq_position(st, level, elt) {
            st.levels[level].seq.remove(pos);
        }
        for &id in &st.levels[level].seq.clone() {
            if st.elts[id].offset > offset {
                st.elts[id].offset -= 1;
            }
        }
        st.elts.remove(elt);

        self.increment_stamp(st, queue);
        queue.push(Pending::Deleted { path });
    }

    fn handle_rows_reordered(
        &self,
        st: &mut SortState,
        queue: &mut Vec<Pending>,
        c_path: &TreePath,
        new_order: &[usize],
    ) {
        let (level, parent) = if c_path.depth() == 0 {
            match st.root {
                Some(root) => (root, None),
                None => return,
            }
        } else {
            let Some((pl, pe)) = self.convert_child_path_in(st, queue, c_path, false) else {
                return;
            };
            match st.elts[pe].children {
                Some(children) => (children, Some((pl, pe))),
                None => return,
            }
        };

        let len = st.levels[level].seq.len();
        if len < 2 {
            return;
        }
        if new_order.len() < len {
            warn!(
                expected = len,
                got = new_order.len(),
                "reorder permutation shorter than the level"
            );
            return;
        }

        // remap stored offsets: old offset new_order[j] now lives at j
        let mut remapped = Vec::with_capacity(len);
        for &id in &st.levels[level].seq {
            let old_offset = st.elts[id].offset;
            match new_order.iter().position(|&o| o == old_offset) {
                Some(j) => remapped.push((id, j)),
                None => remapped.push((id, old_offset)),
            }
        }
        for (id, new_offset) in remapped {
            st.elts[id].offset = new_offset;
        }

        if self.active_func(st).is_none() {
            // unsorted state mirrors child order, so the reorder shows
            self.sort_level(st, queue, level, false, false);
            self.increment_stamp(st, queue);
            match parent {
                Some((pl, pe)) => {
                    let path = self.path_of_elt(st, pl, pe);
                    queue.push(Pending::Reordered {
                        path,
                        parent: Some((pl, pe)),
                        order: new_order.to_vec(),
                    });
                }
                None => queue.push(Pending::Reordered {
                    path: TreePath::new(),
                    parent: None,
                    order: new_order.to_vec(),
                }),
            }
        }
        // with a real comparator active, child order is irrelevant to the
        // presented order; nothing visible moves
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
                Pending::HasChildToggled { path, level, elt } => {
                    if let Some(iter) = self.try_iter(level, elt) {
                        self.emitter.emit_row_has_child_toggled(&path, &iter);
                    }
                }
                Pending::Deleted { path } => self.emitter.emit_row_deleted(&path),
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

/// Built-in comparator over the raw values of one column: booleans before,
/// numbers numerically, strings lexicographically, nulls first.
fn builtin_column_cmp(column: usize) -> SortFunc {
    Rc::new(move |model, a, b| {
        let va = model.value(a, column);
        let vb = model.value(b, column);
        compare_values(&va, &vb)
    })
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

impl TreeModelObserver for SortModel {
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

    fn rows_reordered(&self, path: &TreePath, _iter: Option<&TreeIter>, new_order: &[usize]) {
        let mut queue = Vec::new();
        {
            let mut st = self.state.borrow_mut();
            self.handle_rows_reordered(&mut st, &mut queue, path, new_order);
        }
        self.drain(queue);
    }
}

impl TreeModel for SortModel {
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
        Some(self.path_of_elt(&st, level, elt))
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
        let pos = self.seq_position(&st, level, elt)?;
        let next = *st.levels[level].seq.get(pos + 1)?;
        Some(self.make_iter(&st, level, next))
    }

    fn iter_previous(&self, iter: &TreeIter) -> Option<TreeIter> {
        let st = self.state.borrow();
        let (level, elt) = self.ids_of(&st, iter)?;
        let pos = self.seq_position(&st, level, elt)?;
        if pos == 0 {
            return None;
        }
        let prev = st.levels[level].seq[pos - 1];
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
        let child_iter = {
            let st = self.state.borrow();
            self.ids_of(&st, iter)
                .and_then(|(level, elt)| self.child_iter_for(&st, level, elt))
        };
        child_iter.map_or(false, |ci| self.child.iter_has_child(&ci))
    }

    fn iter_n_children(&self, iter: Option<&TreeIter>) -> usize {
        match iter {
            None => self.child.iter_n_children(None),
            Some(iter) => {
                let child_iter = {
                    let st = self.state.borrow();
                    self.ids_of(&st, iter)
                        .and_then(|(level, elt)| self.child_iter_for(&st, level, elt))
                };
                child_iter.map_or(0, |ci| self.child.iter_n_children(Some(&ci)))
            }
        }
    }

    fn iter_nth_child(&self, parent: Option<&TreeIter>, n: usize) -> Option<TreeIter> {
        let mut queue = Vec::new();
        let result = {
            let mut st = self.state.borrow_mut();
            let first = self.iter_children_in(&mut st, &mut queue, parent)?;
            let (level, _) = self.ids_of(&st, &first)?;
            let elt = *st.levels[level].seq.get(n)?;
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
            self.real_ref(&mut st, level, elt);
        }
    }

    fn unref_node(&self, iter: &TreeIter) {
        let mut st = self.state.borrow_mut();
        if let Some((level, elt)) = self.ids_of(&st, iter) {
            self.real_unref(&mut st, level, elt, true);
        }
    }

    fn connect(&self, observer: Weak<dyn TreeModelObserver>) -> ObserverId {
        self.emitter.connect(observer)
    }

    fn disconnect(&self, id: ObserverId) {
        self.emitter.disconnect(id);
    }
}

impl SortModel {
    fn iter_children_in(
        &self,
        st: &mut SortState,
        queue: &mut Vec<Pending>,
        parent: Option<&TreeIter>,
    ) -> Option<TreeIter> {
        match parent {
            None => {
                if st.root.is_none() {
                    self.build_level(st, queue, None);
                }
                let root = st.root?;
                let first = *st.levels[root].seq.first()?;
                Some(self.make_iter(st, root, first))
            }
            Some(parent) => {
                let (level, elt) = self.ids_of(st, parent)?;
                if st.elts[elt].children.is_none() {
                    self.build_level(st, queue, Some((level, elt)));
                }
                let children = st.elts[elt].children?;
                let first = *st.levels[children].seq.first()?;
                Some(self.make_iter(st, children, first))
            }
        }
    }
}

impl Drop for SortModel {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.child.disconnect(id);
        }
        let mut queue = Vec::new();
        let mut st = self.state.borrow_mut();
        if let Some(root) = st.root {
            self.free_level(&mut st, &mut queue, root, true);
        }
    }
}
