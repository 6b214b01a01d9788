//! Position paths: sequences of sibling offsets addressing a row.
//!
//! A [`TreePath`] identifies a row structurally by walking down from the
//! root: `"4:10:0:3"` is the fourth child of the first child of the
//! eleventh child of the fifth top-level row. Paths are plain data with no
//! tie to any model; whether the indices are valid is only known at the
//! moment a model resolves them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A row address as sibling offsets from the root.
///
/// An empty path addresses no row (depth 0); a depth-1 path addresses a
/// top-level row. Ordering is lexicographic with a shared prefix comparing
/// shorter-first, which matches top-to-bottom display order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreePath {
    indices: Vec<usize>,
}

impl TreePath {
    /// The empty path (depth 0, addresses no row).
    pub fn new() -> Self {
        Self::default()
    }

    /// The path of the first top-level row, `"0"`.
    pub fn first() -> Self {
        Self { indices: vec![0] }
    }

    pub fn from_indices(indices: impl Into<Vec<usize>>) -> Self {
        Self {
            indices: indices.into(),
        }
    }

    pub fn depth(&self) -> usize {
        self.indices.len()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub(crate) fn indices_mut(&mut self) -> &mut [usize] {
        &mut self.indices
    }

    pub fn append_index(&mut self, index: usize) {
        self.indices.push(index);
    }

    pub fn prepend_index(&mut self, index: usize) {
        self.indices.insert(0, index);
    }

    /// Pops the last index, moving to the parent. No-op at depth 0.
    ///
    /// Returns `false` if the path was already empty.
    pub fn up(&mut self) -> bool {
        self.indices.pop().is_some()
    }

    /// Moves to the next sibling. No-op at depth 0.
    pub fn next(&mut self) {
        if let Some(last) = self.indices.last_mut() {
            *last += 1;
        }
    }

    /// Moves to the previous sibling; fails at index 0 or depth 0.
    pub fn prev(&mut self) -> bool {
        match self.indices.last_mut() {
            Some(last) if *last > 0 => {
                *last -= 1;
                true
            }
            _ => false,
        }
    }

    /// Descends to the first child.
    pub fn down(&mut self) {
        self.indices.push(0);
    }

    /// Strict ancestor test: `self` is a proper prefix of `other`.
    pub fn is_ancestor_of(&self, other: &TreePath) -> bool {
        self.depth() < other.depth() && other.indices[..self.depth()] == self.indices[..]
    }

    /// Strict descendant test, the inverse of [`Self::is_ancestor_of`].
    pub fn is_descendant_of(&self, other: &TreePath) -> bool {
        other.is_ancestor_of(self)
    }

    /// Re-roots a relative path under `root`: `root` + `self`.
    pub fn concat(root: &TreePath, rel: &TreePath) -> TreePath {
        let mut indices = root.indices.clone();
        indices.extend_from_slice(&rel.indices);
        TreePath { indices }
    }

    /// Removes a `root` prefix, yielding the path relative to it.
    ///
    /// Fails if `self` is not strictly below `root`.
    pub fn strip_prefix(&self, root: &TreePath) -> Option<TreePath> {
        if !root.is_ancestor_of(self) {
            return None;
        }
        Some(TreePath {
            indices: self.indices[root.depth()..].to_vec(),
        })
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, index) in self.indices.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{}", index)?;
        }
        Ok(())
    }
}

/// Parse error for the colon-separated path format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePathError;

impl fmt::Display for ParsePathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed tree path string")
    }
}

impl std::error::Error for ParsePathError {}

impl FromStr for TreePath {
    type Err = ParsePathError;

    /// Parses `"4:10:0:3"`. The empty string parses to the empty path;
    /// negative numbers, empty segments and stray separators fail.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(TreePath::new());
        }
        let mut indices = Vec::new();
        for part in s.split(':') {
            let index: usize = part.parse().map_err(|_| ParsePathError)?;
            indices.push(index);
        }
        Ok(TreePath { indices })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigation_steps() {
        let mut path = TreePath::from_indices(vec![1, 2]);
        path.down();
        assert_eq!(path.indices(), &[1, 2, 0]);
        path.next();
        assert_eq!(path.indices(), &[1, 2, 1]);
        assert!(path.prev());
        assert!(!path.prev());
        assert!(path.up());
        assert_eq!(path.indices(), &[1, 2]);
    }

    #[test]
    fn test_up_fails_at_root() {
        let mut path = TreePath::new();
        assert!(!path.up());
        assert_eq!(path.depth(), 0);
    }

    #[test]
    fn test_ordering_is_display_order() {
        let a: TreePath = "0:5".parse().unwrap();
        let b: TreePath = "0:5:0".parse().unwrap();
        let c: TreePath = "0:6".parse().unwrap();
        let d: TreePath = "1".parse().unwrap();

        // a parent sorts before its children, children before the next sibling
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn test_ancestor_relations() {
        let root: TreePath = "1".parse().unwrap();
        let deep: TreePath = "1:0:3".parse().unwrap();

        assert!(root.is_ancestor_of(&deep));
        assert!(deep.is_descendant_of(&root));
        // a path is not its own ancestor
        assert!(!root.is_ancestor_of(&root));
    }

    #[test]
    fn test_concat_strip_round_trip() {
        let root: TreePath = "2:1".parse().unwrap();
        let rel: TreePath = "0:4".parse().unwrap();

        let full = TreePath::concat(&root, &rel);
        assert_eq!(full.to_string(), "2:1:0:4");
        assert_eq!(full.strip_prefix(&root), Some(rel));
        assert_eq!(root.strip_prefix(&full), None);
    }

    #[test]
    fn test_parse_round_trip() {
        let path: TreePath = "4:10:0:3".parse().unwrap();
        assert_eq!(path.indices(), &[4, 10, 0, 3]);
        assert_eq!(path.to_string(), "4:10:0:3");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("4:-1".parse::<TreePath>().is_err());
        assert!("4::3".parse::<TreePath>().is_err());
        assert!("a:b".parse::<TreePath>().is_err());
        assert!(":".parse::<TreePath>().is_err());
    }

    #[test]
    fn test_empty_string_is_empty_path() {
        let path: TreePath = "".parse().unwrap();
        assert_eq!(path.depth(), 0);
    }
}
