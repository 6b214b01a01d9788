//! Filtering proxy model: presents only the rows of a child model that
//! pass a visibility policy, staying synchronized with child mutations.

mod level;
mod model;

pub use model::{FilterModel, VisibleFunc};
