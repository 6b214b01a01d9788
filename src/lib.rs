pub mod traits;
pub mod path;
pub mod rowref;
pub mod filter;
pub mod sort;
pub mod flat;

mod arena;

// Export the model contract
pub use traits::{
    foreach, ColumnType, ModelFlags, ObserverId, SignalEmitter,
    TreeIter, TreeModel, TreeModelObserver, Value,
};

// Export path and row-reference machinery
pub use path::{ParsePathError, TreePath};
pub use rowref::{
    remap_for_reorder, shift_for_delete, shift_for_insert, DeleteEffect, RowRef, RowRefPool,
};

// Export the proxy models
pub use filter::{FilterModel, VisibleFunc};
pub use sort::{SortFunc, SortModel, SortOrder, SortSource};

// Export the flat-list filter
pub use flat::{FlatFilter, FlatFilterFunc, ListModel, ListModelObserver};
