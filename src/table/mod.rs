// Per-bucket interning tables.
//
// - `path`: hierarchical path strings sharing segments
// - `content`: (content key, path) records addressed by byte offset
// - `bits`: dense offset sets used while rebuilding both

pub mod bits;
pub mod content;
pub mod path;

pub use bits::BitArray;
pub use content::{CompactContentKeyTable, ContentTableError};
pub use path::{CompactPathTable, PathTableError};
