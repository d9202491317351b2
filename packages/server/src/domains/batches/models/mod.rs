pub mod batch;
pub mod column;

pub use batch::Batch;
pub use column::{kind_of, ColumnDef, ColumnKind};
