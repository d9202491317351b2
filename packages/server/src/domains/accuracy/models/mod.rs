pub mod column_metric;
pub mod snapshot;

pub use column_metric::*;
pub use snapshot::*;
