mod row;
mod snapshot;

pub use self::row::{ImportedRow, PageRow};
pub use self::snapshot::{IconSnapshot, PageSnapshot};
