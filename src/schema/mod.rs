pub mod arrow;
pub mod normalize;
pub mod types;

pub use self::arrow::{is_key_type, map_to_arrow_type};
pub use normalize::normalize;
pub use types::{ColumnMapping, NumericType, RenameSpec};
