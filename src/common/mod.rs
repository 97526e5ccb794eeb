// Common types shared across the crate

pub mod clock;
pub mod types;
pub mod value;

pub use types::*;
pub use value::{DataType, DataValue};
