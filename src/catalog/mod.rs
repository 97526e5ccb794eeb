//! Catalog Module
//!
//! Versioned schema snapshots and the per-node cache that keeps them fresh.

pub mod domain;
pub mod info_schema;

pub use self::domain::Domain;
pub use self::info_schema::InfoSchema;
