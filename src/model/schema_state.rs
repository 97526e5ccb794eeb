//! Schema object states
//!
//! Every column, index, table and schema carries one of these states. The
//! state alone decides what DML must do with the object, which is what lets
//! nodes holding schemas one step apart keep the data consistent.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SchemaState {
    /// Not present in the catalog (or not yet inserted)
    #[default]
    None,
    /// Invisible to reads and writes; deletes still clean it up
    DeleteOnly,
    /// Writes maintain it, reads ignore it
    WriteOnly,
    /// Like WriteOnly while existing rows are being backfilled
    WriteReorganization,
    /// Like DeleteOnly while stored data is being removed
    DeleteReorganization,
    /// Fully visible
    Public,
}

impl SchemaState {
    /// Reads may see the object
    pub fn is_readable(self) -> bool {
        self == SchemaState::Public
    }

    /// Inserts and updates must write the object's value or index entry
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            SchemaState::WriteOnly | SchemaState::WriteReorganization | SchemaState::Public
        )
    }

    /// Deletes must remove the object's value or index entry
    pub fn is_deletable(self) -> bool {
        self != SchemaState::None
    }

    /// States that require a backfill pass before leaving them
    pub fn is_reorganization(self) -> bool {
        matches!(self, SchemaState::WriteReorganization | SchemaState::DeleteReorganization)
    }

    /// Next state on the removal path, shared by drops and by rollbacks of
    /// half-added objects. `None` once the object can leave the catalog.
    pub fn next_removal_state(self) -> Option<SchemaState> {
        match self {
            SchemaState::Public => Some(SchemaState::WriteOnly),
            SchemaState::WriteOnly | SchemaState::WriteReorganization => Some(SchemaState::DeleteOnly),
            SchemaState::DeleteOnly => Some(SchemaState::DeleteReorganization),
            SchemaState::DeleteReorganization | SchemaState::None => None,
        }
    }
}

impl fmt::Display for SchemaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchemaState::None => "none",
            SchemaState::DeleteOnly => "delete only",
            SchemaState::WriteOnly => "write only",
            SchemaState::WriteReorganization => "write reorganization",
            SchemaState::DeleteReorganization => "delete reorganization",
            SchemaState::Public => "public",
        };
        f.write_str(name)
    }
}
