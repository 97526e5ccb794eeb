/// Database (schema) ID type
pub type SchemaId = i64;

/// Table ID type
pub type TableId = i64;

/// Column ID type
pub type ColumnId = i64;

/// Index ID type
pub type IndexId = i64;

/// DDL job ID type. Job ids come from the global id allocator, so a larger
/// id always means a later submission.
pub type JobId = i64;

/// Row handle type
pub type Handle = i64;

/// Schema version type
pub type SchemaVersion = i64;

/// Node identifier type
pub type NodeId = String;

/// Queue lane used by jobs that target a whole schema rather than a table
pub const SCHEMA_LANE: TableId = 0;
