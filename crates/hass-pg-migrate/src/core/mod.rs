//! Core abstractions shared by the migration engine and the drivers.
//!
//! - [`schema`]: table descriptors and the pagination key type
//! - [`value`]: SQL value representation
//! - [`traits`]: source and target collaborator traits
//! - [`catalog`]: the fixed recorder table set

pub mod catalog;
pub mod schema;
pub mod traits;
pub mod value;

pub use catalog::{find_table, recorder_tables};
pub use schema::{KeyValue, TableCategory, TableSpec, TransformKind};
pub use traits::{SourceReader, TargetWriter, WriteOutcome};
pub use value::{Row, SqlValue};
