//! Source-side schema model shared across the replication pipeline.

pub mod schema;
