//! Inter-node wire protocol

pub mod query;
pub mod query_type;

pub use query::{
    Ack, CollectionSchema, DatastoreSchema, ProcedureArtifact, Query, QueryBody, Record,
    Response, SystemTables,
};
pub use query_type::QueryType;

/// Peer-initiated termination sentinel (matched case-insensitively).
pub const KILL: &str = "KILL";
