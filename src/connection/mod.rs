//! Inter-node connections: line-framed transport and the connection pool

pub mod registry;
pub mod transport;

pub use registry::ConnectionRegistry;
pub use transport::{Connection, MessageHandler};
