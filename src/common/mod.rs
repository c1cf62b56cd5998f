//! Common utilities and types shared across nodemesh

pub mod config;
pub mod error;
pub mod utils;

pub use config::NodeConfig;
pub use error::{Error, ErrorCode, Result};
pub use utils::{available_workers, generate_request_id, validate_name};
