//! Distributed operations: participant processors and master-side coordination

pub mod coordinator;
pub mod master;
pub mod processor;
pub mod processor_store;

pub use coordinator::TransactionCoordinator;
pub use master::{MasterExecutable, MasterStore};
pub use processor::{processor_for, Processor};
pub use processor_store::ProcessorStore;
