pub mod config;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod tracker;
pub mod workspace;
