pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod indexer;
pub mod mock;
pub mod reporter;
pub mod store;
pub mod supervisor;
pub mod worker;
