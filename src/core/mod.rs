pub mod config;
pub mod connection_pool;
pub mod error;
pub mod recovery;
pub mod types;
