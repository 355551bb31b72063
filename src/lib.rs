//! Backup agent library.
//!
//! Host-resident agent for a MySQL-compatible database engine, driven by a
//! remote dispatcher over a GPG-encrypted RPC channel.

pub mod agent;
pub mod config;
pub mod crypto;
pub mod db;
pub mod job;
pub mod lock;
pub mod pipeline;
pub mod rpc;
pub mod sink;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::AgentError;
pub use utils::errors::Result;
