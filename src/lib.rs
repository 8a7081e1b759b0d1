pub mod condition;
pub mod config;
pub mod directory;
pub mod filter;
pub mod ldap_protocol;
pub mod mapper;
pub mod memory;
pub mod metrics;
pub mod response;
pub mod search;
pub mod search_manager;
pub mod server;

#[cfg(test)]
mod test_utils;

pub use config::Config;
pub use directory::{Directory, DirectoryEntry, DirectoryError, Principal};
pub use memory::MemoryDirectory;
pub use metrics::{run_metrics_server, Metrics};
pub use server::GalServer;
