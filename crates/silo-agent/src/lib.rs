pub mod admin;
pub mod api;
pub mod config;
pub mod layout;
pub mod manager;
pub mod port_alloc;
pub mod request_meta;
pub mod state_store;
pub mod supervisor;

pub use config::AgentConfig;
pub use manager::{InstanceError, InstanceManager, RecoveryReport};
