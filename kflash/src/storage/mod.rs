//! Registry and config-cache persistence

pub mod config_cache;
pub mod file;
pub mod layout;
pub mod registry;
