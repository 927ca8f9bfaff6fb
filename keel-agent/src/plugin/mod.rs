//! Plugin runtime: registry, transport and process supervision

pub mod process;
pub mod registry;
pub mod remote;

pub use process::{PLUGIN_CRASHED, ProcessPlugin};
pub use registry::PluginRegistry;
pub use remote::RemotePlugin;
