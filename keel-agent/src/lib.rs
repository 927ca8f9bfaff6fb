//! Keel Agent
//!
//! The in-cluster continuous-delivery agent ("piped"). It watches Git for
//! application changes, plans deployments through plugins, executes their
//! stages and reports every state change to the control plane.
//!
//! Architecture:
//! - Configuration: agent settings from a YAML file or the environment
//! - Store: durable local state (deployments, chains, trigger bookkeeping)
//! - Trigger: turns commits, commands and drift into new deployments
//! - Controller: admits deployments and drives planning and execution
//! - Executor: runs stages against plugins, handles cancel and rollback
//! - Plugins: out-of-process deploy plugins and their supervision
//! - Callback API: lets plugins read stage commands such as approvals

pub mod agent;
pub mod callback;
pub mod chain;
pub mod commands;
pub mod config;
pub mod controller;
pub mod drift;
pub mod error;
pub mod executor;
pub mod git;
pub mod notifier;
pub mod planner;
pub mod plugin;
pub mod reporter;
pub mod spec_source;
pub mod store;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{Agent, AgentParts};
pub use config::Config;
pub use error::{AgentError, Result};
