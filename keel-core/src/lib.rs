//! Keel Core
//!
//! Core types and abstractions for the Keel deployment agent.
//!
//! This crate contains:
//! - Domain types: deployments, stages, chains, commands and traces
//! - Spec: the application spec model loaded from Git, with validation
//! - Plugin: the contract every deploy plugin implements
//! - DTOs: payloads exchanged with the control plane
//! - Code: the error taxonomy shared by every RPC surface

pub mod code;
pub mod domain;
pub mod dto;
pub mod plugin;
pub mod spec;

pub use code::Code;
