//! Data Transfer Objects (DTOs)
//!
//! Payloads exchanged between the agent and the control plane.

pub mod application;
pub mod command;
pub mod deployment;
