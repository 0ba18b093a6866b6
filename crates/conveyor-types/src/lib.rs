//! Shared domain types for Conveyor.
//!
//! This crate contains the types used across the workflow task engine:
//! pipeline definitions, task instances with their stage and job records,
//! the execution status machine, approval gate state, engine events, and
//! configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod status;
pub mod task;
