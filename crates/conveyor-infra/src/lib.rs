//! Infrastructure layer for Conveyor.
//!
//! Contains implementations of the port traits defined in `conveyor-core`:
//! SQLite task and definition storage, a `kubectl exec` remote command
//! channel for debug markers, a webhook notifier, and the config loader.

pub mod config;
pub mod notify;
pub mod remote;
pub mod sqlite;
