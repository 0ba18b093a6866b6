//! Task engine logic and port trait definitions for Conveyor.
//!
//! This crate defines the "ports" (repository and backend traits) that the
//! infrastructure layer implements, and the engine that drives workflow
//! tasks through them. It depends only on `conveyor-types` -- never on
//! `conveyor-infra` or any database/IO crate.

pub mod backend;
pub mod controller;
pub mod event;
pub mod repository;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
