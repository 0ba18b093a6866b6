//! Workflow task construction: everything between a stored definition and a
//! `created` task ready to be driven.
//!
//! - `definition` -- YAML parsing, structural validation, definition hashing
//! - `args` -- merging caller arguments over a definition
//! - `render` -- variable substitution into job payloads
//! - `expander` -- fan-out of job definitions into job tasks
//! - `instantiate` -- sequence allocation, snapshot, expansion and lint
//! - `approval` -- approval gate decisions and quorum
//! - `retry` -- deriving a resumable task from a finished one

pub mod approval;
pub mod args;
pub mod definition;
pub mod expander;
pub mod instantiate;
pub mod render;
pub mod retry;
