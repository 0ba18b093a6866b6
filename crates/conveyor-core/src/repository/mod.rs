//! Storage ports implemented by the infrastructure layer.

pub mod definition;
pub mod task;
