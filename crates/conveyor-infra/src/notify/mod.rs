//! Task outcome notifiers.

pub mod webhook;
