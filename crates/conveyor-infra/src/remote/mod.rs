//! Remote command channels into execution units.

pub mod kubectl;
