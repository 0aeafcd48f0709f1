//! Process-wide tracing setup shared by hosts and test harnesses.

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use crate::tracing::{LogFormat, init, init_with};
