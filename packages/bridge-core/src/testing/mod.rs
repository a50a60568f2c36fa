//! Testing Utilities Module
//!
//! Helpers shared by unit tests and the operator's integration tests.
//!
//! ## Submodules
//!
//! - `validators` - Well-known validator keys and signing helpers
//! - `effects` - A quorum effect that records executions and can be told to fail
//! - `cells` - Builders for bridge, deposit and collect cell transactions

pub mod cells;
pub mod effects;
pub mod validators;

pub use cells::*;
pub use effects::*;
pub use validators::*;
