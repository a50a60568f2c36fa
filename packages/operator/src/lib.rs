//! Bridge operator library
//!
//! Watches the account ledger and the cell ledger, collects validator signatures
//! over transfer receipts and relays quorate receipts between the two sides.

pub mod api;
pub mod bounded_cache;
pub mod config;
pub mod contracts;
pub mod db;
pub mod ledger;
pub mod metrics;
pub mod queue;
pub mod relay;
pub mod watchers;
pub mod writers;
