pub mod evm_bridge;

pub use evm_bridge::ChildBridge;
