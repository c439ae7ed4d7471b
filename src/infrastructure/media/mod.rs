//! Media processing implementations

pub mod bridge;

pub use bridge::{Bridge, BridgeManager, TransferOutcome};
