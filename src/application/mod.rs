//! Application layer - Use cases and application services
//!
//! This layer orchestrates domain objects to fulfill use cases. Today that
//! is call transfer: REFER handling, INVITE with Replaces, and transfer
//! progress reporting.

pub mod transfer;

pub use transfer::TransferSupplement;
