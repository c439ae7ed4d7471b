//! Handover - SIP call transfer orchestration
//!
//! Implements attended and blind call transfers on top of in-dialog REFER,
//! INVITE with Replaces, and transfer progress reporting over the implicit
//! refer subscription.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
