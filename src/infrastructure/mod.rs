//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Protocol implementations (SIP)
//! - Media bridge management
//! - Task serialization

pub mod media;
pub mod protocols;
pub mod serializer;
