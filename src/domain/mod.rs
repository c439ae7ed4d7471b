//! Domain layer - Core business logic
//!
//! This layer contains:
//! - Channels and their frame observers
//! - Sessions, dialogs and the dialog registry
//! - Dialplan routing lookups
//! - Shared domain primitives

pub mod channel;
pub mod routing;
pub mod session;
pub mod shared;

pub use channel::{Channel, ControlSubclass, Frame, FrameDirection, FrameObserver, HookId};
pub use routing::{DialplanResolver, StaticDialplan};
pub use session::{Dialog, DialogKey, DialogState, InviteState, Session, SessionRegistry};
pub use shared::{DomainError, Result};
