//! Call transfer orchestration
//!
//! Implements SIP call transfer: in-dialog REFER (attended and blind),
//! INVITE with Replaces, transfer progress reporting over the implicit
//! refer subscription, and the outgoing-request filter.

pub mod attended;
pub mod blind;
pub mod frame_hook;
pub mod progress;
pub mod replaces;
pub mod resolver;
pub mod supplement;

pub use attended::{response_code, ReferAttended};
pub use blind::execute_blind_transfer;
pub use frame_hook::ProgressFrameHook;
pub use progress::{
    on_subscription_terminated, Notification, ProgressMonitor, REFER_PROGRESS_ATTACHMENT,
};
pub use replaces::InviteReplacesHandler;
pub use resolver::ReferHandler;
pub use supplement::{SessionRequestHandler, TransferSupplement};
