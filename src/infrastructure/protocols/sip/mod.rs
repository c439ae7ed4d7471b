//! SIP protocol implementation

pub mod builder;
pub mod message;
pub mod subscription;

pub use builder::{reason_phrase, ResponseBuilder};
pub use message::{
    parse_refer_target, parse_replaces, ReferTarget, ReplacesRef, SipError, SipMethod,
    SipRequest, SipResponse,
};
pub use subscription::{
    ReferSubscription, SignalingSink, SubscriptionState, SUBSCRIPTION_EXPIRES,
};
