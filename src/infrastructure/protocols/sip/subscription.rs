//! Implicit refer subscriptions
//!
//! A REFER creates an implicit subscription to the transfer's outcome. The
//! `ReferSubscription` accepts the REFER with 202 and sends sipfrag NOTIFYs
//! as progress is reported, inside the dialog the REFER arrived on.

use super::builder::{reason_phrase, ResponseBuilder};
use super::message::{SipError, SipRequest, SipResponse};
use rsip::{Header, Headers, Method, Request, Uri, Version};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Expiry advertised on active subscription notifications, in seconds
pub const SUBSCRIPTION_EXPIRES: u32 = 600;

/// Subscription lifetime state carried in Subscription-State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Terminated,
}

impl SubscriptionState {
    pub fn as_header_value(&self) -> &'static str {
        match self {
            SubscriptionState::Active => "active",
            SubscriptionState::Terminated => "terminated;reason=noresource",
        }
    }
}

/// Outbound signaling boundary.
///
/// Responses answer a received request; requests are new in-dialog messages
/// such as NOTIFY. Implementations deliver them over the wire.
#[async_trait::async_trait]
pub trait SignalingSink: Send + Sync {
    async fn send_response(
        &self,
        request: &SipRequest,
        response: SipResponse,
    ) -> Result<(), SipError>;

    async fn send_request(&self, request: SipRequest) -> Result<(), SipError>;
}

/// An accepted refer subscription within a dialog
pub struct ReferSubscription {
    id: Uuid,
    call_id: String,
    /// From header of outgoing NOTIFYs (the To of the REFER, which is us)
    local: String,
    /// To header of outgoing NOTIFYs
    remote: String,
    /// Request URI for outgoing NOTIFYs
    target: String,
    sink: Arc<dyn SignalingSink>,
    cseq: AtomicU32,
}

impl ReferSubscription {
    /// Accept `request` with 202, establishing the implicit subscription.
    ///
    /// When `echo_refer_sub` is set the 202 confirms the subscription with
    /// a `Refer-Sub: true` header.
    pub async fn create(
        request: &SipRequest,
        echo_refer_sub: bool,
        sink: Arc<dyn SignalingSink>,
    ) -> Result<Arc<Self>, SipError> {
        let call_id = request
            .call_id()
            .ok_or_else(|| SipError::InvalidMessage("REFER without Call-ID".to_string()))?;
        let local = request
            .header_value("To")
            .ok_or_else(|| SipError::InvalidMessage("REFER without To".to_string()))?;
        let remote = request
            .header_value("From")
            .ok_or_else(|| SipError::InvalidMessage("REFER without From".to_string()))?;
        let target = request
            .header_value("Contact")
            .map(|contact| extract_uri(&contact))
            .unwrap_or_else(|| extract_uri(&remote));
        // Must parse now so NOTIFY construction cannot fail later
        Uri::try_from(target.as_str())?;

        let subscription = Arc::new(Self {
            id: Uuid::new_v4(),
            call_id,
            local,
            remote,
            target,
            sink: sink.clone(),
            cseq: AtomicU32::new(1),
        });

        let mut builder = ResponseBuilder::accepted();
        if echo_refer_sub {
            builder = builder.header(Header::Other("Refer-Sub".to_string(), "true".to_string()));
        }
        let response = builder.build_for_request(request)?;
        sink.send_response(request, response).await?;
        debug!(
            "Accepted refer subscription '{}' on dialog '{}'",
            subscription.id, subscription.call_id
        );
        Ok(subscription)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Send a sipfrag NOTIFY reporting `code` with the given state.
    pub async fn notify(&self, state: SubscriptionState, code: u16) -> Result<(), SipError> {
        let request = self.build_notify(state, code)?;
        self.sink.send_request(request).await
    }

    fn build_notify(&self, state: SubscriptionState, code: u16) -> Result<SipRequest, SipError> {
        let uri = Uri::try_from(self.target.as_str())?;
        let body = format!("SIP/2.0 {} {}\r\n", code, reason_phrase(code));
        let cseq = self.cseq.fetch_add(1, Ordering::SeqCst);
        let subscription_state = match state {
            SubscriptionState::Active => {
                format!("active;expires={}", SUBSCRIPTION_EXPIRES)
            }
            SubscriptionState::Terminated => state.as_header_value().to_string(),
        };

        let headers: Vec<Header> = vec![
            Header::Other(
                "Via".to_string(),
                format!("SIP/2.0/UDP 0.0.0.0:5060;branch=z9hG4bK{:08x}", rand::random::<u32>()),
            ),
            Header::Other("Max-Forwards".to_string(), "70".to_string()),
            Header::Other("From".to_string(), self.local.clone()),
            Header::Other("To".to_string(), self.remote.clone()),
            Header::Other("Call-ID".to_string(), self.call_id.clone()),
            Header::Other("CSeq".to_string(), format!("{} NOTIFY", cseq)),
            Header::Other("Event".to_string(), "refer".to_string()),
            Header::Other("Subscription-State".to_string(), subscription_state),
            Header::Other(
                "Content-Type".to_string(),
                "message/sipfrag;version=2.0".to_string(),
            ),
            Header::Other("Content-Length".to_string(), body.len().to_string()),
        ];

        let request = Request {
            method: Method::Notify,
            uri,
            version: Version::V2,
            headers: Headers::from(headers),
            body: body.into_bytes(),
        };
        Ok(SipRequest::new(request))
    }
}

/// Pull the bare URI out of a header value, dropping display names,
/// brackets and parameters.
fn extract_uri(value: &str) -> String {
    let inner = match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.trim(),
    };
    inner.split(';').next().unwrap_or(inner).to_string()
}
