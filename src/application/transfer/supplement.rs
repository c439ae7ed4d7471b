//! Session-level dispatch for transfer signaling
//!
//! The `TransferSupplement` sits on the session request path. Incoming
//! REFER, INVITE-with-Replaces and refer-event SUBSCRIBE requests are
//! routed to their handlers; outgoing INVITEs pick up the Replaces marker
//! a blind-transfer completion may have planted on the channel.

use super::progress::on_subscription_terminated;
use super::replaces::InviteReplacesHandler;
use super::resolver::ReferHandler;
use crate::domain::routing::DialplanResolver;
use crate::domain::session::{InviteState, Session, SessionRegistry};
use crate::infrastructure::media::bridge::BridgeManager;
use crate::infrastructure::protocols::sip::{
    ResponseBuilder, SignalingSink, SipError, SipMethod, SipRequest,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handler for one method's worth of in-dialog requests
#[async_trait]
pub trait SessionRequestHandler: Send + Sync {
    /// Returns true when the request was consumed.
    async fn handle(&self, session: &Arc<Session>, request: &SipRequest)
        -> Result<bool, SipError>;
}

#[async_trait]
impl SessionRequestHandler for ReferHandler {
    async fn handle(
        &self,
        session: &Arc<Session>,
        request: &SipRequest,
    ) -> Result<bool, SipError> {
        ReferHandler::handle(self, session, request).await?;
        Ok(true)
    }
}

#[async_trait]
impl SessionRequestHandler for InviteReplacesHandler {
    async fn handle(
        &self,
        session: &Arc<Session>,
        request: &SipRequest,
    ) -> Result<bool, SipError> {
        InviteReplacesHandler::handle(self, session, request).await
    }
}

/// Catches in-dialog unsubscribes from the refer event package
struct SubscribeTerminationHandler {
    sink: Arc<dyn SignalingSink>,
}

#[async_trait]
impl SessionRequestHandler for SubscribeTerminationHandler {
    async fn handle(
        &self,
        session: &Arc<Session>,
        request: &SipRequest,
    ) -> Result<bool, SipError> {
        let event = request.header_value("Event");
        if event.as_deref().map(str::trim) != Some("refer") {
            return Ok(false);
        }
        let expires = request
            .header_value("Expires")
            .and_then(|value| value.trim().parse::<u32>().ok());
        if expires != Some(0) {
            // Refreshes are the subscription layer's concern
            return Ok(false);
        }

        debug!(
            "Refer subscription unsubscribed on session '{}'",
            session.id()
        );
        on_subscription_terminated(session.dialog()).await;
        match ResponseBuilder::new(200).build_for_request(request) {
            Ok(response) => {
                if let Err(err) = self.sink.send_response(request, response).await {
                    warn!("Failed to answer unsubscribe: {}", err);
                }
            }
            Err(err) => warn!("Failed to build unsubscribe response: {}", err),
        }
        Ok(true)
    }
}

/// Entry point wiring transfer handling into a session's request path
pub struct TransferSupplement {
    handlers: HashMap<SipMethod, Arc<dyn SessionRequestHandler>>,
}

impl TransferSupplement {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bridges: Arc<BridgeManager>,
        dialplan: Arc<dyn DialplanResolver>,
        sink: Arc<dyn SignalingSink>,
    ) -> Self {
        let mut handlers: HashMap<SipMethod, Arc<dyn SessionRequestHandler>> = HashMap::new();
        handlers.insert(
            SipMethod::Refer,
            Arc::new(ReferHandler::new(
                registry.clone(),
                bridges.clone(),
                dialplan,
                sink.clone(),
            )),
        );
        handlers.insert(
            SipMethod::Invite,
            Arc::new(InviteReplacesHandler::new(registry, bridges, sink.clone())),
        );
        handlers.insert(
            SipMethod::Subscribe,
            Arc::new(SubscribeTerminationHandler { sink }),
        );
        Self { handlers }
    }

    /// Dispatch an incoming in-dialog request. Returns false when the
    /// request is not a transfer concern and should continue on to other
    /// handlers.
    pub async fn incoming_request(
        &self,
        session: &Arc<Session>,
        request: &SipRequest,
    ) -> Result<bool, SipError> {
        let Some(method) = request.method() else {
            return Ok(false);
        };
        match self.handlers.get(&method) {
            Some(handler) => handler.handle(session, request).await,
            None => Ok(false),
        }
    }

    /// Filter an outgoing request. A session dialing out on behalf of a
    /// transfer carries the replaces marker into its initial INVITE.
    pub fn outgoing_request(&self, session: &Arc<Session>, request: &mut SipRequest) {
        if request.method() != Some(SipMethod::Invite) {
            return;
        }
        if session.state() != InviteState::Calling {
            return;
        }
        let Some(channel) = session.channel() else {
            return;
        };
        let Some(replaces) = channel.variable("SIPREPLACESHDR") else {
            return;
        };
        debug!(
            "Attaching Replaces to outgoing INVITE on session '{}'",
            session.id()
        );
        request.push_header("Replaces", &replaces);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::routing::StaticDialplan;
    use crate::domain::session::DialogKey;
    use crate::infrastructure::protocols::sip::SipResponse;
    use std::sync::Mutex;

    struct RecordingSink {
        responses: Mutex<Vec<SipResponse>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SignalingSink for RecordingSink {
        async fn send_response(
            &self,
            _request: &SipRequest,
            response: SipResponse,
        ) -> Result<(), SipError> {
            self.responses.lock().unwrap().push(response);
            Ok(())
        }

        async fn send_request(&self, _request: SipRequest) -> Result<(), SipError> {
            Ok(())
        }
    }

    fn supplement(sink: Arc<RecordingSink>) -> TransferSupplement {
        TransferSupplement::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(BridgeManager::new()),
            Arc::new(StaticDialplan::new()),
            sink,
        )
    }

    fn request(text: &str) -> SipRequest {
        SipRequest::parse(text.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_non_transfer_requests_pass_through() {
        let sink = RecordingSink::new();
        let supplement = supplement(sink.clone());
        let session = Session::new(DialogKey::new("x@y", "tt", "ft"), "default");

        let bye = request(
            "BYE sip:alice@pbx.example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKabc\r\n\
             From: Bob <sip:bob@example.com>;tag=ft\r\n\
             To: Alice <sip:alice@example.com>;tag=tt\r\n\
             Call-ID: x@y\r\n\
             CSeq: 3 BYE\r\n\
             Content-Length: 0\r\n\r\n",
        );
        assert!(!supplement.incoming_request(&session, &bye).await.unwrap());

        // A plain INVITE without Replaces is not ours either
        let invite = request(
            "INVITE sip:alice@pbx.example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKabc\r\n\
             From: Bob <sip:bob@example.com>;tag=ft\r\n\
             To: Alice <sip:alice@example.com>\r\n\
             Call-ID: x@y\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Length: 0\r\n\r\n",
        );
        assert!(!supplement.incoming_request(&session, &invite).await.unwrap());
        assert!(sink.responses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_refresh_passes_through() {
        let sink = RecordingSink::new();
        let supplement = supplement(sink.clone());
        let session = Session::new(DialogKey::new("x@y", "tt", "ft"), "default");

        let refresh = request(
            "SUBSCRIBE sip:alice@pbx.example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKabc\r\n\
             From: Bob <sip:bob@example.com>;tag=ft\r\n\
             To: Alice <sip:alice@example.com>;tag=tt\r\n\
             Call-ID: x@y\r\n\
             CSeq: 4 SUBSCRIBE\r\n\
             Event: refer\r\n\
             Expires: 600\r\n\
             Content-Length: 0\r\n\r\n",
        );
        assert!(!supplement.incoming_request(&session, &refresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_answered() {
        let sink = RecordingSink::new();
        let supplement = supplement(sink.clone());
        let session = Session::new(DialogKey::new("x@y", "tt", "ft"), "default");

        let unsubscribe = request(
            "SUBSCRIBE sip:alice@pbx.example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKabc\r\n\
             From: Bob <sip:bob@example.com>;tag=ft\r\n\
             To: Alice <sip:alice@example.com>;tag=tt\r\n\
             Call-ID: x@y\r\n\
             CSeq: 4 SUBSCRIBE\r\n\
             Event: refer\r\n\
             Expires: 0\r\n\
             Content-Length: 0\r\n\r\n",
        );
        assert!(supplement
            .incoming_request(&session, &unsubscribe)
            .await
            .unwrap());
        let responses = sink.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status_code(), 200);
    }

    #[tokio::test]
    async fn test_outgoing_invite_carries_replaces_marker() {
        let sink = RecordingSink::new();
        let supplement = supplement(sink);
        let session = Session::with_channel(
            DialogKey::new("x@y", "tt", "ft"),
            "default",
            "Local/1000@default-00000001",
        );
        session.set_state(InviteState::Calling);
        session
            .channel()
            .unwrap()
            .set_variable("SIPREPLACESHDR", "abc123;to-tag=tt;from-tag=ft");

        let mut invite = request(
            "INVITE sip:carol@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKabc\r\n\
             From: Transfer <sip:transfer@pbx.example.com>;tag=new\r\n\
             To: Carol <sip:carol@example.com>\r\n\
             Call-ID: new@pbx\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Length: 0\r\n\r\n",
        );
        supplement.outgoing_request(&session, &mut invite);
        assert_eq!(
            invite.header_value("Replaces"),
            Some("abc123;to-tag=tt;from-tag=ft".to_string())
        );

        // Established sessions are left alone
        session.set_state(InviteState::Confirmed);
        let mut reinvite = invite.clone();
        supplement.outgoing_request(&session, &mut reinvite);
        assert_eq!(reinvite.to_bytes(), invite.to_bytes());
    }
}
