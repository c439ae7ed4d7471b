//! Blind transfer execution
//!
//! A blind transfer redirects the transferer's peer to a dialplan extension.
//! The replacement leg is decorated with the transfer's context before it
//! starts, and the progress hook rides on it from the first frame.

use super::attended::response_code;
use super::frame_hook::ProgressFrameHook;
use super::progress::{Notification, ProgressMonitor};
use crate::domain::channel::Channel;
use crate::domain::routing::DialplanResolver;
use crate::domain::session::Session;
use crate::infrastructure::media::bridge::{BlindCompletion, BridgeManager, TransferOutcome};
use crate::infrastructure::protocols::sip::{ReferTarget, SipRequest, SubscriptionState};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Execute a blind transfer of `session` to the extension named by `target`.
///
/// Returns the SIP response code for the REFER.
pub fn execute_blind_transfer(
    session: &Arc<Session>,
    target: &ReferTarget,
    request: &SipRequest,
    progress: Option<Arc<ProgressMonitor>>,
    bridges: &BridgeManager,
    dialplan: &dyn DialplanResolver,
) -> u16 {
    let Some(channel) = session.channel() else {
        return 400;
    };

    // A channel-level override beats the endpoint's configured context
    let context = channel
        .variable("TRANSFER_CONTEXT")
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| session.endpoint_context().to_string());

    if !dialplan.extension_exists(&context, &target.user) {
        error!(
            "Channel '{}' attempted blind transfer to '{}@{}' but extension does not exist",
            channel.name(),
            target.user,
            context
        );
        return 404;
    }

    debug!(
        "Blind transfer of channel '{}' to '{}@{}'",
        channel.name(),
        target.user,
        context
    );
    let completion = completion_for(request, context.clone(), progress);
    let outcome = bridges.blind_transfer(&channel, &target.user, &context, completion);
    if outcome == TransferOutcome::Success {
        session.defer_termination();
    }
    response_code(outcome)
}

/// Build the callback that decorates the replacement leg.
fn completion_for(
    request: &SipRequest,
    context: String,
    progress: Option<Arc<ProgressMonitor>>,
) -> BlindCompletion {
    let referred_by = request.referred_by();
    let refer_to = request.refer_to();

    Box::new(move |channel: &Arc<Channel>| {
        channel.set_variable("SIPTRANSFER", "yes");
        if let Some(progress) = progress {
            if ProgressFrameHook::attach(progress.clone(), channel).is_err() {
                // The leg exists even if it cannot be observed, so report
                // success rather than leave the subscriber hanging.
                warn!(
                    "Could not attach progress hook to channel '{}' - assuming success",
                    channel.name()
                );
                Notification::new(progress, 200, SubscriptionState::Terminated).dispatch();
            }
        }
        if !context.is_empty() {
            channel.set_variable("SIPREFERRINGCONTEXT", &context);
        }
        if let Some(referred_by) = &referred_by {
            channel.set_variable("SIPREFERREDBYHDR", referred_by);
        }
        if let Some(refer_to) = &refer_to {
            channel.set_variable("SIPREFERTOHDR", refer_to);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::routing::MockDialplanResolver;
    use crate::domain::session::DialogKey;

    fn refer() -> SipRequest {
        SipRequest::parse(
            b"REFER sip:alice@pbx.example.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKabc\r\n\
              From: Bob <sip:bob@example.com>;tag=ft\r\n\
              To: Alice <sip:alice@example.com>;tag=tt\r\n\
              Call-ID: blind-test@example.com\r\n\
              CSeq: 2 REFER\r\n\
              Refer-To: <sip:1000@pbx.example.com>\r\n\
              Referred-By: <sip:bob@example.com>\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap()
    }

    fn target() -> ReferTarget {
        ReferTarget {
            user: "1000".to_string(),
            host: "pbx.example.com".to_string(),
            replaces: None,
        }
    }

    fn bridged_session(bridges: &BridgeManager) -> (Arc<Session>, Arc<Channel>) {
        let session = Session::with_channel(
            DialogKey::new("blind-test@example.com", "tt", "ft"),
            "default",
            "PJSIP/alice-00000001",
        );
        let peer = Channel::new("PJSIP/peer-00000002");
        bridges.bridge_pair(&session.channel().unwrap(), &peer, true);
        (session, peer)
    }

    #[tokio::test]
    async fn test_unknown_extension_rejected_before_bridging() {
        let bridges = BridgeManager::new();
        let (session, _) = bridged_session(&bridges);
        let mut dialplan = MockDialplanResolver::new();
        dialplan
            .expect_extension_exists()
            .withf(|context, extension| context == "default" && extension == "1000")
            .return_const(false);

        let code =
            execute_blind_transfer(&session, &target(), &refer(), None, &bridges, &dialplan);
        assert_eq!(code, 404);
        assert!(!session.termination_deferred());
        assert_eq!(bridges.active_count(), 1);
    }

    #[tokio::test]
    async fn test_transfer_context_variable_overrides_endpoint() {
        let bridges = BridgeManager::new();
        let (session, _) = bridged_session(&bridges);
        session
            .channel()
            .unwrap()
            .set_variable("TRANSFER_CONTEXT", "sales");
        let mut dialplan = MockDialplanResolver::new();
        dialplan
            .expect_extension_exists()
            .withf(|context, _| context == "sales")
            .return_const(true);

        let code =
            execute_blind_transfer(&session, &target(), &refer(), None, &bridges, &dialplan);
        assert_eq!(code, 200);
        assert!(session.termination_deferred());
    }

    #[tokio::test]
    async fn test_replacement_leg_is_decorated() {
        let bridges = BridgeManager::new();
        let (session, peer) = bridged_session(&bridges);
        let mut dialplan = MockDialplanResolver::new();
        dialplan.expect_extension_exists().return_const(true);

        let code =
            execute_blind_transfer(&session, &target(), &refer(), None, &bridges, &dialplan);
        assert_eq!(code, 200);

        let new_leg = bridges.bridge_of(&peer).unwrap().peer_of(&peer).unwrap();
        assert_eq!(new_leg.variable("SIPTRANSFER").as_deref(), Some("yes"));
        assert_eq!(
            new_leg.variable("SIPREFERRINGCONTEXT").as_deref(),
            Some("default")
        );
        assert_eq!(
            new_leg.variable("SIPREFERREDBYHDR").as_deref(),
            Some("<sip:bob@example.com>")
        );
        assert_eq!(
            new_leg.variable("SIPREFERTOHDR").as_deref(),
            Some("<sip:1000@pbx.example.com>")
        );
    }

    #[tokio::test]
    async fn test_unobservable_leg_assumes_success() {
        use crate::infrastructure::protocols::sip::{SignalingSink, SipError, SipResponse};
        use std::sync::Mutex;

        struct RecordingSink {
            requests: Mutex<Vec<SipRequest>>,
        }

        #[async_trait::async_trait]
        impl SignalingSink for RecordingSink {
            async fn send_response(
                &self,
                _request: &SipRequest,
                _response: SipResponse,
            ) -> Result<(), SipError> {
                Ok(())
            }

            async fn send_request(&self, request: SipRequest) -> Result<(), SipError> {
                self.requests.lock().unwrap().push(request);
                Ok(())
            }
        }

        let sink = Arc::new(RecordingSink {
            requests: Mutex::new(Vec::new()),
        });
        let session = Session::with_channel(
            DialogKey::new("blind-test@example.com", "tt", "ft"),
            "default",
            "PJSIP/alice-00000001",
        );
        let monitor = ProgressMonitor::create(&session, &refer(), sink.clone())
            .await
            .unwrap()
            .unwrap();

        // A leg that is already gone cannot take the hook; the transfer
        // still counts as done
        let completion = completion_for(&refer(), "default".to_string(), Some(monitor.clone()));
        let dead_leg = Channel::new("Local/1000@default-dead");
        dead_leg.destroy();
        completion(&dead_leg);
        monitor.serializer().push_synchronous(async {}).await.unwrap();

        let bodies: Vec<String> = sink
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| String::from_utf8_lossy(request.body()).to_string())
            .collect();
        assert_eq!(
            bodies,
            vec!["SIP/2.0 100 Trying\r\n", "SIP/2.0 200 OK\r\n"]
        );
    }

    #[tokio::test]
    async fn test_session_without_channel_is_invalid() {
        let bridges = BridgeManager::new();
        let session = Session::new(DialogKey::new("blind-test@example.com", "tt", "ft"), "default");
        let dialplan = MockDialplanResolver::new();

        let code =
            execute_blind_transfer(&session, &target(), &refer(), None, &bridges, &dialplan);
        assert_eq!(code, 400);
    }
}
