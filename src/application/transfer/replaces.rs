//! INVITE with Replaces handling
//!
//! A new INVITE carrying a Replaces header takes over an existing call: the
//! replaced dialog's channel leaves its bridge (or hands its role over
//! directly when unbridged) and the new call steps in.

use crate::domain::session::{DialogKey, InviteState, Session, SessionRegistry};
use crate::infrastructure::media::bridge::BridgeManager;
use crate::infrastructure::protocols::sip::{
    parse_replaces, ResponseBuilder, SignalingSink, SipError, SipRequest,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handles incoming INVITEs that carry a Replaces header
pub struct InviteReplacesHandler {
    registry: Arc<SessionRegistry>,
    bridges: Arc<BridgeManager>,
    sink: Arc<dyn SignalingSink>,
}

impl InviteReplacesHandler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bridges: Arc<BridgeManager>,
        sink: Arc<dyn SignalingSink>,
    ) -> Self {
        Self {
            registry,
            bridges,
            sink,
        }
    }

    /// Returns false when the INVITE carries no Replaces header and is none
    /// of our business.
    pub async fn handle(
        &self,
        session: &Arc<Session>,
        request: &SipRequest,
    ) -> Result<bool, SipError> {
        let Some(raw) = request.header_value("Replaces") else {
            return Ok(false);
        };

        let replaces = match parse_replaces(&raw) {
            Ok(replaces) => replaces,
            Err(err) => {
                debug!("INVITE with malformed Replaces '{}': {}", raw, err);
                self.fail(session, request, 400).await;
                return Ok(true);
            }
        };

        let key = DialogKey::new(&replaces.call_id, &replaces.to_tag, &replaces.from_tag);
        let Some(other_dialog) = self.registry.find_dialog(&key) else {
            debug!(
                "INVITE with Replaces names dialog '{}' which is not locally known",
                replaces.call_id
            );
            self.fail(session, request, 481).await;
            return Ok(true);
        };
        let Some(other_session) = other_dialog.session() else {
            debug!(
                "INVITE with Replaces names dialog '{}' which has no session",
                replaces.call_id
            );
            self.fail(session, request, 481).await;
            return Ok(true);
        };

        // Fetch the replaced channel and its bridge under the other
        // session's serializer; we are not running on it.
        let bridges = self.bridges.clone();
        let other = other_session.clone();
        let fetched = other_session
            .serializer()
            .push_synchronous(async move {
                other
                    .channel()
                    .map(|channel| {
                        let bridge = bridges.bridge_of(&channel);
                        (channel, bridge)
                    })
            })
            .await;
        let Ok(Some((other_channel, bridge))) = fetched else {
            debug!(
                "Dialog '{}' has no channel left to replace",
                replaces.call_id
            );
            self.fail(session, request, 481).await;
            return Ok(true);
        };

        // Answer before splicing so media can flow the moment we swap
        session.set_state(InviteState::Confirmed);
        info!(
            "Channel '{}' is being replaced by session '{}'",
            other_channel.name(),
            session.id()
        );

        let failure = match bridge {
            Some(bridge) => match session.channel() {
                Some(new_channel) => self
                    .bridges
                    .impart(&bridge, &new_channel, Some(&other_channel))
                    .is_err(),
                None => true,
            },
            None => match session.take_channel() {
                // Unbridged: the new channel directly assumes the old
                // one's role and the old channel is hung up
                Some(new_channel) => {
                    other_session.set_channel(new_channel);
                    other_channel.destroy();
                    false
                }
                None => true,
            },
        };

        if failure {
            self.fail(session, request, 500).await;
        } else {
            debug!(
                "INVITE with Replaces of dialog '{}' completed",
                replaces.call_id
            );
        }
        Ok(true)
    }

    async fn fail(&self, session: &Arc<Session>, request: &SipRequest, code: u16) {
        debug!(
            "INVITE with Replaces on session '{}' failed, sending '{}'",
            session.id(),
            code
        );
        let builder = match code {
            400 => ResponseBuilder::bad_request(),
            500 => ResponseBuilder::server_internal_error(),
            other => ResponseBuilder::new(other),
        };
        match builder.build_for_request(request) {
            Ok(response) => {
                if let Err(err) = self.sink.send_response(request, response).await {
                    warn!("Failed to send '{}' response to INVITE: {}", code, err);
                }
            }
            Err(err) => warn!("Failed to build '{}' response to INVITE: {}", code, err),
        }
        session.defer_termination();
        session.hangup();
    }
}
