//! In-dialog REFER handling
//!
//! Classifies a REFER as attended (Refer-To carries a Replaces directive
//! naming a local dialog) or blind (plain target resolved through the
//! dialplan), sets up progress monitoring, and runs the transfer.

use super::attended::ReferAttended;
use super::blind::execute_blind_transfer;
use super::progress::{Notification, ProgressMonitor};
use crate::domain::routing::DialplanResolver;
use crate::domain::session::{DialogKey, Session, SessionRegistry};
use crate::infrastructure::media::bridge::BridgeManager;
use crate::infrastructure::protocols::sip::{
    parse_refer_target, ReplacesRef, ResponseBuilder, SignalingSink, SipError, SipRequest,
    SubscriptionState,
};
use rsip::Header;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Handles REFER requests arriving on established sessions
pub struct ReferHandler {
    registry: Arc<SessionRegistry>,
    bridges: Arc<BridgeManager>,
    dialplan: Arc<dyn DialplanResolver>,
    sink: Arc<dyn SignalingSink>,
}

impl ReferHandler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bridges: Arc<BridgeManager>,
        dialplan: Arc<dyn DialplanResolver>,
        sink: Arc<dyn SignalingSink>,
    ) -> Self {
        Self {
            registry,
            bridges,
            dialplan,
            sink,
        }
    }

    pub async fn handle(
        &self,
        session: &Arc<Session>,
        request: &SipRequest,
    ) -> Result<(), SipError> {
        let Some(refer_to_raw) = request.refer_to() else {
            debug!(
                "Received REFER without Refer-To on session '{}'",
                session.id()
            );
            self.respond(request, 400, false).await;
            return Ok(());
        };
        let target = match parse_refer_target(&refer_to_raw) {
            Ok(target) => target,
            Err(err) => {
                debug!(
                    "Received REFER with unparseable Refer-To '{}' on session '{}': {}",
                    refer_to_raw,
                    session.id(),
                    err
                );
                self.respond(request, 400, false).await;
                return Ok(());
            }
        };

        let progress = match ProgressMonitor::create(session, request, self.sink.clone()).await {
            Ok(progress) => progress,
            Err(err) => {
                debug!(
                    "Could not set up subscription for REFER on session '{}': {}",
                    session.id(),
                    err
                );
                self.respond(request, 500, false).await;
                return Ok(());
            }
        };

        let response = match &target.replaces {
            Some(replaces) => self.attended(session, replaces, progress.clone()).await,
            None => execute_blind_transfer(
                session,
                &target,
                request,
                progress.clone(),
                &self.bridges,
                self.dialplan.as_ref(),
            ),
        };

        match progress {
            None => {
                debug!(
                    "Progress monitoring not requested on session '{}', sending immediate response '{}'",
                    session.id(),
                    response
                );
                self.respond(request, response, true).await;
            }
            Some(progress) if response != 200 => {
                // The transfer never started; close the subscription out
                Notification::new(progress, response, SubscriptionState::Terminated).dispatch();
            }
            Some(_) => {
                // Deferred completion or the frame hook will report the rest
            }
        }
        Ok(())
    }

    /// Resolve the Replaces directive and queue the attended transfer onto
    /// the target session's serializer.
    async fn attended(
        &self,
        session: &Arc<Session>,
        replaces: &ReplacesRef,
        progress: Option<Arc<ProgressMonitor>>,
    ) -> u16 {
        let key = DialogKey::new(&replaces.call_id, &replaces.to_tag, &replaces.from_tag);
        let Some(dialog) = self.registry.find_dialog(&key) else {
            error!(
                "REFER on session '{}' names dialog '{}' which is not locally known",
                session.id(),
                replaces.call_id
            );
            return 404;
        };
        let Some(target) = dialog.session() else {
            debug!(
                "REFER on session '{}' names dialog '{}' which has no session",
                session.id(),
                replaces.call_id
            );
            return 603;
        };

        let attended = match ReferAttended::new(session, &target, progress, self.bridges.clone()) {
            Ok(attended) => attended,
            Err(err) => {
                warn!(
                    "Cannot prepare attended transfer on session '{}': {}",
                    session.id(),
                    err
                );
                return 500;
            }
        };
        if target
            .serializer()
            .push(async move { attended.run().await })
            .is_err()
        {
            return 500;
        }
        debug!(
            "Queued attended transfer from session '{}' to session '{}'",
            session.id(),
            target.id()
        );
        200
    }

    async fn respond(&self, request: &SipRequest, code: u16, decline_refer_sub: bool) {
        let mut builder = ResponseBuilder::new(code);
        if decline_refer_sub {
            builder = builder.header(Header::Other("Refer-Sub".to_string(), "false".to_string()));
        }
        match builder.build_for_request(request) {
            Ok(response) => {
                if let Err(err) = self.sink.send_response(request, response).await {
                    warn!("Failed to send '{}' response to REFER: {}", code, err);
                }
            }
            Err(err) => warn!("Failed to build '{}' response to REFER: {}", code, err),
        }
    }
}
