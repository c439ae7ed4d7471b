//! Attended transfer execution

use super::progress::{Notification, ProgressMonitor};
use crate::domain::channel::Channel;
use crate::domain::session::Session;
use crate::domain::shared::{DomainError, Result};
use crate::infrastructure::media::bridge::{BridgeManager, TransferOutcome};
use crate::infrastructure::protocols::sip::SubscriptionState;
use std::sync::Arc;
use tracing::debug;

/// Map a bridge-layer outcome to the SIP final response for the REFER.
pub fn response_code(outcome: TransferOutcome) -> u16 {
    match outcome {
        TransferOutcome::Invalid => 400,
        TransferOutcome::NotPermitted => 403,
        TransferOutcome::Failed => 500,
        TransferOutcome::Success => 200,
    }
}

/// A resolved attended transfer, ready to run on the target's serializer
pub struct ReferAttended {
    transferer: Arc<Session>,
    transferer_channel: Arc<Channel>,
    target: Arc<Session>,
    progress: Option<Arc<ProgressMonitor>>,
    bridges: Arc<BridgeManager>,
}

impl ReferAttended {
    pub fn new(
        transferer: &Arc<Session>,
        target: &Arc<Session>,
        progress: Option<Arc<ProgressMonitor>>,
        bridges: Arc<BridgeManager>,
    ) -> Result<Self> {
        let transferer_channel = transferer.channel().ok_or_else(|| {
            DomainError::InvalidOperation(format!(
                "Session '{}' has no channel to transfer",
                transferer.id()
            ))
        })?;
        Ok(Self {
            transferer: transferer.clone(),
            transferer_channel,
            target: target.clone(),
            progress,
            bridges,
        })
    }

    /// Perform the transfer. Must run on the target session's serializer so
    /// both ends are touched under a single ordering domain.
    pub async fn run(self) {
        debug!(
            "Performing attended transfer from session '{}' to session '{}'",
            self.transferer.id(),
            self.target.id()
        );
        let outcome = match self.target.channel() {
            Some(target_channel) => self
                .bridges
                .attended_transfer(&self.transferer_channel, &target_channel),
            // Target hung up between resolution and execution
            None => TransferOutcome::Failed,
        };

        let response = response_code(outcome);
        if outcome == TransferOutcome::Success {
            self.transferer.defer_termination();
        }
        debug!(
            "Attended transfer from session '{}' finished with response '{}'",
            self.transferer.id(),
            response
        );
        if let Some(progress) = self.progress {
            Notification::new(progress, response, SubscriptionState::Terminated).dispatch();
        }
    }
}
