//! Transfer progress monitoring
//!
//! A `ProgressMonitor` tracks one transfer and reports its progress over the
//! implicit refer subscription. All notifications for a monitor funnel
//! through the monitor's own serializer, giving a single total order and a
//! single place where the terminal notification can retire the monitor.
//!
//! The monitor is reachable from two sides: the frame hook feeding progress
//! events, and the dialog attachment through which a remote unsubscribe
//! finds it. Exactly one terminal notification wins; everything after it
//! finds the subscription handle cleared and degrades to a no-op.

use crate::domain::channel::{Channel, ControlSubclass, HookId};
use crate::domain::session::{Dialog, Session};
use crate::infrastructure::protocols::sip::{
    ReferSubscription, SignalingSink, SipError, SipRequest, SubscriptionState,
};
use crate::infrastructure::serializer::Serializer;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// Key under which a monitor hangs off its dialog's state
pub const REFER_PROGRESS_ATTACHMENT: &str = "refer-progress";

/// Monitors one transfer's progress toward its subscriber
pub struct ProgressMonitor {
    /// Cleared exactly once, by the terminal notification or by a remote
    /// unsubscribe. `None` means the subscriber no longer listens.
    subscription: AsyncMutex<Option<Arc<ReferSubscription>>>,
    dialog: Arc<Dialog>,
    hook: Mutex<Option<(Arc<Channel>, HookId)>>,
    last_subclass: Mutex<Option<ControlSubclass>>,
    serializer: Serializer,
}

impl ProgressMonitor {
    /// Set up progress monitoring for the REFER carried by `request`.
    ///
    /// Returns `Ok(None)` when the requester opted out with `Refer-Sub`,
    /// in which case the transfer reports through an immediate final
    /// response instead. Otherwise the REFER is accepted with 202, the
    /// monitor is attached to the session's dialog, and an initial
    /// `100 Trying` notification is queued.
    pub async fn create(
        session: &Arc<Session>,
        request: &SipRequest,
        sink: Arc<dyn SignalingSink>,
    ) -> Result<Option<Arc<Self>>, SipError> {
        let refer_sub = request.refer_sub();
        if let Some(value) = &refer_sub {
            if !value.trim().eq_ignore_ascii_case("true") {
                debug!(
                    "Progress monitoring declined by Refer-Sub '{}' on session '{}'",
                    value,
                    session.id()
                );
                return Ok(None);
            }
        }

        let subscription =
            ReferSubscription::create(request, refer_sub.is_some(), sink).await?;
        let dialog = session.dialog().clone();
        let monitor = Arc::new(Self {
            subscription: AsyncMutex::new(Some(subscription)),
            dialog: dialog.clone(),
            hook: Mutex::new(None),
            last_subclass: Mutex::new(None),
            serializer: Serializer::new("refer-progress"),
        });

        // The dialog association is how a remote unsubscribe finds us
        dialog
            .state
            .lock()
            .await
            .attach(REFER_PROGRESS_ATTACHMENT, monitor.clone());

        debug!(
            "Created progress monitor for session '{}' on dialog '{}'",
            session.id(),
            dialog.id()
        );
        Notification::new(monitor.clone(), 100, SubscriptionState::Active).dispatch();
        Ok(Some(monitor))
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    pub fn dialog(&self) -> &Arc<Dialog> {
        &self.dialog
    }

    /// Record the channel and hook id through which frames are observed.
    pub fn bind_hook(&self, channel: Arc<Channel>, id: HookId) {
        *self.hook.lock().unwrap() = Some((channel, id));
    }

    pub(crate) fn take_hook(&self) -> Option<(Arc<Channel>, HookId)> {
        self.hook.lock().unwrap().take()
    }

    pub(crate) fn last_subclass(&self) -> Option<ControlSubclass> {
        *self.last_subclass.lock().unwrap()
    }

    /// Record a control subclass, returning what was recorded before.
    pub(crate) fn swap_subclass(&self, subclass: ControlSubclass) -> Option<ControlSubclass> {
        self.last_subclass.lock().unwrap().replace(subclass)
    }
}

/// One progress report on its way to the subscriber
pub struct Notification {
    monitor: Arc<ProgressMonitor>,
    response: u16,
    state: SubscriptionState,
}

impl Notification {
    pub fn new(monitor: Arc<ProgressMonitor>, response: u16, state: SubscriptionState) -> Self {
        Self {
            monitor,
            response,
            state,
        }
    }

    /// Queue delivery on the monitor's serializer and return immediately.
    pub fn dispatch(self) {
        let serializer = self.monitor.serializer.clone();
        if serializer.push(async move { self.deliver().await }).is_err() {
            debug!("Dropping progress notification, monitor serializer has stopped");
        }
    }

    /// Delivery body. Runs only on the monitor's serializer.
    async fn deliver(self) {
        let mut guard = self.monitor.subscription.lock().await;
        let subscription = match guard.clone() {
            Some(subscription) => subscription,
            None => {
                debug!(
                    "Not sending NOTIFY with response '{}', subscription already terminated",
                    self.response
                );
                return;
            }
        };

        if self.state == SubscriptionState::Terminated {
            // Retire the monitor before sending so nothing can race a
            // second terminal notification in behind this one.
            if let Some((channel, id)) = self.monitor.take_hook() {
                channel.detach_observer(id);
                debug!("Detached progress hook from channel '{}'", channel.name());
            }
            self.monitor
                .dialog
                .state
                .lock()
                .await
                .detach(REFER_PROGRESS_ATTACHMENT);
            *guard = None;
        }
        drop(guard);

        debug!(
            "Sending NOTIFY with response '{}' and state '{:?}' on subscription '{}'",
            self.response,
            self.state,
            subscription.id()
        );
        if let Err(err) = subscription.notify(self.state, self.response).await {
            warn!("Failed to send transfer progress NOTIFY: {}", err);
        }
    }
}

/// Handle a remote termination of the refer subscription on `dialog`.
///
/// A notification queued on the monitor's serializer may be about to take
/// the dialog state lock, so that lock must not be held while waiting for
/// the serializer to clear the subscription handle.
pub async fn on_subscription_terminated(dialog: &Arc<Dialog>) {
    let monitor: Option<Arc<ProgressMonitor>> = dialog
        .state
        .lock()
        .await
        .attachment(REFER_PROGRESS_ATTACHMENT);
    let Some(monitor) = monitor else {
        return;
    };

    debug!(
        "Refer subscription on dialog '{}' remotely terminated, clearing monitor",
        dialog.id()
    );
    let cleared = monitor.clone();
    let pushed = monitor
        .serializer()
        .push_synchronous(async move {
            cleared.subscription.lock().await.take();
        })
        .await;
    if pushed.is_err() {
        debug!("Monitor serializer already stopped during remote termination");
    }

    // A terminal notification may have detached us in the meantime
    let mut state = dialog.state.lock().await;
    if state.has(REFER_PROGRESS_ATTACHMENT) {
        state.detach(REFER_PROGRESS_ATTACHMENT);
    }
    drop(state);

    if let Some((channel, id)) = monitor.take_hook() {
        channel.detach_observer(id);
        debug!(
            "Detached progress hook from channel '{}' after remote termination",
            channel.name()
        );
    }
}
