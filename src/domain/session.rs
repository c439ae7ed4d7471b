//! SIP sessions and their dialogs
//!
//! A `Session` ties together a dialog, the channel currently carrying the
//! call, and the serializer on which all work touching the session runs. The
//! `SessionRegistry` resolves Replaces references to locally known dialogs.

use crate::domain::channel::Channel;
use crate::infrastructure::serializer::Serializer;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use uuid::Uuid;

/// Identifies a dialog by Call-ID and tags
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogKey {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
}

impl DialogKey {
    pub fn new(call_id: &str, to_tag: &str, from_tag: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            to_tag: to_tag.to_string(),
            from_tag: from_tag.to_string(),
        }
    }
}

/// Typed data attachments living on a dialog.
///
/// Features hang their per-dialog state here, keyed by name, the way a
/// protocol stack exposes per-module dialog data.
#[derive(Default)]
pub struct DialogState {
    attachments: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl DialogState {
    pub fn attach<T: Any + Send + Sync>(&mut self, key: &str, value: Arc<T>) {
        self.attachments.insert(key.to_string(), value);
    }

    pub fn attachment<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.attachments
            .get(key)
            .and_then(|value| value.clone().downcast::<T>().ok())
    }

    pub fn detach(&mut self, key: &str) -> bool {
        self.attachments.remove(key).is_some()
    }

    pub fn has(&self, key: &str) -> bool {
        self.attachments.contains_key(key)
    }
}

/// A SIP dialog
pub struct Dialog {
    id: Uuid,
    key: DialogKey,
    /// Lock order: never wait on this while holding a feature's own lock
    /// from inside a serialized task; see the transfer progress monitor.
    pub state: AsyncMutex<DialogState>,
    session: Mutex<Weak<Session>>,
}

impl Dialog {
    fn new(key: DialogKey) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            key,
            state: AsyncMutex::new(DialogState::default()),
            session: Mutex::new(Weak::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &DialogKey {
        &self.key
    }

    /// The session currently bound to this dialog, if it still exists.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().unwrap().upgrade()
    }

    fn bind_session(&self, session: &Arc<Session>) {
        *self.session.lock().unwrap() = Arc::downgrade(session);
    }
}

/// INVITE dialog usage state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteState {
    Null,
    Calling,
    Early,
    Confirmed,
    Terminated,
}

/// A call session bound to a dialog
pub struct Session {
    id: Uuid,
    endpoint_context: String,
    dialog: Arc<Dialog>,
    serializer: Serializer,
    channel: Mutex<Option<Arc<Channel>>>,
    state: Mutex<InviteState>,
    defer_termination: AtomicBool,
}

impl Session {
    pub fn new(dialog_key: DialogKey, endpoint_context: &str) -> Arc<Self> {
        let dialog = Dialog::new(dialog_key);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            endpoint_context: endpoint_context.to_string(),
            dialog: dialog.clone(),
            serializer: Serializer::new("session"),
            channel: Mutex::new(None),
            state: Mutex::new(InviteState::Null),
            defer_termination: AtomicBool::new(false),
        });
        dialog.bind_session(&session);
        session
    }

    /// Convenience constructor creating the session together with its channel.
    pub fn with_channel(
        dialog_key: DialogKey,
        endpoint_context: &str,
        channel_name: &str,
    ) -> Arc<Self> {
        let session = Self::new(dialog_key, endpoint_context);
        session.set_channel(Channel::new(channel_name));
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint_context(&self) -> &str {
        &self.endpoint_context
    }

    pub fn dialog(&self) -> &Arc<Dialog> {
        &self.dialog
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().unwrap().clone()
    }

    pub fn set_channel(&self, channel: Arc<Channel>) {
        *self.channel.lock().unwrap() = Some(channel);
    }

    pub fn take_channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().unwrap().take()
    }

    pub fn state(&self) -> InviteState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: InviteState) {
        *self.state.lock().unwrap() = state;
    }

    /// Mark that termination of this session is handed off to the far end.
    ///
    /// After a successful transfer the transferer is expected to hang up;
    /// the session must not be torn down locally in the meantime.
    pub fn defer_termination(&self) {
        debug!("Deferring termination of session '{}'", self.id);
        self.defer_termination.store(true, Ordering::SeqCst);
    }

    pub fn termination_deferred(&self) -> bool {
        self.defer_termination.load(Ordering::SeqCst)
    }

    /// Hang the session up, destroying its channel.
    pub fn hangup(&self) {
        if let Some(channel) = self.take_channel() {
            channel.destroy();
        }
        self.set_state(InviteState::Terminated);
    }
}

/// Locally known dialogs, indexed for Replaces resolution
#[derive(Default)]
pub struct SessionRegistry {
    dialogs: RwLock<HashMap<DialogKey, Arc<Dialog>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: &Arc<Session>) {
        let dialog = session.dialog().clone();
        self.dialogs
            .write()
            .unwrap()
            .insert(dialog.key().clone(), dialog);
    }

    pub fn remove(&self, key: &DialogKey) -> bool {
        self.dialogs.write().unwrap().remove(key).is_some()
    }

    pub fn find_dialog(&self, key: &DialogKey) -> Option<Arc<Dialog>> {
        self.dialogs.read().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.dialogs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(call_id: &str) -> DialogKey {
        DialogKey::new(call_id, "to-tag", "from-tag")
    }

    #[tokio::test]
    async fn test_registry_resolves_dialog() {
        let registry = SessionRegistry::new();
        let session = Session::with_channel(key("abc"), "default", "PJSIP/alice-00000001");
        registry.insert(&session);

        let dialog = registry.find_dialog(&key("abc")).unwrap();
        assert_eq!(dialog.session().unwrap().id(), session.id());
        assert!(registry.find_dialog(&key("other")).is_none());

        assert!(registry.remove(&key("abc")));
        assert!(registry.find_dialog(&key("abc")).is_none());
    }

    #[tokio::test]
    async fn test_dialog_session_is_weak() {
        let registry = SessionRegistry::new();
        let session = Session::new(key("abc"), "default");
        registry.insert(&session);
        drop(session);

        let dialog = registry.find_dialog(&key("abc")).unwrap();
        assert!(dialog.session().is_none());
    }

    #[tokio::test]
    async fn test_dialog_attachments_are_typed() {
        let session = Session::new(key("abc"), "default");
        let mut state = session.dialog().state.lock().await;
        state.attach("marker", Arc::new(42u32));

        assert_eq!(state.attachment::<u32>("marker").as_deref(), Some(&42));
        assert!(state.attachment::<String>("marker").is_none());
        assert!(state.detach("marker"));
        assert!(!state.has("marker"));
    }

    #[tokio::test]
    async fn test_new_session_has_no_dialog_usage_yet() {
        let session = Session::new(key("abc"), "default");
        assert_eq!(session.state(), InviteState::Null);
    }

    #[tokio::test]
    async fn test_hangup_clears_channel() {
        let session = Session::with_channel(key("abc"), "default", "PJSIP/alice-00000001");
        let channel = session.channel().unwrap();
        session.hangup();
        assert!(channel.is_destroyed());
        assert!(session.channel().is_none());
        assert_eq!(session.state(), InviteState::Terminated);
    }
}
