//! Channel abstraction - a single call leg with variables and frame observers
//!
//! A channel carries the media leg of a call. Interested parties can attach
//! frame observers to watch the frames flowing through the leg, which is how
//! transfer progress is tracked on the replacement leg of a blind transfer.

use crate::domain::shared::{DomainError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Identifier of an attached frame observer
pub type HookId = u64;

/// Control frame subclasses seen on a call leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSubclass {
    Ring,
    Ringing,
    Proceeding,
    Progress,
    Busy,
    Congestion,
    Answer,
    Hold,
    Unhold,
}

/// A frame travelling through a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Voice,
    Control(ControlSubclass),
}

/// Direction a frame is travelling, relative to the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Read,
    Write,
}

/// Observer attached to a channel's frame stream
pub trait FrameObserver: Send + Sync {
    /// Called for every frame passing through the channel.
    fn on_frame(&self, channel: &Arc<Channel>, direction: FrameDirection, frame: &Frame);

    /// Called when the channel is destroyed while the observer is still attached.
    fn on_destroy(&self);
}

/// A call leg with variables and an observer list
pub struct Channel {
    name: String,
    variables: RwLock<HashMap<String, String>>,
    observers: Mutex<Vec<(HookId, Arc<dyn FrameObserver>)>>,
    next_hook_id: AtomicU64,
    destroyed: AtomicBool,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            variables: RwLock::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_variable(&self, name: &str, value: &str) {
        self.variables
            .write()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    pub fn variable(&self, name: &str) -> Option<String> {
        self.variables.read().unwrap().get(name).cloned()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Attach a frame observer. Fails once the channel has been destroyed.
    pub fn attach_observer(&self, observer: Arc<dyn FrameObserver>) -> Result<HookId> {
        if self.is_destroyed() {
            return Err(DomainError::InvalidOperation(format!(
                "Channel '{}' is destroyed",
                self.name
            )));
        }
        let id = self.next_hook_id.fetch_add(1, Ordering::SeqCst);
        self.observers.lock().unwrap().push((id, observer));
        Ok(id)
    }

    /// Detach an observer. Returns false when it was no longer attached.
    pub fn detach_observer(&self, id: HookId) -> bool {
        let mut observers = self.observers.lock().unwrap();
        let before = observers.len();
        observers.retain(|(hook_id, _)| *hook_id != id);
        observers.len() != before
    }

    /// Push a frame through the channel, notifying every attached observer.
    pub fn feed_frame(self: &Arc<Self>, direction: FrameDirection, frame: Frame) {
        if self.is_destroyed() {
            return;
        }
        // Observers may detach themselves from inside the callback, so the
        // list lock must not be held while they run.
        let observers: Vec<Arc<dyn FrameObserver>> = self
            .observers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer.on_frame(self, direction, &frame);
        }
    }

    /// Tear the channel down, informing any observers still attached.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Destroying channel '{}'", self.name);
        let drained = std::mem::take(&mut *self.observers.lock().unwrap());
        for (_, observer) in drained {
            observer.on_destroy();
        }
    }
}
