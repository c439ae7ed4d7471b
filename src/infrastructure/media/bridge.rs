//! Media bridges between call legs
//!
//! The `BridgeManager` owns every active bridge and implements the two
//! transfer primitives on top of them: joining the far sides of two bridges
//! (attended) and replacing one side of a bridge with a freshly dialed leg
//! (blind).

use crate::domain::channel::Channel;
use crate::domain::shared::{DomainError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of a transfer attempt against the bridge layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The request itself was unworkable
    Invalid,
    /// Bridge policy forbids transferring these parties
    NotPermitted,
    /// The transfer was attempted but could not complete
    Failed,
    Success,
}

/// A bridge joining two (or, mid-splice, more) call legs
pub struct Bridge {
    id: Uuid,
    transfer_permitted: bool,
    participants: Mutex<Vec<Arc<Channel>>>,
}

impl Bridge {
    fn new(transfer_permitted: bool) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            transfer_permitted,
            participants: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn transfer_permitted(&self) -> bool {
        self.transfer_permitted
    }

    pub fn participants(&self) -> Vec<Arc<Channel>> {
        self.participants.lock().unwrap().clone()
    }

    /// The first participant that is not `channel`.
    pub fn peer_of(&self, channel: &Channel) -> Option<Arc<Channel>> {
        self.participants
            .lock()
            .unwrap()
            .iter()
            .find(|other| other.name() != channel.name())
            .cloned()
    }

    fn add(&self, channel: &Arc<Channel>) {
        self.participants.lock().unwrap().push(channel.clone());
    }

    fn remove(&self, channel: &Channel) {
        self.participants
            .lock()
            .unwrap()
            .retain(|other| other.name() != channel.name());
    }
}

/// Callback run with the replacement leg created by a blind transfer, before
/// the leg enters the bridge.
pub type BlindCompletion = Box<dyn FnOnce(&Arc<Channel>) + Send>;

/// Owns all active bridges. Channel names are assumed unique.
#[derive(Default)]
pub struct BridgeManager {
    bridges: RwLock<HashMap<Uuid, Arc<Bridge>>>,
    memberships: RwLock<HashMap<String, Uuid>>,
}

impl BridgeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bridge two legs together.
    pub fn bridge_pair(
        &self,
        a: &Arc<Channel>,
        b: &Arc<Channel>,
        transfer_permitted: bool,
    ) -> Arc<Bridge> {
        let bridge = Bridge::new(transfer_permitted);
        bridge.add(a);
        bridge.add(b);
        self.bridges.write().unwrap().insert(bridge.id(), bridge.clone());
        let mut memberships = self.memberships.write().unwrap();
        memberships.insert(a.name().to_string(), bridge.id());
        memberships.insert(b.name().to_string(), bridge.id());
        info!("Bridged '{}' with '{}'", a.name(), b.name());
        bridge
    }

    pub fn bridge_of(&self, channel: &Channel) -> Option<Arc<Bridge>> {
        let id = *self.memberships.read().unwrap().get(channel.name())?;
        self.bridges.read().unwrap().get(&id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.bridges.read().unwrap().len()
    }

    /// Tear a bridge down, releasing its memberships.
    pub fn dissolve(&self, bridge: &Arc<Bridge>) {
        self.bridges.write().unwrap().remove(&bridge.id());
        let mut memberships = self.memberships.write().unwrap();
        for participant in bridge.participants() {
            memberships.remove(participant.name());
        }
        debug!("Dissolved bridge '{}'", bridge.id());
    }

    /// Attended transfer: connect the peer of `a` with the peer of `b`,
    /// dissolving both original bridges. The transferer legs are left for
    /// their sessions to hang up.
    pub fn attended_transfer(&self, a: &Arc<Channel>, b: &Arc<Channel>) -> TransferOutcome {
        if a.name() == b.name() {
            return TransferOutcome::Invalid;
        }
        let bridge_a = match self.bridge_of(a) {
            Some(bridge) => bridge,
            None => return TransferOutcome::Invalid,
        };
        let bridge_b = match self.bridge_of(b) {
            Some(bridge) => bridge,
            None => return TransferOutcome::Invalid,
        };
        if bridge_a.id() == bridge_b.id() {
            return TransferOutcome::Invalid;
        }
        if !bridge_a.transfer_permitted() || !bridge_b.transfer_permitted() {
            warn!(
                "Transfer between '{}' and '{}' denied by bridge policy",
                a.name(),
                b.name()
            );
            return TransferOutcome::NotPermitted;
        }
        let peer_a = match bridge_a.peer_of(a) {
            Some(peer) => peer,
            None => return TransferOutcome::Failed,
        };
        let peer_b = match bridge_b.peer_of(b) {
            Some(peer) => peer,
            None => return TransferOutcome::Failed,
        };
        self.dissolve(&bridge_a);
        self.dissolve(&bridge_b);
        self.bridge_pair(&peer_a, &peer_b, true);
        info!(
            "Attended transfer joined '{}' with '{}'",
            peer_a.name(),
            peer_b.name()
        );
        TransferOutcome::Success
    }

    /// Blind transfer: dial `extension@context` on a new leg and bridge it
    /// with the transferer's peer. `on_complete` decorates the new leg
    /// before it enters the bridge.
    pub fn blind_transfer(
        &self,
        transferer: &Arc<Channel>,
        extension: &str,
        context: &str,
        on_complete: BlindCompletion,
    ) -> TransferOutcome {
        let bridge = match self.bridge_of(transferer) {
            Some(bridge) => bridge,
            None => return TransferOutcome::Invalid,
        };
        if !bridge.transfer_permitted() {
            warn!(
                "Blind transfer of '{}' denied by bridge policy",
                transferer.name()
            );
            return TransferOutcome::NotPermitted;
        }
        let peer = match bridge.peer_of(transferer) {
            Some(peer) => peer,
            None => return TransferOutcome::Failed,
        };
        let new_leg = Channel::new(format!(
            "Local/{}@{}-{:08x}",
            extension,
            context,
            rand::random::<u32>()
        ));
        on_complete(&new_leg);
        self.dissolve(&bridge);
        self.bridge_pair(&peer, &new_leg, true);
        info!(
            "Blind transfer redirected '{}' to '{}'",
            peer.name(),
            new_leg.name()
        );
        TransferOutcome::Success
    }

    /// Splice `new_leg` into an existing bridge, optionally swapping out a
    /// participant that is removed and destroyed.
    pub fn impart(
        &self,
        bridge: &Arc<Bridge>,
        new_leg: &Arc<Channel>,
        swap: Option<&Arc<Channel>>,
    ) -> Result<()> {
        if !self.bridges.read().unwrap().contains_key(&bridge.id()) {
            return Err(DomainError::NotFound(format!(
                "Bridge '{}' no longer exists",
                bridge.id()
            )));
        }
        let mut memberships = self.memberships.write().unwrap();
        if let Some(old) = swap {
            bridge.remove(old);
            memberships.remove(old.name());
            old.destroy();
        }
        bridge.add(new_leg);
        memberships.insert(new_leg.name().to_string(), bridge.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(manager: &BridgeManager, a: &str, b: &str, permitted: bool) -> (Arc<Channel>, Arc<Channel>) {
        let a = Channel::new(a);
        let b = Channel::new(b);
        manager.bridge_pair(&a, &b, permitted);
        (a, b)
    }

    #[test]
    fn test_attended_transfer_joins_peers() {
        let manager = BridgeManager::new();
        let (a, x) = pair(&manager, "A", "X", true);
        let (b, y) = pair(&manager, "B", "Y", true);

        assert_eq!(manager.attended_transfer(&a, &b), TransferOutcome::Success);
        assert_eq!(manager.active_count(), 1);
        let bridge = manager.bridge_of(&x).unwrap();
        assert_eq!(bridge.peer_of(&x).unwrap().name(), y.name());
        assert!(manager.bridge_of(&a).is_none());
        assert!(manager.bridge_of(&b).is_none());
    }

    #[test]
    fn test_attended_transfer_requires_two_bridges() {
        let manager = BridgeManager::new();
        let (a, x) = pair(&manager, "A", "X", true);
        let unbridged = Channel::new("B");

        assert_eq!(
            manager.attended_transfer(&a, &unbridged),
            TransferOutcome::Invalid
        );
        assert_eq!(manager.attended_transfer(&a, &a), TransferOutcome::Invalid);
        // Both legs in the same bridge cannot be joined with themselves
        assert_eq!(manager.attended_transfer(&a, &x), TransferOutcome::Invalid);
    }

    #[test]
    fn test_attended_transfer_honors_policy() {
        let manager = BridgeManager::new();
        let (a, _) = pair(&manager, "A", "X", false);
        let (b, _) = pair(&manager, "B", "Y", true);

        assert_eq!(
            manager.attended_transfer(&a, &b),
            TransferOutcome::NotPermitted
        );
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn test_blind_transfer_replaces_transferer() {
        let manager = BridgeManager::new();
        let (a, x) = pair(&manager, "A", "X", true);

        let outcome = manager.blind_transfer(
            &a,
            "1000",
            "default",
            Box::new(|leg| leg.set_variable("SIPTRANSFER", "yes")),
        );
        assert_eq!(outcome, TransferOutcome::Success);
        assert!(manager.bridge_of(&a).is_none());

        let new_peer = manager.bridge_of(&x).unwrap().peer_of(&x).unwrap();
        assert!(new_peer.name().starts_with("Local/1000@default-"));
        assert_eq!(new_peer.variable("SIPTRANSFER").as_deref(), Some("yes"));
    }

    #[test]
    fn test_blind_transfer_requires_bridge() {
        let manager = BridgeManager::new();
        let lone = Channel::new("A");
        assert_eq!(
            manager.blind_transfer(&lone, "1000", "default", Box::new(|_| {})),
            TransferOutcome::Invalid
        );
    }

    #[test]
    fn test_impart_with_swap() {
        let manager = BridgeManager::new();
        let (a, x) = pair(&manager, "A", "X", true);
        let bridge = manager.bridge_of(&a).unwrap();
        let replacement = Channel::new("R");

        manager.impart(&bridge, &replacement, Some(&a)).unwrap();
        assert!(a.is_destroyed());
        assert_eq!(bridge.peer_of(&x).unwrap().name(), "R");
        assert_eq!(manager.bridge_of(&replacement).unwrap().id(), bridge.id());

        manager.dissolve(&bridge);
        assert!(manager.impart(&bridge, &replacement, None).is_err());
    }
}
