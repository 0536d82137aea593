//! Bridge state: the registry, connection table, watch ownership.
//!
//! Owned exclusively by the bridge loop. No concurrent access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::geo::permission::HostPermissionGate;
use crate::geo::registry::{HostRequest, RegistryEvent, WatchRegistry};
use crate::geo::sim::{SimControl, SimulatedBackend};
use crate::ipc::protocol::{Message, Role};

use super::BridgeConfig;

/// Registry type hosted by the daemon.
pub type Registry = WatchRegistry<SimulatedBackend, HostPermissionGate>;

/// Unique identifier for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    /// `None` until the handshake succeeds.
    role: Option<Role>,
    outbound: mpsc::UnboundedSender<Message>,
}

/// Everything the bridge loop mutates.
pub struct BridgeState {
    pub registry: Registry,
    pub gate: HostPermissionGate,
    pub sim: SimControl,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// Which connection added each watch. Cleared watches are removed;
    /// a replaced watch belongs to the connection that replaced it.
    watch_owners: HashMap<String, ConnectionId>,
    /// A permission prompt no host has answered yet.
    prompt_outstanding: bool,
}

impl BridgeState {
    /// Build the registry stack. The returned receivers must be drained
    /// by the bridge loop.
    pub fn new(
        config: BridgeConfig,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<RegistryEvent>,
        mpsc::UnboundedReceiver<HostRequest>,
    ) {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let gate = HostPermissionGate::new(config.permission, host_tx.clone());
        let backend = SimulatedBackend::new(config.sim);
        let sim = backend.control();
        let (registry, events_rx) =
            WatchRegistry::new(backend, gate.clone(), config.registry, host_tx);
        let state = Self {
            registry,
            gate,
            sim,
            connections: HashMap::new(),
            watch_owners: HashMap::new(),
            prompt_outstanding: false,
        };
        (state, events_rx, host_rx)
    }

    // -- Connections --

    pub fn add_connection(&mut self, id: ConnectionId, outbound: mpsc::UnboundedSender<Message>) {
        self.connections
            .insert(id, ConnectionEntry { role: None, outbound });
    }

    /// Record the handshake role.
    pub fn set_role(&mut self, id: ConnectionId, role: Role) {
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.role = Some(role);
        }
    }

    pub fn connection_role(&self, id: ConnectionId) -> Option<Role> {
        self.connections.get(&id).and_then(|e| e.role)
    }

    /// Remove a connection and clear every watch it still owns.
    pub fn remove_connection(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
        let owned: Vec<String> = self
            .watch_owners
            .iter()
            .filter(|(_, owner)| **owner == id)
            .map(|(watch_id, _)| watch_id.clone())
            .collect();
        for watch_id in owned {
            self.watch_owners.remove(&watch_id);
            self.registry.clear_watch(&watch_id);
            tracing::debug!(?id, %watch_id, "watch cleared on disconnect");
        }
    }

    pub fn outbound(&self, id: ConnectionId) -> Option<mpsc::UnboundedSender<Message>> {
        self.connections.get(&id).map(|e| e.outbound.clone())
    }

    /// Send an unsolicited message to every host connection. Returns how
    /// many hosts received it.
    pub fn broadcast_hosts(&self, message: &Message) -> usize {
        self.connections
            .values()
            .filter(|e| e.role == Some(Role::Host))
            .filter(|e| e.outbound.send(message.clone()).is_ok())
            .count()
    }

    // -- Watches --

    pub fn claim_watch(&mut self, watch_id: &str, owner: ConnectionId) {
        self.watch_owners.insert(watch_id.to_string(), owner);
    }

    pub fn release_watch(&mut self, watch_id: &str) {
        self.watch_owners.remove(watch_id);
    }

    #[cfg(test)]
    pub fn watch_owner(&self, watch_id: &str) -> Option<ConnectionId> {
        self.watch_owners.get(watch_id).copied()
    }

    // -- Host requests --

    /// Route a registry request to the hosts.
    ///
    /// A settings dialog nobody can show fails open. A permission prompt
    /// waits for the next host to connect.
    pub fn dispatch_host_request(&mut self, request: HostRequest) {
        match request {
            HostRequest::ShowPermissionPrompt => {
                self.prompt_outstanding = true;
                let hosts = self.broadcast_hosts(&Message::PermissionPrompt { id: 0 });
                if hosts == 0 {
                    tracing::warn!("permission prompt pending, no host connected");
                }
            }
            HostRequest::ResolveSettings => {
                let hosts = self.broadcast_hosts(&Message::ResolveSettings { id: 0 });
                if hosts == 0 {
                    tracing::warn!("no host to resolve settings, continuing");
                    self.registry.on_settings_resolved();
                }
            }
        }
    }

    /// Replay an unanswered permission prompt to a host that just joined.
    pub fn replay_prompt(&self, id: ConnectionId) {
        if !self.prompt_outstanding {
            return;
        }
        if let Some(entry) = self.connections.get(&id) {
            let _ = entry.outbound.send(Message::PermissionPrompt { id: 0 });
        }
    }

    pub fn resolve_permission(&mut self, granted: bool) {
        self.prompt_outstanding = false;
        self.gate.resolve(granted);
    }
}
