//! Connection registry: who is connected, who is primary, who owns which window.
//!
//! All state sits behind one mutex. The registry is the only writer of the
//! primary pointer and the ownership map; everything else reads through
//! [`ConnectionRegistry::route_for`] and the query methods.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::{BridgeError, ClientId, WindowId};
use tracing::{debug, info, warn};

use crate::connection::ClientConnection;

struct Entry {
    connection: Arc<ClientConnection>,
    /// Admission order; lower means connected earlier.
    seq: u64,
}

#[derive(Default)]
struct RegistryState {
    clients: HashMap<ClientId, Entry>,
    primary: Option<ClientId>,
    windows: HashMap<WindowId, ClientId>,
    next_seq: u64,
}

impl RegistryState {
    /// Longest-connected client, if any.
    fn oldest_client(&self) -> Option<ClientId> {
        self.clients
            .iter()
            .min_by_key(|(_, entry)| entry.seq)
            .map(|(id, _)| id.clone())
    }
}

/// What [`ConnectionRegistry::handle_disconnect`] changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DisconnectOutcome {
    /// The client was registered when the disconnect arrived.
    pub was_registered: bool,
    /// The client was primary.
    pub was_primary: bool,
    /// The client promoted in its place, if any.
    pub promoted: Option<ClientId>,
    /// Ownership entries released.
    pub released_windows: usize,
}

/// Server-side registry of controller connections.
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    focus_claims_primary: bool,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    ///
    /// With `focus_claims_primary`, a `focused` event from a standby client
    /// also moves the primary designation to it.
    pub fn new(focus_claims_primary: bool) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            focus_claims_primary,
        }
    }

    /// Admit a connection. The first connection becomes primary.
    pub fn register_client(&self, connection: Arc<ClientConnection>) -> ClientId {
        let id = connection.id.clone();
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let _ = state.clients.insert(id.clone(), Entry { connection, seq });
        let is_primary = state.primary.is_none();
        if is_primary {
            state.primary = Some(id.clone());
        }
        info!(
            client_id = %id,
            is_primary,
            connections = state.clients.len(),
            "controller client registered"
        );
        id
    }

    /// Pick the connection for a request.
    ///
    /// A live owner of `window_id` wins; otherwise the primary; otherwise
    /// [`BridgeError::NotConnected`].
    pub fn route_for(&self, window_id: Option<WindowId>) -> Result<Arc<ClientConnection>, BridgeError> {
        let state = self.state.lock();
        if let Some(window_id) = window_id {
            let owner = state
                .windows
                .get(&window_id)
                .and_then(|owner| state.clients.get(owner))
                .filter(|entry| !entry.connection.is_closed());
            if let Some(entry) = owner {
                debug!(window_id, client_id = %entry.connection.id, "routing to window owner");
                return Ok(Arc::clone(&entry.connection));
            }
        }
        state
            .primary
            .as_ref()
            .and_then(|primary| state.clients.get(primary))
            .map(|entry| Arc::clone(&entry.connection))
            .ok_or(BridgeError::NotConnected)
    }

    /// Remove a connection, release its windows, and re-elect if it was primary.
    pub fn handle_disconnect(&self, client_id: &ClientId) -> DisconnectOutcome {
        let mut state = self.state.lock();
        if state.clients.remove(client_id).is_none() {
            return DisconnectOutcome::default();
        }

        let before = state.windows.len();
        state.windows.retain(|_, owner| owner != client_id);
        let released_windows = before - state.windows.len();

        let was_primary = state.primary.as_ref() == Some(client_id);
        let promoted = if was_primary {
            state.primary = state.oldest_client();
            state.primary.clone()
        } else {
            None
        };

        info!(
            client_id = %client_id,
            was_primary,
            promoted = ?promoted.as_ref().map(ClientId::as_str),
            released_windows,
            connections = state.clients.len(),
            "controller client removed"
        );
        DisconnectOutcome {
            was_registered: true,
            was_primary,
            promoted,
            released_windows,
        }
    }

    /// A client's browser gained focus.
    ///
    /// Confirms ownership of `window_id` when given, and moves primary to the
    /// client when focus claims primary. Returns whether primary changed.
    pub fn handle_focus(&self, client_id: &ClientId, window_id: Option<WindowId>) -> bool {
        let mut state = self.state.lock();
        if !state.clients.contains_key(client_id) {
            warn!(client_id = %client_id, "focus from unregistered client ignored");
            return false;
        }
        if let Some(window_id) = window_id {
            let _ = state.windows.insert(window_id, client_id.clone());
        }
        if !self.focus_claims_primary || state.primary.as_ref() == Some(client_id) {
            return false;
        }
        let previous = state.primary.replace(client_id.clone());
        info!(
            client_id = %client_id,
            previous = ?previous.as_ref().map(ClientId::as_str),
            "primary reassigned on focus"
        );
        true
    }

    /// Record ownership of every window in `window_ids`.
    pub fn handle_register_windows(&self, client_id: &ClientId, window_ids: &[WindowId]) {
        let mut state = self.state.lock();
        if !state.clients.contains_key(client_id) {
            warn!(client_id = %client_id, "window registration from unregistered client ignored");
            return;
        }
        for window_id in window_ids {
            let _ = state.windows.insert(*window_id, client_id.clone());
        }
        debug!(client_id = %client_id, count = window_ids.len(), "windows registered");
    }

    /// Record ownership of a newly created window.
    pub fn handle_window_created(&self, client_id: &ClientId, window_id: WindowId) {
        let mut state = self.state.lock();
        if !state.clients.contains_key(client_id) {
            warn!(client_id = %client_id, window_id, "window_created from unregistered client ignored");
            return;
        }
        let _ = state.windows.insert(window_id, client_id.clone());
    }

    /// Drop ownership of a closed window, but only if `client_id` owns it.
    ///
    /// Returns whether an entry was removed.
    pub fn handle_window_removed(&self, client_id: &ClientId, window_id: WindowId) -> bool {
        let mut state = self.state.lock();
        if state.windows.get(&window_id) == Some(client_id) {
            let _ = state.windows.remove(&window_id);
            true
        } else {
            debug!(client_id = %client_id, window_id, "window_removed from non-owner ignored");
            false
        }
    }

    /// Current primary.
    pub fn primary(&self) -> Option<ClientId> {
        self.state.lock().primary.clone()
    }

    /// Whether `client_id` is the current primary.
    pub fn is_primary(&self, client_id: &ClientId) -> bool {
        self.state.lock().primary.as_ref() == Some(client_id)
    }

    /// Owner of `window_id`.
    pub fn owner_of(&self, window_id: WindowId) -> Option<ClientId> {
        self.state.lock().windows.get(&window_id).cloned()
    }

    /// Look up a connection.
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientConnection>> {
        self.state
            .lock()
            .clients
            .get(client_id)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Number of windows with a recorded owner.
    pub fn owned_window_count(&self) -> usize {
        self.state.lock().windows.len()
    }

    /// Registered client ids, in admission order.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let state = self.state.lock();
        let mut entries: Vec<_> = state.clients.iter().map(|(id, e)| (e.seq, id.clone())).collect();
        entries.sort_unstable_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, id)| id).collect()
    }

    /// Remove every connection and all ownership.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.clients.len();
        state.clients.clear();
        state.windows.clear();
        state.primary = None;
        count
    }
}
