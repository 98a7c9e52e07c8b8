//! Authentication flag and listener fan-out.
//!
//! The flag is owned here and mutated only by the bus core in response to
//! the reserved `authenticate` / `deauthenticate` command replies —
//! consumers read it through accessors and get notified through
//! listeners. Notification is synchronous, in registration order, after
//! the flag mutation and before any further queued work.

use std::fmt;

/// Notified when the authenticated flag transitions. Takes no arguments;
/// listeners re-query the flag for its current value.
pub type AuthListener = Box<dyn FnMut() + Send>;

/// Names a registered listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ── AuthState ────────────────────────────────────────────────────

/// The shared authenticated flag plus its listeners.
#[derive(Default)]
pub struct AuthState {
    authenticated: bool,
    listeners: Vec<(ListenerId, AuthListener)>,
    next_id: u64,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of the flag.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Register a listener.
    ///
    /// A late joiner that arrives after a successful authentication is
    /// invoked immediately, synchronously, instead of being registered —
    /// it sees current truth without waiting for the next transition.
    pub fn add_listener(&mut self, mut listener: AuthListener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;

        if self.authenticated {
            listener();
            return id;
        }

        self.listeners.push((id, listener));
        id
    }

    /// Remove a listener. Unknown ids are a no-op.
    pub fn remove_listener(&mut self, id: ListenerId) {
        self.listeners.retain(|(lid, _)| *lid != id);
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Set the flag. Only the bus core's reply dispatch calls this.
    pub(crate) fn set_authenticated(&mut self, value: bool) {
        self.authenticated = value;
    }

    /// Invoke every listener in registration order.
    pub(crate) fn notify_listeners(&mut self) {
        for (_, listener) in &mut self.listeners {
            listener();
        }
    }
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("authenticated", &self.authenticated)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
