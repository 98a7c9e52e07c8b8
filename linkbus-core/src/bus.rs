//! The multiplexing core.
//!
//! `BusCore` owns all shared mutable state — the command queue, the
//! subscription registry, the authenticated flag and the link phase — and
//! runs on one logical thread of control. Inbound frames on the reserved
//! `command` topic complete the queue head; every other topic fans out
//! through the registry. Outbound frames leave through the [`Transmit`]
//! seam, so tests can record transmissions and production can hand them
//! to a writer task.

use serde_json::Value;
use tracing::warn;

use crate::auth::{AuthListener, AuthState, ListenerId};
use crate::codec::{self, Frame};
use crate::error::BusError;
use crate::link::LinkState;
use crate::message::{COMMAND_TOPIC, Payload};
use crate::queue::{AuthCallback, CommandQueue, PendingCommand, ReplyAction};
use crate::registry::{EventCallback, SubscriptionHandle, SubscriptionRegistry};

// ── Transmit ─────────────────────────────────────────────────────

/// Outbound seam: puts one encoded frame on the wire.
///
/// Must not block; the production implementation pushes into the writer
/// task's channel.
pub trait Transmit {
    fn transmit(&mut self, frame: String) -> Result<(), BusError>;
}

impl Transmit for tokio::sync::mpsc::UnboundedSender<String> {
    fn transmit(&mut self, frame: String) -> Result<(), BusError> {
        self.send(frame).map_err(|_| BusError::ChannelClosed)
    }
}

// ── BusCore ──────────────────────────────────────────────────────

/// Connection-agnostic multiplexer state machine.
pub struct BusCore<T: Transmit> {
    transport: T,
    link: LinkState,
    queue: CommandQueue,
    registry: SubscriptionRegistry,
    auth: AuthState,
    /// Inbound frames dropped as malformed or orphaned.
    dropped_frames: u64,
}

impl<T: Transmit> BusCore<T> {
    /// A fresh core in the `Connecting` phase. Commands sent before
    /// [`open`](Self::open) queue up and flush once the link is up.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            link: LinkState::default(),
            queue: CommandQueue::new(),
            registry: SubscriptionRegistry::new(),
            auth: AuthState::new(),
            dropped_frames: 0,
        }
    }

    // ── Link lifecycle ───────────────────────────────────────────

    pub fn link(&self) -> &LinkState {
        &self.link
    }

    /// Mark the link open and flush the queue head.
    pub fn open(&mut self) -> Result<(), BusError> {
        self.link.open()?;
        self.flush()
    }

    /// Mark the link closed. Queued commands stay queued and will never
    /// be serviced by this core again.
    pub fn close(&mut self) {
        self.link.close();
        if self.queue.pending_count() > 0 {
            warn!(
                pending = self.queue.pending_count(),
                "link closed with commands outstanding; they will never resolve"
            );
        }
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Enqueue a command and, when it lands at the head of an idle open
    /// link, transmit it immediately.
    pub fn send_command(
        &mut self,
        name: &str,
        payload: Value,
        action: ReplyAction,
    ) -> Result<(), BusError> {
        let frame = codec::encode_command(name, payload)?;
        self.queue.enqueue(PendingCommand {
            name: name.to_string(),
            frame,
            action,
        });
        self.flush()
    }

    /// Transmit the queue head if the link is open and nothing is in
    /// flight. Idempotent; a no-op in any other situation.
    pub fn flush(&mut self) -> Result<(), BusError> {
        if !self.link.is_open() {
            return Ok(());
        }
        if let Some(frame) = self.queue.take_transmission() {
            self.transport.transmit(frame)?;
        }
        Ok(())
    }

    // ── Inbound routing ──────────────────────────────────────────

    /// Decode and route one inbound wire line.
    ///
    /// Malformed frames and orphan replies are dropped and counted, never
    /// fatal. `Err` here means the outbound transport died while servicing
    /// the next queued command.
    pub fn handle_line(&mut self, line: &str) -> Result<(), BusError> {
        match codec::decode_frame(line) {
            Ok(frame) => self.handle_frame(frame),
            Err(err) => {
                self.dropped_frames += 1;
                warn!(%err, "dropping malformed frame");
                Ok(())
            }
        }
    }

    /// Route one decoded frame.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<(), BusError> {
        if frame.topic == COMMAND_TOPIC {
            self.handle_reply(frame.payload)
        } else {
            self.registry.deliver(&frame.topic, &frame.payload);
            Ok(())
        }
    }

    fn handle_reply(&mut self, payload: Payload) -> Result<(), BusError> {
        let pending = match self.queue.complete_head() {
            Ok(pending) => pending,
            Err(_) => {
                self.dropped_frames += 1;
                warn!(
                    orphans = self.queue.orphan_replies(),
                    "reply with no command in flight; dropping"
                );
                return Ok(());
            }
        };
        self.dispatch_reply(pending, payload);
        // Reply dispatch (including auth listener fan-out) has finished
        // before the next command goes on the wire.
        self.flush()
    }

    fn dispatch_reply(&mut self, pending: PendingCommand, payload: Payload) {
        match pending.action {
            ReplyAction::Discard => {}
            ReplyAction::Callback(callback) => callback(payload),
            ReplyAction::Authenticate(callback) => {
                if payload.bool_field("authenticated") {
                    self.auth.set_authenticated(true);
                    callback(true);
                    self.auth.notify_listeners();
                } else {
                    // A refusal is a normal negative result: flag stays
                    // false, listeners stay quiet.
                    callback(false);
                }
            }
            ReplyAction::Deauthenticate => {
                if !payload.bool_field("authenticated") {
                    self.auth.set_authenticated(false);
                    self.auth.notify_listeners();
                }
            }
        }
    }

    // ── Authentication ───────────────────────────────────────────

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    /// Issue the `authenticate` command.
    ///
    /// Already authenticated: the callback fires with `true` and no frame
    /// is produced.
    pub fn authenticate(
        &mut self,
        username: &str,
        password: &str,
        callback: AuthCallback,
    ) -> Result<(), BusError> {
        if self.auth.is_authenticated() {
            callback(true);
            return Ok(());
        }
        let payload = serde_json::json!({
            "username": username,
            "password": password,
        });
        self.send_command("authenticate", payload, ReplyAction::Authenticate(callback))
    }

    /// Issue the `deauthenticate` command.
    pub fn deauthenticate(&mut self) -> Result<(), BusError> {
        self.send_command("deauthenticate", serde_json::json!({}), ReplyAction::Deauthenticate)
    }

    pub fn add_auth_listener(&mut self, listener: AuthListener) -> ListenerId {
        self.auth.add_listener(listener)
    }

    pub fn remove_auth_listener(&mut self, id: ListenerId) {
        self.auth.remove_listener(id);
    }

    // ── Subscriptions ────────────────────────────────────────────

    pub fn subscribe(
        &mut self,
        topic: &str,
        accepted: impl IntoIterator<Item = String>,
        callback: EventCallback,
    ) -> SubscriptionHandle {
        self.registry.subscribe(topic, accepted, callback)
    }

    /// Register a subscription under a caller-allocated id.
    pub fn insert_subscription(
        &mut self,
        topic: &str,
        id: u64,
        accepted: impl IntoIterator<Item = String>,
        callback: EventCallback,
    ) -> SubscriptionHandle {
        self.registry.insert(topic, id, accepted, callback)
    }

    pub fn unsubscribe(&mut self, handle: &SubscriptionHandle) {
        self.registry.unsubscribe(handle);
    }

    // ── Counters ─────────────────────────────────────────────────

    /// Commands queued, including the in-flight head.
    pub fn pending_commands(&self) -> usize {
        self.queue.pending_count()
    }

    /// Inbound frames dropped (malformed or orphaned).
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Replies that arrived with no command in flight.
    pub fn orphan_replies(&self) -> u64 {
        self.queue.orphan_replies()
    }
}

// ── Tests ────────────────────────────────────────────────────────
