//! Strict-FIFO command queue with a one-in-flight discipline.
//!
//! The protocol has no message identifiers: replies are matched to
//! commands purely by arrival order, under the rule that at most one
//! command is ever on the wire unacknowledged. The queue enforces that
//! invariant explicitly instead of leaving it to the transport.

use std::collections::VecDeque;
use std::fmt;

use crate::error::BusError;
use crate::message::Payload;

/// Invoked exactly once with the decoded reply payload.
pub type ReplyCallback = Box<dyn FnOnce(Payload) + Send>;

/// Caller callback for the reserved authentication commands, invoked with
/// the granted/refused outcome.
pub type AuthCallback = Box<dyn FnOnce(bool) + Send>;

// ── ReplyAction ──────────────────────────────────────────────────

/// What to do with a command's reply once it arrives.
///
/// The two reserved authentication commands do not get a plain payload
/// callback; their replies drive the authentication state machine, which
/// is the only thing allowed to mutate the authenticated flag.
pub enum ReplyAction {
    /// No caller is waiting for this reply.
    Discard,
    /// Hand the reply payload to the caller.
    Callback(ReplyCallback),
    /// `authenticate` — apply the outcome, then tell the caller.
    Authenticate(AuthCallback),
    /// `deauthenticate` — apply the outcome.
    Deauthenticate,
}

impl fmt::Debug for ReplyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discard => write!(f, "Discard"),
            Self::Callback(_) => write!(f, "Callback"),
            Self::Authenticate(_) => write!(f, "Authenticate"),
            Self::Deauthenticate => write!(f, "Deauthenticate"),
        }
    }
}

// ── PendingCommand ───────────────────────────────────────────────

/// One queued command awaiting transmission and, later, its reply.
pub struct PendingCommand {
    /// Command name, kept for diagnostics.
    pub name: String,
    /// Encoded wire line, ready to transmit.
    pub frame: String,
    /// Reply disposition.
    pub action: ReplyAction,
}

impl fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCommand")
            .field("name", &self.name)
            .field("action", &self.action)
            .finish()
    }
}

// ── CommandQueue ─────────────────────────────────────────────────

/// Ordered in-flight command tracking.
///
/// Invariants: commands are serviced strictly in arrival order, and the
/// number of transmitted-but-unacknowledged commands is always 0 or 1.
/// There is no priority, cancellation, retry or timeout.
#[derive(Default)]
pub struct CommandQueue {
    pending: VecDeque<PendingCommand>,
    /// The head has been transmitted and awaits its reply.
    in_flight: bool,
    /// Replies that arrived with nothing in flight (protocol violations).
    orphan_replies: u64,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command at the tail. Transmission is the caller's job, via
    /// [`take_transmission`](Self::take_transmission).
    pub fn enqueue(&mut self, command: PendingCommand) {
        self.pending.push_back(command);
    }

    /// The frame to put on the wire now, if any.
    ///
    /// Returns the head's frame exactly once: the head is marked in flight,
    /// and subsequent calls return `None` until its reply is consumed. Safe
    /// to call at any time, so "flush" can be idempotent.
    pub fn take_transmission(&mut self) -> Option<String> {
        if self.in_flight {
            return None;
        }
        let head = self.pending.front()?;
        self.in_flight = true;
        Some(head.frame.clone())
    }

    /// Consume a reply: pop and return the in-flight head.
    ///
    /// A reply with no command in flight is a protocol desynchronization;
    /// it is counted and reported, and the queue is left untouched.
    pub fn complete_head(&mut self) -> Result<PendingCommand, BusError> {
        if !self.in_flight {
            self.orphan_replies += 1;
            return Err(BusError::OrphanReply);
        }
        self.in_flight = false;
        self.pending.pop_front().ok_or(BusError::OrphanReply)
    }

    /// Number of queued commands, including the in-flight head.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether a command is currently on the wire unacknowledged.
    pub fn has_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Total replies dropped for want of an outstanding command.
    pub fn orphan_replies(&self) -> u64 {
        self.orphan_replies
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("pending", &self.pending.len())
            .field("in_flight", &self.in_flight)
            .field("orphan_replies", &self.orphan_replies)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(name: &str) -> PendingCommand {
        PendingCommand {
            name: name.into(),
            frame: format!("{{\"command\":\"{name}\"}}"),
            action: ReplyAction::Discard,
        }
    }

    fn reply() -> Payload {
        Payload::new(serde_json::json!({"type": "cmd_reply"}))
    }

    #[test]
    fn transmits_one_at_a_time_in_order() {
        let mut queue = CommandQueue::new();
        queue.enqueue(cmd("first"));
        queue.enqueue(cmd("second"));
        queue.enqueue(cmd("third"));

        // Only the head goes out, exactly once.
        let frame = queue.take_transmission().unwrap();
        assert!(frame.contains("first"));
        assert!(queue.take_transmission().is_none());
        assert!(queue.has_in_flight());

        // Its reply releases the next head.
        let done = queue.complete_head().unwrap();
        assert_eq!(done.name, "first");
        assert!(!queue.has_in_flight());

        let frame = queue.take_transmission().unwrap();
        assert!(frame.contains("second"));
        queue.complete_head().unwrap();

        let frame = queue.take_transmission().unwrap();
        assert!(frame.contains("third"));
        queue.complete_head().unwrap();

        assert_eq!(queue.pending_count(), 0);
        assert!(queue.take_transmission().is_none());
    }

    #[test]
    fn empty_queue_transmits_nothing() {
        let mut queue = CommandQueue::new();
        assert!(queue.take_transmission().is_none());
        assert!(!queue.has_in_flight());
    }

    #[test]
    fn orphan_reply_is_counted_not_fatal() {
        let mut queue = CommandQueue::new();
        assert!(matches!(
            queue.complete_head().unwrap_err(),
            BusError::OrphanReply
        ));
        assert_eq!(queue.orphan_replies(), 1);

        // A reply before the head was ever transmitted is also an orphan.
        queue.enqueue(cmd("late"));
        assert!(matches!(
            queue.complete_head().unwrap_err(),
            BusError::OrphanReply
        ));
        assert_eq!(queue.orphan_replies(), 2);
        assert_eq!(queue.pending_count(), 1);

        // The queue still works afterwards.
        assert!(queue.take_transmission().is_some());
        assert_eq!(queue.complete_head().unwrap().name, "late");
    }

    #[test]
    fn callback_fires_with_reply_payload() {
        let mut queue = CommandQueue::new();
        let (tx, rx) = std::sync::mpsc::channel();
        queue.enqueue(PendingCommand {
            name: "get_status".into(),
            frame: "{}".into(),
            action: ReplyAction::Callback(Box::new(move |payload| {
                tx.send(payload).unwrap();
            })),
        });

        queue.take_transmission().unwrap();
        let done = queue.complete_head().unwrap();
        if let ReplyAction::Callback(cb) = done.action {
            cb(reply());
        }
        assert_eq!(rx.recv().unwrap().kind(), "cmd_reply");
    }
}
