//! Link lifecycle state machine.
//!
//! ```text
//!  Connecting ──► Open ──► Closed
//!       │                    ▲
//!       └────────────────────┘
//! ```
//!
//! `Closed` is terminal: this design performs no automatic reconnection,
//! and commands still queued when the link closes are never serviced. The
//! state is observable so owners can surface that condition instead of
//! masking it.

use std::time::{Duration, Instant};

use crate::error::BusError;

// ── LinkState ────────────────────────────────────────────────────

/// The current phase of the bus's single underlying connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinkState {
    /// Connection initiated but not yet established. Initial state.
    Connecting,

    /// Link is up; frames flow in both directions.
    Open {
        /// When the link entered the `Open` state.
        since: Instant,
    },

    /// Link is down. Terminal state.
    Closed,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::Connecting
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Open { .. } => write!(f, "Open"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl LinkState {
    /// Returns `true` when frames can be transmitted.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Returns `true` once the terminal state is reached.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// How long the link has been open, if it is.
    pub fn opened_duration(&self) -> Option<Duration> {
        match self {
            Self::Open { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Open`.
    ///
    /// Valid from: `Connecting`.
    pub fn open(&mut self) -> Result<(), BusError> {
        match self {
            Self::Connecting => {
                *self = Self::Open {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(BusError::LinkState("cannot open: not in Connecting state")),
        }
    }

    /// Transition to `Closed`. Valid from any state; closing an already
    /// closed link is a no-op.
    pub fn close(&mut self) {
        *self = Self::Closed;
    }
}

// ── Tests ────────────────────────────────────────────────────────
