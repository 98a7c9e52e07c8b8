//! # linkbus-core
//!
//! Client-side control bus: multiplexes request/response commands,
//! topic-based event broadcast and derived authentication state over one
//! persistent duplex connection to a remote controller.
//!
//! This crate contains:
//! - **Codec**: `BusCodec` for framed I/O via `tokio_util`, plus frame
//!   encode/decode (`<topic>\0<json>` inbound, command JSON outbound)
//! - **Queue**: `CommandQueue` — strict FIFO, one command in flight,
//!   positional reply matching (the protocol has no message identifiers)
//! - **Registry**: `SubscriptionRegistry` — per-topic fan-out with
//!   accepted-type allow-lists and removal-safe delivery
//! - **Auth**: `AuthState` — the authenticated flag, its listeners, and
//!   the two reserved commands that mutate it
//! - **Link**: `LinkState` — `Connecting → Open → Closed` (terminal, no
//!   automatic reconnection)
//! - **Bus**: `BusCore` — the deterministic multiplexer over a `Transmit`
//!   seam; `Bus`/`ConnectionManager` — the tokio session around it
//! - **Error**: `BusError` — typed, `thiserror`-based error hierarchy

pub mod auth;
pub mod bus;
pub mod codec;
pub mod connection;
pub mod error;
pub mod link;
pub mod message;
pub mod queue;
pub mod registry;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use auth::{AuthListener, AuthState, ListenerId};
pub use bus::{BusCore, Transmit};
pub use codec::{BusCodec, Frame, MAX_FRAME_SIZE, decode_frame, encode_command};
pub use connection::{Bus, CommandReply, ConnectionInfo, EventStream};
pub use error::BusError;
pub use link::LinkState;
pub use message::{COMMAND_TOPIC, Payload, TOPIC_DELIMITER, TYPE_COMMAND, TYPE_COMMAND_ERROR, TYPE_COMMAND_REPLY};
pub use queue::{CommandQueue, PendingCommand, ReplyAction};
pub use registry::{Delivery, SubscriptionHandle, SubscriptionRegistry};
