//! Connection manager and the consumer-facing [`Bus`] handle.
//!
//! The manager owns the single TCP connection and the [`BusCore`] state,
//! all inside one spawned task, so every queue/registry/auth mutation
//! happens on one logical thread of control. Consumers hold a cheap
//! cloneable [`Bus`] handle: commands come back as awaitable replies,
//! subscriptions as event streams, and the authenticated flag plus link
//! phase are published through `watch` channels so late joiners observe
//! current truth immediately.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

use crate::bus::BusCore;
use crate::codec::BusCodec;
use crate::error::BusError;
use crate::link::LinkState;
use crate::message::{Payload, json_type_name};
use crate::queue::ReplyAction;
use crate::registry::{Delivery, SubscriptionHandle};

type CoreTransport = mpsc::UnboundedSender<String>;

// ── ConnectionInfo ───────────────────────────────────────────────

/// Address of the remote controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn to_socket_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ConnectionInfo {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| BusError::InvalidAddress(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| BusError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host.to_string(), port))
    }
}

// ── Requests ─────────────────────────────────────────────────────

enum BusRequest {
    Command {
        name: String,
        payload: Value,
        reply: Option<oneshot::Sender<Payload>>,
    },
    Subscribe {
        topic: String,
        id: u64,
        types: Vec<String>,
        events: mpsc::UnboundedSender<Payload>,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
    },
    Authenticate {
        username: String,
        password: String,
        reply: oneshot::Sender<bool>,
    },
    Deauthenticate,
}

// ── Bus handle ───────────────────────────────────────────────────

/// Cloneable consumer handle to one bus session.
///
/// All methods are non-blocking; work is forwarded to the session task.
/// Once the link reaches its terminal `Closed` state, commands still
/// queue (and never resolve) per the protocol contract — watch
/// [`link_watch`](Self::link_watch) to observe that condition.
#[derive(Debug, Clone)]
pub struct Bus {
    tx: mpsc::UnboundedSender<BusRequest>,
    auth_rx: watch::Receiver<bool>,
    link_rx: watch::Receiver<LinkState>,
    next_sub_id: Arc<AtomicU64>,
}

impl Bus {
    /// Open a session to the controller.
    ///
    /// Returns immediately in the `Connecting` phase; commands sent before
    /// the link is up are queued and flushed on open.
    pub fn connect(info: &ConnectionInfo) -> Self {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = watch::channel(false);
        let (link_tx, link_rx) = watch::channel(LinkState::default());

        let manager = ConnectionManager {
            info: info.clone(),
            req_rx,
            auth_tx,
            link_tx,
        };
        tokio::spawn(manager.run());

        Self {
            tx: req_tx,
            auth_rx,
            link_rx,
            next_sub_id: Arc::new(AtomicU64::new(1)),
        }
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Enqueue a command and get an awaitable reply.
    pub fn send_command(&self, name: &str, payload: Value) -> Result<CommandReply, BusError> {
        let (tx, rx) = oneshot::channel();
        self.submit_command(name, payload, Some(tx))?;
        Ok(CommandReply { rx })
    }

    /// Enqueue a command whose reply nobody waits for.
    pub fn send_command_no_reply(&self, name: &str, payload: Value) -> Result<(), BusError> {
        self.submit_command(name, payload, None)
    }

    fn submit_command(
        &self,
        name: &str,
        payload: Value,
        reply: Option<oneshot::Sender<Payload>>,
    ) -> Result<(), BusError> {
        if !matches!(payload, Value::Object(_) | Value::Null) {
            return Err(BusError::NotAnObject(json_type_name(&payload)));
        }
        self.tx
            .send(BusRequest::Command {
                name: name.to_string(),
                payload,
                reply,
            })
            .map_err(|_| BusError::ChannelClosed)
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Subscribe to a broadcast topic, filtered to the given payload
    /// kinds. An empty filter receives nothing.
    pub fn subscribe(
        &self,
        topic: &str,
        types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<EventStream, BusError> {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SubscriptionHandle::new(topic.to_string(), id);

        self.tx
            .send(BusRequest::Subscribe {
                topic: topic.to_string(),
                id,
                types: types.into_iter().map(Into::into).collect(),
                events: tx,
            })
            .map_err(|_| BusError::ChannelClosed)?;

        Ok(EventStream {
            rx,
            handle,
            bus: self.tx.clone(),
            stopped: false,
        })
    }

    // ── Authentication ───────────────────────────────────────────

    /// Authenticate against the controller. Resolves to the outcome;
    /// already-authenticated sessions short-circuit to `true` without an
    /// outbound frame.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<bool, BusError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(BusRequest::Authenticate {
                username: username.to_string(),
                password: password.to_string(),
                reply: tx,
            })
            .map_err(|_| BusError::ChannelClosed)?;
        rx.await.map_err(|_| BusError::Closed)
    }

    /// Drop authentication.
    pub fn deauthenticate(&self) -> Result<(), BusError> {
        self.tx
            .send(BusRequest::Deauthenticate)
            .map_err(|_| BusError::ChannelClosed)
    }

    /// Current value of the authenticated flag.
    pub fn is_authenticated(&self) -> bool {
        *self.auth_rx.borrow()
    }

    /// Watch the authenticated flag. A fresh receiver already holds the
    /// current value, so late joiners need no transition to catch up.
    pub fn auth_watch(&self) -> watch::Receiver<bool> {
        self.auth_rx.clone()
    }

    // ── Link state ───────────────────────────────────────────────

    /// Current link phase.
    pub fn link_state(&self) -> LinkState {
        *self.link_rx.borrow()
    }

    /// Watch the link phase, including the terminal `Closed`.
    pub fn link_watch(&self) -> watch::Receiver<LinkState> {
        self.link_rx.clone()
    }
}

// ── CommandReply ─────────────────────────────────────────────────

/// Pending reply to a sent command.
#[derive(Debug)]
pub struct CommandReply {
    rx: oneshot::Receiver<Payload>,
}

impl CommandReply {
    /// Wait for the reply frame.
    ///
    /// There is no timeout: if the link closes with the command
    /// unresolved, this resolves to [`BusError::Closed`] only once the
    /// session itself is gone. Callers decide whether to re-issue.
    pub async fn recv(self) -> Result<Payload, BusError> {
        self.rx.await.map_err(|_| BusError::Closed)
    }
}

// ── EventStream ──────────────────────────────────────────────────

/// Live subscription to one topic.
///
/// Dropping the stream (or calling [`stop`](Self::stop)) unsubscribes;
/// a delivery attempted against a dropped stream also prunes the
/// subscription on the spot.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Payload>,
    handle: SubscriptionHandle,
    bus: mpsc::UnboundedSender<BusRequest>,
    stopped: bool,
}

impl EventStream {
    /// Next accepted payload, or `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Unsubscribe explicitly.
    pub fn stop(mut self) {
        self.unsubscribe();
    }

    fn unsubscribe(&mut self) {
        if !self.stopped {
            self.stopped = true;
            let _ = self.bus.send(BusRequest::Unsubscribe {
                handle: self.handle.clone(),
            });
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ── ConnectionManager ────────────────────────────────────────────

/// Session task: owns the stream, the core, and the state publishers.
struct ConnectionManager {
    info: ConnectionInfo,
    req_rx: mpsc::UnboundedReceiver<BusRequest>,
    auth_tx: watch::Sender<bool>,
    link_tx: watch::Sender<LinkState>,
}

impl ConnectionManager {
    async fn run(mut self) {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut core = BusCore::new(out_tx);

        // Connecting: accept requests, transmit nothing yet.
        let connect = TcpStream::connect(self.info.to_socket_string());
        tokio::pin!(connect);
        let stream = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(stream) => break Some(stream),
                    Err(err) => {
                        error!(%err, addr = %self.info, "connect failed");
                        break None;
                    }
                },
                request = self.req_rx.recv() => match request {
                    Some(request) => {
                        self.apply(&mut core, request);
                        self.sync_state(&core);
                    }
                    // All handles dropped before the link came up.
                    None => return,
                },
            }
        };

        let Some(stream) = stream else {
            core.close();
            self.sync_state(&core);
            self.drain_closed(core).await;
            return;
        };

        let (mut writer, mut reader) = Framed::new(stream, BusCodec::default()).split();

        // Writer task: outbound frames onto the socket.
        let write_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(err) = writer.send(frame).await {
                    error!(%err, "network write error");
                    break;
                }
            }
        });

        // Open: flush whatever queued up while connecting.
        if let Err(err) = core.open() {
            error!(%err, "open failed");
        }
        self.sync_state(&core);
        info!(addr = %self.info, "link open");

        loop {
            tokio::select! {
                inbound = reader.next() => match inbound {
                    Some(Ok(line)) => {
                        if let Err(err) = core.handle_line(&line) {
                            error!(%err, "outbound transport gone");
                            break;
                        }
                        self.sync_state(&core);
                    }
                    Some(Err(err)) => {
                        error!(%err, "network read error");
                        break;
                    }
                    None => {
                        info!("connection closed by remote");
                        break;
                    }
                },
                request = self.req_rx.recv() => match request {
                    Some(request) => {
                        self.apply(&mut core, request);
                        self.sync_state(&core);
                    }
                    None => {
                        // All handles dropped; tear the session down.
                        write_task.abort();
                        return;
                    }
                },
            }
        }

        core.close();
        self.sync_state(&core);
        write_task.abort();
        self.drain_closed(core).await;
    }

    /// Terminal `Closed` phase: requests are still accepted and queue
    /// silently, but nothing is ever serviced again. Returns once every
    /// handle is gone, dropping the core and resolving pending replies
    /// into [`BusError::Closed`].
    async fn drain_closed(&mut self, mut core: BusCore<CoreTransport>) {
        while let Some(request) = self.req_rx.recv().await {
            self.apply(&mut core, request);
            self.sync_state(&core);
        }
    }

    fn apply(&self, core: &mut BusCore<CoreTransport>, request: BusRequest) {
        match request {
            BusRequest::Command { name, payload, reply } => {
                let action = match reply {
                    Some(tx) => ReplyAction::Callback(Box::new(move |payload| {
                        let _ = tx.send(payload);
                    })),
                    None => ReplyAction::Discard,
                };
                if let Err(err) = core.send_command(&name, payload, action) {
                    warn!(%err, command = %name, "command not transmitted");
                }
            }
            BusRequest::Subscribe { topic, id, types, events } => {
                core.insert_subscription(
                    &topic,
                    id,
                    types,
                    Box::new(move |payload| match events.send(payload.clone()) {
                        Ok(()) => Delivery::Retain,
                        // Consumer dropped its stream; prune in place.
                        Err(_) => Delivery::Stop,
                    }),
                );
            }
            BusRequest::Unsubscribe { handle } => core.unsubscribe(&handle),
            BusRequest::Authenticate { username, password, reply } => {
                let result = core.authenticate(
                    &username,
                    &password,
                    Box::new(move |granted| {
                        let _ = reply.send(granted);
                    }),
                );
                if let Err(err) = result {
                    warn!(%err, "authenticate not transmitted");
                }
            }
            BusRequest::Deauthenticate => {
                if let Err(err) = core.deauthenticate() {
                    warn!(%err, "deauthenticate not transmitted");
                }
            }
        }
    }

    /// Publish the core's auth flag and link phase to handle-side watches.
    fn sync_state(&self, core: &BusCore<CoreTransport>) {
        let authenticated = core.is_authenticated();
        self.auth_tx.send_if_modified(|value| {
            let changed = *value != authenticated;
            *value = authenticated;
            changed
        });

        let link = *core.link();
        self.link_tx.send_if_modified(|value| {
            let changed = *value != link;
            *value = link;
            changed
        });
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_info_parse_and_display() {
        let info: ConnectionInfo = "10.0.0.5:8080".parse().unwrap();
        assert_eq!(info.host(), "10.0.0.5");
        assert_eq!(info.port(), 8080);
        assert_eq!(info.to_socket_string(), "10.0.0.5:8080");
        assert_eq!(info.to_string(), "10.0.0.5:8080");
    }

    #[test]
    fn connection_info_rejects_garbage() {
        assert!("no-port".parse::<ConnectionInfo>().is_err());
        assert!("host:not-a-port".parse::<ConnectionInfo>().is_err());
    }

    #[tokio::test]
    async fn send_command_rejects_non_object_payload() {
        let info = ConnectionInfo::new("127.0.0.1".into(), 1);
        let bus = Bus::connect(&info);
        let err = bus
            .send_command("get_status", serde_json::json!([1, 2]))
            .unwrap_err();
        assert!(matches!(err, BusError::NotAnObject("array")));
    }

    #[tokio::test]
    async fn failed_connect_reaches_terminal_closed() {
        // Port 1 on localhost refuses immediately.
        let info = ConnectionInfo::new("127.0.0.1".into(), 1);
        let bus = Bus::connect(&info);

        let mut link = bus.link_watch();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            link.wait_for(|state| state.is_closed()),
        )
        .await
        .expect("timeout")
        .expect("watch closed");

        // Commands are still accepted, they just never resolve while the
        // session lives.
        assert!(bus.send_command_no_reply("get_status", serde_json::json!({})).is_ok());
    }
}
