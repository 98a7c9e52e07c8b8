//! Integration tests — full session lifecycle against a scripted fake
//! controller over a real TCP connection on localhost.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use linkbus_core::{Bus, BusCodec, BusError, ConnectionInfo};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

type Controller = Framed<TcpStream, BusCodec>;

// ── Helpers ──────────────────────────────────────────────────────

/// Spin up a listener on an OS-assigned port and return its address.
async fn ephemeral_listener() -> (TcpListener, ConnectionInfo) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let info = ConnectionInfo::new(addr.ip().to_string(), addr.port());
    (listener, info)
}

/// Connect a bus and accept its connection as the fake controller.
async fn connect_pair() -> (Bus, Controller) {
    let (listener, info) = ephemeral_listener().await;
    let bus = Bus::connect(&info);
    let (stream, _) = listener.accept().await.unwrap();
    (bus, Framed::new(stream, BusCodec::default()))
}

/// Receive the next outbound command message from the client.
async fn recv_command(controller: &mut Controller) -> Value {
    let line = tokio::time::timeout(Duration::from_secs(5), controller.next())
        .await
        .expect("timeout waiting for command")
        .expect("client hung up")
        .expect("codec error");
    serde_json::from_str(&line).expect("outbound frame is not JSON")
}

/// Push one inbound frame (`<topic>\0<json>`) to the client.
async fn send_frame(controller: &mut Controller, topic: &str, payload: Value) {
    controller
        .send(format!("{topic}\0{payload}"))
        .await
        .expect("controller send failed");
}

// ── Command round-trips ──────────────────────────────────────────

#[tokio::test]
async fn test_command_reply_round_trip() {
    let (bus, mut controller) = connect_pair().await;

    let reply = bus.send_command("get_status", json!({})).unwrap();

    let sent = recv_command(&mut controller).await;
    assert_eq!(sent["type"], "command");
    assert_eq!(sent["command"], "get_status");

    send_frame(
        &mut controller,
        "command",
        json!({"type": "cmd_reply", "uuid": "abc"}),
    )
    .await;

    let payload = tokio::time::timeout(Duration::from_secs(5), reply.recv())
        .await
        .expect("timeout")
        .expect("reply dropped");
    assert_eq!(payload.get("uuid"), Some(&json!("abc")));

    // The queue is empty again: a follow-up command transmits immediately.
    bus.send_command_no_reply("reboot", json!({})).unwrap();
    let sent = recv_command(&mut controller).await;
    assert_eq!(sent["command"], "reboot");
}

#[tokio::test]
async fn test_fifo_one_command_in_flight() {
    let (bus, mut controller) = connect_pair().await;

    let first = bus.send_command("get_status", json!({})).unwrap();
    let second = bus.send_command("motor_move", json!({"x": 10})).unwrap();

    // Only the first command is on the wire until its reply arrives.
    let sent = recv_command(&mut controller).await;
    assert_eq!(sent["command"], "get_status");
    assert!(
        tokio::time::timeout(Duration::from_millis(200), controller.next())
            .await
            .is_err(),
        "second command transmitted before first reply"
    );

    send_frame(
        &mut controller,
        "command",
        json!({"type": "cmd_reply", "seq": 1}),
    )
    .await;

    let sent = recv_command(&mut controller).await;
    assert_eq!(sent["command"], "motor_move");
    assert_eq!(sent["x"], 10);

    send_frame(
        &mut controller,
        "command",
        json!({"type": "cmd_reply", "seq": 2}),
    )
    .await;

    // Replies resolved in submission order.
    assert_eq!(first.recv().await.unwrap().get("seq"), Some(&json!(1)));
    assert_eq!(second.recv().await.unwrap().get("seq"), Some(&json!(2)));
}

// ── Broadcast fan-out ────────────────────────────────────────────

#[tokio::test]
async fn test_topic_fanout_with_type_filters() {
    let (bus, mut controller) = connect_pair().await;

    let mut sfp = bus.subscribe("status", ["sfp"]).unwrap();
    let mut motors = bus.subscribe("status", ["motors"]).unwrap();

    // Requests are serviced in order, so once a command shows up on the
    // wire both subscriptions are registered.
    bus.send_command_no_reply("get_status", json!({})).unwrap();
    recv_command(&mut controller).await;

    send_frame(
        &mut controller,
        "status",
        json!({"type": "motors", "motor": {"x": 1, "y": 2}}),
    )
    .await;

    let event = tokio::time::timeout(Duration::from_secs(5), motors.recv())
        .await
        .expect("timeout")
        .expect("stream ended");
    assert_eq!(event.kind(), "motors");
    assert_eq!(event.get("motor"), Some(&json!({"x": 1, "y": 2})));

    // The sfp subscriber saw nothing.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), sfp.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_stopped_subscription_receives_nothing_more() {
    let (bus, mut controller) = connect_pair().await;

    let sub = bus.subscribe("status", ["motors"]).unwrap();
    let mut keep = bus.subscribe("status", ["motors"]).unwrap();
    sub.stop();

    // Barrier: the unsubscribe above is applied before this command
    // reaches the controller.
    bus.send_command_no_reply("get_status", json!({})).unwrap();
    recv_command(&mut controller).await;

    send_frame(&mut controller, "status", json!({"type": "motors"})).await;

    let event = tokio::time::timeout(Duration::from_secs(5), keep.recv())
        .await
        .expect("timeout")
        .expect("stream ended");
    assert_eq!(event.kind(), "motors");
}

// ── Authentication ───────────────────────────────────────────────

#[tokio::test]
async fn test_authentication_lifecycle() {
    let (bus, mut controller) = connect_pair().await;
    assert!(!bus.is_authenticated());

    let controller_script = tokio::spawn(async move {
        let sent = recv_command(&mut controller).await;
        assert_eq!(sent["command"], "authenticate");
        assert_eq!(sent["username"], "admin");
        assert_eq!(sent["password"], "hunter2");
        send_frame(
            &mut controller,
            "command",
            json!({"type": "cmd_reply", "authenticated": true}),
        )
        .await;

        let sent = recv_command(&mut controller).await;
        assert_eq!(sent["command"], "deauthenticate");
        send_frame(
            &mut controller,
            "command",
            json!({"type": "cmd_reply", "authenticated": false}),
        )
        .await;
        controller
    });

    let granted = tokio::time::timeout(
        Duration::from_secs(5),
        bus.authenticate("admin", "hunter2"),
    )
    .await
    .expect("timeout")
    .unwrap();
    assert!(granted);

    let mut auth = bus.auth_watch();
    tokio::time::timeout(Duration::from_secs(5), auth.wait_for(|v| *v))
        .await
        .expect("timeout")
        .unwrap();
    assert!(bus.is_authenticated());

    bus.deauthenticate().unwrap();
    tokio::time::timeout(Duration::from_secs(5), auth.wait_for(|v| !*v))
        .await
        .expect("timeout")
        .unwrap();
    assert!(!bus.is_authenticated());

    controller_script.await.unwrap();
}

// ── Closure ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_remote_close_is_terminal_and_observable() {
    let (bus, mut controller) = connect_pair().await;

    let pending = bus.send_command("get_status", json!({})).unwrap();
    recv_command(&mut controller).await;

    // Controller goes away without replying.
    drop(controller);

    let mut link = bus.link_watch();
    tokio::time::timeout(Duration::from_secs(5), link.wait_for(|s| s.is_closed()))
        .await
        .expect("timeout")
        .unwrap();

    // The command stays unresolved for the session's lifetime; dropping
    // the last handle resolves it into a closed-session error.
    drop(bus);
    let err = tokio::time::timeout(Duration::from_secs(5), pending.recv())
        .await
        .expect("timeout")
        .unwrap_err();
    assert!(matches!(err, BusError::Closed));
}
