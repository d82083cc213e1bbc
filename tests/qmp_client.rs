//! Unit tests for the protocol client state machine.
//!
//! The client owns no I/O, so these tests drive it directly: inbound bytes
//! go through `feed`, outbound lines are captured from the writer channel.
//! Covered here:
//! - handshake: greeting → capabilities negotiation → connected
//! - framing: fragmentation invariance, multiple messages per read,
//!   malformed-frame tolerance
//! - correlation: FIFO resolution order, error payload passthrough
//! - reset: abandoned requests can never be fulfilled by stale responses

use serde_json::{Value, json};
use tokio::sync::mpsc;

use vmwarden::{ClientError, QmpClient};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const GREETING: &[u8] = b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n";

/// A client with a bound writer plus the receiving end of its outbound line
/// channel.
fn bound_client() -> (QmpClient, mpsc::UnboundedReceiver<String>) {
    let mut client = QmpClient::new();
    let (tx, rx) = mpsc::unbounded_channel();
    client.set_writer(Some(tx));
    (client, rx)
}

/// Feed the greeting, assert the capabilities negotiation goes out, and
/// complete it so the client reaches the connected state.
fn handshake(client: &mut QmpClient, outbound: &mut mpsc::UnboundedReceiver<String>) {
    client.feed(GREETING);
    let line = outbound.try_recv().expect("capabilities command sent");
    let sent: Value = serde_json::from_str(&line).expect("outbound line is JSON");
    assert_eq!(sent["execute"], "qmp_capabilities");
    client.feed(b"{\"return\": {}}\n");
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn greeting_triggers_capabilities_negotiation() {
    let (mut client, mut outbound) = bound_client();
    let connected = client.connected();
    assert!(!*connected.borrow());

    client.feed(GREETING);
    let line = outbound.try_recv().expect("capabilities command sent");
    assert!(line.contains("qmp_capabilities"));

    // Not connected until the negotiation response arrives.
    assert!(!*connected.borrow());
    client.feed(b"{\"return\": {}}\n");
    assert!(*connected.borrow());
}

#[tokio::test]
async fn messages_before_the_greeting_are_ignored() {
    let (mut client, mut outbound) = bound_client();
    let mut events = client.subscribe_events();

    client.feed(b"{\"return\": {}}\n");
    client.feed(b"{\"event\": \"RESET\", \"data\": {}, \"timestamp\": {}}\n");

    assert!(outbound.try_recv().is_err(), "nothing sent before greeting");
    assert!(events.try_recv().is_err(), "no events before greeting");

    // The handshake still works afterwards.
    handshake(&mut client, &mut outbound);
    assert!(*client.connected().borrow());
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn message_fragmented_across_many_feeds_parses_identically() {
    let (mut client, mut outbound) = bound_client();
    handshake(&mut client, &mut outbound);

    let rx = client.execute("query-status", None).expect("execute");

    let response = b"{\"return\": {\"status\": \"running\", \"running\": true}}\n";
    for byte in response {
        client.feed(std::slice::from_ref(byte));
    }

    let payload = rx.await.expect("request settled").expect("success");
    assert_eq!(payload, json!({"status": "running", "running": true}));
}

#[tokio::test]
async fn two_requests_resolve_in_send_order_from_one_combined_read() {
    let (mut client, mut outbound) = bound_client();
    handshake(&mut client, &mut outbound);

    let first = client.execute("query-status", None).expect("execute");
    let second = client.execute("query-version", None).expect("execute");

    // Both responses arrive in a single read.
    client.feed(b"{\"return\": 1}\n{\"return\": 2}\n");

    assert_eq!(first.await.unwrap().unwrap(), json!(1));
    assert_eq!(second.await.unwrap().unwrap(), json!(2));
}

#[tokio::test]
async fn malformed_frame_is_dropped_and_later_messages_still_parse() {
    let (mut client, mut outbound) = bound_client();
    handshake(&mut client, &mut outbound);

    let rx = client.execute("query-status", None).expect("execute");
    client.feed(b"!! this is not json !!\n{\"return\": 5}\n");

    assert_eq!(rx.await.unwrap().unwrap(), json!(5));
}

#[tokio::test]
async fn empty_feed_is_a_noop() {
    let (mut client, mut outbound) = bound_client();
    client.feed(b"");
    assert!(outbound.try_recv().is_err());

    // A partial frame with no newline extracts nothing either.
    client.feed(b"{\"QMP\": {\"ver");
    assert!(outbound.try_recv().is_err());

    // Completing the frame finishes the greeting.
    client.feed(b"sion\": {}, \"capabilities\": []}}\n");
    assert!(outbound.try_recv().expect("capabilities").contains("qmp_capabilities"));
}

// ---------------------------------------------------------------------------
// Correlation and errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn error_response_carries_the_server_payload() {
    let (mut client, mut outbound) = bound_client();
    handshake(&mut client, &mut outbound);

    let rx = client.execute("eject", Some(json!({"device": "nope"}))).expect("execute");
    client.feed(b"{\"error\": {\"class\": \"DeviceNotFound\", \"desc\": \"no such device\"}}\n");

    match rx.await.expect("request settled") {
        Err(ClientError::Protocol(e)) => {
            assert_eq!(e.class, "DeviceNotFound");
            assert_eq!(e.desc, "no such device");
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn arguments_are_serialized_only_when_present() {
    let (mut client, mut outbound) = bound_client();
    handshake(&mut client, &mut outbound);

    let _rx = client
        .execute("eject", Some(json!({"device": "cd0"})))
        .expect("execute");
    let with_args: Value = serde_json::from_str(&outbound.try_recv().unwrap()).unwrap();
    assert_eq!(with_args["execute"], "eject");
    assert_eq!(with_args["arguments"]["device"], "cd0");

    let _rx = client.execute("query-status", None).expect("execute");
    let without_args: Value = serde_json::from_str(&outbound.try_recv().unwrap()).unwrap();
    assert_eq!(without_args["execute"], "query-status");
    assert!(without_args.get("arguments").is_none());
}

#[tokio::test]
async fn execute_without_a_writer_is_a_fault() {
    let mut client = QmpClient::new();
    match client.execute("query-status", None) {
        Err(ClientError::NotBound) => {}
        other => panic!("expected NotBound, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Reset
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reset_abandons_pending_requests_permanently() {
    let (mut client, mut outbound) = bound_client();
    handshake(&mut client, &mut outbound);

    let stale = client.execute("query-status", None).expect("execute");
    client.reset();
    assert!(!*client.connected().borrow(), "reset clears connected");

    // A late response from the old transport arrives after the reset. The
    // abandoned request must never be fulfilled by it.
    client.feed(b"{\"return\": {\"status\": \"running\"}}\n");
    assert!(stale.await.is_err(), "abandoned request never fulfils");

    // The next connection handshakes from scratch and correlates cleanly.
    handshake(&mut client, &mut outbound);
    let fresh = client.execute("query-version", None).expect("execute");
    client.feed(b"{\"return\": \"9.0\"}\n");
    assert_eq!(fresh.await.unwrap().unwrap(), json!("9.0"));
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn events_are_broadcast_by_name_with_data_and_timestamp() {
    let (mut client, mut outbound) = bound_client();
    let mut events = client.subscribe_events();
    handshake(&mut client, &mut outbound);

    client.feed(
        b"{\"event\": \"SHUTDOWN\", \"data\": {\"guest\": true}, \
          \"timestamp\": {\"seconds\": 1700000000, \"microseconds\": 42}}\n",
    );

    let event = events.try_recv().expect("event dispatched");
    assert_eq!(event.name, "SHUTDOWN");
    assert_eq!(event.data, json!({"guest": true}));
    let ts = event.timestamp_utc().expect("representable timestamp");
    assert_eq!(ts.timestamp(), 1_700_000_000);
}

#[tokio::test]
async fn events_do_not_consume_pending_requests() {
    let (mut client, mut outbound) = bound_client();
    handshake(&mut client, &mut outbound);

    let rx = client.execute("query-status", None).expect("execute");

    // An event interleaved before the response must not satisfy the request.
    client.feed(b"{\"event\": \"RESET\", \"data\": {}, \"timestamp\": {}}\n");
    client.feed(b"{\"return\": \"ok\"}\n");

    assert_eq!(rx.await.unwrap().unwrap(), json!("ok"));
}
