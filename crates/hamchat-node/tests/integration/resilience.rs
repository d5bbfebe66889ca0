//! Damaged frames, capacity limits, idle sessions and shutdown.

use std::time::Duration;

use hamchat_node::client::ClientError;
use hamchat_protocol::{ErrorCode, Request, Response, BLOCK_SIZE, FRAME_TERMINATOR};

use crate::harness::{error_code, next_within, TestRelay, TestRelayBuilder};

const WAIT: Duration = Duration::from_secs(5);

fn flip(symbol: &mut u8) {
    *symbol = if *symbol == b'0' { b'1' } else { b'0' };
}

/// Channel-coded frame with the given (block, bit position) symbols flipped.
fn damaged(request: &Request, flips: &[(usize, usize)]) -> Vec<u8> {
    let mut wire = request.to_envelope().build();
    for &(block, position) in flips {
        flip(&mut wire[block * BLOCK_SIZE + position - 1]);
    }
    wire.push(FRAME_TERMINATOR);
    wire
}

#[tokio::test]
async fn test_single_bit_error_corrected() {
    let relay = TestRelayBuilder::new()
        .account("alice", "secret")
        .build()
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    client
        .send_raw(&damaged(&Request::login("alice", "secret"), &[(3, 5), (40, 1), (97, 7)]))
        .await
        .unwrap();
    let reply = next_within(&mut client, WAIT).await;
    assert_eq!(reply.response, Response::ok("welcome alice"));

    relay.shutdown().await.unwrap();
}

/// Two flips in one block defeat Hamming(7,4); the checksum catches it
/// and the session stays open.
#[tokio::test]
async fn test_double_bit_error_rejected_session_survives() {
    let relay = TestRelayBuilder::new()
        .account("alice", "secret")
        .build()
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    client
        .send_raw(&damaged(&Request::login("alice", "secret"), &[(30, 3), (30, 6)]))
        .await
        .unwrap();
    let reply = next_within(&mut client, WAIT).await;
    assert_eq!(error_code(&reply), ErrorCode::CorruptFrame);

    // A corrupt frame is not an auth attempt
    let reply = client.login("alice", "secret").await.unwrap();
    assert_eq!(reply.response, Response::ok("welcome alice"));

    relay.shutdown().await.unwrap();
}

/// A damaged chat message is reported and never reaches the log or the
/// recipient.
#[tokio::test]
async fn test_damaged_message_not_logged() {
    let relay = TestRelayBuilder::new()
        .account("alice", "a-pw")
        .account("bob", "b-pw")
        .build()
        .await
        .unwrap();
    let mut alice = relay.login("alice", "a-pw").await.unwrap();
    let mut bob = relay.login("bob", "b-pw").await.unwrap();

    let request = Request::message("alice", "bob", "meet at the usual place");
    alice.send_raw(&damaged(&request, &[(60, 2), (60, 5)])).await.unwrap();
    let reply = next_within(&mut alice, WAIT).await;
    assert_eq!(error_code(&reply), ErrorCode::CorruptFrame);
    assert!(relay.relay.history.is_empty());

    let reply = alice.request(&request).await.unwrap();
    assert_eq!(reply.response, Response::Ack { seq: 0, delivered: 1 });
    assert_eq!(relay.relay.history.len(), 1);

    // Only the clean copy was delivered
    let incoming = next_within(&mut bob, WAIT).await;
    assert!(matches!(
        incoming.response,
        Response::Deliver(ref m) if m.body == "meet at the usual place"
    ));
    assert!(tokio::time::timeout(Duration::from_millis(200), bob.next_response())
        .await
        .is_err());

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_garbage_line_rejected() {
    let relay = TestRelay::start().await.unwrap();
    let mut client = relay.connect().await.unwrap();

    client.send_raw(b"hello there\n").await.unwrap();
    let reply = next_within(&mut client, WAIT).await;
    assert_eq!(error_code(&reply), ErrorCode::CorruptFrame);
    assert_eq!(relay.relay.registry.len(), 1);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_full() {
    let relay = TestRelayBuilder::new()
        .max_sessions(1)
        .account("alice", "secret")
        .build()
        .await
        .unwrap();

    let _alice = relay.login("alice", "secret").await.unwrap();

    let mut extra = relay.connect().await.unwrap();
    let reply = next_within(&mut extra, WAIT).await;
    assert_eq!(error_code(&reply), ErrorCode::ServerFull);
    assert!(matches!(extra.next_response().await, Err(ClientError::Closed)));
    assert_eq!(relay.relay.registry.len(), 1);

    relay.shutdown().await.unwrap();
}

/// A disconnected client's slot goes back to the pool.
#[tokio::test]
async fn test_slot_reused_after_disconnect() {
    let relay = TestRelayBuilder::new()
        .max_sessions(1)
        .account("alice", "secret")
        .build()
        .await
        .unwrap();

    let first = relay.login("alice", "secret").await.unwrap();
    let slot = relay.sessions()[0].slot;
    drop(first);
    relay.wait_sessions(0, WAIT).await.unwrap();

    let _second = relay.login("alice", "secret").await.unwrap();
    let sessions = relay.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].slot, slot);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_idle_session_closed() {
    let relay = TestRelayBuilder::new()
        .idle_timeout(Duration::from_millis(200))
        .build()
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    relay.wait_sessions(1, WAIT).await.unwrap();

    let closed = tokio::time::timeout(WAIT, client.next_response()).await.unwrap();
    assert!(matches!(closed, Err(ClientError::Closed)));
    relay.wait_sessions(0, WAIT).await.unwrap();

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let relay = TestRelayBuilder::new()
        .account("alice", "secret")
        .build()
        .await
        .unwrap();

    let mut alice = relay.login("alice", "secret").await.unwrap();
    let mut anon = relay.connect().await.unwrap();
    relay.wait_sessions(2, WAIT).await.unwrap();

    let addr = relay.addr;
    relay.shutdown().await.unwrap();

    for client in [&mut alice, &mut anon] {
        let closed = tokio::time::timeout(WAIT, client.next_response()).await.unwrap();
        assert!(matches!(closed, Err(ClientError::Closed)));
    }
    assert!(matches!(
        hamchat_node::client::RelayClient::connect(addr).await,
        Err(ClientError::Connect(_))
    ));
}
