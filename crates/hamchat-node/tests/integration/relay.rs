//! Message relay, delivery and broadcast.

use std::time::Duration;

use hamchat_node::broadcast::{broadcast, BroadcastReport};
use hamchat_node::client::ClientError;
use hamchat_node::registry::SessionState;
use hamchat_protocol::{ChatRequest, ErrorCode, Request, Response};
use hamchat_storage::{ChatLog, HistoryFile};

use crate::harness::{error_code, next_within, TestRelay, TestRelayBuilder};

const WAIT: Duration = Duration::from_secs(5);

async fn two_users() -> TestRelay {
    TestRelayBuilder::new()
        .account("alice", "a-pw")
        .account("bob", "b-pw")
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_message_delivered_to_online_recipient() {
    let relay = two_users().await;
    let mut alice = relay.login("alice", "a-pw").await.unwrap();
    let mut bob = relay.login("bob", "b-pw").await.unwrap();

    let reply = alice.send_message("bob", "hello bob").await.unwrap();
    assert_eq!(reply.response, Response::Ack { seq: 0, delivered: 1 });

    let incoming = next_within(&mut bob, WAIT).await;
    assert_eq!(
        incoming.response,
        Response::Deliver(ChatRequest {
            from: "alice".into(),
            to: "bob".into(),
            body: "hello bob".into(),
        })
    );

    let states: Vec<SessionState> = relay.sessions().into_iter().map(|s| s.state).collect();
    assert!(states.contains(&SessionState::Relaying));
    assert!(states.contains(&SessionState::Authenticated));

    relay.shutdown().await.unwrap();
}

/// Offline recipients still get the message logged; nothing is delivered.
#[tokio::test]
async fn test_offline_recipient_logged() {
    let relay = two_users().await;
    let mut alice = relay.login("alice", "a-pw").await.unwrap();

    let reply = alice.send_message("bob", "see you later").await.unwrap();
    assert_eq!(reply.response, Response::Ack { seq: 0, delivered: 0 });

    let logged = relay.relay.history.get(0).unwrap().unwrap();
    assert_eq!(logged.sender, "alice");
    assert_eq!(logged.recipient, "bob");
    assert_eq!(logged.body, "see you later");

    relay.shutdown().await.unwrap();
}

/// A user logged in twice receives on both sessions.
#[tokio::test]
async fn test_delivery_to_every_session_of_recipient() {
    let relay = two_users().await;
    let mut alice = relay.login("alice", "a-pw").await.unwrap();
    let mut bob1 = relay.login("bob", "b-pw").await.unwrap();
    let mut bob2 = relay.login("bob", "b-pw").await.unwrap();

    let reply = alice.send_message("bob", "both of you").await.unwrap();
    assert_eq!(reply.response, Response::Ack { seq: 0, delivered: 2 });

    for bob in [&mut bob1, &mut bob2] {
        let incoming = next_within(bob, WAIT).await;
        assert!(matches!(incoming.response, Response::Deliver(ref m) if m.body == "both of you"));
    }

    relay.shutdown().await.unwrap();
}

/// Sequence numbers follow log order across sessions and survive restart.
#[tokio::test]
async fn test_sequence_and_history_persist() {
    let relay = two_users().await;
    let mut alice = relay.login("alice", "a-pw").await.unwrap();
    let mut bob = relay.login("bob", "b-pw").await.unwrap();

    let mut seqs = Vec::new();
    for i in 0..3 {
        for (client, to) in [(&mut alice, "bob"), (&mut bob, "alice")] {
            match client.send_message(to, &format!("msg {i}")).await.unwrap().response {
                Response::Ack { seq, .. } => seqs.push(seq),
                other => panic!("expected ACK, got {other:?}"),
            }
        }
    }
    assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);

    let history_path = relay.history_path();
    let reopened = ChatLog::open(Box::new(HistoryFile::new(&history_path))).unwrap();
    assert_eq!(reopened.len(), 6);
    let first = reopened.get(0).unwrap().unwrap();
    assert_eq!((first.sender.as_str(), first.body.as_str()), ("alice", "msg 0"));
    assert!(first.logged_at.is_some());

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sender_must_match_login() {
    let relay = two_users().await;
    let mut alice = relay.login("alice", "a-pw").await.unwrap();

    let reply = alice
        .request(&Request::message("bob", "alice", "spoofed"))
        .await
        .unwrap();
    assert_eq!(error_code(&reply), ErrorCode::SenderMismatch);
    assert!(relay.relay.history.is_empty());

    // The session survives the rejection
    let reply = alice.send_message("bob", "genuine").await.unwrap();
    assert!(matches!(reply.response, Response::Ack { .. }));

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_message_before_login_closes() {
    let relay = two_users().await;
    let mut client = relay.connect().await.unwrap();

    let reply = client
        .request(&Request::message("alice", "bob", "sneaky"))
        .await
        .unwrap();
    assert_eq!(error_code(&reply), ErrorCode::NotAuthenticated);
    assert!(matches!(client.next_response().await, Err(ClientError::Closed)));
    assert!(relay.relay.history.is_empty());

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_requires_login_before_send() {
    let relay = two_users().await;
    let mut client = relay.connect().await.unwrap();
    assert!(matches!(
        client.send_message("bob", "hi").await,
        Err(ClientError::NotLoggedIn)
    ));
    relay.shutdown().await.unwrap();
}

/// Operator broadcast reaches authenticated and unauthenticated sessions.
#[tokio::test]
async fn test_broadcast_reaches_everyone() {
    let relay = two_users().await;
    let mut alice = relay.login("alice", "a-pw").await.unwrap();
    let mut anon = relay.connect().await.unwrap();
    relay.wait_sessions(2, WAIT).await.unwrap();

    let report = broadcast(&relay.relay.registry, "server restarting at noon");
    assert_eq!(report, BroadcastReport { delivered: 2, failed: 0 });

    for client in [&mut alice, &mut anon] {
        let incoming = next_within(client, WAIT).await;
        assert_eq!(incoming.response, Response::broadcast("server restarting at noon"));
    }

    relay.shutdown().await.unwrap();
}

/// Broadcasts arriving mid-request are queued, not mistaken for replies.
#[tokio::test]
async fn test_broadcast_interleaved_with_request() {
    let relay = two_users().await;
    let mut alice = relay.login("alice", "a-pw").await.unwrap();

    broadcast(&relay.relay.registry, "heads up");
    let reply = alice.send_message("bob", "hi").await.unwrap();
    assert!(matches!(reply.response, Response::Ack { .. }));

    let queued = next_within(&mut alice, WAIT).await;
    assert_eq!(queued.response, Response::broadcast("heads up"));

    relay.shutdown().await.unwrap();
}
