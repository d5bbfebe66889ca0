//! Registration and login over TCP.

use std::time::Duration;

use hamchat_node::client::ClientError;
use hamchat_protocol::{ErrorCode, Response};

use crate::harness::{error_code, TestRelay, TestRelayBuilder};

/// A registered account can log in from a fresh connection.
#[tokio::test]
async fn test_register_then_login() {
    let relay = TestRelay::start().await.unwrap();

    let mut first = relay.connect().await.unwrap();
    let reply = first.register("alice", "secret").await.unwrap();
    assert_eq!(reply.response, Response::ok("registered alice"));
    assert_eq!(first.username(), Some("alice"));
    drop(first);

    let mut second = relay.connect().await.unwrap();
    let reply = second.login("alice", "secret").await.unwrap();
    assert_eq!(reply.response, Response::ok("welcome alice"));

    relay.shutdown().await.unwrap();
}

/// Passwords are never written in clear.
#[tokio::test]
async fn test_account_file_holds_hashes() {
    let relay = TestRelay::start().await.unwrap();
    let mut client = relay.connect().await.unwrap();
    client.register("alice", "hunter2").await.unwrap();

    let contents = std::fs::read_to_string(relay.accounts_path()).unwrap();
    assert!(contents.starts_with("alice scrypt$"));
    assert!(!contents.contains("hunter2"));

    relay.shutdown().await.unwrap();
}

/// Wrong password: AUTH_FAILED, then the server closes the connection.
#[tokio::test]
async fn test_wrong_password_closes_connection() {
    let relay = TestRelayBuilder::new()
        .account("alice", "secret")
        .build()
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    let reply = client.login("alice", "guess").await.unwrap();
    assert_eq!(error_code(&reply), ErrorCode::AuthFailed);
    assert_eq!(client.username(), None);

    assert!(matches!(
        client.next_response().await,
        Err(ClientError::Closed)
    ));
    relay.wait_sessions(0, Duration::from_secs(2)).await.unwrap();

    relay.shutdown().await.unwrap();
}

/// Unknown usernames fail exactly like wrong passwords.
#[tokio::test]
async fn test_unknown_user_rejected() {
    let relay = TestRelay::start().await.unwrap();
    let mut client = relay.connect().await.unwrap();
    let reply = client.login("ghost", "boo").await.unwrap();
    assert_eq!(error_code(&reply), ErrorCode::AuthFailed);
    relay.shutdown().await.unwrap();
}

/// A configured allowance lets a client retry on the same connection.
#[tokio::test]
async fn test_retry_within_allowance() {
    let relay = TestRelayBuilder::new()
        .max_auth_attempts(3)
        .account("alice", "secret")
        .build()
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    for _ in 0..2 {
        let reply = client.login("alice", "wrong").await.unwrap();
        assert_eq!(error_code(&reply), ErrorCode::AuthFailed);
    }
    let reply = client.login("alice", "secret").await.unwrap();
    assert_eq!(reply.response, Response::ok("welcome alice"));

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_registration() {
    let relay = TestRelayBuilder::new()
        .account("alice", "secret")
        .build()
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    let reply = client.register("alice", "other").await.unwrap();
    assert_eq!(error_code(&reply), ErrorCode::UsernameTaken);

    // The first credential still works
    relay.login("alice", "secret").await.unwrap();
    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_account_capacity() {
    let relay = TestRelayBuilder::new()
        .max_accounts(2)
        .account("a", "1")
        .account("b", "2")
        .build()
        .await
        .unwrap();

    let mut client = relay.connect().await.unwrap();
    let reply = client.register("c", "3").await.unwrap();
    assert_eq!(error_code(&reply), ErrorCode::CapacityExceeded);
    assert!(!relay.relay.accounts.contains("c"));

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_username_rejected() {
    let relay = TestRelay::start().await.unwrap();
    let mut client = relay.connect().await.unwrap();
    let reply = client.register("two words", "pw").await.unwrap();
    assert_eq!(error_code(&reply), ErrorCode::InvalidCredentials);
    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_login_rejected() {
    let relay = TestRelayBuilder::new()
        .account("alice", "secret")
        .build()
        .await
        .unwrap();

    let mut client = relay.login("alice", "secret").await.unwrap();
    let reply = client.login("alice", "secret").await.unwrap();
    assert_eq!(error_code(&reply), ErrorCode::AlreadyAuthenticated);
    let reply = client.register("bob", "pw").await.unwrap();
    assert_eq!(error_code(&reply), ErrorCode::AlreadyAuthenticated);
    assert!(!relay.relay.accounts.contains("bob"));

    relay.shutdown().await.unwrap();
}

/// Racing registrations of one name: exactly one wins.
#[tokio::test]
async fn test_concurrent_registration_one_winner() {
    let relay = TestRelay::start().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..6 {
        let addr = relay.addr;
        tasks.push(tokio::spawn(async move {
            let mut client = hamchat_node::client::RelayClient::connect(addr).await.unwrap();
            let reply = client.register("dup", &format!("pw{i}")).await.unwrap();
            matches!(reply.response, Response::Ok { .. })
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(relay.relay.accounts.len(), 1);

    relay.shutdown().await.unwrap();
}
