//! Per-server pool invariants: capacity ceiling, lease/return/discard
//! accounting, cancellation, and close semantics.

mod common;

use common::MockNntpServer;
use nzb_connect::error::NntpError;
use nzb_connect::nntp::ServerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn lease_dials_lazily_and_put_enables_reuse() {
    let server = MockNntpServer::start().await;
    let pool = ServerPool::new(server.server_config("a", 4), String::new());
    let cancel = CancellationToken::new();

    let conn = pool.lease(&cancel).await.expect("first lease");
    assert_eq!(pool.active_count(), 1);
    pool.put(conn).await;
    assert_eq!(pool.active_count(), 1, "returned connection stays active");

    let _conn = pool.lease(&cancel).await.expect("second lease");
    assert_eq!(
        server.connections_opened(),
        1,
        "an idle connection must be reused, not re-dialed"
    );
}

#[tokio::test]
async fn active_count_never_exceeds_capacity() {
    let server = MockNntpServer::start().await;
    let pool = Arc::new(ServerPool::new(server.server_config("a", 2), String::new()));
    let cancel = CancellationToken::new();

    let first = pool.lease(&cancel).await.expect("lease 1");
    let second = pool.lease(&cancel).await.expect("lease 2");
    assert_eq!(pool.active_count(), 2);

    // A third lease must block, not dial
    let blocked = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.lease(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished(), "lease beyond capacity must wait");
    assert_eq!(server.connections_opened(), 2);

    // Returning one unblocks the waiter with the same connection
    pool.put(first).await;
    let third = blocked
        .await
        .expect("join")
        .expect("third lease after return");
    assert_eq!(pool.active_count(), 2);
    assert_eq!(server.connections_opened(), 2);

    pool.put(second).await;
    pool.put(third).await;
}

#[tokio::test]
async fn cancelled_waiter_gets_cancelled_error() {
    let server = MockNntpServer::start().await;
    let pool = Arc::new(ServerPool::new(server.server_config("a", 1), String::new()));
    let cancel = CancellationToken::new();

    let held = pool.lease(&cancel).await.expect("lease");

    let waiter_cancel = CancellationToken::new();
    let waiter = {
        let pool = pool.clone();
        let cancel = waiter_cancel.clone();
        tokio::spawn(async move { pool.lease(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    waiter_cancel.cancel();

    let result = waiter.await.expect("join");
    assert!(matches!(result, Err(NntpError::Cancelled)));

    pool.put(held).await;
}

#[tokio::test]
async fn discard_releases_capacity_for_a_fresh_dial() {
    let server = MockNntpServer::start().await;
    let pool = ServerPool::new(server.server_config("a", 1), String::new());
    let cancel = CancellationToken::new();

    let conn = pool.lease(&cancel).await.expect("lease");
    pool.discard(conn).await;
    assert_eq!(pool.active_count(), 0, "discard must release the slot");

    let _conn = pool.lease(&cancel).await.expect("lease after discard");
    assert_eq!(
        server.connections_opened(),
        2,
        "a discarded connection is gone; the next lease dials fresh"
    );
}

#[tokio::test]
async fn close_refuses_new_leases_and_wakes_waiters() {
    let server = MockNntpServer::start().await;
    let pool = Arc::new(ServerPool::new(server.server_config("a", 1), String::new()));
    let cancel = CancellationToken::new();

    let held = pool.lease(&cancel).await.expect("lease");

    let waiter = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.lease(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.close().await;
    let result = waiter.await.expect("join");
    assert!(
        matches!(result, Err(NntpError::PoolClosed)),
        "a blocked waiter must fail once the pool closes"
    );
    assert!(matches!(
        pool.lease(&cancel).await,
        Err(NntpError::PoolClosed)
    ));

    // The leaseholder drains through put, which closes the connection
    pool.put(held).await;
    assert_eq!(pool.active_count(), 0);
}

#[tokio::test]
async fn dial_failure_releases_the_reserved_slot() {
    // A port with nothing listening
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let config = nzb_connect::config::ServerConfig {
        id: "dead".into(),
        name: "dead".into(),
        host: "127.0.0.1".into(),
        port,
        tls: false,
        username: None,
        password: None,
        connections: 1,
        enabled: true,
    };
    let pool = ServerPool::new(config, String::new());
    let cancel = CancellationToken::new();

    assert!(pool.lease(&cancel).await.is_err());
    assert_eq!(
        pool.active_count(),
        0,
        "a failed dial must not leak capacity"
    );
    // The slot is reusable: the next attempt fails the same way rather
    // than blocking forever
    assert!(pool.lease(&cancel).await.is_err());
}

#[tokio::test]
async fn capacity_is_clamped_to_the_hard_ceiling() {
    let server = MockNntpServer::start().await;
    let oversized = ServerPool::new(server.server_config("a", 500), String::new());
    assert_eq!(oversized.capacity(), 50);

    let zero = ServerPool::new(server.server_config("b", 0), String::new());
    assert_eq!(zero.capacity(), 10);
}
