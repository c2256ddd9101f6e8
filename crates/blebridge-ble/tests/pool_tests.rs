//! Connection Pool Tests
//!
//! Admission, LRU eviction and connect retry classification against the
//! in-memory transport. The clock is paused so backoff sleeps cost nothing.

mod common;

use std::sync::Arc;
use std::time::Duration;

use blebridge_ble::{ConnectionPool, ConnectionState, GatewayError, Link, TransportFault};
use common::*;
use tokio::time::Instant;

fn pool(transport: &Arc<MockTransport>, capacity: usize) -> Arc<ConnectionPool> {
    init_tracing();
    ConnectionPool::new(
        Arc::clone(transport) as Arc<dyn blebridge_ble::BleTransport>,
        test_config().with_pool_capacity(capacity),
    )
}

// ----------------------------------------------------------------------------
// Capacity and Eviction
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_capacity_never_exceeded() {
    let transport = MockTransport::new();
    let pool = pool(&transport, 2);
    let links: Vec<Link> = [ADDRESS_A, ADDRESS_B, ADDRESS_C, ADDRESS_D]
        .into_iter()
        .map(|address| Link::new(Arc::clone(&pool), address))
        .collect();

    for link in &links {
        link.connect().await.unwrap();
        assert!(pool.connected_count().await <= 2);
        assert!(transport.connected_count() <= 2);
    }

    assert_eq!(transport.peak_connected(), 2);
    assert_eq!(pool.addresses().await, vec![ADDRESS_C, ADDRESS_D]);
    assert_eq!(transport.disconnect_count(ADDRESS_A), 1);
    assert_eq!(transport.disconnect_count(ADDRESS_B), 1);
    assert_eq!(links[0].state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_least_recently_used_is_evicted() {
    let transport = MockTransport::new();
    let pool = pool(&transport, 2);
    let a = Link::new(Arc::clone(&pool), ADDRESS_A);
    let b = Link::new(Arc::clone(&pool), ADDRESS_B);
    let c = Link::new(Arc::clone(&pool), ADDRESS_C);

    a.connect().await.unwrap();
    b.connect().await.unwrap();
    // Using `a` again makes `b` the least recently used
    a.connect().await.unwrap();
    c.connect().await.unwrap();

    assert!(a.is_connected());
    assert!(!b.is_connected());
    assert!(c.is_connected());
    assert_eq!(transport.disconnect_count(ADDRESS_A), 0);
    assert_eq!(transport.disconnect_count(ADDRESS_B), 1);
    assert_eq!(transport.connect_count(ADDRESS_A), 1);
}

#[tokio::test(start_paused = true)]
async fn test_evicted_link_reconnects_on_next_use() {
    let transport = MockTransport::new();
    let pool = pool(&transport, 1);
    let a = Link::new(Arc::clone(&pool), ADDRESS_A);
    let b = Link::new(Arc::clone(&pool), ADDRESS_B);

    a.connect().await.unwrap();
    b.connect().await.unwrap();
    a.connect().await.unwrap();

    assert!(a.is_connected());
    assert!(!b.is_connected());
    assert_eq!(transport.connect_count(ADDRESS_A), 2);
    assert_eq!(pool.addresses().await, vec![ADDRESS_A]);
}

// ----------------------------------------------------------------------------
// Retry Classification
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_local_abort_is_retried_after_backoff() {
    let transport = MockTransport::new();
    let pool = pool(&transport, 6);
    let link = Link::new(Arc::clone(&pool), ADDRESS_A);
    transport.script_connect_failures(
        ADDRESS_A,
        vec![
            TransportFault::LocalAbort("le-connection-abort-by-local".into()),
            TransportFault::LocalAbort("le-connection-abort-by-local".into()),
        ],
    );

    let started = Instant::now();
    link.connect().await.unwrap();

    assert!(link.is_connected());
    assert_eq!(transport.connect_count(ADDRESS_A), 3);
    assert!(started.elapsed() >= Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_device_not_found_triggers_scan() {
    let transport = MockTransport::new();
    let pool = pool(&transport, 6);
    let link = Link::new(Arc::clone(&pool), ADDRESS_A);
    transport.script_connect_failures(
        ADDRESS_A,
        vec![TransportFault::DeviceNotFound {
            address: ADDRESS_A.into(),
        }],
    );

    link.connect().await.unwrap();

    assert_eq!(transport.scan_count(ADDRESS_A), 1);
    assert_eq!(transport.connect_count(ADDRESS_A), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unclassified_connect_error_is_fatal() {
    let transport = MockTransport::new();
    let pool = pool(&transport, 6);
    let link = Link::new(Arc::clone(&pool), ADDRESS_A);
    transport.script_connect_failures(
        ADDRESS_A,
        vec![TransportFault::Other("org.bluez.Error.NotPermitted".into())],
    );

    let result = link.connect().await;

    assert!(matches!(
        result,
        Err(GatewayError::Transport(TransportFault::Other(_)))
    ));
    assert_eq!(transport.connect_count(ADDRESS_A), 1);
    assert_eq!(link.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_attempts_are_bounded() {
    let transport = MockTransport::new();
    let pool = pool(&transport, 6);
    let link = Link::new(Arc::clone(&pool), ADDRESS_A);
    transport.fail_connect_always(
        ADDRESS_A,
        TransportFault::LocalAbort("le-connection-abort-by-local".into()),
    );

    let result = link.connect().await;

    assert_eq!(
        result,
        Err(GatewayError::ExhaustedRetries {
            operation: "connect",
            attempts: 10
        })
    );
    assert_eq!(transport.connect_count(ADDRESS_A), 10);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_releases_pool_lock() {
    let transport = MockTransport::new();
    let pool = pool(&transport, 6);
    let stuck = Arc::new(Link::new(Arc::clone(&pool), ADDRESS_A));
    let healthy = Link::new(Arc::clone(&pool), ADDRESS_B);
    transport.fail_connect_always(
        ADDRESS_A,
        TransportFault::LocalAbort("le-connection-abort-by-local".into()),
    );

    let retrying = {
        let stuck = Arc::clone(&stuck);
        tokio::spawn(async move { stuck.connect().await })
    };
    settle().await;
    assert_eq!(transport.connect_count(ADDRESS_A), 1);

    // Connects while the other link sleeps off its backoff
    healthy.connect().await.unwrap();
    assert!(healthy.is_connected());
    assert!(!retrying.is_finished());

    assert!(matches!(
        retrying.await.unwrap(),
        Err(GatewayError::ExhaustedRetries { .. })
    ));
}

// ----------------------------------------------------------------------------
// Disconnect Guarantees
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_dropped_link_disconnects_exactly_once() {
    let transport = MockTransport::new();
    let pool = pool(&transport, 6);
    let link = Link::new(Arc::clone(&pool), ADDRESS_A);
    link.connect().await.unwrap();

    drop(link);
    settle().await;
    assert_eq!(transport.disconnect_count(ADDRESS_A), 1);
    assert!(!transport.is_connected(ADDRESS_A));

    pool.disconnect_all().await;
    assert_eq!(transport.disconnect_count(ADDRESS_A), 1);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_disconnect_then_drop() {
    let transport = MockTransport::new();
    let pool = pool(&transport, 6);
    let link = Link::new(Arc::clone(&pool), ADDRESS_A);
    link.connect().await.unwrap();

    link.close().await;
    settle().await;
    assert_eq!(transport.disconnect_count(ADDRESS_A), 1);
    assert!(pool.addresses().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_remote_disconnect_leaves_pool() {
    let transport = MockTransport::new();
    let pool = pool(&transport, 2);
    let a = Link::new(Arc::clone(&pool), ADDRESS_A);
    let b = Link::new(Arc::clone(&pool), ADDRESS_B);
    let c = Link::new(Arc::clone(&pool), ADDRESS_C);
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    transport.drop_connection(ADDRESS_A);
    assert_eq!(a.state(), ConnectionState::Disconnected);

    // The free slot is reused without evicting `b`
    c.connect().await.unwrap();
    assert!(b.is_connected());
    assert_eq!(transport.disconnect_count(ADDRESS_B), 0);
    assert_eq!(transport.disconnect_count(ADDRESS_A), 0);
    assert_eq!(pool.addresses().await, vec![ADDRESS_B, ADDRESS_C]);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_all() {
    let transport = MockTransport::new();
    let pool = pool(&transport, 6);
    let a = Link::new(Arc::clone(&pool), ADDRESS_A);
    let b = Link::new(Arc::clone(&pool), ADDRESS_B);
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    pool.disconnect_all().await;

    assert_eq!(pool.connected_count().await, 0);
    assert!(!a.is_connected());
    assert!(!b.is_connected());
    assert_eq!(transport.connected_count(), 0);
}
