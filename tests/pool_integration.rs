//! Integration tests for the connection pool caps and idle eviction
//!
//! These tests check the pool invariants under concurrent checkouts.

mod common;

use common::StubServer;
use getpool::pool::{ConnectionPool, PoolConfig, PoolError, Route, Scheme};
use hyper::StatusCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn ok_server() -> StubServer {
    StubServer::start(|_| (StatusCode::OK, "ok".to_string())).await
}

fn route_of(server: &StubServer) -> Route {
    Route::new(Scheme::Http, "127.0.0.1", server.addr.port())
}

#[tokio::test]
async fn test_route_cap_under_concurrency() {
    let server = ok_server().await;
    let route = route_of(&server);
    let pool = ConnectionPool::new(PoolConfig {
        max_total_connections: 10,
        max_per_route: 3,
        acquire_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    })
    .unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let route = route.clone();
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            let conn = pool.acquire(&route).await?;
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            assert!(pool.route_stats(&route).open <= 3);

            tokio::time::sleep(Duration::from_millis(30)).await;

            active.fetch_sub(1, Ordering::SeqCst);
            pool.release(conn, true);
            Ok::<_, PoolError>(())
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(pool.stats().total_created <= 3);
    assert_eq!(pool.stats().leased, 0);
}

#[tokio::test]
async fn test_excess_callers_time_out() {
    let server = ok_server().await;
    let route = route_of(&server);
    let pool = ConnectionPool::new(PoolConfig {
        max_total_connections: 10,
        max_per_route: 2,
        acquire_timeout: Duration::from_millis(100),
        ..PoolConfig::default()
    })
    .unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let pool = pool.clone();
        let route = route.clone();
        handles.push(tokio::spawn(async move {
            let conn = pool.acquire(&route).await?;
            tokio::time::sleep(Duration::from_millis(400)).await;
            pool.release(conn, true);
            Ok::<_, PoolError>(())
        }));
    }

    let mut succeeded = 0;
    let mut timed_out = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => succeeded += 1,
            Err(PoolError::AcquireTimeout { .. }) => timed_out += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(succeeded, 2);
    assert_eq!(timed_out, 3);
}

#[tokio::test]
async fn test_total_cap_across_routes() {
    let first = ok_server().await;
    let second = ok_server().await;
    let routes = [route_of(&first), route_of(&second)];
    let pool = ConnectionPool::new(PoolConfig {
        max_total_connections: 3,
        max_per_route: 3,
        acquire_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    })
    .unwrap();

    let mut handles = Vec::new();
    for i in 0..12 {
        let pool = pool.clone();
        let route = routes[i % 2].clone();
        handles.push(tokio::spawn(async move {
            let conn = pool.acquire(&route).await?;
            assert!(pool.stats().open <= 3);
            tokio::time::sleep(Duration::from_millis(20)).await;
            pool.release(conn, true);
            Ok::<_, PoolError>(())
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(pool.stats().open <= 3);
}

#[tokio::test]
async fn test_background_sweep_evicts_idle_connections() {
    let server = ok_server().await;
    let route = route_of(&server);
    let pool = ConnectionPool::new(PoolConfig {
        max_total_connections: 2,
        max_per_route: 1,
        idle_timeout: Duration::from_millis(50),
        eviction_interval: Duration::from_millis(50),
        ..PoolConfig::default()
    })
    .unwrap();

    let conn = pool.acquire(&route).await.unwrap();
    pool.release(conn, true);
    assert_eq!(pool.route_stats(&route).idle, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(pool.route_stats(&route).open, 0);
    assert!(pool.stats().total_evicted >= 1);

    // The evicted connection no longer counts against the route cap
    let conn = pool.acquire(&route).await.unwrap();
    assert!(!conn.is_reused());
    pool.release(conn, true);
}
