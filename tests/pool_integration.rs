//! Pool integration tests: real subprocesses through checkout, reuse,
//! capacity limits, replacement and shutdown.
#![cfg(unix)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use toolgate_core::pool::{ConnectionPoolManager, PoolConfig, SpawnSpec};
use toolgate_core::types::ToolId;
use toolgate_core::Error;

fn manager(max_size: usize) -> Arc<ConnectionPoolManager> {
    Arc::new(ConnectionPoolManager::new(PoolConfig {
        max_size,
        spawn_grace: Duration::from_millis(20),
        graceful_shutdown_timeout: Duration::from_millis(500),
        kill_timeout: Duration::from_millis(500),
        ..Default::default()
    }))
}

fn sleeper() -> SpawnSpec {
    SpawnSpec::new("sleep").arg("30")
}

#[tokio::test]
async fn concurrent_checkouts_get_distinct_connections() {
    let pool = manager(8);
    let tool = ToolId::must("parallel");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let tool = tool.clone();
            tokio::spawn(async move { pool.get_connection(&tool, &sleeper()).await })
        })
        .collect();

    let mut connections = Vec::new();
    for handle in handles {
        connections.push(handle.await.unwrap().unwrap());
    }
    let ids: HashSet<_> = connections.iter().map(|c| c.id().clone()).collect();
    assert_eq!(ids.len(), 8);
    assert_eq!(pool.get_pool_stats().await.active, 8);

    for connection in connections {
        pool.release_connection(connection).await;
    }
    assert_eq!(pool.shutdown().await, 8);
}

#[tokio::test]
async fn released_connection_is_reused_before_spawning() {
    let pool = manager(3);
    let tool = ToolId::must("reuse");

    let first = pool.get_connection(&tool, &sleeper()).await.unwrap();
    let first_id = first.id().clone();
    let first_pid = first.pid();
    pool.release_connection(first).await;

    let again = pool.get_connection(&tool, &sleeper()).await.unwrap();
    assert_eq!(again.id(), &first_id);
    assert_eq!(again.pid(), first_pid);
    assert_eq!(pool.get_pool_stats().await.total, 1);

    pool.release_connection(again).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn fourth_checkout_exceeds_capacity_until_release() {
    let pool = manager(3);
    let tool = ToolId::must("bounded");

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.get_connection(&tool, &sleeper()).await.unwrap());
    }

    match pool.get_connection(&tool, &sleeper()).await {
        Err(Error::CapacityExceeded { tool_id, max_size }) => {
            assert_eq!(tool_id, "bounded");
            assert_eq!(max_size, 3);
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }

    // Other tools are unaffected.
    let other = pool
        .get_connection(&ToolId::must("other"), &sleeper())
        .await
        .unwrap();

    let released = held.pop().unwrap();
    pool.release_connection(released).await;
    held.push(pool.get_connection(&tool, &sleeper()).await.unwrap());

    held.push(other);
    for connection in held {
        pool.release_connection(connection).await;
    }
    pool.shutdown().await;
}

#[tokio::test]
async fn exited_process_is_replaced_not_returned() {
    let pool = manager(3);
    let tool = ToolId::must("flaky");
    let short = SpawnSpec::new("sh").args(["-c", "sleep 0.3"]);

    let conn = pool.get_connection(&tool, &short).await.unwrap();
    let dead_id = conn.id().clone();
    assert!(pool.release_connection(conn).await);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut replacement = pool.get_connection(&tool, &sleeper()).await.unwrap();
    assert_ne!(replacement.id(), &dead_id);
    assert!(pool.health_check(&mut replacement));

    pool.release_connection(replacement).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn missing_executable_surfaces_spawn_failure() {
    let pool = manager(3);
    let tool = ToolId::must("ghost");
    let err = pool
        .get_connection(&tool, &SpawnSpec::new("/nonexistent/toolgate-ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SpawnFailure { .. }));
    assert!(err.to_string().contains("ghost"));
    // The failed spawn does not hold a slot.
    let stats = pool.get_pool_stats().await;
    assert_eq!(stats.tools["ghost"].spawning, 0);
    assert_eq!(stats.total, 0);
}

#[tokio::test]
async fn connection_stdio_belongs_to_the_holder() {
    let pool = manager(1);
    let tool = ToolId::must("cat");
    let mut conn = pool
        .get_connection(&tool, &SpawnSpec::new("cat"))
        .await
        .unwrap();

    conn.stdin().unwrap().write_all(b"ping\n").await.unwrap();
    let mut line = String::new();
    BufReader::new(conn.stdout().unwrap())
        .read_line(&mut line)
        .await
        .unwrap();
    assert_eq!(line, "ping\n");

    pool.release_connection(conn).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn sweeper_closes_idle_connections_and_stops() {
    let pool = Arc::new(ConnectionPoolManager::new(PoolConfig {
        idle_timeout: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(50),
        spawn_grace: Duration::from_millis(20),
        graceful_shutdown_timeout: Duration::from_millis(500),
        kill_timeout: Duration::from_millis(500),
        ..Default::default()
    }));
    pool.start().unwrap();

    let tool = ToolId::must("sweepme");
    let a = pool.get_connection(&tool, &sleeper()).await.unwrap();
    let b = pool.get_connection(&tool, &sleeper()).await.unwrap();
    pool.release_connection(a).await;
    pool.release_connection(b).await;
    assert_eq!(pool.get_pool_stats().await.idle, 2);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(pool.get_pool_stats().await.idle, 0);

    pool.shutdown().await;
    assert!(matches!(
        pool.get_connection(&tool, &sleeper()).await,
        Err(Error::PoolClosed(_))
    ));
}
