//! Leader election and failover across replicas.
//!
//! Replicas share one in-memory store and talk real TCP on distinct
//! loopback addresses. Tests cover the claim race, EOF-driven failover,
//! and takeover from an unreachable leader.

use std::sync::Arc;
use std::time::Duration;

use caravel_core::config::LeaderConfig;
use caravel_core::ha::{LeaderGate, LEADER_KEY};
use caravel_core::storage::{MemoryStorage, Storage};

fn gate(storage: Arc<dyn Storage>, ip: &str, port: u16) -> Arc<LeaderGate> {
    Arc::new(LeaderGate::new(
        storage,
        LeaderConfig {
            ip: ip.to_string(),
            server_port: port,
            retry_interval: Duration::from_millis(20),
            ..Default::default()
        },
    ))
}

// ============================================================================
// At most one leader
// ============================================================================

#[tokio::test]
async fn only_one_replica_wins_the_claim_race() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

    let a = gate(storage.clone(), "127.0.0.2", 47011);
    a.elect().await.unwrap();
    let a_serve = tokio::spawn({
        let a = a.clone();
        async move {
            let _ = a.serve().await;
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The key is taken and its holder is alive; a second replica must
    // keep following rather than return from election.
    let b = gate(storage.clone(), "127.0.0.3", 47011);
    let b_elect = tokio::spawn({
        let b = b.clone();
        async move { b.elect().await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!b_elect.is_finished());
    assert_eq!(
        storage.read(LEADER_KEY).await.unwrap().as_deref(),
        Some("127.0.0.2")
    );
    b_elect.abort();
    a_serve.abort();
}

// ============================================================================
// Failover on leader death
// ============================================================================

#[tokio::test]
async fn standby_takes_over_when_leader_connection_closes() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let port = 47013;

    let a = gate(storage.clone(), "127.0.0.2", port);
    a.elect().await.unwrap();
    let a_serve = tokio::spawn({
        let a = a.clone();
        async move {
            let _ = a.serve().await;
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let b = gate(storage.clone(), "127.0.0.3", port);
    let b_elect = tokio::spawn({
        let b = b.clone();
        async move { b.elect().await }
    });

    // B is connected and watching; A still leads.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!b_elect.is_finished());
    assert_eq!(
        storage.read(LEADER_KEY).await.unwrap().as_deref(),
        Some("127.0.0.2")
    );

    // Kill A: its listener and held connections drop, B observes EOF,
    // deletes the key, and claims it.
    a_serve.abort();
    tokio::time::timeout(Duration::from_secs(5), b_elect)
        .await
        .expect("standby did not take over")
        .unwrap()
        .unwrap();

    assert_eq!(
        storage.read(LEADER_KEY).await.unwrap().as_deref(),
        Some("127.0.0.3")
    );
}

#[tokio::test]
async fn standby_takes_over_from_unreachable_leader() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

    // The recorded leader is gone: nothing listens on its address, so the
    // dial is refused, the key is deleted, and the standby claims it.
    storage.create(LEADER_KEY, "127.0.0.9").await.unwrap();

    let b = gate(storage.clone(), "127.0.0.3", 47017);
    tokio::time::timeout(Duration::from_secs(5), b.elect())
        .await
        .expect("standby did not take over")
        .unwrap();

    assert_eq!(
        storage.read(LEADER_KEY).await.unwrap().as_deref(),
        Some("127.0.0.3")
    );
}

// ============================================================================
// Graceful handover
// ============================================================================

#[tokio::test]
async fn resignation_lets_the_next_replica_claim_immediately() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

    let a = gate(storage.clone(), "127.0.0.2", 47019);
    a.elect().await.unwrap();
    a.resign().await.unwrap();

    let b = gate(storage.clone(), "127.0.0.3", 47019);
    tokio::time::timeout(Duration::from_secs(1), b.elect())
        .await
        .expect("claim after resignation should not block")
        .unwrap();
    assert_eq!(
        storage.read(LEADER_KEY).await.unwrap().as_deref(),
        Some("127.0.0.3")
    );
}
