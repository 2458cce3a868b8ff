//! Integration tests for endpoint registration against the in-memory store.

use hotswap_registry::coordination::{FaultOp, MemoryCoordinator};
use hotswap_registry::prelude::*;
use hotswap_registry::registry::{RegistryState, RenewalExit, discover, service_key};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn registry(store: &MemoryCoordinator, address: &str, ttl: Duration) -> EndpointRegistry {
    EndpointRegistry::new(
        Arc::new(store.client()),
        "task",
        address,
        RegistryOptions {
            lease_ttl: ttl,
            request_timeout: Duration::from_secs(1),
        },
    )
}

#[tokio::test]
async fn test_registered_endpoint_is_discoverable() {
    let store = MemoryCoordinator::new();
    let reg = registry(&store, "localhost:9090", Duration::from_secs(15));

    reg.register(&CancellationToken::new()).await.unwrap();

    assert_eq!(reg.state(), RegistryState::Active);
    assert_eq!(reg.key(), "service/task/localhost:9090");
    assert_eq!(
        discover(&store.client(), "task").await.unwrap(),
        vec!["localhost:9090"]
    );
    assert_eq!(store.lease_of(reg.key()), reg.lease());
}

#[tokio::test]
async fn test_unregister_withdraws_and_is_idempotent() {
    let store = MemoryCoordinator::new();
    let reg = registry(&store, "localhost:9090", Duration::from_secs(15));
    reg.register(&CancellationToken::new()).await.unwrap();

    reg.unregister().await.unwrap();
    assert!(discover(&store.client(), "task").await.unwrap().is_empty());
    assert_eq!(store.live_leases(), 0);
    assert_eq!(reg.lease(), None);
    assert_eq!(reg.state(), RegistryState::Retired);
    assert_eq!(reg.renewal_exit(), Some(RenewalExit::Stopped));

    reg.unregister().await.unwrap();
    assert_eq!(reg.state(), RegistryState::Retired);
}

#[tokio::test]
async fn test_retired_registry_rejects_register() {
    let store = MemoryCoordinator::new();
    let reg = registry(&store, "localhost:9090", Duration::from_secs(15));
    reg.register(&CancellationToken::new()).await.unwrap();
    reg.unregister().await.unwrap();

    assert!(matches!(
        reg.register(&CancellationToken::new()).await,
        Err(RegistryError::Retired)
    ));
    assert!(store.entries("service/").is_empty());
}

#[tokio::test]
async fn test_unregister_before_register_is_a_no_op() {
    let store = MemoryCoordinator::new();
    let reg = registry(&store, "localhost:9090", Duration::from_secs(15));

    reg.unregister().await.unwrap();
    assert!(store.events().is_empty());
}

#[tokio::test]
async fn test_grant_failure_leaves_registry_inert() {
    let store = MemoryCoordinator::new();
    store.set_failing(FaultOp::Grant, true);
    let reg = registry(&store, "localhost:9090", Duration::from_secs(15));

    assert!(matches!(
        reg.register(&CancellationToken::new()).await,
        Err(RegistryError::Grant(_))
    ));
    assert_eq!(reg.state(), RegistryState::Inert);
    assert_eq!(reg.renewal_exit(), None);

    // Inert registries may try again.
    store.set_failing(FaultOp::Grant, false);
    reg.register(&CancellationToken::new()).await.unwrap();
    assert_eq!(reg.state(), RegistryState::Active);
}

#[tokio::test]
async fn test_put_failure_revokes_fresh_lease() {
    let store = MemoryCoordinator::new();
    store.set_failing(FaultOp::Put, true);
    let reg = registry(&store, "localhost:9090", Duration::from_secs(15));

    let err = reg.register(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RegistryError::Put { ref key, .. } if key == "service/task/localhost:9090"));
    assert_eq!(reg.state(), RegistryState::Inert);
    assert_eq!(store.live_leases(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_record_expires_once_renewal_stops() {
    let store = MemoryCoordinator::new();
    let ttl = Duration::from_secs(3);
    let reg = registry(&store, "localhost:9090", ttl);
    reg.register(&CancellationToken::new()).await.unwrap();

    // Renewal keeps it alive well past one TTL.
    tokio::time::sleep(ttl * 4).await;
    assert_eq!(store.entries("service/task/").len(), 1);

    let lease = reg.lease().unwrap();
    store.sever(lease);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(reg.renewal_exit(), Some(RenewalExit::ChannelClosed));
    assert_eq!(reg.state(), RegistryState::Retired);
    assert_eq!(store.entries("service/task/").len(), 1);

    tokio::time::sleep(ttl + Duration::from_millis(10)).await;
    assert!(store.entries("service/task/").is_empty());
    assert_eq!(store.live_leases(), 0);

    // Nothing left to revoke; withdrawal still succeeds.
    reg.unregister().await.unwrap();
}

#[tokio::test]
async fn test_two_registries_hold_separate_leases() {
    let store = MemoryCoordinator::new();
    let a = registry(&store, "localhost:9090", Duration::from_secs(15));
    let b = registry(&store, "localhost:9091", Duration::from_secs(15));
    let cancel = CancellationToken::new();
    a.register(&cancel).await.unwrap();
    b.register(&cancel).await.unwrap();

    assert_ne!(a.lease(), b.lease());
    assert_eq!(
        discover(&store.client(), "task").await.unwrap(),
        vec!["localhost:9090", "localhost:9091"]
    );

    a.unregister().await.unwrap();
    assert_eq!(
        discover(&store.client(), "task").await.unwrap(),
        vec!["localhost:9091"]
    );
    assert!(store.lease_of(&service_key("task", "localhost:9091")).is_some());
    b.unregister().await.unwrap();
}
