//! Lease-backed endpoint advertisement.
//!
//! An [`EndpointRegistry`] writes one `service/<name>/<address>` record bound
//! to a lease it keeps renewing, and withdraws it on
//! [`unregister`](EndpointRegistry::unregister). [`discover`] is the matching
//! lookup used by clients.

mod endpoint;

pub use endpoint::{EndpointRegistry, RegistryOptions, RegistryState, RenewalExit};

use crate::coordination::CoordinationClient;
use crate::error::CoordinationError;

/// Root of the discovery key space.
pub const SERVICE_ROOT: &str = "service";

/// Prefix under which every endpoint of `service` is recorded.
pub fn service_prefix(service: &str) -> String {
    format!("{SERVICE_ROOT}/{service}/")
}

/// Discovery key for one endpoint.
pub fn service_key(service: &str, address: &str) -> String {
    format!("{SERVICE_ROOT}/{service}/{address}")
}

/// Addresses currently advertised for `service`, sorted and deduplicated.
///
/// # Errors
///
/// Propagates the coordination client's failure.
pub async fn discover(
    client: &dyn CoordinationClient,
    service: &str,
) -> Result<Vec<String>, CoordinationError> {
    let mut addrs: Vec<String> = client
        .list(&service_prefix(service))
        .await?
        .into_iter()
        .map(|(_, addr)| addr)
        .collect();
    addrs.sort();
    addrs.dedup();
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;
    use std::time::Duration;

    #[test]
    fn test_key_schema() {
        assert_eq!(service_prefix("task"), "service/task/");
        assert_eq!(
            service_key("task", "localhost:9090"),
            "service/task/localhost:9090"
        );
        assert!(service_key("task", "localhost:9090").starts_with(&service_prefix("task")));
    }

    #[tokio::test]
    async fn test_discover_ignores_other_services() {
        let store = MemoryCoordinator::new();
        let client = store.client();
        let lease = client.grant(Duration::from_secs(30)).await.unwrap();

        client
            .put(&service_key("task", "localhost:1"), "localhost:1", lease)
            .await
            .unwrap();
        client
            .put(&service_key("user", "localhost:2"), "localhost:2", lease)
            .await
            .unwrap();

        assert_eq!(discover(&client, "task").await.unwrap(), vec!["localhost:1"]);
    }
}
