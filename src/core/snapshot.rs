//! The service configuration snapshot and its change facets.

use crate::core::Validate;
use crate::error::ValidationError;
use crate::server::ListenAddr;
use serde::Deserialize;
use std::fmt;

/// Which part of a snapshot changed between two reloads.
///
/// Observers receive one notification per changed facet and ignore the kinds
/// they do not care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// The server listen address.
    Server,
    /// The storage connection descriptor.
    Storage,
    /// The coordination store address.
    Coordination,
    /// Secret material (token signing keys).
    Secret,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "server",
            Self::Storage => "storage",
            Self::Coordination => "coordination",
            Self::Secret => "secret",
        })
    }
}

/// Snapshot types that can report which facets differ from a successor.
pub trait Facets {
    /// Facets that differ between `self` and `next`, in dispatch order.
    /// Empty when nothing an observer could care about changed.
    fn changes(&self, next: &Self) -> Vec<ChangeKind>;
}

/// Configuration of one service process.
///
/// ```yaml
/// server:
///   addr: ":9090"
/// storage:
///   dsn: "mysql://todo@localhost/todolist"
/// coordination:
///   addr: "127.0.0.1:2379"
/// secret:
///   jwt_key: "..."
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceConfig {
    /// Listening socket settings.
    pub server: ServerSection,
    /// Persistence settings. Not interpreted here.
    #[serde(default)]
    pub storage: StorageSection,
    /// Where the coordination store lives.
    pub coordination: CoordinationSection,
    /// Secret material. Not interpreted here.
    #[serde(default)]
    pub secret: SecretSection,
}

/// `server` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSection {
    /// Listen address, e.g. `:9090` or `127.0.0.1:9090`.
    pub addr: String,
}

/// `storage` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StorageSection {
    /// Connection descriptor handed to the persistence layer.
    #[serde(default)]
    pub dsn: String,
}

/// `coordination` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoordinationSection {
    /// Coordination store endpoint.
    pub addr: String,
}

/// `secret` section.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SecretSection {
    /// Token signing key.
    #[serde(default)]
    pub jwt_key: String,
}

impl fmt::Debug for SecretSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretSection")
            .field("jwt_key", &"<redacted>")
            .finish()
    }
}

impl ServiceConfig {
    /// A snapshot with only the required fields set.
    pub fn new(server_addr: impl Into<String>, coordination_addr: impl Into<String>) -> Self {
        Self {
            server: ServerSection {
                addr: server_addr.into(),
            },
            storage: StorageSection::default(),
            coordination: CoordinationSection {
                addr: coordination_addr.into(),
            },
            secret: SecretSection::default(),
        }
    }

    /// Copy of this snapshot with a different server address.
    pub fn with_server_addr(&self, addr: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.server.addr = addr.into();
        next
    }
}

impl Facets for ServiceConfig {
    fn changes(&self, next: &Self) -> Vec<ChangeKind> {
        let mut kinds = Vec::new();
        // Address spellings that bind the same socket are not a change.
        let same_addr = match (
            ListenAddr::parse(&self.server.addr),
            ListenAddr::parse(&next.server.addr),
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => self.server.addr == next.server.addr,
        };
        if !same_addr {
            kinds.push(ChangeKind::Server);
        }
        if self.storage != next.storage {
            kinds.push(ChangeKind::Storage);
        }
        if self.coordination != next.coordination {
            kinds.push(ChangeKind::Coordination);
        }
        if self.secret != next.secret {
            kinds.push(ChangeKind::Secret);
        }
        kinds
    }
}

impl Validate for ServiceConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = Vec::new();
        if let Err(e) = ListenAddr::parse(&self.server.addr) {
            errors.push(ValidationError::invalid_field("server.addr", e.to_string()));
        }
        if self.coordination.addr.trim().is_empty() {
            errors.push(ValidationError::invalid_field(
                "coordination.addr",
                "must not be empty",
            ));
        }
        match ValidationError::from_list(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServiceConfig {
        ServiceConfig::new(":9090", "127.0.0.1:2379")
    }

    #[test]
    fn test_identical_snapshots_have_no_changes() {
        assert!(base().changes(&base()).is_empty());
    }

    #[test]
    fn test_equivalent_address_spelling_is_not_a_change() {
        let next = base().with_server_addr("0.0.0.0:9090");
        assert!(base().changes(&next).is_empty());
    }

    #[test]
    fn test_changes_follow_dispatch_order() {
        let mut next = base().with_server_addr(":9091");
        next.secret.jwt_key = "rotated".into();
        next.storage.dsn = "mysql://other".into();

        assert_eq!(
            base().changes(&next),
            vec![ChangeKind::Server, ChangeKind::Storage, ChangeKind::Secret]
        );
    }

    #[test]
    fn test_validation() {
        assert!(base().validate().is_ok());

        let mut bad = base().with_server_addr("not an address");
        bad.coordination.addr = " ".into();
        let err = bad.validate().unwrap_err();
        assert!(matches!(err, ValidationError::Multiple(ref v) if v.len() == 2));
    }

    #[test]
    fn test_secret_is_redacted() {
        let mut cfg = base();
        cfg.secret.jwt_key = "hunter2".into();
        assert!(!format!("{:?}", cfg).contains("hunter2"));
    }
}
