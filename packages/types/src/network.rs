use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::Repository;

/// Name prefix shared by every isolation network the hub creates.
pub const NETWORK_PREFIX: &str = "runnerhub-net";

/// A per-repository internal bridge network.
///
/// At most one active network exists per repository, and active subnets never
/// overlap.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct Network {
    /// Runtime-side network id
    pub id: String,
    pub name: String,
    pub repository: Repository,
    /// A /24 carved out of the configured /16
    #[schema(value_type = String)]
    pub subnet: Ipv4Network,
    #[schema(value_type = String)]
    pub gateway: std::net::Ipv4Addr,
    /// Always true; isolation networks have no external routing
    pub internal: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl Network {
    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }

    /// `runnerhub-net-<normalized repo>`
    pub fn name_for(repository: &Repository) -> String {
        format!("{}-{}", NETWORK_PREFIX, repository.normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_naming() {
        let repo = Repository::new("Org/Repo.One").unwrap();
        assert_eq!(Network::name_for(&repo), "runnerhub-net-org-repo-one");
    }
}
