use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

use runnerhub_types::{
    Classify, ContainerId, ErrorCode, MonitorEvent, Network, Repository, NETWORK_PREFIX,
};
use utils::lock::KeyedMutex;

use crate::runtime::{ContainerRuntime, NetworkSpec, RuntimeError};
use crate::storage::{Store, StoreError};
use crate::subsystems::monitor::MonitorBus;

const CACHE_TTL_S: i64 = 600;
/// Name of the runtime's default network that containers are detached from
/// before joining their isolation network.
const DEFAULT_NETWORK: &str = "bridge";

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("all {0} subnets in the allocation range are in use")]
    SubnetExhausted(u32),

    #[error("network unavailable for {repository}: {reason}")]
    NetworkUnavailable {
        repository: Repository,
        reason: String,
    },

    #[error("allocation range must be a /16, got {0}")]
    InvalidRange(Ipv4Network),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl Classify for NetworkError {
    fn code(&self) -> ErrorCode {
        match self {
            NetworkError::SubnetExhausted(_) => ErrorCode::Unrecoverable,
            NetworkError::NetworkUnavailable { .. } => ErrorCode::Unavailable,
            NetworkError::InvalidRange(_) => ErrorCode::Validation,
            NetworkError::Store(e) => e.code(),
            NetworkError::Runtime(e) => e.code(),
        }
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Clone)]
struct CachedNetwork {
    network: Network,
    cached_at: DateTime<Utc>,
}

/// Owns per-repository isolation networks: one internal /24 bridge per repo,
/// carved out of a configured /16. Only this component creates or removes
/// networks.
pub struct NetworkIsolator {
    runtime: Arc<dyn ContainerRuntime>,
    store: Store,
    bus: Arc<MonitorBus>,
    range: Ipv4Network,
    idle_ttl: Duration,
    cache: DashMap<Repository, CachedNetwork>,
    locks: KeyedMutex<Repository>,
}

impl NetworkIsolator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Store,
        bus: Arc<MonitorBus>,
        range: Ipv4Network,
        idle_ttl_s: u64,
    ) -> NetworkResult<Self> {
        if range.prefix() != 16 {
            return Err(NetworkError::InvalidRange(range));
        }
        Ok(Self {
            runtime,
            store,
            bus,
            range,
            idle_ttl: Duration::seconds(idle_ttl_s as i64),
            cache: DashMap::new(),
            locks: KeyedMutex::new(),
        })
    }

    /// Idempotent: returns the repo's existing network or creates one with
    /// the first free /24.
    #[instrument(level = "debug", skip(self), fields(subsys = "NetworkIsolator"))]
    pub async fn get_or_create(&self, repository: &Repository) -> NetworkResult<Network> {
        if let Some(cached) = self.cache.get(repository) {
            if Utc::now() - cached.cached_at < Duration::seconds(CACHE_TTL_S) {
                return Ok(cached.network.clone());
            }
        }

        let _guard = self.locks.lock(repository.clone()).await;

        if let Some(network) = self.store.active_network_for_repo(repository).await? {
            self.cache_insert(repository, &network);
            return Ok(network);
        }

        let active = self.store.active_networks().await?;
        let used: BTreeSet<u8> = active
            .iter()
            .filter(|n| self.range.contains(n.subnet.network()))
            .map(|n| n.subnet.network().octets()[2])
            .collect();
        let octet = (1..=254u8)
            .find(|octet| !used.contains(octet))
            .ok_or(NetworkError::SubnetExhausted(254))?;

        let base = self.range.network().octets();
        let subnet = Ipv4Network::new(Ipv4Addr::new(base[0], base[1], octet, 0), 24)
            .expect("/24 inside a /16 is always valid");
        let gateway = Ipv4Addr::new(base[0], base[1], octet, 1);

        let name = Network::name_for(repository);
        let spec = NetworkSpec {
            name: name.clone(),
            subnet: subnet.to_string(),
            gateway: gateway.to_string(),
            internal: true,
            labels: [
                ("runnerhub.managed".to_string(), "true".to_string()),
                ("runnerhub.repository".to_string(), repository.to_string()),
            ]
            .into(),
        };
        let runtime_id =
            self.runtime
                .create_network(&spec)
                .await
                .map_err(|e| NetworkError::NetworkUnavailable {
                    repository: repository.clone(),
                    reason: e.to_string(),
                })?;

        let now = Utc::now();
        let network = Network {
            id: runtime_id,
            name,
            repository: repository.clone(),
            subnet,
            gateway,
            internal: true,
            created_at: now,
            last_used: now,
            removed_at: None,
        };
        self.store.insert_network(&network).await?;

        tracing::info!(
            "Created isolation network: repo={}, name={}, subnet={}",
            repository,
            network.name,
            network.subnet
        );
        self.bus.publish(MonitorEvent::NetworkCreated {
            repository: repository.clone(),
            name: network.name.clone(),
        });
        self.cache_insert(repository, &network);
        Ok(network)
    }

    /// Detach from the runtime default network, then connect to the repo
    /// network.
    #[instrument(level = "debug", skip(self), fields(subsys = "NetworkIsolator"))]
    pub async fn attach(
        &self,
        container: &ContainerId,
        repository: &Repository,
    ) -> NetworkResult<Network> {
        let network = self.get_or_create(repository).await?;

        // tolerate a container that was never on the default network
        if let Err(err) = self
            .runtime
            .disconnect_network(DEFAULT_NETWORK, container, true)
            .await
        {
            tracing::debug!(
                "Default-network detach skipped for {}: {}",
                container,
                err
            );
        }

        self.runtime
            .connect_network(&network.name, container)
            .await
            .map_err(|e| NetworkError::NetworkUnavailable {
                repository: repository.clone(),
                reason: e.to_string(),
            })?;

        self.store
            .set_container_network(container, Some(&network.id))
            .await?;
        self.store.touch_network(&network.id, Utc::now()).await?;
        Ok(network)
    }

    /// Tolerant of already-detached containers.
    #[instrument(level = "debug", skip(self), fields(subsys = "NetworkIsolator"))]
    pub async fn detach(
        &self,
        container: &ContainerId,
        repository: &Repository,
    ) -> NetworkResult<()> {
        let Some(network) = self.store.active_network_for_repo(repository).await? else {
            return Ok(());
        };

        match self
            .runtime
            .disconnect_network(&network.name, container, true)
            .await
        {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        self.store.set_container_network(container, None).await?;
        Ok(())
    }

    /// Remove idle networks: past the idle TTL and with no attached
    /// containers. Returns the number removed.
    #[instrument(level = "debug", skip(self), fields(subsys = "NetworkIsolator"))]
    pub async fn reap(&self) -> NetworkResult<u32> {
        let now = Utc::now();
        let mut removed = 0u32;

        for network in self.store.active_networks().await? {
            if now - network.last_used < self.idle_ttl {
                continue;
            }
            let attached = match self.runtime.network_containers(&network.name).await {
                Ok(containers) => containers,
                Err(RuntimeError::NotFound(_)) => Vec::new(),
                Err(err) => {
                    tracing::warn!("Reaper could not inspect {}: {}", network.name, err);
                    continue;
                }
            };
            if !attached.is_empty() {
                continue;
            }

            match self.runtime.remove_network(&network.name).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(err) => {
                    tracing::warn!("Reaper could not remove {}: {}", network.name, err);
                    continue;
                }
            }
            self.store.mark_network_removed(&network.id, now).await?;
            self.cache.remove(&network.repository);
            self.bus.publish(MonitorEvent::NetworkRemoved {
                name: network.name.clone(),
            });
            tracing::info!("Reaped idle network: {}", network.name);
            removed += 1;
        }
        Ok(removed)
    }

    /// True when the container is attached only to hub-managed networks.
    pub async fn verify(&self, container: &ContainerId) -> NetworkResult<bool> {
        let info = self.runtime.inspect(container).await?;
        Ok(!info.networks.is_empty()
            && info
                .networks
                .iter()
                .all(|name| name.starts_with(NETWORK_PREFIX)))
    }

    fn cache_insert(&self, repository: &Repository, network: &Network) {
        self.cache.insert(
            repository.clone(),
            CachedNetwork {
                network: network.clone(),
                cached_at: Utc::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::runtime::MockRuntime;
    use crate::test_utils::store::temp_store;

    async fn isolator(
        idle_ttl_s: u64,
    ) -> (Arc<NetworkIsolator>, Arc<MockRuntime>, Store, tempfile::TempDir) {
        let (store, dir) = temp_store().await;
        let runtime = Arc::new(MockRuntime::new());
        let bus = Arc::new(MonitorBus::new());
        let isolator = NetworkIsolator::new(
            runtime.clone(),
            store.clone(),
            bus,
            "10.100.0.0/16".parse().unwrap(),
            idle_ttl_s,
        )
        .unwrap();
        (Arc::new(isolator), runtime, store, dir)
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let (isolator, _runtime, _store, _dir) = isolator(3600).await;
        let repo = Repository::new("org/a").unwrap();

        let first = isolator.get_or_create(&repo).await.unwrap();
        let second = isolator.get_or_create(&repo).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.name, "runnerhub-net-org-a");
        assert!(first.internal);
    }

    #[tokio::test]
    async fn distinct_repos_get_distinct_subnets() {
        let (isolator, _runtime, _store, _dir) = isolator(3600).await;

        let a = isolator
            .get_or_create(&Repository::new("org/a").unwrap())
            .await
            .unwrap();
        let b = isolator
            .get_or_create(&Repository::new("org/b").unwrap())
            .await
            .unwrap();

        assert_ne!(a.subnet, b.subnet);
        assert_ne!(a.subnet.network().octets()[2], b.subnet.network().octets()[2]);
    }

    #[tokio::test]
    async fn rejects_non_slash_16_range() {
        let (store, _dir) = temp_store().await;
        let err = NetworkIsolator::new(
            Arc::new(MockRuntime::new()),
            store,
            Arc::new(MonitorBus::new()),
            "10.100.0.0/24".parse().unwrap(),
            60,
        )
        .err()
        .unwrap();
        assert!(matches!(err, NetworkError::InvalidRange(_)));
    }

    #[tokio::test]
    async fn subnet_exhaustion_after_254() {
        let (isolator, _runtime, _store, _dir) = isolator(3600).await;

        for i in 0..254 {
            let repo = Repository::new(format!("org/repo{i}")).unwrap();
            isolator.get_or_create(&repo).await.unwrap();
        }

        let err = isolator
            .get_or_create(&Repository::new("org/overflow").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::SubnetExhausted(254)));
    }

    #[tokio::test]
    async fn attach_detach_round_trip() {
        let (isolator, runtime, _store, _dir) = isolator(3600).await;
        let repo = Repository::new("org/a").unwrap();
        let container = runtime.seed_container("c1").await;

        let network = isolator.attach(&container, &repo).await.unwrap();
        assert!(isolator.verify(&container).await.unwrap());
        assert_eq!(
            runtime.network_containers(&network.name).await.unwrap(),
            vec![container.to_string()]
        );

        isolator.detach(&container, &repo).await.unwrap();
        assert!(runtime
            .network_containers(&network.name)
            .await
            .unwrap()
            .is_empty());
        // detach again is a no-op
        isolator.detach(&container, &repo).await.unwrap();
    }

    #[tokio::test]
    async fn reap_removes_only_idle_and_empty() {
        let (isolator, runtime, store, _dir) = isolator(0).await;
        let busy_repo = Repository::new("org/busy").unwrap();
        let idle_repo = Repository::new("org/idle").unwrap();

        let container = runtime.seed_container("c1").await;
        isolator.attach(&container, &busy_repo).await.unwrap();
        let idle_net = isolator.get_or_create(&idle_repo).await.unwrap();

        // make both appear idle by TTL, but busy still has a container
        store
            .touch_network(&idle_net.id, Utc::now() - Duration::hours(2))
            .await
            .unwrap();
        let busy_net = store
            .active_network_for_repo(&busy_repo)
            .await
            .unwrap()
            .unwrap();
        store
            .touch_network(&busy_net.id, Utc::now() - Duration::hours(2))
            .await
            .unwrap();

        let removed = isolator.reap().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .active_network_for_repo(&idle_repo)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .active_network_for_repo(&busy_repo)
            .await
            .unwrap()
            .is_some());
    }
}
