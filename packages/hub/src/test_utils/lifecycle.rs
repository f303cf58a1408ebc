use std::collections::BTreeMap;
use std::sync::Arc;

use runnerhub_types::{ContainerSpec, Repository, ResourceLimits};
use utils::telemetry::LifecycleMetrics;

use crate::subsystems::lifecycle::{
    CleanupConfig, LifecycleConfig, LifecycleManager, SamplerConfig,
};
use crate::subsystems::monitor::MonitorBus;
use crate::subsystems::network::NetworkIsolator;
use crate::test_utils::runtime::MockRuntime;
use crate::test_utils::store::temp_store;

pub fn sample_spec(repo: &str) -> ContainerSpec {
    let repository = Repository::new(repo).unwrap();
    ContainerSpec {
        name: format!("test-{}", repository.normalized()),
        image: "runner:test".to_string(),
        env: BTreeMap::new(),
        labels: [
            ("runnerhub.managed".to_string(), "true".to_string()),
            ("runnerhub.repository".to_string(), repository.to_string()),
        ]
        .into(),
        resources: ResourceLimits::default(),
        read_only_root: false,
        repository,
        job_id: None,
        runner_id: None,
    }
}

pub async fn test_manager() -> (Arc<LifecycleManager>, Arc<MockRuntime>, tempfile::TempDir) {
    test_manager_with_cleanup(CleanupConfig::default()).await
}

pub async fn test_manager_with_cleanup(
    cleanup: CleanupConfig,
) -> (Arc<LifecycleManager>, Arc<MockRuntime>, tempfile::TempDir) {
    let (store, dir) = temp_store().await;
    let runtime = Arc::new(MockRuntime::new());
    let bus = Arc::new(MonitorBus::new());
    let network = Arc::new(
        NetworkIsolator::new(
            runtime.clone(),
            store.clone(),
            bus.clone(),
            "10.100.0.0/16".parse().unwrap(),
            3600,
        )
        .unwrap(),
    );

    let meter = opentelemetry::global::meter("lifecycle-tests");
    let manager = LifecycleManager::new(
        runtime.clone(),
        store,
        network,
        bus,
        LifecycleMetrics::init(&meter),
        LifecycleConfig {
            sampler: SamplerConfig::default(),
            cleanup,
            archive_dir: dir.path().join("archive"),
            default_stop_grace_s: 10,
        },
    );
    (Arc::new(manager), runtime, dir)
}
