use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use runnerhub_types::{PoolPolicy, ResourceLimits};
use utils::config::ConfigExt;

use crate::dispatcher::DispatcherConfig;
use crate::storage::QueueConfig;
use crate::subsystems::ingress::IngressConfig;
use crate::subsystems::lifecycle::{
    CleanupConfig, CleanupPolicy, LifecycleConfig, SamplerConfig,
};
use crate::subsystems::pool::PoolManagerConfig;
use crate::subsystems::scaler::ScalerConfig;
use crate::subsystems::upstream::{ThrottleStrategy, UpstreamConfig};

/// The fully parsed and validated config struct used by the application,
/// built by the ConfigBuilder from (in order of preference) cli args,
/// environment variables, and the config file.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// The port to bind the server to
    pub port: u32,
    /// The host to bind the server to
    pub host: String,
    /// Log directives in tracing env-filter syntax
    pub log_level: Vec<String>,
    /// The directory for internal data (database, log archives)
    pub data: PathBuf,
    /// Worker threads of the shared tokio runtime
    pub runtime_threads: usize,
    /// Allowed CORS origins; wildcards supported
    pub cors_allowed_origins: Vec<String>,
    /// Optional bearer token protecting mutating endpoints
    pub bearer_token: Option<String>,
    /// Jaeger collector for trace export
    pub jaeger: Option<String>,
    /// OTLP metrics collector
    pub prometheus: Option<String>,

    /// Shortcut for `webhook.secret`, so the secret can come from
    /// RUNNERHUB_WEBHOOK_SECRET without a config file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    /// Shortcut for `upstream.token`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_token: Option<String>,

    pub dispatch: DispatchSection,
    pub queue: QueueSection,
    pub autoscaler: AutoscalerSection,
    pub cleanup: CleanupSection,
    pub sampler: SamplerSection,
    pub network: NetworkSection,
    pub upstream: UpstreamSection,
    pub webhook: WebhookSection,
    pub container: ContainerSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "localhost".to_string(),
            log_level: vec!["info".to_string()],
            data: PathBuf::from("/var/runnerhub"),
            runtime_threads: 4,
            cors_allowed_origins: Vec::new(),
            bearer_token: None,
            jaeger: None,
            prometheus: None,
            webhook_secret: None,
            upstream_token: None,
            dispatch: DispatchSection::default(),
            queue: QueueSection::default(),
            autoscaler: AutoscalerSection::default(),
            cleanup: CleanupSection::default(),
            sampler: SamplerSection::default(),
            network: NetworkSection::default(),
            upstream: UpstreamSection::default(),
            webhook: WebhookSection::default(),
            container: ContainerSection::default(),
        }
    }
}

impl ConfigExt for Config {
    fn log_levels(&self) -> &[String] {
        &self.log_level
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchSection {
    pub workers: usize,
    pub visibility_timeout_s: u64,
    pub poll_interval_ms: u64,
    pub snapshot_interval_s: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            workers: 4,
            visibility_timeout_s: 60,
            poll_interval_ms: 500,
            snapshot_interval_s: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSection {
    pub max_attempts: u32,
    pub backoff_base_s: u64,
    pub backoff_cap_s: u64,
    pub max_starvation_s: u64,
    pub schedule_tick_s: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_s: 2,
            backoff_cap_s: 300,
            max_starvation_s: 120,
            schedule_tick_s: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AutoscalerSection {
    pub tick_s: u64,
    pub predictive: bool,
    pub predictive_samples: usize,
    pub predictive_horizon_s: u64,
    pub predictive_confidence: f64,
    pub default_policy: PoolPolicy,
}

impl Default for AutoscalerSection {
    fn default() -> Self {
        Self {
            tick_s: 30,
            predictive: false,
            predictive_samples: 30,
            predictive_horizon_s: 1800,
            predictive_confidence: 0.7,
            default_policy: PoolPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CleanupSection {
    pub interval_s: u64,
    /// Which of idle/failed/orphaned/expired are active
    pub policies: Vec<String>,
    pub idle_ttl_s: u64,
    pub failed_age_s: u64,
    pub orphaned_age_s: u64,
    pub max_lifetime_s: u64,
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self {
            interval_s: 300,
            policies: vec![
                "idle".to_string(),
                "failed".to_string(),
                "orphaned".to_string(),
                "expired".to_string(),
            ],
            idle_ttl_s: 30 * 60,
            failed_age_s: 10 * 60,
            orphaned_age_s: 60 * 60,
            max_lifetime_s: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SamplerSection {
    pub interval_s: u64,
    pub high_cpu_pct: f64,
    pub high_mem_pct: f64,
    pub heartbeat_interval_s: u64,
}

impl Default for SamplerSection {
    fn default() -> Self {
        Self {
            interval_s: 30,
            high_cpu_pct: 90.0,
            high_mem_pct: 90.0,
            heartbeat_interval_s: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkSection {
    /// The /16 that per-repo /24s are carved from
    pub cidr: String,
    pub idle_ttl_s: u64,
    pub reaper_interval_s: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            cidr: "10.100.0.0/16".to_string(),
            idle_ttl_s: 60 * 60,
            reaper_interval_s: 300,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamSection {
    pub base_url: String,
    /// Usually left empty here and provided via environment
    pub token: String,
    pub strategy: ThrottleStrategy,
    pub max_rph: Option<u32>,
    pub max_retries: u32,
    pub request_timeout_s: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: String::new(),
            strategy: ThrottleStrategy::Adaptive,
            max_rph: None,
            max_retries: 3,
            request_timeout_s: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WebhookSection {
    /// Usually left empty here and provided via environment
    pub secret: String,
    pub dedup_ttl_s: u64,
    pub retry_cap: usize,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            secret: String::new(),
            dedup_ttl_s: 60,
            retry_cap: 50,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ContainerSection {
    pub image: String,
    pub cpu_limit: f64,
    pub mem_limit_mb: u64,
    pub pids_limit: u64,
    pub stop_grace_s: u64,
    pub runner_labels: Vec<String>,
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            image: "ghcr.io/runnerhub/runner:latest".to_string(),
            cpu_limit: 2.0,
            mem_limit_mb: 4096,
            pids_limit: 512,
            stop_grace_s: 30,
            runner_labels: vec!["self-hosted".to_string()],
        }
    }
}

impl Config {
    pub fn database_url(&self) -> String {
        format!("sqlite://{}", self.data.join("hub.db").display())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.dispatch.workers.max(1),
            visibility_timeout_s: self.dispatch.visibility_timeout_s,
            poll_interval_ms: self.dispatch.poll_interval_ms,
            snapshot_interval_s: self.dispatch.snapshot_interval_s,
            cleanup_interval_s: self.cleanup.interval_s,
            reaper_interval_s: self.network.reaper_interval_s,
            schedule_tick_s: self.queue.schedule_tick_s,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_attempts: self.queue.max_attempts,
            backoff_base_s: self.queue.backoff_base_s,
            backoff_cap_s: self.queue.backoff_cap_s,
            max_starvation_s: self.queue.max_starvation_s,
        }
    }

    pub fn scaler_config(&self) -> ScalerConfig {
        ScalerConfig {
            tick_s: self.autoscaler.tick_s,
            predictive: self.autoscaler.predictive,
            predictive_samples: self.autoscaler.predictive_samples,
            predictive_horizon_s: self.autoscaler.predictive_horizon_s,
            predictive_confidence: self.autoscaler.predictive_confidence,
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        let enabled: BTreeSet<CleanupPolicy> = self
            .cleanup
            .policies
            .iter()
            .filter_map(|name| match name.as_str() {
                "idle" => Some(CleanupPolicy::Idle),
                "failed" => Some(CleanupPolicy::Failed),
                "orphaned" => Some(CleanupPolicy::Orphaned),
                "expired" => Some(CleanupPolicy::Expired),
                other => {
                    tracing::warn!("Unknown cleanup policy `{}` ignored", other);
                    None
                }
            })
            .collect();

        LifecycleConfig {
            sampler: SamplerConfig {
                interval_s: self.sampler.interval_s,
                high_cpu_pct: self.sampler.high_cpu_pct,
                high_mem_pct: self.sampler.high_mem_pct,
                heartbeat_interval_s: self.sampler.heartbeat_interval_s,
            },
            cleanup: CleanupConfig {
                enabled,
                idle_ttl_s: self.cleanup.idle_ttl_s,
                failed_age_s: self.cleanup.failed_age_s,
                orphaned_age_s: self.cleanup.orphaned_age_s,
                max_lifetime_s: self.cleanup.max_lifetime_s,
            },
            archive_dir: self.data.join("log-archive"),
            default_stop_grace_s: self.container.stop_grace_s,
        }
    }

    pub fn network_cidr(&self) -> anyhow::Result<Ipv4Network> {
        Ok(self.network.cidr.parse()?)
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            base_url: self.upstream.base_url.clone(),
            token: self
                .upstream_token
                .clone()
                .unwrap_or_else(|| self.upstream.token.clone()),
            strategy: self.upstream.strategy,
            max_rph: self.upstream.max_rph,
            max_retries: self.upstream.max_retries,
            request_timeout_s: self.upstream.request_timeout_s,
        }
    }

    pub fn ingress_config(&self) -> IngressConfig {
        IngressConfig {
            secret: self
                .webhook_secret
                .clone()
                .unwrap_or_else(|| self.webhook.secret.clone()),
            dedup_ttl_s: self.webhook.dedup_ttl_s,
            retry_cap: self.webhook.retry_cap,
        }
    }

    pub fn pool_manager_config(&self) -> PoolManagerConfig {
        PoolManagerConfig {
            runner_image: self.container.image.clone(),
            default_policy: self.autoscaler.default_policy.clone(),
            default_limits: ResourceLimits {
                cpu_limit: self.container.cpu_limit,
                mem_limit_bytes: self.container.mem_limit_mb * 1024 * 1024,
                pids_limit: self.container.pids_limit,
            },
            default_runner_labels: self.container.runner_labels.iter().cloned().collect(),
            startup_poll_interval: std::time::Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.runtime_threads, 4);
        assert_eq!(config.autoscaler.tick_s, 30);
        assert_eq!(config.autoscaler.default_policy.cooldown_s, 300);
        assert_eq!(config.cleanup.interval_s, 300);
        assert_eq!(config.network.cidr, "10.100.0.0/16");
        assert_eq!(config.webhook.dedup_ttl_s, 60);
        assert!(config.network_cidr().is_ok());
    }

    #[test]
    fn secret_shortcuts_override_sections() {
        let config = Config {
            webhook_secret: Some("from-env".to_string()),
            ..Default::default()
        };
        assert_eq!(config.ingress_config().secret, "from-env");

        let config = Config::default();
        assert_eq!(config.ingress_config().secret, "");
    }

    #[test]
    fn unknown_cleanup_policies_are_dropped() {
        let config = Config {
            cleanup: CleanupSection {
                policies: vec!["idle".to_string(), "bogus".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let lifecycle = config.lifecycle_config();
        assert_eq!(lifecycle.cleanup.enabled.len(), 1);
    }

    #[test]
    fn toml_sections_deserialize() {
        let raw = r#"
            port = 9000
            log_level = ["info", "runnerhub=debug"]

            [autoscaler]
            tick_s = 15

            [autoscaler.default_policy]
            min_runners = 1
            max_runners = 20
            scale_increment = 5
            scale_decrement = 1
            queue_threshold = 3
            scale_up_threshold = 0.8
            scale_down_threshold = 0.2
            wait_threshold_s = 30
            cooldown_s = 120
            startup_timeout_s = 60
            dynamic_labels = true

            [network]
            cidr = "10.200.0.0/16"
        "#;
        let config: Config = toml_from_str(raw);
        assert_eq!(config.port, 9000);
        assert_eq!(config.autoscaler.tick_s, 15);
        assert_eq!(config.autoscaler.default_policy.max_runners, 20);
        assert_eq!(config.network.cidr, "10.200.0.0/16");
        // untouched sections keep their defaults
        assert_eq!(config.dispatch.workers, 4);
    }

    fn toml_from_str(raw: &str) -> Config {
        use figment::providers::Format;
        figment::Figment::new()
            .merge(figment::providers::Toml::string(raw))
            .join(figment::providers::Serialized::defaults(Config::default()))
            .extract()
            .unwrap()
    }
}
