use chrono::{Duration, Utc};
use runnerhub_types::{ContainerState, MonitorEvent};

use super::LifecycleManager;

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub interval_s: u64,
    /// Percent CPU that counts as a strike
    pub high_cpu_pct: f64,
    /// Percent memory that counts as a strike
    pub high_mem_pct: f64,
    /// Heartbeat interval the health loop measures against
    pub heartbeat_interval_s: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_s: 30,
            high_cpu_pct: 90.0,
            high_mem_pct: 90.0,
            heartbeat_interval_s: 30,
        }
    }
}

impl LifecycleManager {
    /// One resource-sampling pass over all RUNNING containers. An alert fires
    /// only after two consecutive over-threshold samples.
    pub async fn run_sampler(&self) {
        let config = self.config.sampler;
        let records = match self.store.list_containers(Some(ContainerState::Running), None).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!("Sampler could not list containers: {}", err);
                return;
            }
        };

        for record in records {
            let sample = match self.stats(&record.id).await {
                Ok(sample) => sample,
                Err(err) => {
                    tracing::debug!("Sampler skipped {}: {}", record.id, err);
                    continue;
                }
            };

            let mut entry = self.strikes.entry(record.id.clone()).or_insert((0, 0));
            let (cpu_strikes, mem_strikes) = *entry;

            let cpu_strikes = if sample.cpu_pct >= config.high_cpu_pct {
                cpu_strikes.saturating_add(1)
            } else {
                0
            };
            let mem_strikes = if sample.mem_pct >= config.high_mem_pct {
                mem_strikes.saturating_add(1)
            } else {
                0
            };
            *entry = (cpu_strikes, mem_strikes);
            drop(entry);

            if cpu_strikes == 2 {
                tracing::warn!(
                    "High CPU: container={}, cpu_pct={:.1}",
                    record.id,
                    sample.cpu_pct
                );
                self.bus.publish(MonitorEvent::ContainerHighCpu {
                    container_id: record.id.clone(),
                    cpu_pct: sample.cpu_pct,
                });
            }
            if mem_strikes == 2 {
                tracing::warn!(
                    "High memory: container={}, mem_pct={:.1}",
                    record.id,
                    sample.mem_pct
                );
                self.bus.publish(MonitorEvent::ContainerHighMem {
                    container_id: record.id.clone(),
                    mem_pct: sample.mem_pct,
                });
            }
        }
    }

    /// One health pass: a RUNNING container whose last sample is older than
    /// `2 * heartbeat_interval + 10s` is marked unhealthy; a container the
    /// runtime reports as exited is moved to ERROR with its exit code.
    pub async fn run_health_check(&self) {
        let config = self.config.sampler;
        let grace = Duration::seconds(2 * config.heartbeat_interval_s as i64 + 10);
        let now = Utc::now();

        let records = match self.store.list_containers(Some(ContainerState::Running), None).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!("Health loop could not list containers: {}", err);
                return;
            }
        };

        for record in records {
            match self.runtime.inspect(&record.id).await {
                Ok(info) if info.running => {
                    if !record.healthy {
                        let _ = self.store.set_container_health(&record.id, true).await;
                    }
                }
                Ok(info) => {
                    tracing::warn!(
                        "Container exited outside lifecycle control: id={}, exit={:?}",
                        record.id,
                        info.exit_code
                    );
                    if let Err(err) = self.mark_exited(&record.id, info.exit_code).await {
                        tracing::warn!("Could not record exit of {}: {}", record.id, err);
                    }
                }
                Err(err) => {
                    let last_seen = record.last_sampled_at.unwrap_or(record.created_at);
                    if now - last_seen > grace && record.healthy {
                        tracing::warn!(
                            "Marking container unhealthy: id={}, last_seen={}, err={}",
                            record.id,
                            last_seen,
                            err
                        );
                        let _ = self.store.set_container_health(&record.id, false).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RawStats;
    use crate::test_utils::lifecycle::{sample_spec, test_manager};
    use runnerhub_types::ContainerState;

    fn hot_stats(cpu_total_ns: u64) -> RawStats {
        RawStats {
            cpu_total_ns,
            system_cpu_ns: cpu_total_ns, // 100% of one cpu
            online_cpus: 1,
            mem_usage_bytes: 10,
            mem_limit_bytes: 1024,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn high_cpu_needs_two_consecutive_strikes() {
        let (manager, runtime, _dir) = test_manager().await;
        let record = manager.create(&sample_spec("org/repo1")).await.unwrap();
        manager.start(&record.id).await.unwrap();

        let bus = manager.bus.clone();
        let alerts = bus.subscribe(&["container.high_cpu"], None);

        // baseline, then two consecutive 100%-cpu diffs
        runtime.set_stats(&record.id, hot_stats(0)).await;
        manager.run_sampler().await;
        runtime.set_stats(&record.id, hot_stats(1_000_000)).await;
        manager.run_sampler().await;
        assert!(alerts.try_recv().is_none(), "one strike must not alert");

        runtime.set_stats(&record.id, hot_stats(2_000_000)).await;
        manager.run_sampler().await;
        assert!(alerts.try_recv().is_some(), "second strike alerts");
    }

    #[tokio::test]
    async fn externally_exited_container_is_recorded_stopped() {
        let (manager, runtime, _dir) = test_manager().await;
        let record = manager.create(&sample_spec("org/repo1")).await.unwrap();
        manager.start(&record.id).await.unwrap();

        runtime.kill_externally(&record.id, 137).await;
        manager.run_health_check().await;

        // the observed exit goes through the regular stop states, so a later
        // removal is preceded by STOPPED as required
        let loaded = manager.store().get_container(&record.id).await.unwrap();
        assert_eq!(loaded.state, ContainerState::Stopped);
        assert_eq!(loaded.exit_code, Some(137));
        assert!(!loaded.healthy);

        manager.remove(&record.id, false).await.unwrap();
        assert!(manager.store().get_container(&record.id).await.is_err());
    }
}
