//! Background loops that watch the fleet and publish `InstanceEvent`s. Each loop logs and keeps
//! going when an iteration fails, and exits within one interval of `MonitorHandle::shutdown`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anvil_model::{InstanceEvent, InstanceStatus, ServerInstance};
use tokio::{sync::watch, task::JoinHandle};

use crate::manager::RuntimeManager;

const LOG_POLL_TAIL: usize = 200;

pub struct MonitorHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for t in self.tasks {
            if let Err(e) = t.await {
                tracing::warn!(error = %e, "monitor task ended abnormally");
            }
        }
    }
}

pub fn spawn_monitors(manager: Arc<RuntimeManager>) -> MonitorHandle {
    let (stop, stop_rx) = watch::channel(false);
    let health_every = manager.config().health_interval;
    let logs_every = manager.config().log_monitor_interval;

    let health = tokio::spawn(run_loop(
        "health",
        health_every,
        stop_rx.clone(),
        HealthMonitor::new(manager.clone()),
    ));
    let logs = tokio::spawn(run_loop(
        "log-tail",
        logs_every,
        stop_rx,
        LogTailMonitor::new(manager),
    ));

    MonitorHandle {
        stop,
        tasks: vec![health, logs],
    }
}

trait Tick: Send {
    fn tick(&mut self) -> impl Future<Output = crate::error::Result<()>> + Send;
}

async fn run_loop(
    name: &'static str,
    every: Duration,
    mut stop: watch::Receiver<bool>,
    mut monitor: impl Tick,
) {
    tracing::info!(monitor = name, interval_ms = every.as_millis() as u64, "monitor started");
    loop {
        if *stop.borrow() {
            break;
        }
        if let Err(e) = monitor.tick().await {
            tracing::warn!(monitor = name, error = %e, "monitor iteration failed");
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(every) => {}
        }
    }
    tracing::info!(monitor = name, "monitor stopped");
}

/// Diffs instance states between polls and tracks player counts of running instances.
struct HealthMonitor {
    manager: Arc<RuntimeManager>,
    seen: Option<HashMap<String, InstanceStatus>>,
    players: HashMap<String, u32>,
}

impl HealthMonitor {
    fn new(manager: Arc<RuntimeManager>) -> Self {
        Self {
            manager,
            seen: None,
            players: HashMap::new(),
        }
    }

    async fn track_players(&mut self, inst: &ServerInstance) {
        let info = self.manager.observe_players(inst).await;
        let before = self.players.insert(inst.name.clone(), info.online);
        if before != Some(info.online) {
            self.manager.emit(InstanceEvent::PlayersChanged {
                name: inst.name.clone(),
                online: info.online,
            });
        }
    }
}

impl Tick for HealthMonitor {
    async fn tick(&mut self) -> crate::error::Result<()> {
        let instances = self.manager.backend().list().await?;
        let current: HashMap<String, InstanceStatus> = instances
            .iter()
            .map(|i| (i.name.clone(), i.status))
            .collect();

        // First pass only records a baseline.
        if let Some(previous) = &self.seen {
            for (name, status) in &current {
                let before = previous.get(name).copied();
                if before != Some(*status) {
                    tracing::info!(instance = %name, from = ?before, to = ?status, "status changed");
                    self.manager.emit(InstanceEvent::StatusChanged {
                        name: name.clone(),
                        from: before,
                        to: *status,
                    });
                }
            }
            for (name, status) in previous {
                if !current.contains_key(name) {
                    tracing::warn!(instance = %name, "instance vanished");
                    self.manager.emit(InstanceEvent::StatusChanged {
                        name: name.clone(),
                        from: Some(*status),
                        to: InstanceStatus::NotFound,
                    });
                }
            }
        }

        for inst in instances.iter().filter(|i| i.status.is_running()) {
            self.track_players(inst).await;
        }
        self.players
            .retain(|name, _| current.get(name).is_some_and(|s| s.is_running()));
        self.seen = Some(current);
        Ok(())
    }
}

/// Lines in `cur` that follow the longest suffix of `prev` it starts with.
fn new_lines<'a>(prev: &[String], cur: &'a [String]) -> &'a [String] {
    let max = prev.len().min(cur.len());
    for k in (1..=max).rev() {
        if prev[prev.len() - k..] == cur[..k] {
            return &cur[k..];
        }
    }
    cur
}

/// Polls console output of running instances and republishes new lines.
struct LogTailMonitor {
    manager: Arc<RuntimeManager>,
    last: HashMap<String, Vec<String>>,
}

impl LogTailMonitor {
    fn new(manager: Arc<RuntimeManager>) -> Self {
        Self {
            manager,
            last: HashMap::new(),
        }
    }
}

impl Tick for LogTailMonitor {
    async fn tick(&mut self) -> crate::error::Result<()> {
        let backend = self.manager.backend().clone();
        let instances = backend.list().await?;
        let mut live = HashMap::new();

        for inst in instances.iter().filter(|i| i.status.is_running()) {
            let lines = match backend.logs(inst.id.as_str(), LOG_POLL_TAIL).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::debug!(instance = %inst.name, error = %e, "log poll failed");
                    continue;
                }
            };
            if let Some(prev) = self.last.get(&inst.name) {
                for line in new_lines(prev, &lines) {
                    self.manager.emit(InstanceEvent::LogLine {
                        name: inst.name.clone(),
                        line: line.clone(),
                    });
                }
            }
            live.insert(inst.name.clone(), lines);
        }

        self.last = live;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::backend::fake::FakeBackend;
    use crate::config::AgentConfig;
    use crate::layout::test_support::temp_dir_for;
    use anvil_model::ServerSpec;

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn only_unseen_lines_are_new() {
        let prev = lines(&["a", "b", "c"]);
        assert_eq!(new_lines(&prev, &lines(&["b", "c", "d", "e"])), lines(&["d", "e"]).as_slice());
        assert!(new_lines(&prev, &prev).is_empty());
        assert_eq!(new_lines(&prev, &lines(&["x", "y"])), lines(&["x", "y"]).as_slice());
        assert_eq!(new_lines(&[], &lines(&["x"])), lines(&["x"]).as_slice());
    }

    fn manager(test: &str) -> (Arc<RuntimeManager>, FakeBackend, std::path::PathBuf) {
        let root = temp_dir_for(test);
        let cfg = AgentConfig {
            data_root: root.clone(),
            health_interval: Duration::from_millis(20),
            log_monitor_interval: Duration::from_millis(20),
            query_timeout: Duration::from_millis(100),
            ..AgentConfig::default()
        };
        let fake = FakeBackend::new();
        let mgr = Arc::new(RuntimeManager::new(cfg, Arc::new(fake.clone())));
        (mgr, fake, root)
    }

    async fn wait_for(
        rx: &mut tokio::sync::broadcast::Receiver<InstanceEvent>,
        pred: impl Fn(&InstanceEvent) -> bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(ev)) if pred(&ev) => return true,
                Ok(Ok(_)) | Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {}
                _ => return false,
            }
        }
    }

    #[tokio::test]
    async fn health_monitor_reports_external_transitions() {
        let (mgr, fake, root) = manager("monitor-health");
        let mut spec = ServerSpec::new("alpha");
        spec.preferred_host_port = Some(43010);
        spec.auto_start = false;
        mgr.create(spec).await.unwrap();

        let mut rx = mgr.subscribe();
        let handle = spawn_monitors(mgr.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;

        fake.start("alpha").await.unwrap();
        assert!(
            wait_for(&mut rx, |e| matches!(
                e,
                InstanceEvent::StatusChanged {
                    name,
                    from: Some(InstanceStatus::Stopped),
                    to: InstanceStatus::Running,
                } if name == "alpha"
            ))
            .await
        );

        fake.vanish("alpha").await;
        assert!(
            wait_for(&mut rx, |e| matches!(
                e,
                InstanceEvent::StatusChanged {
                    to: InstanceStatus::NotFound,
                    ..
                }
            ))
            .await
        );

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap();
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn log_monitor_republishes_new_lines() {
        let (mgr, fake, root) = manager("monitor-logs");
        let mut spec = ServerSpec::new("alpha");
        spec.preferred_host_port = Some(43020);
        mgr.create(spec).await.unwrap();
        fake.set_logs(&["booting"]).await;

        let mut rx = mgr.subscribe();
        let handle = spawn_monitors(mgr.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;

        fake.set_logs(&["booting", "Done (3.2s)!"]).await;
        assert!(
            wait_for(&mut rx, |e| matches!(
                e,
                InstanceEvent::LogLine { line, .. } if line == "Done (3.2s)!"
            ))
            .await
        );

        handle.shutdown().await;
        std::fs::remove_dir_all(root).ok();
    }
}
