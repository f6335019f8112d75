//! Recording in-memory backend for tests.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use anvil_model::{BackendKind, InstanceId, InstanceStatus, PortClaim, ServerInstance};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Backend, ProvisionRequest, StopSignal};
use crate::error::{Result, RuntimeError};
use crate::port_alloc::claims_from_bindings;
use crate::stats::RawStatsSample;
use crate::workload::{GameKind, LABEL_GAME};

#[derive(Default)]
struct FakeState {
    instances: BTreeMap<String, ServerInstance>,
    calls: Vec<String>,
    provisions: Vec<ProvisionRequest>,
    attach_unsupported: bool,
    proc_table_unsupported: bool,
    ignore_graceful: bool,
    ignore_term: bool,
    fail_remove: bool,
    fail_provisions: u32,
    fail_stats: bool,
    attach_response: String,
    logs: Vec<String>,
    stats: RawStatsSample,
    stats_samples: u32,
    java: Option<u32>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn seed_running(
        &self,
        name: &str,
        env: BTreeMap<String, String>,
    ) -> ServerInstance {
        let inst = ServerInstance {
            name: name.to_string(),
            id: InstanceId(format!("id-{name}")),
            backend: BackendKind::Container,
            status: InstanceStatus::Running,
            image: "fake:latest".to_string(),
            labels: BTreeMap::from([(LABEL_GAME.to_string(), "minecraft".to_string())]),
            env,
            ports: Vec::new(),
            mounts: Vec::new(),
            created_at_unix_ms: Some(0),
        };
        let mut s = self.state.lock().await;
        s.instances.insert(name.to_string(), inst.clone());
        inst
    }

    pub(crate) async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub(crate) async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    pub(crate) async fn provisions(&self) -> Vec<ProvisionRequest> {
        self.state.lock().await.provisions.clone()
    }

    pub(crate) async fn set_attach_supported(&self, v: bool) {
        self.state.lock().await.attach_unsupported = !v;
    }

    pub(crate) async fn set_proc_table_supported(&self, v: bool) {
        self.state.lock().await.proc_table_unsupported = !v;
    }

    /// Graceful stop commands are accepted but the workload keeps running.
    pub(crate) async fn set_ignore_graceful(&self, v: bool) {
        self.state.lock().await.ignore_graceful = v;
    }

    pub(crate) async fn set_ignore_term(&self, v: bool) {
        self.state.lock().await.ignore_term = v;
    }

    pub(crate) async fn set_fail_remove(&self, v: bool) {
        self.state.lock().await.fail_remove = v;
    }

    /// The next `n` provision calls fail without creating anything.
    pub(crate) async fn fail_next_provisions(&self, n: u32) {
        self.state.lock().await.fail_provisions = n;
    }

    pub(crate) async fn set_fail_stats(&self, v: bool) {
        self.state.lock().await.fail_stats = v;
    }

    pub(crate) async fn set_attach_response(&self, v: &str) {
        self.state.lock().await.attach_response = v.to_string();
    }

    pub(crate) async fn set_logs(&self, lines: &[&str]) {
        self.state.lock().await.logs = lines.iter().map(|s| s.to_string()).collect();
    }

    pub(crate) async fn set_stats(&self, sample: RawStatsSample) {
        self.state.lock().await.stats = sample;
    }

    pub(crate) async fn stats_samples(&self) -> u32 {
        self.state.lock().await.stats_samples
    }

    pub(crate) async fn set_java(&self, v: Option<u32>) {
        self.state.lock().await.java = v;
    }

    pub(crate) async fn vanish(&self, name: &str) {
        self.state.lock().await.instances.remove(name);
    }

    pub(crate) async fn status_of(&self, name: &str) -> Option<InstanceStatus> {
        self.state
            .lock()
            .await
            .instances
            .get(name)
            .map(|i| i.status)
    }
}

fn find_name(s: &FakeState, id: &str) -> Result<String> {
    if s.instances.contains_key(id) {
        return Ok(id.to_string());
    }
    s.instances
        .values()
        .find(|i| i.id.as_str() == id)
        .map(|i| i.name.clone())
        .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
}

#[async_trait]
impl Backend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn list(&self) -> Result<Vec<ServerInstance>> {
        Ok(self.state.lock().await.instances.values().cloned().collect())
    }

    async fn inspect(&self, id: &str) -> Result<ServerInstance> {
        let s = self.state.lock().await;
        let name = find_name(&s, id)?;
        s.instances
            .get(&name)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn provision(&self, req: &ProvisionRequest) -> Result<ServerInstance> {
        let mut s = self.state.lock().await;
        s.calls.push(format!("create {}", req.name));
        if s.fail_provisions > 0 {
            s.fail_provisions -= 1;
            return Err(RuntimeError::Internal(format!("create {} failed", req.name)));
        }
        if s.instances.contains_key(&req.name) {
            return Err(RuntimeError::invalid(
                "docker",
                format!("name {} already in use", req.name),
            ));
        }
        let n = s.provisions.len();
        s.provisions.push(req.clone());
        let inst = ServerInstance {
            name: req.name.clone(),
            id: InstanceId(format!("id-{}-{n}", req.name)),
            backend: BackendKind::Container,
            status: InstanceStatus::Stopped,
            image: req.image.clone(),
            labels: req.labels.clone(),
            env: req.env.clone(),
            ports: req.ports.clone(),
            mounts: Vec::new(),
            created_at_unix_ms: Some(0),
        };
        s.instances.insert(req.name.clone(), inst.clone());
        Ok(inst)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut s = self.state.lock().await;
        let name = find_name(&s, id)?;
        s.calls.push(format!("start {name}"));
        if let Some(i) = s.instances.get_mut(&name) {
            i.status = InstanceStatus::Running;
        }
        Ok(())
    }

    async fn signal(&self, id: &str, signal: StopSignal) -> Result<()> {
        let mut s = self.state.lock().await;
        let name = find_name(&s, id)?;
        let ignore = match signal {
            StopSignal::Term => {
                s.calls.push(format!("term {name}"));
                s.ignore_term
            }
            StopSignal::Kill => {
                s.calls.push(format!("kill {name}"));
                false
            }
        };
        if !ignore && let Some(i) = s.instances.get_mut(&name) {
            i.status = InstanceStatus::Stopped;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut s = self.state.lock().await;
        let name = find_name(&s, id)?;
        s.calls.push(format!("remove {name}"));
        if s.fail_remove {
            return Err(RuntimeError::BackendUnavailable("engine went away".to_string()));
        }
        s.instances.remove(&name);
        Ok(())
    }

    async fn claimed_ports(&self) -> Result<Vec<PortClaim>> {
        let s = self.state.lock().await;
        Ok(s.instances
            .values()
            .flat_map(|i| claims_from_bindings(&i.name, &i.ports))
            .collect())
    }

    async fn rcon_address(&self, _inst: &ServerInstance, port: u16) -> Option<SocketAddr> {
        Some(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    async fn attach_command(&self, id: &str, command: &str, _timeout: Duration) -> Result<String> {
        let mut s = self.state.lock().await;
        let name = find_name(&s, id)?;
        s.calls.push(format!("attach {name} {command}"));
        if s.attach_unsupported {
            return Err(RuntimeError::Unsupported("attach".to_string()));
        }
        let game = s
            .instances
            .get(&name)
            .map(GameKind::of_instance)
            .unwrap_or(GameKind::Minecraft);
        if command == game.graceful_stop_command()
            && !s.ignore_graceful
            && let Some(i) = s.instances.get_mut(&name)
        {
            i.status = InstanceStatus::Stopped;
        }
        Ok(s.attach_response.clone())
    }

    async fn proc_table_command(&self, id: &str, command: &str) -> Result<()> {
        let mut s = self.state.lock().await;
        let name = find_name(&s, id)?;
        s.calls.push(format!("proc {name} {command}"));
        if s.proc_table_unsupported {
            return Err(RuntimeError::Unsupported("process table".to_string()));
        }
        Ok(())
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>> {
        let s = self.state.lock().await;
        find_name(&s, id)?;
        let start = s.logs.len().saturating_sub(tail);
        Ok(s.logs[start..].to_vec())
    }

    async fn sample_stats(&self, id: &str) -> Result<RawStatsSample> {
        let mut s = self.state.lock().await;
        find_name(&s, id)?;
        s.stats_samples += 1;
        if s.fail_stats {
            return Err(RuntimeError::protocol("stats", "sample failed"));
        }
        Ok(s.stats.clone())
    }

    async fn detect_java(&self, _id: &str) -> Result<Option<u32>> {
        Ok(self.state.lock().await.java)
    }
}
