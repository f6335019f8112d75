//! Execution backends. Both implement [`Backend`]; the manager picks one at startup and never
//! branches on which one it holds.

use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anvil_model::{BackendKind, PortBinding, PortClaim, ServerInstance};
use async_trait::async_trait;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::metadata::ResourceQuota;
use crate::stats::RawStatsSample;
use crate::workload::GameKind;

pub mod container;
pub mod process;
pub(crate) mod procfs;

#[cfg(test)]
pub(crate) mod fake;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Term,
    Kill,
}

/// Everything a backend needs to materialise a workload. Host ports are already allocated.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub name: String,
    pub kind: GameKind,
    pub image: String,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub quota: ResourceQuota,
    pub instance_dir: PathBuf,
    pub java_major: Option<u32>,
    pub custom_args: Option<String>,
}

/// Primitive operations of one execution backend. Identifiers accept either the instance name
/// or the backend-assigned id.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Managed instances only.
    async fn list(&self) -> Result<Vec<ServerInstance>>;

    /// `RuntimeError::NotFound` when the resource does not exist.
    async fn inspect(&self, id: &str) -> Result<ServerInstance>;

    /// Creates the resource in the stopped state.
    async fn provision(&self, req: &ProvisionRequest) -> Result<ServerInstance>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn signal(&self, id: &str, signal: StopSignal) -> Result<()>;

    /// Removes a stopped resource. Running resources are killed first.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Host ports held by this backend's resources, running or not.
    async fn claimed_ports(&self) -> Result<Vec<PortClaim>>;

    /// Address of the remote console, if this backend can reach one.
    async fn rcon_address(&self, inst: &ServerInstance, port: u16) -> Option<SocketAddr>;

    /// Writes `command` to the console stream and collects output for up to `timeout`.
    async fn attach_command(&self, id: &str, command: &str, timeout: Duration)
    -> Result<String>;

    /// Writes `command` to the server process's stdin located through the process table.
    async fn proc_table_command(&self, id: &str, command: &str) -> Result<()>;

    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>>;

    async fn sample_stats(&self, id: &str) -> Result<RawStatsSample>;

    /// Java major version of the runtime that will run (or runs) the instance.
    async fn detect_java(&self, id: &str) -> Result<Option<u32>>;
}

pub type SharedBackend = Arc<dyn Backend>;

/// Builds the configured backend. Called once at startup.
pub async fn from_config(cfg: &AgentConfig) -> Result<SharedBackend> {
    match cfg.backend {
        BackendKind::Container => {
            let b = container::ContainerBackend::connect(cfg).await?;
            Ok(Arc::new(b))
        }
        BackendKind::Process => {
            let b = process::ProcessBackend::new(cfg).await;
            Ok(Arc::new(b))
        }
    }
}
