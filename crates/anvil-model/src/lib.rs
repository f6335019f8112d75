use std::{collections::BTreeMap, fmt};

use specta::Type;

/// Identifier assigned by the execution backend (container id, or a generated id for local processes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport protocol of a port binding. TCP and UDP are independent namespaces.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    Type,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct PortBinding {
    pub container_port: u16,
    pub protocol: Protocol,
    /// `None` when the backend has not resolved a host-side port.
    pub host_port: Option<u16>,
}

/// A (host port, protocol) pair that is already taken, with its holder when known.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct PortClaim {
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl fmt::Display for PortClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner {
            Some(owner) => write!(f, "{}/{} ({owner})", self.port, self.protocol),
            None => write!(f, "{}/{}", self.port, self.protocol),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Absent,
    Creating,
    Running,
    Stopping,
    Stopped,
    Recreating,
    Deleted,
    /// The backing resource vanished outside of this agent.
    NotFound,
}

impl InstanceStatus {
    pub fn is_running(self) -> bool {
        matches!(self, InstanceStatus::Running)
    }

    /// States in which a live workload may still be answering on its ports.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            InstanceStatus::Creating
                | InstanceStatus::Running
                | InstanceStatus::Stopping
                | InstanceStatus::Recreating
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Container,
    Process,
}

impl BackendKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "docker" | "container" => Some(BackendKind::Container),
            "process" | "local" | "native" => Some(BackendKind::Process),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Container => "docker",
            BackendKind::Process => "process",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct MountDescriptor {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Read projection of a workload, rebuilt from the backend on every inspection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct ServerInstance {
    pub name: String,
    pub id: InstanceId,
    pub backend: BackendKind,
    pub status: InstanceStatus,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<MountDescriptor>,
    pub created_at_unix_ms: Option<u64>,
}

impl ServerInstance {
    /// Host port of the first TCP binding, falling back to the first resolved binding.
    pub fn primary_host_port(&self) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.protocol == Protocol::Tcp && p.host_port.is_some())
            .or_else(|| self.ports.iter().find(|p| p.host_port.is_some()))
            .and_then(|p| p.host_port)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// RAM amounts arrive either as integers (megabytes) or strings such as `"2G"` / `"2048"`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(untagged)]
pub enum RamValue {
    Megabytes(u64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct PortRequest {
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortRequest {
    pub fn tcp(container_port: u16) -> Self {
        Self {
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(container_port: u16) -> Self {
        Self {
            container_port,
            protocol: Protocol::Udp,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Provisioning request for a new instance.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct ServerSpec {
    pub name: String,
    /// Workload kind: `minecraft`, `terraria`, `dst` or `generic`.
    #[serde(default)]
    pub game: Option<String>,
    /// Server flavour, e.g. `PAPER` or `FABRIC`.
    #[serde(default)]
    pub server_type: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub loader_version: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    /// Executable for non-Java workloads on the process backend.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortRequest>,
    #[serde(default)]
    pub preferred_host_port: Option<u16>,
    #[serde(default = "default_true")]
    pub allow_port_fallback: bool,
    #[serde(default)]
    pub min_ram: Option<RamValue>,
    #[serde(default)]
    pub max_ram: Option<RamValue>,
    #[serde(default)]
    pub java_version: Option<String>,
    #[serde(default)]
    pub custom_args: Option<String>,
    #[serde(default)]
    pub custom_id: Option<String>,
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

impl ServerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            game: None,
            server_type: None,
            version: None,
            loader_version: None,
            image: None,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            ports: Vec::new(),
            preferred_host_port: None,
            allow_port_fallback: true,
            min_ram: None,
            max_ram: None,
            java_version: None,
            custom_args: None,
            custom_id: None,
            auto_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceStats {
    /// Within `[0, 100 * online_cpus]`.
    pub cpu_percent: f64,
    pub online_cpus: u32,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub sampled_at_unix_ms: u64,
}

/// One row of a fleet listing. `stats` is `None` when not requested or when sampling failed.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceSummary {
    pub instance: ServerInstance,
    pub stats: Option<InstanceStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum PlayerInfoSource {
    StatusQuery,
    RemoteConsole,
    Attach,
    ProcessTable,
    LogScan,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct PlayerInfo {
    pub online: u32,
    pub max: Option<u32>,
    pub names: Vec<String>,
    /// Stage that produced the reported count.
    pub source: PlayerInfoSource,
    /// Stage that produced `names`, when any did.
    pub names_source: Option<PlayerInfoSource>,
}

impl PlayerInfo {
    pub fn unavailable() -> Self {
        Self {
            online: 0,
            max: None,
            names: Vec::new(),
            source: PlayerInfoSource::Unavailable,
            names_source: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum DispatchTier {
    RemoteConsole,
    Attach,
    ProcessTable,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct CommandOutcome {
    pub tier: DispatchTier,
    pub response: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum StopMethod {
    AlreadyStopped,
    Graceful,
    /// Plain terminate signal after the graceful window.
    Terminated,
    /// Forced kill after the graceful window.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct StopOutcome {
    pub status: InstanceStatus,
    pub method: StopMethod,
    pub graceful_command: Option<String>,
    pub dispatch_tier: Option<DispatchTier>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct StepOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// Per-step result of a delete; a failed step does not hide the others.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct DeleteOutcome {
    pub backend: StepOutcome,
    pub directory: StepOutcome,
}

impl DeleteOutcome {
    pub fn is_complete(&self) -> bool {
        self.backend.ok && self.directory.ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BackendUnavailable,
    NotFound,
    PortConflict,
    NoPortsAvailable,
    ProtocolTimeout,
    CorruptState,
    Unsupported,
    InvalidParam,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PortConflict => "port_conflict",
            ErrorKind::NoPortsAvailable => "no_ports_available",
            ErrorKind::ProtocolTimeout => "protocol_timeout",
            ErrorKind::CorruptState => "corrupt_state",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::InvalidParam => "invalid_param",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Structured failure returned across the façade boundary.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct OpError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<PortClaim>,
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for OpError {}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceEvent {
    Created {
        name: String,
    },
    StatusChanged {
        name: String,
        from: Option<InstanceStatus>,
        to: InstanceStatus,
    },
    Deleted {
        name: String,
    },
    Renamed {
        from: String,
        to: String,
    },
    PlayersChanged {
        name: String,
        online: u32,
    },
    LogLine {
        name: String,
        line: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_is_non_empty() {
        let id = InstanceId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn ram_value_accepts_strings_and_integers() {
        let v: RamValue = serde_json::from_str("2048").unwrap();
        assert_eq!(v, RamValue::Megabytes(2048));
        let v: RamValue = serde_json::from_str("\"2G\"").unwrap();
        assert_eq!(v, RamValue::Text("2G".to_string()));
    }

    #[test]
    fn server_spec_defaults_allow_fallback_and_autostart() {
        let spec: ServerSpec = serde_json::from_str(r#"{"name":"lobby"}"#).unwrap();
        assert!(spec.allow_port_fallback);
        assert!(spec.auto_start);
        assert!(spec.ports.is_empty());
    }

    #[test]
    fn primary_port_prefers_tcp() {
        let inst = ServerInstance {
            name: "a".to_string(),
            id: InstanceId("x".to_string()),
            backend: BackendKind::Process,
            status: InstanceStatus::Running,
            image: String::new(),
            labels: BTreeMap::new(),
            env: BTreeMap::new(),
            ports: vec![
                PortBinding {
                    container_port: 19132,
                    protocol: Protocol::Udp,
                    host_port: Some(19132),
                },
                PortBinding {
                    container_port: 25565,
                    protocol: Protocol::Tcp,
                    host_port: Some(25570),
                },
            ],
            mounts: Vec::new(),
            created_at_unix_ms: None,
        };
        assert_eq!(inst.primary_host_port(), Some(25570));
    }

    #[test]
    fn port_claim_display_names_protocol() {
        let c = PortClaim {
            port: 25565,
            protocol: Protocol::Tcp,
            owner: None,
        };
        assert_eq!(c.to_string(), "25565/tcp");
    }
}
