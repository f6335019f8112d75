//! Docker engine backend (bollard).

use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use anvil_model::{
    BackendKind, InstanceId, InstanceStatus, MountDescriptor, PortBinding, PortClaim, Protocol,
    ServerInstance,
};
use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
        InspectContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
        LogsOptions, MemoryStatsStats, RemoveContainerOptions, StartContainerOptions, Stats,
        StatsOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{
        ContainerInspectResponse, ContainerStateStatusEnum, HostConfig,
        PortBinding as EnginePortBinding, RestartPolicy, RestartPolicyNameEnum,
    },
};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use super::{Backend, ProvisionRequest, StopSignal};
use crate::config::AgentConfig;
use crate::console_log::split_lines_from_tail;
use crate::error::{Result, RuntimeError};
use crate::player_info::strip_stream_frames;
use crate::port_alloc::claims_from_bindings;
use crate::stats::{CpuCounters, RawStatsSample};
use crate::workload::{
    GameKind, LABEL_GAME, LABEL_MANAGED, LABEL_NAME, parse_java_major_from_version_line,
};

const DATA_MOUNT: &str = "/data";
/// Output gap that ends an attach read once some output has arrived.
const ATTACH_QUIET: Duration = Duration::from_millis(300);
const EXEC_TIMEOUT: Duration = Duration::from_secs(15);

/// Writes `$ANVIL_CMD` to the stdin of the first process whose command line matches
/// `$ANVIL_MATCH`, falling back to pid 1.
const PROC_TABLE_SCRIPT: &str = r#"
for d in /proc/[0-9]*; do
  if [ -n "$ANVIL_MATCH" ] && tr '\0' ' ' < "$d/cmdline" 2>/dev/null | grep -q "$ANVIL_MATCH"; then
    printf '%s\n' "$ANVIL_CMD" > "$d/fd/0" && exit 0
  fi
done
printf '%s\n' "$ANVIL_CMD" > /proc/1/fd/0 && exit 0
exit 1
"#;

fn port_key(port: u16, protocol: Protocol) -> String {
    format!("{port}/{protocol}")
}

fn parse_port_key(key: &str) -> Option<(u16, Protocol)> {
    let (port, proto) = key.split_once('/').unwrap_or((key, "tcp"));
    Some((port.parse().ok()?, Protocol::parse(proto)?))
}

fn map_status(status: Option<ContainerStateStatusEnum>) -> InstanceStatus {
    match status {
        Some(ContainerStateStatusEnum::RUNNING)
        | Some(ContainerStateStatusEnum::RESTARTING)
        | Some(ContainerStateStatusEnum::PAUSED) => InstanceStatus::Running,
        Some(ContainerStateStatusEnum::REMOVING) => InstanceStatus::Stopping,
        Some(ContainerStateStatusEnum::CREATED)
        | Some(ContainerStateStatusEnum::EXITED)
        | Some(ContainerStateStatusEnum::DEAD) => InstanceStatus::Stopped,
        Some(ContainerStateStatusEnum::EMPTY) | None => InstanceStatus::Absent,
    }
}

fn parse_env(raw: &[String]) -> BTreeMap<String, String> {
    raw.iter()
        .filter_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

fn parse_created(raw: Option<&str>) -> Option<u64> {
    let dt = chrono::DateTime::parse_from_rfc3339(raw?).ok()?;
    u64::try_from(dt.timestamp_millis()).ok()
}

fn bindings_from_map(
    map: &HashMap<String, Option<Vec<EnginePortBinding>>>,
) -> Vec<PortBinding> {
    let mut out = Vec::new();
    for (key, hosts) in map {
        let Some((container_port, protocol)) = parse_port_key(key) else {
            continue;
        };
        let host_port = hosts
            .as_ref()
            .and_then(|v| v.iter().find_map(|b| b.host_port.as_deref()?.parse().ok()));
        out.push(PortBinding {
            container_port,
            protocol,
            host_port,
        });
    }
    out.sort_by_key(|b| (b.container_port, b.protocol));
    out
}

fn engine_port_map(ports: &[PortBinding]) -> HashMap<String, Option<Vec<EnginePortBinding>>> {
    ports
        .iter()
        .map(|p| {
            let hosts = p.host_port.map(|h| {
                vec![EnginePortBinding {
                    host_ip: None,
                    host_port: Some(h.to_string()),
                }]
            });
            (port_key(p.container_port, p.protocol), hosts)
        })
        .collect()
}

/// Heap plus headroom for metaspace, threads and native buffers.
fn memory_limit_bytes(max_ram_mb: u64) -> i64 {
    let overhead = (max_ram_mb / 4).max(256);
    let mb = max_ram_mb.saturating_add(overhead);
    i64::try_from(mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
}

fn log_bytes(chunk: LogOutput) -> Vec<u8> {
    match chunk {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => message.to_vec(),
    }
}

fn raw_sample(stats: &Stats) -> RawStatsSample {
    let counters = |c: &bollard::container::CPUStats| CpuCounters {
        total_usage: c.cpu_usage.total_usage,
        system_usage: c.system_cpu_usage.unwrap_or(0),
        online_cpus: c
            .online_cpus
            .map(|n| n as u32)
            .or_else(|| c.cpu_usage.percpu_usage.as_ref().map(|v| v.len() as u32))
            .unwrap_or(1)
            .max(1),
    };
    let precpu = counters(&stats.precpu_stats);
    let memory_cache = match &stats.memory_stats.stats {
        Some(MemoryStatsStats::V1(v1)) => v1.cache,
        Some(MemoryStatsStats::V2(v2)) => v2.inactive_file,
        None => 0,
    };
    RawStatsSample {
        cpu: counters(&stats.cpu_stats),
        precpu: (precpu.system_usage > 0).then_some(precpu),
        memory_usage: stats.memory_stats.usage.unwrap_or(0),
        memory_cache,
        memory_limit: stats.memory_stats.limit.unwrap_or(0),
        networks: stats
            .networks
            .as_ref()
            .map(|n| n.values().map(|s| (s.rx_bytes, s.tx_bytes)).collect())
            .unwrap_or_default(),
    }
}

fn container_ip(resp: &ContainerInspectResponse) -> Option<IpAddr> {
    let settings = resp.network_settings.as_ref()?;
    let direct = settings
        .ip_address
        .as_deref()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok());
    direct.or_else(|| {
        settings.networks.as_ref()?.values().find_map(|n| {
            n.ip_address
                .as_deref()
                .filter(|s| !s.is_empty())
                .and_then(|s| s.parse().ok())
        })
    })
}

/// A managed container that cannot be mapped is left out of listings instead of failing them.
fn listed_instance(id: &str, resp: ContainerInspectResponse) -> Option<ServerInstance> {
    match to_instance(resp) {
        Ok(inst) => Some(inst),
        Err(e) => {
            tracing::warn!(id, error = %e, "skipping unreadable managed container");
            None
        }
    }
}

/// The engine never restarts a workload by itself; one that exits after a console `stop`
/// stays stopped.
fn restart_policy() -> RestartPolicy {
    RestartPolicy {
        name: Some(RestartPolicyNameEnum::NO),
        maximum_retry_count: None,
    }
}

/// A kill sent to a container that is not running succeeds as a no-op. Every other rejection
/// is reported.
fn tolerate_not_running(id: &str, e: BollardError) -> Result<()> {
    if let BollardError::DockerResponseServerError {
        status_code: 409,
        message,
    } = &e
        && message.contains("is not running")
    {
        tracing::debug!(id, message = %message, "signal ignored");
        return Ok(());
    }
    Err(e.into())
}

fn to_instance(resp: ContainerInspectResponse) -> Result<ServerInstance> {
    let id = resp
        .id
        .clone()
        .ok_or_else(|| RuntimeError::CorruptState("container without id".to_string()))?;
    let config = resp.config.clone().unwrap_or_default();
    let labels: BTreeMap<String, String> = config.labels.unwrap_or_default().into_iter().collect();
    let name = labels
        .get(LABEL_NAME)
        .cloned()
        .or_else(|| resp.name.as_deref().map(|n| n.trim_start_matches('/').to_string()))
        .unwrap_or_else(|| id.clone());

    let mut ports = resp
        .host_config
        .as_ref()
        .and_then(|h| h.port_bindings.as_ref())
        .map(bindings_from_map)
        .unwrap_or_default();
    for key in config.exposed_ports.unwrap_or_default().keys() {
        if let Some((container_port, protocol)) = parse_port_key(key)
            && !ports
                .iter()
                .any(|p| p.container_port == container_port && p.protocol == protocol)
        {
            ports.push(PortBinding {
                container_port,
                protocol,
                host_port: None,
            });
        }
    }

    let mounts = resp
        .mounts
        .unwrap_or_default()
        .into_iter()
        .map(|m| MountDescriptor {
            source: m.source.unwrap_or_default(),
            target: m.destination.unwrap_or_default(),
            read_only: !m.rw.unwrap_or(true),
        })
        .collect();

    Ok(ServerInstance {
        name,
        id: InstanceId(id),
        backend: BackendKind::Container,
        status: map_status(resp.state.and_then(|s| s.status)),
        image: config.image.unwrap_or_default(),
        labels,
        env: parse_env(&config.env.unwrap_or_default()),
        ports,
        mounts,
        created_at_unix_ms: parse_created(resp.created.as_deref()),
    })
}

#[derive(Clone)]
pub struct ContainerBackend {
    docker: Docker,
}

impl ContainerBackend {
    pub async fn connect(_cfg: &AgentConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::BackendUnavailable(e.to_string()))?;
        // An unreachable engine is not fatal; operations report BackendUnavailable until it returns.
        match docker.ping().await {
            Ok(_) => tracing::info!("connected to docker engine"),
            Err(e) => tracing::warn!(error = %e, "docker engine not reachable yet"),
        }
        Ok(Self { docker })
    }

    async fn inspect_raw(&self, id: &str) -> Result<ContainerInspectResponse> {
        Ok(self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?)
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                let e = RuntimeError::from(e);
                if !e.is_not_found() {
                    return Err(e);
                }
            }
        }
        tracing::info!(image, "pulling image");
        let mut pull = Box::pin(self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        ));
        while let Some(step) = pull.next().await {
            step?;
        }
        Ok(())
    }

    /// Runs a command inside the container and returns (exit code, combined output).
    async fn exec(&self, id: &str, cmd: Vec<String>, env: Vec<String>) -> Result<(i64, String)> {
        let created = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd),
                    env: Some(env),
                    ..Default::default()
                },
            )
            .await?;

        let mut out = Vec::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&created.id, None).await?
        {
            let drain = async {
                while let Some(chunk) = output.next().await {
                    out.extend_from_slice(&log_bytes(chunk?));
                }
                Ok::<_, RuntimeError>(())
            };
            tokio::time::timeout(EXEC_TIMEOUT, drain)
                .await
                .map_err(|_| RuntimeError::ProtocolTimeout {
                    channel: "docker exec",
                    timeout_ms: EXEC_TIMEOUT.as_millis() as u64,
                })??;
        }

        let code = self
            .docker
            .inspect_exec(&created.id)
            .await?
            .exit_code
            .unwrap_or(-1);
        Ok((code, String::from_utf8_lossy(&out).into_owned()))
    }

    async fn require_running(&self, id: &str) -> Result<ContainerInspectResponse> {
        let resp = self.inspect_raw(id).await?;
        let status = map_status(resp.state.as_ref().and_then(|s| s.status));
        if !status.is_running() {
            return Err(RuntimeError::Unsupported(format!("{id} is not running")));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn list(&self) -> Result<Vec<ServerInstance>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{LABEL_MANAGED}=true")],
        )]);
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut out = Vec::new();
        for s in summaries {
            let Some(id) = s.id else {
                continue;
            };
            match self.inspect_raw(&id).await {
                Ok(resp) => out.extend(listed_instance(&id, resp)),
                // Removed between list and inspect.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn inspect(&self, id: &str) -> Result<ServerInstance> {
        to_instance(self.inspect_raw(id).await?)
    }

    async fn provision(&self, req: &ProvisionRequest) -> Result<ServerInstance> {
        self.ensure_image(&req.image).await?;

        let mut labels = req.labels.clone();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_NAME.to_string(), req.name.clone());

        let exposed_ports = req
            .ports
            .iter()
            .map(|p| (port_key(p.container_port, p.protocol), HashMap::new()))
            .collect::<HashMap<_, _>>();

        let cmd = req.command.as_ref().map(|c| {
            let mut v = vec![c.clone()];
            v.extend(req.args.iter().cloned());
            v
        });

        let config = Config {
            image: Some(req.image.clone()),
            env: Some(req.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            labels: Some(labels.into_iter().collect()),
            exposed_ports: Some(exposed_ports),
            cmd,
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{DATA_MOUNT}",
                    req.instance_dir.display()
                )]),
                port_bindings: Some(engine_port_map(&req.ports)),
                memory: Some(memory_limit_bytes(req.quota.max_ram_mb)),
                restart_policy: Some(restart_policy()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: req.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await?;
        for w in &created.warnings {
            tracing::warn!(instance = %req.name, warning = %w, "docker create warning");
        }
        tracing::info!(instance = %req.name, id = %created.id, image = %req.image, "container created");
        self.inspect(&created.id).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn signal(&self, id: &str, signal: StopSignal) -> Result<()> {
        let sig = match signal {
            StopSignal::Term => "SIGTERM",
            StopSignal::Kill => "SIGKILL",
        };
        match self
            .docker
            .kill_container(id, Some(KillContainerOptions { signal: sig }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => tolerate_not_running(id, e),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        tracing::info!(id, "container removed");
        Ok(())
    }

    async fn claimed_ports(&self) -> Result<Vec<PortClaim>> {
        // Every container on the engine holds its bindings, managed or not, running or not.
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;
        let mut out = Vec::new();
        for s in summaries {
            let Some(id) = s.id else {
                continue;
            };
            let resp = match self.inspect_raw(&id).await {
                Ok(r) => r,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let owner = resp
                .name
                .as_deref()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or(id);
            let bindings = resp
                .host_config
                .as_ref()
                .and_then(|h| h.port_bindings.as_ref())
                .map(bindings_from_map)
                .unwrap_or_default();
            out.extend(claims_from_bindings(&owner, &bindings));
        }
        Ok(out)
    }

    async fn rcon_address(&self, inst: &ServerInstance, port: u16) -> Option<SocketAddr> {
        if let Some(host) = inst
            .ports
            .iter()
            .find(|p| p.container_port == port && p.protocol == Protocol::Tcp)
            .and_then(|p| p.host_port)
        {
            return Some(SocketAddr::from(([127, 0, 0, 1], host)));
        }
        let resp = self.inspect_raw(inst.id.as_str()).await.ok()?;
        container_ip(&resp).map(|ip| SocketAddr::new(ip, port))
    }

    async fn attach_command(&self, id: &str, command: &str, timeout: Duration) -> Result<String> {
        self.require_running(id).await?;
        let AttachContainerResults {
            mut output,
            mut input,
        } = self
            .docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    detach_keys: None,
                }),
            )
            .await?;

        input
            .write_all(format!("{}\n", command.trim_end()).as_bytes())
            .await
            .map_err(RuntimeError::io("write to container stdin"))?;
        input.flush().await.ok();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let wait = if buf.is_empty() {
                remaining
            } else {
                ATTACH_QUIET.min(remaining)
            };
            match tokio::time::timeout(wait, output.next()).await {
                Ok(Some(Ok(chunk))) => buf.extend_from_slice(&strip_stream_frames(&log_bytes(chunk))),
                Ok(Some(Err(e))) => {
                    tracing::debug!(id, error = %e, "attach stream error");
                    break;
                }
                Ok(None) | Err(_) => break,
            }
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn proc_table_command(&self, id: &str, command: &str) -> Result<()> {
        let resp = self.require_running(id).await?;
        let game = resp
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|l| l.get(LABEL_GAME))
            .map(|g| GameKind::parse(g))
            .unwrap_or(GameKind::Minecraft);
        let matcher = if game.uses_java() { "java" } else { "" };
        let (code, out) = self
            .exec(
                id,
                vec!["sh".to_string(), "-c".to_string(), PROC_TABLE_SCRIPT.to_string()],
                vec![format!("ANVIL_CMD={command}"), format!("ANVIL_MATCH={matcher}")],
            )
            .await?;
        if code != 0 {
            return Err(RuntimeError::Unsupported(format!(
                "process table write failed (exit {code}): {}",
                out.trim()
            )));
        }
        Ok(())
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>> {
        let mut stream = Box::pin(self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        ));
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&log_bytes(chunk?));
        }
        Ok(split_lines_from_tail(&buf, tail))
    }

    async fn sample_stats(&self, id: &str) -> Result<RawStatsSample> {
        let mut stream = Box::pin(self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        ));
        match stream.next().await {
            Some(Ok(stats)) => Ok(raw_sample(&stats)),
            Some(Err(e)) => Err(e.into()),
            None => Err(RuntimeError::NotFound(format!("no stats for {id}"))),
        }
    }

    async fn detect_java(&self, id: &str) -> Result<Option<u32>> {
        if self.require_running(id).await.is_err() {
            return Ok(None);
        }
        let (_, out) = self
            .exec(id, vec!["java".to_string(), "-version".to_string()], Vec::new())
            .await?;
        Ok(out
            .lines()
            .find(|l| l.contains("version"))
            .and_then(|l| parse_java_major_from_version_line(l).ok()))
    }
}
