//! Local OS process backend.
//!
//! Each instance directory holds `runtime.json` (what to launch) and, while a process exists,
//! `run.json` (pid/pgid of the live process group). Console input goes through the
//! `console.in` named pipe. The workload writes stdout and stderr straight to
//! `logs/console.out`, so it never depends on a pipe held by the agent; a follower task copies
//! new lines from there into `logs/console.log` and the in-memory buffer.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anvil_model::{
    BackendKind, InstanceId, InstanceStatus, MountDescriptor, PortBinding, PortClaim,
    ServerInstance,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncWriteExt,
    process::Command,
    sync::Mutex,
};

use super::{Backend, ProvisionRequest, StopSignal, procfs};
use crate::config::{AgentConfig, LogLimits};
use crate::console_log::{CONSOLE_LOG_FILE, LogSink, read_since, tail_file};
use crate::error::{Result, RuntimeError};
use crate::launch::resolve_launch_spec;
use crate::layout::{DataLayout, validate_name};
use crate::metadata::ResourceQuota;
use crate::port_alloc::claims_from_bindings;
use crate::stats::{RawStatsSample, now_unix_ms};
use crate::workload::{GameKind, LABEL_GAME, parse_java_major_from_version_line};

pub const RUNTIME_FILE: &str = "runtime.json";
pub const RUN_FILE: &str = "run.json";
pub const CONSOLE_FIFO: &str = "console.in";
pub const CONSOLE_OUT: &str = "console.out";
const LOG_DIR: &str = "logs";

const COLLECT_POLL: Duration = Duration::from_millis(100);
const FOLLOW_POLL: Duration = Duration::from_millis(200);
const REMOVE_WAIT: Duration = Duration::from_secs(3);
const JAVA_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Launch description persisted at provisioning time.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessRecord {
    id: String,
    name: String,
    game: String,
    image: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    ports: Vec<PortBinding>,
    min_ram_mb: u64,
    max_ram_mb: u64,
    #[serde(default)]
    java_major: Option<u32>,
    #[serde(default)]
    custom_args: Option<String>,
    created_at_unix_ms: u64,
}

impl ProcessRecord {
    fn kind(&self) -> GameKind {
        GameKind::parse(&self.game)
    }

    fn quota(&self) -> ResourceQuota {
        ResourceQuota {
            min_ram_mb: self.min_ram_mb,
            max_ram_mb: self.max_ram_mb,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunInfo {
    id: String,
    started_at_unix_ms: u64,
    agent_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pgid: Option<i32>,
    exec: String,
    args: Vec<String>,
    cwd: String,
    // Values of secret-looking keys are redacted.
    env: BTreeMap<String, String>,
}

fn redact_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let upper = k.to_ascii_uppercase();
            let secret = ["PASSWORD", "PASS", "SECRET", "TOKEN"]
                .iter()
                .any(|m| upper.contains(m));
            let v = if secret { "<redacted>".to_string() } else { v.clone() };
            (k.clone(), v)
        })
        .collect()
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| RuntimeError::Internal(format!("serialize {}: {e}", path.display())))?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .map_err(RuntimeError::io(format!("create {}", tmp.display())))?;
    f.write_all(&data)
        .await
        .map_err(RuntimeError::io(format!("write {}", tmp.display())))?;
    f.flush().await.ok();
    drop(f);
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(RuntimeError::io(format!("persist {}", path.display())))
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match tokio::fs::read(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RuntimeError::io(format!("read {}", path.display()))(e)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| RuntimeError::CorruptState(format!("{}: {e}", path.display())))
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RuntimeError::io(format!("remove {}", path.display()))(e)),
    }
}

#[cfg(unix)]
fn ensure_fifo(path: &Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::FileTypeExt;

    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_fifo() {
            return Ok(());
        }
        std::fs::remove_file(path).map_err(RuntimeError::io("replace console pipe"))?;
    }
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| RuntimeError::invalid("path", "contains a NUL byte"))?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc == -1 {
        return Err(RuntimeError::io("create console pipe")(
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_fifo(_path: &Path) -> Result<()> {
    Err(RuntimeError::Unsupported(
        "console pipes require a unix host".to_string(),
    ))
}

/// Writes one newline-terminated command without blocking on a pipe nobody reads.
async fn write_console_line(path: &Path, command: &str) -> Result<()> {
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true);
    #[cfg(unix)]
    opts.custom_flags(libc::O_NONBLOCK);
    let mut f = opts.open(path).await.map_err(|e| {
        if e.raw_os_error() == Some(libc::ENXIO) {
            RuntimeError::Unsupported(format!("no reader on {}", path.display()))
        } else {
            RuntimeError::io(format!("open {}", path.display()))(e)
        }
    })?;
    let mut line = command.trim_end_matches(['\r', '\n']).to_string();
    line.push('\n');
    f.write_all(line.as_bytes())
        .await
        .map_err(RuntimeError::io(format!("write {}", path.display())))?;
    f.flush().await.ok();
    Ok(())
}

fn send_group_signal(pgid: i32, signal: StopSignal) -> Result<()> {
    #[cfg(unix)]
    {
        let sig = match signal {
            StopSignal::Term => libc::SIGTERM,
            StopSignal::Kill => libc::SIGKILL,
        };
        let rc = unsafe { libc::kill(-pgid, sig) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(RuntimeError::io(format!("signal process group {pgid}"))(err));
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, signal);
        Err(RuntimeError::Unsupported("signals require a unix host".to_string()))
    }
}

struct ProcessEntry {
    pid: u32,
    pgid: i32,
    running: bool,
    sink: LogSink,
}

/// Live process state resolved for one instance.
#[derive(Debug, Clone, Copy)]
struct Liveness {
    pid: u32,
    pgid: i32,
}

/// Where freshly written console output can be read back from.
enum OutputCursor {
    Memory(LogSink, u64),
    File(PathBuf, u64),
}

impl OutputCursor {
    async fn next(&mut self) -> Vec<String> {
        match self {
            OutputCursor::Memory(sink, cursor) => {
                let (lines, next) = sink.tail_after(*cursor, 500).await;
                *cursor = next;
                lines
            }
            OutputCursor::File(path, cursor) => match read_since(path, *cursor).await {
                Ok((lines, next)) => {
                    *cursor = next;
                    lines
                }
                Err(_) => Vec::new(),
            },
        }
    }
}

#[derive(Clone)]
pub struct ProcessBackend {
    layout: DataLayout,
    java_homes: BTreeMap<u32, PathBuf>,
    log_limits: LogLimits,
    entries: Arc<Mutex<HashMap<String, ProcessEntry>>>,
}

impl ProcessBackend {
    pub async fn new(cfg: &AgentConfig) -> Self {
        let backend = Self {
            layout: DataLayout::new(cfg.data_root.clone()),
            java_homes: cfg.java_homes.clone(),
            log_limits: cfg.log_limits.clone(),
            entries: Arc::new(Mutex::new(HashMap::new())),
        };
        if let Err(e) = tokio::fs::create_dir_all(backend.layout.instances_dir()).await {
            tracing::warn!(error = %e, "cannot create instances dir");
        }
        let adopted = backend.adoptable().await;
        if !adopted.is_empty() {
            let names: Vec<&str> = adopted.iter().map(|(n, _)| n.as_str()).collect();
            tracing::info!(instances = ?names, "found processes still running from a previous agent");
        }
        for (name, live) in adopted {
            let Ok(dir) = backend.layout.instance_dir(&name) else {
                continue;
            };
            let log_dir = dir.join(LOG_DIR);
            let out = log_dir.join(CONSOLE_OUT);
            // Output written while no agent was following is already in the file; start at its end.
            let start = tokio::fs::metadata(&out).await.map(|m| m.len()).unwrap_or(0);
            let sink = LogSink::open(&log_dir, &backend.log_limits).await;
            spawn_output_follower(out, start, sink, live.pid, backend.log_limits.file_max_bytes);
        }
        backend
    }

    fn log_path(dir: &Path) -> PathBuf {
        dir.join(LOG_DIR).join(CONSOLE_LOG_FILE)
    }

    async fn adoptable(&self) -> Vec<(String, Liveness)> {
        let mut out = Vec::new();
        for rec in self.records().await {
            if let Ok(dir) = self.layout.instance_dir(&rec.name)
                && let Some(live) = self.adopted_liveness(&dir).await
            {
                out.push((rec.name, live));
            }
        }
        out
    }

    async fn load_record(&self, name: &str) -> Result<Option<ProcessRecord>> {
        let dir = self.layout.instance_dir(name)?;
        read_json(&dir.join(RUNTIME_FILE)).await
    }

    async fn records(&self) -> Vec<ProcessRecord> {
        let names = match self.layout.instance_names().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "cannot list instance dirs");
                return Vec::new();
            }
        };
        let mut out = Vec::new();
        for name in names {
            match self.load_record(&name).await {
                Ok(Some(rec)) => out.push(rec),
                Ok(None) => {}
                Err(e) => tracing::warn!(instance = %name, error = %e, "skipping unreadable runtime record"),
            }
        }
        out
    }

    /// Accepts either the instance name or the generated id.
    async fn resolve(&self, id: &str) -> Result<ProcessRecord> {
        if validate_name(id).is_ok()
            && let Some(rec) = self.load_record(id).await?
        {
            return Ok(rec);
        }
        self.records()
            .await
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn adopted_liveness(&self, dir: &Path) -> Option<Liveness> {
        let run: RunInfo = read_json(&dir.join(RUN_FILE)).await.ok().flatten()?;
        let pid = run.pid?;
        if !procfs::pid_alive(pid) {
            return None;
        }
        // Guard against pid reuse: the live process must still be what we launched.
        let exec_name = Path::new(&run.exec)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let cmdline = procfs::read_cmdline(pid).await?;
        if !exec_name.is_empty() && !cmdline.contains(&exec_name) {
            return None;
        }
        Some(Liveness {
            pid,
            pgid: run.pgid.unwrap_or(pid as i32),
        })
    }

    async fn liveness(&self, rec: &ProcessRecord) -> Option<Liveness> {
        {
            let entries = self.entries.lock().await;
            if let Some(e) = entries.get(&rec.name) {
                return e.running.then_some(Liveness {
                    pid: e.pid,
                    pgid: e.pgid,
                });
            }
        }
        let dir = self.layout.instance_dir(&rec.name).ok()?;
        self.adopted_liveness(&dir).await
    }

    async fn require_live(&self, rec: &ProcessRecord) -> Result<Liveness> {
        self.liveness(rec)
            .await
            .ok_or_else(|| RuntimeError::Unsupported(format!("{} is not running", rec.name)))
    }

    async fn to_instance(&self, rec: &ProcessRecord) -> ServerInstance {
        let status = if self.liveness(rec).await.is_some() {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        };
        let dir = self
            .layout
            .instance_dir(&rec.name)
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        ServerInstance {
            name: rec.name.clone(),
            id: InstanceId(rec.id.clone()),
            backend: BackendKind::Process,
            status,
            image: rec.image.clone(),
            labels: rec.labels.clone(),
            env: rec.env.clone(),
            ports: rec.ports.clone(),
            mounts: vec![MountDescriptor {
                source: dir.clone(),
                target: dir,
                read_only: false,
            }],
            created_at_unix_ms: Some(rec.created_at_unix_ms),
        }
    }

    fn java_exec(&self, major: Option<u32>) -> String {
        if let Some(home) = major.and_then(|m| self.java_homes.get(&m)) {
            return home.join("bin").join("java").display().to_string();
        }
        if let Some(m) = major {
            tracing::debug!(java = m, "no configured home for requested java; using default");
        }
        match std::env::var("JAVA_HOME") {
            Ok(home) if !home.trim().is_empty() => {
                PathBuf::from(home).join("bin").join("java").display().to_string()
            }
            _ => "java".to_string(),
        }
    }

    fn launch_for(&self, rec: &ProcessRecord, dir: &Path) -> Result<(String, Vec<String>)> {
        if let Some(cmd) = rec.command.as_deref().filter(|c| !c.trim().is_empty()) {
            return Ok((cmd.to_string(), rec.args.clone()));
        }
        if rec.kind().uses_java() {
            let java = self.java_exec(rec.java_major);
            let spec = resolve_launch_spec(dir, &java, rec.quota(), rec.custom_args.as_deref())?;
            tracing::debug!(instance = %rec.name, kind = spec.kind, "resolved java launch");
            return Ok((spec.exec, spec.args));
        }
        Err(RuntimeError::invalid(
            "command",
            format!("{} workloads need an explicit command", rec.game),
        ))
    }

    async fn spawn(&self, rec: &ProcessRecord) -> Result<()> {
        let dir = self.layout.instance_dir(&rec.name)?;
        let (exec, args) = self.launch_for(rec, &dir)?;

        let fifo = dir.join(CONSOLE_FIFO);
        ensure_fifo(&fifo)?;
        // Read-write keeps a writer attached so the server never sees EOF between commands.
        let stdin = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&fifo)
            .map_err(RuntimeError::io("open console pipe"))?;

        let log_dir = dir.join(LOG_DIR);
        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(RuntimeError::io("create log dir"))?;
        let sink = LogSink::open(&log_dir, &self.log_limits).await;

        let out_path = log_dir.join(CONSOLE_OUT);
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&out_path)
            .map_err(RuntimeError::io(format!("open {}", out_path.display())))?;
        stdout
            .set_len(0)
            .map_err(RuntimeError::io("reset console output"))?;
        let stderr = stdout
            .try_clone()
            .map_err(RuntimeError::io("share console output"))?;

        let mut cmd = Command::new(&exec);
        cmd.current_dir(&dir)
            .args(&args)
            .envs(&rec.env)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        #[cfg(unix)]
        unsafe {
            // Own process group so signals reach the whole server tree. No parent-death signal:
            // servers outlive agent restarts and are adopted from run.json.
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut run = RunInfo {
            id: rec.id.clone(),
            started_at_unix_ms: now_unix_ms(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            pid: None,
            pgid: None,
            exec: exec.clone(),
            args: args.clone(),
            cwd: dir.display().to_string(),
            env: redact_env(&rec.env),
        };

        sink.emit(format!(
            "[anvil] exec: {} {} (cwd {})",
            exec,
            args.join(" "),
            dir.display()
        ))
        .await;

        let mut child = cmd.spawn().map_err(|e| {
            RuntimeError::io(format!("spawn {exec} for {}", rec.name))(e)
        })?;
        let pid = child
            .id()
            .ok_or_else(|| RuntimeError::Internal("spawned process has no pid".to_string()))?;
        let pgid = pid as i32;
        run.pid = Some(pid);
        run.pgid = Some(pgid);
        if let Err(e) = write_json_atomic(&dir.join(RUN_FILE), &run).await {
            tracing::warn!(instance = %rec.name, error = %e, "failed to write run record");
        }

        spawn_output_follower(
            out_path,
            0,
            sink.clone(),
            pid,
            self.log_limits.file_max_bytes,
        );

        self.entries.lock().await.insert(
            rec.name.clone(),
            ProcessEntry {
                pid,
                pgid,
                running: true,
                sink: sink.clone(),
            },
        );
        tracing::info!(instance = %rec.name, pid, exec = %exec, "process started");

        let entries = self.entries.clone();
        let name = rec.name.clone();
        tokio::spawn(async move {
            let res = child.wait().await;
            let code = res.as_ref().ok().and_then(|s| s.code());
            {
                let mut map = entries.lock().await;
                if let Some(e) = map.get_mut(&name)
                    && e.pid == pid
                {
                    e.running = false;
                }
            }
            match res {
                Ok(status) => {
                    sink.emit(format!("[anvil] process exited: {status}")).await;
                    tracing::info!(instance = %name, pid, code = ?code, "process exited");
                }
                Err(e) => {
                    sink.emit(format!("[anvil] wait failed: {e}")).await;
                    tracing::warn!(instance = %name, pid, error = %e, "wait failed");
                }
            }
        });

        Ok(())
    }

    async fn output_cursor(&self, rec: &ProcessRecord, dir: &Path) -> OutputCursor {
        if let Some(e) = self.entries.lock().await.get(&rec.name)
            && e.running
        {
            let seq = e.sink.last_seq().await;
            return OutputCursor::Memory(e.sink.clone(), seq);
        }
        let path = Self::log_path(dir);
        let len = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        OutputCursor::File(path, len)
    }
}

/// Copies lines the workload appends to `console.out` into `sink` until `pid` is gone, then
/// drains once more. Past `truncate_at` bytes the consumed file is truncated in place; the
/// workload's append-mode descriptor keeps writing at the new end. Lines written between the
/// last read and the truncation are lost.
fn spawn_output_follower(
    path: PathBuf,
    start: u64,
    sink: LogSink,
    pid: u32,
    truncate_at: u64,
) {
    tokio::spawn(async move {
        let mut cursor = start;
        loop {
            let alive = procfs::pid_alive(pid);
            match read_since(&path, cursor).await {
                Ok((lines, next)) => {
                    for line in lines {
                        sink.emit(line).await;
                    }
                    cursor = next;
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "console output read failed");
                }
            }
            if !alive {
                break;
            }
            if truncate_at > 0
                && cursor >= truncate_at
                && let Ok(f) = tokio::fs::OpenOptions::new().write(true).open(&path).await
            {
                match f.set_len(0).await {
                    Ok(()) => cursor = 0,
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "console output truncate failed");
                    }
                }
            }
            tokio::time::sleep(FOLLOW_POLL).await;
        }
        tracing::debug!(pid, "console output follower finished");
    });
}

#[async_trait]
impl Backend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    async fn list(&self) -> Result<Vec<ServerInstance>> {
        let mut out = Vec::new();
        for rec in self.records().await {
            out.push(self.to_instance(&rec).await);
        }
        Ok(out)
    }

    async fn inspect(&self, id: &str) -> Result<ServerInstance> {
        let rec = self.resolve(id).await?;
        Ok(self.to_instance(&rec).await)
    }

    async fn provision(&self, req: &ProvisionRequest) -> Result<ServerInstance> {
        let dir = self.layout.instance_dir(&req.name)?;
        if self.load_record(&req.name).await?.is_some() {
            return Err(RuntimeError::invalid(
                "name",
                format!("{} is already provisioned", req.name),
            ));
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(RuntimeError::io(format!("create {}", dir.display())))?;

        let mut labels = req.labels.clone();
        labels.insert(LABEL_GAME.to_string(), req.kind.as_str().to_string());
        let rec = ProcessRecord {
            id: InstanceId::new().0,
            name: req.name.clone(),
            game: req.kind.as_str().to_string(),
            image: req.command.clone().unwrap_or_else(|| "java".to_string()),
            command: req.command.clone(),
            args: req.args.clone(),
            env: req.env.clone(),
            labels,
            ports: req.ports.clone(),
            min_ram_mb: req.quota.min_ram_mb,
            max_ram_mb: req.quota.max_ram_mb,
            java_major: req.java_major,
            custom_args: req.custom_args.clone(),
            created_at_unix_ms: now_unix_ms(),
        };
        write_json_atomic(&dir.join(RUNTIME_FILE), &rec).await?;
        tracing::info!(instance = %rec.name, id = %rec.id, "process instance provisioned");
        Ok(self.to_instance(&rec).await)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let rec = self.resolve(id).await?;
        if self.liveness(&rec).await.is_some() {
            tracing::debug!(instance = %rec.name, "start: already running");
            return Ok(());
        }
        self.spawn(&rec).await
    }

    async fn signal(&self, id: &str, signal: StopSignal) -> Result<()> {
        let rec = self.resolve(id).await?;
        let Some(live) = self.liveness(&rec).await else {
            return Ok(());
        };
        tracing::debug!(instance = %rec.name, pgid = live.pgid, ?signal, "signalling process group");
        send_group_signal(live.pgid, signal)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let rec = self.resolve(id).await?;
        let dir = self.layout.instance_dir(&rec.name)?;
        if let Some(live) = self.liveness(&rec).await {
            send_group_signal(live.pgid, StopSignal::Kill)?;
            let deadline = tokio::time::Instant::now() + REMOVE_WAIT;
            while self.liveness(&rec).await.is_some() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(COLLECT_POLL).await;
            }
        }
        self.entries.lock().await.remove(&rec.name);
        for f in [RUNTIME_FILE, RUN_FILE, CONSOLE_FIFO] {
            remove_if_exists(&dir.join(f)).await?;
        }
        tracing::info!(instance = %rec.name, "process instance removed");
        Ok(())
    }

    async fn claimed_ports(&self) -> Result<Vec<PortClaim>> {
        Ok(self
            .records()
            .await
            .iter()
            .flat_map(|r| claims_from_bindings(&r.name, &r.ports))
            .collect())
    }

    async fn rcon_address(&self, _inst: &ServerInstance, _port: u16) -> Option<SocketAddr> {
        None
    }

    async fn attach_command(&self, id: &str, command: &str, timeout: Duration) -> Result<String> {
        let rec = self.resolve(id).await?;
        self.require_live(&rec).await?;
        let dir = self.layout.instance_dir(&rec.name)?;
        let mut cursor = self.output_cursor(&rec, &dir).await;

        write_console_line(&dir.join(CONSOLE_FIFO), command).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut collected: Vec<String> = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(COLLECT_POLL.min(remaining)).await;
            let fresh = cursor.next().await;
            if fresh.is_empty() && !collected.is_empty() {
                break;
            }
            collected.extend(fresh);
        }
        Ok(collected.join("\n"))
    }

    async fn proc_table_command(&self, id: &str, command: &str) -> Result<()> {
        let rec = self.resolve(id).await?;
        let live = self.require_live(&rec).await?;
        let members = procfs::group_members(live.pgid).await;

        let mut target = None;
        if rec.kind().uses_java() {
            for (pid, _) in &members {
                if procfs::read_cmdline(*pid)
                    .await
                    .is_some_and(|c| c.contains("java"))
                {
                    target = Some(*pid);
                    break;
                }
            }
        }
        let pid = target
            .or_else(|| members.iter().map(|(p, _)| *p).find(|p| *p == live.pid))
            .or_else(|| members.first().map(|(p, _)| *p))
            .ok_or_else(|| RuntimeError::Unsupported(format!("no process found for {}", rec.name)))?;

        write_console_line(Path::new(&format!("/proc/{pid}/fd/0")), command).await
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>> {
        let rec = self.resolve(id).await?;
        let dir = self.layout.instance_dir(&rec.name)?;
        let lines = tail_file(&Self::log_path(&dir), tail)
            .await
            .map_err(RuntimeError::io("read console log"))?;
        if !lines.is_empty() {
            return Ok(lines);
        }
        if let Some(e) = self.entries.lock().await.get(&rec.name) {
            return Ok(e.sink.tail(tail).await);
        }
        Ok(lines)
    }

    async fn sample_stats(&self, id: &str) -> Result<RawStatsSample> {
        let rec = self.resolve(id).await?;
        let live = self.require_live(&rec).await?;
        let cpu = procfs::group_cpu(live.pgid)
            .await
            .ok_or_else(|| RuntimeError::NotFound(format!("process group {}", live.pgid)))?;

        let mut memory_usage = 0u64;
        let mut memory_cache = 0u64;
        for (pid, _) in procfs::group_members(live.pgid).await {
            memory_usage += procfs::read_rss_bytes(pid).await.unwrap_or(0);
            memory_cache += procfs::read_rss_file_bytes(pid).await.unwrap_or(0);
        }
        let quota_bytes = rec.max_ram_mb.saturating_mul(1024 * 1024);
        let memory_limit = if quota_bytes > 0 {
            quota_bytes
        } else {
            procfs::mem_total_bytes().await.unwrap_or(0)
        };

        Ok(RawStatsSample {
            cpu,
            precpu: None,
            memory_usage,
            memory_cache,
            memory_limit,
            networks: procfs::net_counters(live.pid).await,
        })
    }

    async fn detect_java(&self, id: &str) -> Result<Option<u32>> {
        let rec = self.resolve(id).await?;
        if !rec.kind().uses_java() || rec.command.is_some() {
            return Ok(None);
        }
        let java = self.java_exec(rec.java_major);
        let probe = Command::new(&java)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();
        let out = match tokio::time::timeout(JAVA_PROBE_TIMEOUT, probe).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                tracing::warn!(instance = %rec.name, java = %java, error = %e, "java not runnable");
                return Ok(None);
            }
            Err(_) => {
                return Err(RuntimeError::ProtocolTimeout {
                    channel: "java -version",
                    timeout_ms: JAVA_PROBE_TIMEOUT.as_millis() as u64,
                });
            }
        };
        // `java -version` prints to stderr; some builds use stdout.
        let text = if out.stderr.is_empty() {
            String::from_utf8_lossy(&out.stdout).into_owned()
        } else {
            String::from_utf8_lossy(&out.stderr).into_owned()
        };
        let first = text.lines().next().unwrap_or("");
        Ok(parse_java_major_from_version_line(first).ok())
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use anvil_model::Protocol;

    use super::*;
    use crate::layout::test_support::temp_dir_for;

    fn backend_at(root: &Path) -> ProcessBackend {
        ProcessBackend {
            layout: DataLayout::new(root.to_path_buf()),
            java_homes: BTreeMap::new(),
            log_limits: LogLimits::default(),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn echo_request(root: &Path, name: &str) -> ProvisionRequest {
        ProvisionRequest {
            name: name.to_string(),
            kind: GameKind::Generic,
            image: String::new(),
            command: Some("sh".to_string()),
            args: vec![
                "-c".to_string(),
                "echo ready; while read l; do echo \"got $l\"; done".to_string(),
            ],
            env: BTreeMap::from([("RCON_PASSWORD".to_string(), "hunter2".to_string())]),
            labels: BTreeMap::new(),
            ports: vec![PortBinding {
                container_port: 7777,
                protocol: Protocol::Udp,
                host_port: Some(7777),
            }],
            quota: ResourceQuota {
                min_ram_mb: 128,
                max_ram_mb: 256,
            },
            instance_dir: root.join("instances").join(name),
            java_major: None,
            custom_args: None,
        }
    }

    async fn wait_status(b: &ProcessBackend, name: &str, want: InstanceStatus) -> bool {
        for _ in 0..50 {
            if b.inspect(name).await.map(|i| i.status).ok() == Some(want) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[test]
    fn run_record_redacts_secrets() {
        let env = BTreeMap::from([
            ("RCON_PASSWORD".to_string(), "hunter2".to_string()),
            ("API_TOKEN".to_string(), "t".to_string()),
            ("VERSION".to_string(), "1.20.1".to_string()),
        ]);
        let red = redact_env(&env);
        assert_eq!(red["RCON_PASSWORD"], "<redacted>");
        assert_eq!(red["API_TOKEN"], "<redacted>");
        assert_eq!(red["VERSION"], "1.20.1");
    }

    #[tokio::test]
    async fn provision_persists_a_stopped_record() {
        let root = temp_dir_for("proc-provision");
        let b = backend_at(&root);
        let inst = b.provision(&echo_request(&root, "tr")).await.unwrap();
        assert_eq!(inst.status, InstanceStatus::Stopped);
        assert_eq!(inst.backend, BackendKind::Process);
        assert_eq!(inst.label(LABEL_GAME), Some("generic"));

        let again = b.inspect(inst.id.as_str()).await.unwrap();
        assert_eq!(again.name, "tr");
        assert!(b.provision(&echo_request(&root, "tr")).await.is_err());

        let claims = b.claimed_ports().await.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].protocol, Protocol::Udp);
        assert!(b.rcon_address(&inst, 25575).await.is_none());
        tokio::fs::remove_dir_all(root).await.ok();
    }

    #[tokio::test]
    async fn console_pipe_round_trip_and_group_signal() {
        let root = temp_dir_for("proc-console");
        let b = backend_at(&root);
        b.provision(&echo_request(&root, "echo")).await.unwrap();
        b.start("echo").await.unwrap();
        assert!(wait_status(&b, "echo", InstanceStatus::Running).await);

        let out = b
            .attach_command("echo", "hello", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(out.contains("got hello"), "unexpected output: {out:?}");

        let run: RunInfo = read_json(&root.join("instances/echo").join(RUN_FILE))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.env["RCON_PASSWORD"], "<redacted>");

        b.signal("echo", StopSignal::Term).await.unwrap();
        assert!(wait_status(&b, "echo", InstanceStatus::Stopped).await);

        let logs = b.logs("echo", 100).await.unwrap();
        assert!(logs.iter().any(|l| l == "ready"));

        b.remove("echo").await.unwrap();
        assert!(b.inspect("echo").await.unwrap_err().is_not_found());
        tokio::fs::remove_dir_all(root).await.ok();
    }

    #[tokio::test]
    async fn workload_output_bypasses_agent_pipes() {
        let root = temp_dir_for("proc-output-file");
        let b = backend_at(&root);
        let mut req = echo_request(&root, "detached");
        req.args = vec![
            "-c".to_string(),
            "echo to-out; echo to-err >&2; while read l; do :; done".to_string(),
        ];
        b.provision(&req).await.unwrap();
        b.start("detached").await.unwrap();
        assert!(wait_status(&b, "detached", InstanceStatus::Running).await);

        let run: RunInfo = read_json(&root.join("instances/detached").join(RUN_FILE))
            .await
            .unwrap()
            .unwrap();
        let pid = run.pid.unwrap();
        for fd in [1, 2] {
            let target = std::fs::read_link(format!("/proc/{pid}/fd/{fd}")).unwrap();
            assert!(
                target.ends_with(Path::new(LOG_DIR).join(CONSOLE_OUT)),
                "fd {fd} -> {}",
                target.display()
            );
        }

        let mut seen = Vec::new();
        for _ in 0..30 {
            seen = b.logs("detached", 50).await.unwrap();
            if seen.iter().any(|l| l == "to-out") && seen.iter().any(|l| l == "to-err") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(seen.iter().any(|l| l == "to-out"), "{seen:?}");
        assert!(seen.iter().any(|l| l == "to-err"), "{seen:?}");

        b.signal("detached", StopSignal::Kill).await.unwrap();
        assert!(wait_status(&b, "detached", InstanceStatus::Stopped).await);
        b.remove("detached").await.unwrap();
        tokio::fs::remove_dir_all(root).await.ok();
    }

    #[tokio::test]
    async fn stopped_instance_rejects_console_writes() {
        let root = temp_dir_for("proc-stopped");
        let b = backend_at(&root);
        b.provision(&echo_request(&root, "idle")).await.unwrap();
        assert!(
            b.attach_command("idle", "list", Duration::from_millis(100))
                .await
                .is_err()
        );
        assert!(b.sample_stats("idle").await.is_err());
        b.signal("idle", StopSignal::Term).await.unwrap();
        tokio::fs::remove_dir_all(root).await.ok();
    }
}
