//! The orchestration façade. One `RuntimeManager` is built at startup around the configured
//! backend; every public operation returns `Result<T, OpError>`.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anvil_model::{
    CommandOutcome, DeleteOutcome, InstanceEvent, InstanceStats, InstanceStatus, InstanceSummary,
    OpError, PlayerInfo, PlayerInfoSource, PortBinding, PortRequest, RamValue, ServerInstance,
    ServerSpec, StepOutcome, StopOutcome,
};
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};

use crate::backend::{ProvisionRequest, SharedBackend};
use crate::config::AgentConfig;
use crate::dispatch::CommandDispatcher;
use crate::error::{Result, RuntimeError};
use crate::layout::{DataLayout, remove_instance_dir, validate_name};
use crate::lifecycle::{self, StopPolicy};
use crate::metadata::{MetadataStore, ResourceQuota, ServerMetadata, merge_env, parse_ram_mb};
use crate::player_info::{self, ConsoleStage, LogScanStage, PlayerSource, StatusQueryStage};
use crate::port_alloc::{PortAllocator, PortSnapshot};
use crate::stats::{Clock, StatsCollector, SystemClock, TtlCache};
use crate::workload::{GameKind, image_for_java, managed_labels, parse_java_major, provisioning_env};

pub type OpResult<T> = std::result::Result<T, OpError>;

const LIST_KEY: &str = "all";
const EVENT_CAPACITY: usize = 256;
const MAX_LOG_TAIL: usize = 10_000;

/// Per-name async locks. Entries are never evicted; the set of names on one host is small.
#[derive(Default)]
struct NameLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NameLocks {
    async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let m = {
            let mut map = self.locks.lock().await;
            map.entry(name.to_string()).or_default().clone()
        };
        m.lock_owned().await
    }

    /// Both names, acquired in lexical order.
    async fn lock_pair(&self, a: &str, b: &str) -> (OwnedMutexGuard<()>, OwnedMutexGuard<()>) {
        if a <= b {
            let first = self.lock(a).await;
            let second = self.lock(b).await;
            (first, second)
        } else {
            let second = self.lock(b).await;
            let first = self.lock(a).await;
            (first, second)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    /// Falls back to the configured stop timeout.
    pub timeout: Option<Duration>,
    /// Escalate with SIGKILL instead of SIGTERM at the deadline.
    pub force: bool,
}

impl StopOptions {
    pub fn forced() -> Self {
        Self {
            timeout: None,
            force: true,
        }
    }
}

/// Settings applied through a stop/remove/re-provision cycle. `None` leaves a setting untouched;
/// the nested options clear the stored value when set to `Some(None)`.
#[derive(Debug, Clone, Default)]
pub struct ReprovisionOverrides {
    pub env: BTreeMap<String, String>,
    pub host_port: Option<u16>,
    pub min_ram_mb: Option<u64>,
    pub max_ram_mb: Option<u64>,
    pub java_version: Option<Option<String>>,
    pub custom_args: Option<Option<String>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceInfo {
    pub instance: ServerInstance,
    pub metadata: ServerMetadata,
    pub min_ram_mb: u64,
    pub max_ram_mb: u64,
    pub java_major: Option<u32>,
}

pub struct RuntimeManager {
    cfg: AgentConfig,
    backend: SharedBackend,
    metadata: MetadataStore,
    ports: PortAllocator,
    stats: StatsCollector,
    list_cache: TtlCache<Vec<ServerInstance>>,
    dispatcher: CommandDispatcher,
    locks: NameLocks,
    events: broadcast::Sender<InstanceEvent>,
}

impl RuntimeManager {
    pub fn new(cfg: AgentConfig, backend: SharedBackend) -> Self {
        Self::with_clock(cfg, backend, Arc::new(SystemClock))
    }

    pub fn with_clock(cfg: AgentConfig, backend: SharedBackend, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            metadata: MetadataStore::new(DataLayout::new(cfg.data_root.clone())),
            ports: PortAllocator::new(cfg.port_range),
            stats: StatsCollector::new(cfg.stats_ttl, clock.clone()),
            list_cache: TtlCache::new(cfg.list_ttl, clock),
            dispatcher: CommandDispatcher::new(cfg.rcon_timeout, cfg.attach_timeout),
            locks: NameLocks::default(),
            events,
            backend,
            cfg,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    fn layout(&self) -> &DataLayout {
        self.metadata.layout()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    /// No subscribers is not an error.
    pub(crate) fn emit(&self, event: InstanceEvent) {
        let _ = self.events.send(event);
    }

    fn emit_status(&self, name: &str, from: Option<InstanceStatus>, to: InstanceStatus) {
        if from != Some(to) {
            self.emit(InstanceEvent::StatusChanged {
                name: name.to_string(),
                from,
                to,
            });
        }
    }

    fn stop_policy(&self, opts: StopOptions) -> StopPolicy {
        StopPolicy {
            timeout: opts.timeout.unwrap_or(self.cfg.stop_timeout),
            poll_interval: self.cfg.stop_poll_interval,
            force: opts.force,
        }
    }

    fn quota_for(&self, meta: &ServerMetadata) -> ResourceQuota {
        ResourceQuota::from_metadata(meta, self.cfg.default_min_ram_mb, self.cfg.default_max_ram_mb)
    }

    async fn mutated(&self) {
        self.list_cache.invalidate(LIST_KEY).await;
    }

    async fn cached_list(&self) -> Result<Vec<ServerInstance>> {
        let backend = self.backend.clone();
        self.list_cache
            .get_or_refresh(LIST_KEY, || async move { backend.list().await })
            .await
    }

    async fn sample_stats(
        &self,
        inst: &ServerInstance,
        max_age: Option<Duration>,
    ) -> Result<InstanceStats> {
        let backend = self.backend.clone();
        let id = inst.id.as_str().to_string();
        self.stats
            .get(inst.id.as_str(), max_age, || async move {
                backend.sample_stats(&id).await
            })
            .await
    }

    /// Resolves a name or backend id to the instance's current state.
    async fn inspect(&self, id: &str) -> Result<ServerInstance> {
        self.backend.inspect(id.trim()).await
    }

    // ---- listing and read paths ----

    /// Every managed instance. A failed stats sample leaves that row's `stats` empty instead of
    /// failing the listing.
    pub async fn list(&self, with_stats: bool) -> OpResult<Vec<InstanceSummary>> {
        let instances = self.cached_list().await?;
        let mut out = Vec::with_capacity(instances.len());
        for instance in instances {
            let stats = if with_stats && instance.status.is_running() {
                match self.sample_stats(&instance, None).await {
                    Ok(s) => Some(s),
                    Err(e) => {
                        tracing::debug!(instance = %instance.name, error = %e, "list: stats unavailable");
                        None
                    }
                }
            } else {
                None
            };
            out.push(InstanceSummary { instance, stats });
        }
        Ok(out)
    }

    pub async fn get_info(&self, id: &str) -> OpResult<InstanceInfo> {
        let instance = self.inspect(id).await?;
        let metadata = match self.metadata.load(&instance.name).await {
            Ok(m) => m.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(instance = %instance.name, error = %e, "metadata unreadable, using defaults");
                ServerMetadata::default()
            }
        };
        let quota = self.quota_for(&metadata);
        let java_major = metadata.detected_java_version.or_else(|| {
            metadata
                .java_version
                .as_deref()
                .and_then(|v| parse_java_major(v).ok())
        });
        Ok(InstanceInfo {
            instance,
            min_ram_mb: quota.min_ram_mb,
            max_ram_mb: quota.max_ram_mb,
            java_major,
            metadata,
        })
    }

    pub async fn get_logs(&self, id: &str, tail: usize) -> OpResult<Vec<String>> {
        let inst = self.inspect(id).await?;
        let tail = tail.clamp(1, MAX_LOG_TAIL);
        Ok(self.backend.logs(inst.id.as_str(), tail).await?)
    }

    pub async fn get_stats(&self, id: &str) -> OpResult<InstanceStats> {
        self.get_stats_within(id, None).await
    }

    /// Serves a cached sample no older than `max_age`; `None` uses the configured stats TTL.
    pub async fn get_stats_within(
        &self,
        id: &str,
        max_age: Option<Duration>,
    ) -> OpResult<InstanceStats> {
        let inst = self.inspect(id).await?;
        if !inst.status.is_running() {
            return Err(RuntimeError::invalid("instance", format!("{} is not running", inst.name)).into());
        }
        Ok(self.sample_stats(&inst, max_age).await?)
    }

    /// Stats for every running instance, keyed by name. Shares the per-id cache with `get_stats`.
    pub async fn get_all_stats(&self) -> OpResult<BTreeMap<String, Option<InstanceStats>>> {
        self.get_all_stats_within(None).await
    }

    pub async fn get_all_stats_within(
        &self,
        max_age: Option<Duration>,
    ) -> OpResult<BTreeMap<String, Option<InstanceStats>>> {
        let instances = self.cached_list().await?;
        let mut out = BTreeMap::new();
        for inst in instances.iter().filter(|i| i.status.is_running()) {
            let stats = match self.sample_stats(inst, max_age).await {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::debug!(instance = %inst.name, error = %e, "stats unavailable");
                    None
                }
            };
            out.insert(inst.name.clone(), stats);
        }
        Ok(out)
    }

    pub async fn send_command(&self, id: &str, text: &str) -> OpResult<CommandOutcome> {
        let inst = self.inspect(id).await?;
        if !inst.status.is_running() {
            return Err(RuntimeError::invalid("instance", format!("{} is not running", inst.name)).into());
        }
        let outcome = self
            .dispatcher
            .dispatch(self.backend.as_ref(), &inst, text)
            .await?;
        tracing::info!(instance = %inst.name, tier = ?outcome.tier, "command sent");
        Ok(outcome)
    }

    /// Never fails for a running instance: exhausting every stage reports zero players.
    pub async fn get_player_info(&self, id: &str) -> OpResult<PlayerInfo> {
        let inst = self.inspect(id).await?;
        if !inst.status.is_running() {
            return Ok(PlayerInfo::unavailable());
        }
        Ok(player_info::resolve(&self.player_stages(&inst, true)).await)
    }

    /// Status query and log scan only; issues no console commands.
    pub(crate) async fn observe_players(&self, inst: &ServerInstance) -> PlayerInfo {
        player_info::resolve(&self.player_stages(inst, false)).await
    }

    fn player_stages<'a>(
        &'a self,
        inst: &'a ServerInstance,
        with_console: bool,
    ) -> Vec<Box<dyn PlayerSource + 'a>> {
        let kind = GameKind::of_instance(inst);
        let backend = self.backend.as_ref();

        let status_addr = if kind.supports_status_query() {
            inst.primary_host_port()
                .map(|p| SocketAddr::from(([127, 0, 0, 1], p)))
        } else {
            None
        };
        let mut stages: Vec<Box<dyn PlayerSource + 'a>> = vec![Box::new(StatusQueryStage {
            addr: status_addr,
            timeout: self.cfg.query_timeout,
        })];
        if with_console && let Some(command) = kind.list_command() {
            for source in [
                PlayerInfoSource::RemoteConsole,
                PlayerInfoSource::Attach,
                PlayerInfoSource::ProcessTable,
            ] {
                stages.push(Box::new(ConsoleStage {
                    source,
                    backend,
                    dispatcher: &self.dispatcher,
                    instance: inst,
                    command,
                }));
            }
        }
        stages.push(Box::new(LogScanStage {
            backend,
            instance: inst,
        }));
        stages
    }

    // ---- lifecycle ----

    pub async fn create(&self, spec: ServerSpec) -> OpResult<ServerInstance> {
        Ok(self.create_inner(spec, false).await?)
    }

    /// Adopts a data directory that already exists on disk, e.g. an imported world.
    pub async fn create_from_existing(
        &self,
        name: &str,
        mut spec: ServerSpec,
    ) -> OpResult<ServerInstance> {
        spec.name = name.to_string();
        Ok(self.create_inner(spec, true).await?)
    }

    async fn create_inner(&self, spec: ServerSpec, existing_dir: bool) -> Result<ServerInstance> {
        let name = validate_name(&spec.name)?;
        let _guard = self.locks.lock(&name).await;

        match self.backend.inspect(&name).await {
            Ok(_) => {
                return Err(RuntimeError::invalid(
                    "name",
                    format!("{name} already exists"),
                ));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let dir = self.layout().instance_dir(&name)?;
        let dir_existed = tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir());
        if existing_dir && !dir_existed {
            return Err(RuntimeError::invalid(
                "name",
                format!("no data directory at {}", dir.display()),
            ));
        }

        let kind = GameKind::of_spec(&spec);
        let (quota, warnings) = ResourceQuota::resolve(
            spec.min_ram.as_ref(),
            spec.max_ram.as_ref(),
            self.cfg.default_min_ram_mb,
            self.cfg.default_max_ram_mb,
        );
        for w in &warnings {
            tracing::warn!(instance = %name, "{w}");
        }

        let java_version = match spec.java_version.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => Some(parse_java_major(v)?.to_string()),
            _ => None,
        };

        let requests = if spec.ports.is_empty() {
            kind.default_ports()
        } else {
            spec.ports.clone()
        };
        let bindings = self
            .assign_ports(&requests, spec.preferred_host_port, spec.allow_port_fallback)
            .await?;

        if !dir_existed {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(RuntimeError::io(format!("create {}", dir.display())))?;
        }

        // Only an adopted directory keeps its recorded settings; a fresh create starts clean.
        let previous = self.metadata.load(&name).await?;
        let mut meta = if existing_dir {
            self.metadata.load_for_write(&name).await?
        } else {
            ServerMetadata::default()
        };
        meta.game = Some(kind.as_str().to_string());
        meta.server_type = spec.server_type.clone().or(meta.server_type.take());
        meta.version = spec.version.clone().or(meta.version.take());
        meta.loader_version = spec.loader_version.clone().or(meta.loader_version.take());
        if java_version.is_some() {
            meta.java_version = java_version.clone();
        }
        if spec.custom_args.is_some() {
            meta.custom_args = spec.custom_args.clone();
        }
        if spec.custom_id.is_some() {
            meta.custom_id = spec.custom_id.clone();
        }
        if spec.image.is_some() {
            meta.image = spec.image.clone();
        }
        if spec.command.is_some() {
            meta.command = spec.command.clone();
            meta.args = spec.args.clone();
        }
        merge_env(&mut meta.env_overrides, &spec.env);
        meta.host_port = bindings.first().and_then(|b| b.host_port);
        meta.ports = bindings.clone();
        meta.min_ram_mb = Some(quota.min_ram_mb);
        meta.max_ram_mb = Some(quota.max_ram_mb);

        let provisioned = match self.metadata.save(&name, &meta).await {
            Ok(()) => {
                self.provision_from_metadata(&name, &meta, bindings, &spec.labels)
                    .await
            }
            Err(e) => Err(e),
        };
        let inst = match provisioned {
            Ok(inst) => inst,
            Err(e) => {
                tracing::warn!(instance = %name, error = %e, "create failed, rolling back");
                self.rollback_create(&name, &dir, dir_existed, previous.as_ref())
                    .await;
                return Err(e);
            }
        };
        tracing::info!(instance = %name, id = %inst.id, game = kind.as_str(), "instance created");
        self.mutated().await;
        self.emit(InstanceEvent::Created { name: name.clone() });
        self.emit_status(&name, None, inst.status);

        let inst = if spec.auto_start {
            self.start_locked(inst).await?
        } else {
            inst
        };
        self.record_detected_java(&inst).await;
        Ok(inst)
    }

    /// Undoes the on-disk half of a create that never produced a resource.
    async fn rollback_create(
        &self,
        name: &str,
        dir: &Path,
        dir_existed: bool,
        previous: Option<&ServerMetadata>,
    ) {
        let res = match (dir_existed, previous) {
            (false, _) => remove_instance_dir(dir).await,
            (true, Some(m)) => self.metadata.save(name, m).await,
            (true, None) => self.metadata.remove(name).await,
        };
        if let Err(e) = res {
            tracing::warn!(instance = %name, error = %e, "create rollback incomplete");
        }
    }

    /// Host ports for `requests`. A stored or requested base that is no longer free is only
    /// abandoned when fallback is allowed.
    async fn assign_ports(
        &self,
        requests: &[PortRequest],
        preferred: Option<u16>,
        allow_fallback: bool,
    ) -> Result<Vec<PortBinding>> {
        let snapshot = self.port_snapshot(None).await?;
        self.ports
            .allocate_block(&snapshot, requests, preferred, allow_fallback)
    }

    /// Fresh host port state. The bindings of `releasing` count as free: that resource is
    /// about to be removed and recreated.
    async fn port_snapshot(&self, releasing: Option<&ServerInstance>) -> Result<PortSnapshot> {
        let claims = self.backend.claimed_ports().await?;
        let mut snapshot = PortSnapshot::capture(claims).await;
        if let Some(inst) = releasing {
            snapshot.release(&inst.name, &inst.ports);
        }
        Ok(snapshot)
    }

    fn image_for(&self, kind: GameKind, meta: &ServerMetadata) -> String {
        let base = meta
            .image
            .clone()
            .unwrap_or_else(|| self.cfg.docker_image.clone());
        match (kind.uses_java(), meta.java_version.as_deref().map(parse_java_major)) {
            (true, Some(Ok(major))) => image_for_java(&base, major),
            _ => base,
        }
    }

    async fn provision_from_metadata(
        &self,
        name: &str,
        meta: &ServerMetadata,
        ports: Vec<PortBinding>,
        extra_labels: &BTreeMap<String, String>,
    ) -> Result<ServerInstance> {
        let kind = GameKind::of_metadata(meta);
        let quota = self.quota_for(meta);
        let primary = ports.first().and_then(|b| b.host_port);
        let java_major = meta
            .java_version
            .as_deref()
            .and_then(|v| parse_java_major(v).ok());
        let req = ProvisionRequest {
            name: name.to_string(),
            kind,
            image: self.image_for(kind, meta),
            command: meta.command.clone(),
            args: meta.args.clone(),
            env: provisioning_env(kind, meta, quota, primary),
            labels: managed_labels(name, kind, extra_labels),
            ports,
            quota,
            instance_dir: self.layout().instance_dir(name)?,
            java_major,
            custom_args: meta.custom_args.clone(),
        };
        self.backend.provision(&req).await
    }

    /// Best-effort: a failed probe only costs the recorded value.
    async fn record_detected_java(&self, inst: &ServerInstance) {
        if !GameKind::of_instance(inst).uses_java() {
            return;
        }
        match self.backend.detect_java(inst.id.as_str()).await {
            Ok(Some(major)) => {
                if let Err(e) = self
                    .metadata
                    .update(&inst.name, |m| m.detected_java_version = Some(major))
                    .await
                {
                    tracing::warn!(instance = %inst.name, error = %e, "failed to record java version");
                } else {
                    tracing::info!(instance = %inst.name, java = major, "java runtime detected");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(instance = %inst.name, error = %e, "java detection failed");
            }
        }
    }

    pub async fn start(&self, id: &str) -> OpResult<ServerInstance> {
        let inst = self.inspect(id).await?;
        let _guard = self.locks.lock(&inst.name).await;
        let inst = self.inspect(&inst.name).await?;
        Ok(self.start_locked(inst).await?)
    }

    async fn start_locked(&self, inst: ServerInstance) -> Result<ServerInstance> {
        if inst.status.is_running() {
            return Ok(inst);
        }
        self.emit_status(&inst.name, Some(inst.status), InstanceStatus::Creating);
        self.backend.start(inst.id.as_str()).await?;
        let after = self.inspect(inst.id.as_str()).await?;
        tracing::info!(instance = %after.name, status = ?after.status, "instance started");
        self.stats.forget(inst.id.as_str()).await;
        self.mutated().await;
        self.emit_status(&after.name, Some(InstanceStatus::Creating), after.status);
        Ok(after)
    }

    pub async fn stop(&self, id: &str, opts: StopOptions) -> OpResult<StopOutcome> {
        let inst = self.inspect(id).await?;
        let _guard = self.locks.lock(&inst.name).await;
        let inst = self.inspect(&inst.name).await?;
        Ok(self.stop_locked(&inst, opts).await?)
    }

    async fn stop_locked(&self, inst: &ServerInstance, opts: StopOptions) -> Result<StopOutcome> {
        if inst.status.is_running() {
            self.emit_status(&inst.name, Some(inst.status), InstanceStatus::Stopping);
        }
        let outcome = lifecycle::stop_instance(
            self.backend.as_ref(),
            &self.dispatcher,
            inst,
            self.stop_policy(opts),
        )
        .await?;
        tracing::info!(
            instance = %inst.name,
            method = ?outcome.method,
            elapsed_ms = outcome.elapsed_ms,
            "instance stopped"
        );
        self.after_stop(inst, &outcome).await;
        Ok(outcome)
    }

    async fn after_stop(&self, inst: &ServerInstance, outcome: &StopOutcome) {
        self.stats.forget(inst.id.as_str()).await;
        self.mutated().await;
        if inst.status.is_running() {
            self.emit_status(&inst.name, Some(InstanceStatus::Stopping), outcome.status);
        }
    }

    /// Stop failures are logged and the start is attempted anyway.
    pub async fn restart(&self, id: &str) -> OpResult<ServerInstance> {
        let inst = self.inspect(id).await?;
        let _guard = self.locks.lock(&inst.name).await;
        let inst = self.inspect(&inst.name).await?;
        if let Err(e) = self.stop_locked(&inst, StopOptions::forced()).await {
            tracing::warn!(instance = %inst.name, error = %e, "restart: stop failed, starting anyway");
        }
        let inst = self.inspect(&inst.name).await?;
        Ok(self.start_locked(inst).await?)
    }

    pub async fn kill(&self, id: &str) -> OpResult<StopOutcome> {
        let inst = self.inspect(id).await?;
        let _guard = self.locks.lock(&inst.name).await;
        let inst = self.inspect(&inst.name).await?;
        let outcome =
            lifecycle::kill_instance(self.backend.as_ref(), &inst, self.cfg.stop_poll_interval)
                .await?;
        tracing::warn!(instance = %inst.name, "instance killed");
        self.after_stop(&inst, &outcome).await;
        Ok(outcome)
    }

    /// Removes the backend resource and the data directory. Each step reports on its own; an
    /// instance whose resource already vanished still has its directory cleaned up.
    pub async fn delete(&self, id: &str) -> OpResult<DeleteOutcome> {
        Ok(self.delete_inner(id.trim()).await?)
    }

    async fn delete_inner(&self, id: &str) -> Result<DeleteOutcome> {
        let found = match self.backend.inspect(id).await {
            Ok(inst) => Some(inst),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let name = match &found {
            Some(inst) => inst.name.clone(),
            None => validate_name(id)?,
        };
        let _guard = self.locks.lock(&name).await;

        let dir = self.layout().instance_dir(&name)?;
        let dir_exists = tokio::fs::symlink_metadata(&dir).await.is_ok();
        if found.is_none() && !dir_exists {
            return Err(RuntimeError::NotFound(id.to_string()));
        }

        let backend_step = match &found {
            None => StepOutcome::ok(),
            Some(_) => match self.remove_resource(&name).await {
                Ok(()) => StepOutcome::ok(),
                Err(e) => {
                    tracing::warn!(instance = %name, error = %e, "delete: backend removal failed");
                    StepOutcome::failed(e.to_string())
                }
            },
        };
        let directory = match remove_instance_dir(&dir).await {
            Ok(()) => StepOutcome::ok(),
            Err(e) => {
                tracing::warn!(instance = %name, error = %e, "delete: directory removal failed");
                StepOutcome::failed(e.to_string())
            }
        };

        if let Some(inst) = &found {
            self.stats.forget(inst.id.as_str()).await;
        }
        self.mutated().await;
        let outcome = DeleteOutcome {
            backend: backend_step,
            directory,
        };
        if outcome.backend.ok {
            self.emit(InstanceEvent::Deleted { name: name.clone() });
        }
        tracing::info!(instance = %name, complete = outcome.is_complete(), "instance deleted");
        Ok(outcome)
    }

    /// Kills whatever is still running, then removes the resource. Tolerates a resource that
    /// vanishes midway.
    async fn remove_resource(&self, name: &str) -> Result<()> {
        let inst = match self.backend.inspect(name).await {
            Ok(i) => i,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if inst.status.is_running() {
            lifecycle::kill_instance(self.backend.as_ref(), &inst, self.cfg.stop_poll_interval)
                .await?;
        }
        match self.backend.remove(inst.id.as_str()).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Graceful stop, then removal. Used by every recreate path.
    async fn teardown(&self, inst: &ServerInstance) -> Result<()> {
        if inst.status.is_running() {
            self.stop_locked(inst, StopOptions::forced()).await?;
        }
        match self.backend.remove(inst.id.as_str()).await {
            Err(e) if e.is_not_found() => {}
            other => other?,
        }
        self.stats.forget(inst.id.as_str()).await;
        Ok(())
    }

    /// Ports recorded for an instance, re-validated against the current host state with the
    /// instance's own bindings released. Runs before teardown so a conflict leaves the instance
    /// untouched.
    async fn reassign_ports(
        &self,
        inst: &ServerInstance,
        meta: &ServerMetadata,
        host_port: Option<u16>,
    ) -> Result<Vec<PortBinding>> {
        let requests: Vec<PortRequest> = if meta.ports.is_empty() {
            GameKind::of_metadata(meta).default_ports()
        } else {
            meta.ports
                .iter()
                .map(|b| PortRequest {
                    container_port: b.container_port,
                    protocol: b.protocol,
                })
                .collect()
        };
        let snapshot = self.port_snapshot(Some(inst)).await?;
        if let Some(port) = host_port {
            return self.ports.allocate_block(&snapshot, &requests, Some(port), false);
        }
        let stored = meta
            .ports
            .first()
            .and_then(|b| b.host_port)
            .or(meta.host_port);
        match self.ports.allocate_block(&snapshot, &requests, stored, false) {
            Ok(b) => Ok(b),
            Err(e @ RuntimeError::PortConflict(_)) => {
                tracing::warn!(
                    instance = %inst.name,
                    error = %e,
                    "stored host ports are taken, allocating new ones"
                );
                self.ports.allocate_block(&snapshot, &requests, None, true)
            }
            Err(e) => Err(e),
        }
    }

    /// Puts back the resource a failed recreate tore down, from the record it had before.
    /// Failures are logged; the caller reports the original error.
    async fn restore(
        &self,
        name: &str,
        previous: &ServerMetadata,
        inst: &ServerInstance,
        was_running: bool,
    ) {
        if let Err(e) = self.metadata.save(name, previous).await {
            tracing::error!(instance = %name, error = %e, "restore: metadata write failed");
        }
        let restored = match self.backend.inspect(name).await {
            Ok(existing) => Ok(existing),
            Err(e) if e.is_not_found() => match self.reassign_ports(inst, previous, None).await {
                Ok(ports) => {
                    self.provision_from_metadata(name, previous, ports, &inst.labels)
                        .await
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let restored = match restored {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(instance = %name, error = %e, "restore: instance could not be recreated");
                self.mutated().await;
                return;
            }
        };
        let restored = if was_running && !restored.status.is_running() {
            match self.start_locked(restored.clone()).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(instance = %name, error = %e, "restore: start failed");
                    restored
                }
            }
        } else {
            restored
        };
        tracing::warn!(instance = %name, status = ?restored.status, "previous configuration restored");
        self.mutated().await;
        self.emit_status(name, Some(InstanceStatus::Recreating), restored.status);
    }

    pub async fn rename(&self, old: &str, new: &str) -> OpResult<ServerInstance> {
        Ok(self.rename_inner(old.trim(), new).await?)
    }

    async fn rename_inner(&self, old: &str, new: &str) -> Result<ServerInstance> {
        let new = validate_name(new)?;
        let inst = self.inspect(old).await?;
        let old = inst.name.clone();
        if old == new {
            return Ok(inst);
        }
        let (_a, _b) = self.locks.lock_pair(&old, &new).await;

        match self.backend.inspect(&new).await {
            Ok(_) => {
                return Err(RuntimeError::invalid("name", format!("{new} already exists")));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let old_dir = self.layout().instance_dir(&old)?;
        let new_dir = self.layout().instance_dir(&new)?;
        if tokio::fs::symlink_metadata(&new_dir).await.is_ok() {
            return Err(RuntimeError::invalid(
                "name",
                format!("directory {} already exists", new_dir.display()),
            ));
        }

        let inst = self.inspect(&old).await?;
        let was_running = inst.status.is_running();
        let labels = inst.labels.clone();
        let previous = self.metadata.load_for_write(&old).await?;
        let ports = self.reassign_ports(&inst, &previous, None).await?;

        if let Err(e) = self.teardown(&inst).await {
            self.restore(&old, &previous, &inst, was_running).await;
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&old_dir, &new_dir).await {
            tracing::error!(instance = %old, error = %e, "rename: directory move failed, restoring");
            self.restore(&old, &previous, &inst, was_running).await;
            return Err(RuntimeError::io(format!(
                "rename {} to {}",
                old_dir.display(),
                new_dir.display()
            ))(e));
        }

        let mut meta = previous.clone();
        if !meta.previous_names.contains(&old) {
            meta.previous_names.push(old.clone());
        }
        meta.host_port = ports.first().and_then(|b| b.host_port);
        meta.ports = ports.clone();
        let provisioned = match self.metadata.save(&new, &meta).await {
            Ok(()) => {
                self.provision_from_metadata(&new, &meta, ports, &labels)
                    .await
            }
            Err(e) => Err(e),
        };
        let created = match provisioned {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(from = %old, to = %new, error = %e, "rename: provisioning failed, moving back");
                match tokio::fs::rename(&new_dir, &old_dir).await {
                    Ok(()) => self.restore(&old, &previous, &inst, was_running).await,
                    Err(mv) => {
                        tracing::error!(
                            instance = %old,
                            error = %mv,
                            dir = %new_dir.display(),
                            "rename: directory could not be moved back"
                        );
                    }
                }
                return Err(e);
            }
        };
        self.mutated().await;
        self.emit(InstanceEvent::Renamed {
            from: old.clone(),
            to: new.clone(),
        });
        tracing::info!(from = %old, to = %new, "instance renamed");

        if was_running {
            self.start_locked(created).await
        } else {
            Ok(created)
        }
    }

    /// Applies settings the backend cannot change in place: merge into metadata, stop and remove
    /// the resource, provision a new one from the same data directory, and start it again if it
    /// was running. Running it twice with the same overrides ends in the same state.
    pub async fn reprovision_with_overrides(
        &self,
        id: &str,
        overrides: ReprovisionOverrides,
    ) -> OpResult<ServerInstance> {
        let inst = self.inspect(id).await?;
        let _guard = self.locks.lock(&inst.name).await;
        Ok(self.reprovision_locked(&inst.name, overrides).await?)
    }

    async fn reprovision_locked(
        &self,
        name: &str,
        ov: ReprovisionOverrides,
    ) -> Result<ServerInstance> {
        let inst = self.inspect(name).await?;
        let was_running = inst.status.is_running();

        let previous = self.metadata.load_for_write(name).await?;
        let mut meta = previous.clone();
        merge_env(&mut meta.env_overrides, &ov.env);
        if let Some(v) = ov.min_ram_mb {
            meta.min_ram_mb = Some(v);
        }
        if let Some(v) = ov.max_ram_mb {
            meta.max_ram_mb = Some(v);
        }
        if let Some(j) = &ov.java_version {
            meta.java_version = j.clone();
            meta.detected_java_version = None;
        }
        if let Some(a) = &ov.custom_args {
            meta.custom_args = a.clone();
        }
        let ports = self.reassign_ports(&inst, &meta, ov.host_port).await?;
        meta.host_port = ports.first().and_then(|b| b.host_port);
        meta.ports = ports.clone();

        self.emit_status(name, Some(inst.status), InstanceStatus::Recreating);
        if let Err(e) = self.teardown(&inst).await {
            self.restore(name, &previous, &inst, was_running).await;
            return Err(e);
        }

        let provisioned = match self.metadata.save(name, &meta).await {
            Ok(()) => {
                self.provision_from_metadata(name, &meta, ports, &inst.labels)
                    .await
            }
            Err(e) => Err(e),
        };
        let created = match provisioned {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(instance = %name, error = %e, "reprovision failed, restoring previous configuration");
                self.restore(name, &previous, &inst, was_running).await;
                return Err(e);
            }
        };
        tracing::info!(
            instance = %name,
            id = %created.id,
            java = ?meta.java_version,
            custom_args = ?meta.custom_args,
            "instance reprovisioned"
        );
        self.mutated().await;

        let created = if was_running {
            self.start_locked(created).await?
        } else {
            self.emit_status(name, Some(InstanceStatus::Recreating), created.status);
            created
        };
        self.record_detected_java(&created).await;
        Ok(created)
    }

    /// Accepts `21`, `"1.8"` or `"17.0.2"`; stores the major version.
    pub async fn update_runtime_version(&self, id: &str, version: &str) -> OpResult<ServerInstance> {
        let major = parse_java_major(version)?;
        self.reprovision_with_overrides(
            id,
            ReprovisionOverrides {
                java_version: Some(Some(major.to_string())),
                ..Default::default()
            },
        )
        .await
    }

    /// Blank arguments clear the stored value.
    pub async fn update_custom_args(
        &self,
        id: &str,
        args: Option<&str>,
    ) -> OpResult<ServerInstance> {
        let args = args
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string);
        self.reprovision_with_overrides(
            id,
            ReprovisionOverrides {
                custom_args: Some(args),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn update_ram(
        &self,
        id: &str,
        min: Option<RamValue>,
        max: Option<RamValue>,
    ) -> OpResult<ServerInstance> {
        let parse = |field: &str, v: Option<RamValue>| -> Result<Option<u64>> {
            match v {
                None => Ok(None),
                Some(raw) => parse_ram_mb(&raw)
                    .map(Some)
                    .ok_or_else(|| RuntimeError::invalid(field, format!("{raw:?} is not a RAM amount"))),
            }
        };
        let min_ram_mb = parse("min_ram", min)?;
        let max_ram_mb = parse("max_ram", max)?;
        if let (Some(lo), Some(hi)) = (min_ram_mb, max_ram_mb)
            && lo > hi
        {
            return Err(RuntimeError::invalid("min_ram", "must not exceed max_ram").into());
        }
        self.reprovision_with_overrides(
            id,
            ReprovisionOverrides {
                min_ram_mb,
                max_ram_mb,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn update_env(
        &self,
        id: &str,
        env: BTreeMap<String, String>,
    ) -> OpResult<ServerInstance> {
        if let Some(k) = env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(RuntimeError::invalid("env", format!("bad variable name {k:?}")).into());
        }
        self.reprovision_with_overrides(
            id,
            ReprovisionOverrides {
                env,
                ..Default::default()
            },
        )
        .await
    }

    /// The new primary host port is strict: a taken port fails instead of falling back.
    pub async fn update_port(&self, id: &str, port: u16) -> OpResult<ServerInstance> {
        if port == 0 {
            return Err(RuntimeError::invalid("port", "must be 1-65535").into());
        }
        self.reprovision_with_overrides(
            id,
            ReprovisionOverrides {
                host_port: Some(port),
                ..Default::default()
            },
        )
        .await
    }
}
