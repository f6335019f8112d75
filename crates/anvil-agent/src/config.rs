use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use anvil_model::BackendKind;

use crate::port_alloc::PortRange;

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;
const DEFAULT_DOCKER_IMAGE: &str = "itzg/minecraft-server:latest";

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
}

fn env_millis(name: &str, default_ms: u64, min: u64, max: u64) -> Duration {
    Duration::from_millis(
        env_u64(name)
            .map(|v| v.clamp(min, max))
            .unwrap_or(default_ms),
    )
}

/// Resolves `ANVIL_DATA_ROOT` to an absolute path. Missing directories are fine.
pub fn data_root_from_env() -> PathBuf {
    let raw = std::env::var("ANVIL_DATA_ROOT").unwrap_or_else(|_| "./data".to_string());
    let p = PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    std::fs::canonicalize(&abs).unwrap_or(abs)
}

/// Parses `8=/usr/lib/jvm/java-8,21=/opt/java/21` into major version -> JAVA_HOME.
pub(crate) fn parse_java_homes(raw: &str) -> BTreeMap<u32, PathBuf> {
    let mut out = BTreeMap::new();
    for part in raw.split(',') {
        let Some((major, path)) = part.split_once('=') else {
            continue;
        };
        let Ok(major) = major.trim().parse::<u32>() else {
            continue;
        };
        let path = path.trim();
        if path.is_empty() {
            continue;
        }
        out.insert(major, PathBuf::from(path));
    }
    out
}

#[derive(Debug, Clone)]
pub struct LogLimits {
    pub max_lines: usize,
    pub file_max_bytes: u64,
    pub file_max_files: usize,
}

impl Default for LogLimits {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_LOG_MAX_LINES,
            file_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            file_max_files: DEFAULT_LOG_FILE_MAX_FILES,
        }
    }
}

/// Process-wide agent settings, read once at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub backend: BackendKind,
    pub data_root: PathBuf,
    pub port_range: PortRange,
    pub stats_ttl: Duration,
    pub list_ttl: Duration,
    pub stop_timeout: Duration,
    pub stop_poll_interval: Duration,
    pub rcon_timeout: Duration,
    pub query_timeout: Duration,
    pub attach_timeout: Duration,
    pub health_interval: Duration,
    pub log_monitor_interval: Duration,
    pub docker_image: String,
    pub java_homes: BTreeMap<u32, PathBuf>,
    pub default_min_ram_mb: u64,
    pub default_max_ram_mb: u64,
    pub log_limits: LogLimits,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Container,
            data_root: PathBuf::from("./data"),
            port_range: PortRange::default(),
            stats_ttl: Duration::from_millis(3000),
            list_ttl: Duration::from_millis(1000),
            stop_timeout: Duration::from_secs(30),
            stop_poll_interval: Duration::from_secs(1),
            rcon_timeout: Duration::from_millis(3000),
            query_timeout: Duration::from_millis(3000),
            attach_timeout: Duration::from_millis(2000),
            health_interval: Duration::from_millis(5000),
            log_monitor_interval: Duration::from_millis(2000),
            docker_image: DEFAULT_DOCKER_IMAGE.to_string(),
            java_homes: BTreeMap::new(),
            default_min_ram_mb: 1024,
            default_max_ram_mb: 2048,
            log_limits: LogLimits::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let backend = std::env::var("ANVIL_RUNTIME")
            .ok()
            .and_then(|v| BackendKind::parse(&v))
            .unwrap_or(defaults.backend);

        let start = env_u16("ANVIL_PORT_RANGE_START")
            .filter(|v| *v >= 1024)
            .unwrap_or(defaults.port_range.start);
        let end = env_u16("ANVIL_PORT_RANGE_END")
            .filter(|v| *v >= start)
            .unwrap_or_else(|| defaults.port_range.end.max(start));

        let default_min_ram_mb = env_u64("ANVIL_DEFAULT_MIN_RAM_MB")
            .map(|v| v.clamp(128, 1024 * 1024))
            .unwrap_or(defaults.default_min_ram_mb);
        let default_max_ram_mb = env_u64("ANVIL_DEFAULT_MAX_RAM_MB")
            .map(|v| v.clamp(default_min_ram_mb, 1024 * 1024))
            .unwrap_or(defaults.default_max_ram_mb.max(default_min_ram_mb));

        Self {
            backend,
            data_root: data_root_from_env(),
            port_range: PortRange { start, end },
            stats_ttl: env_millis("ANVIL_STATS_TTL_MS", 3000, 250, 60_000),
            list_ttl: env_millis("ANVIL_LIST_TTL_MS", 1000, 0, 60_000),
            stop_timeout: Duration::from_secs(
                env_u64("ANVIL_STOP_TIMEOUT_SEC")
                    .map(|v| v.clamp(1, 600))
                    .unwrap_or(30),
            ),
            stop_poll_interval: env_millis("ANVIL_STOP_POLL_MS", 1000, 50, 10_000),
            rcon_timeout: env_millis("ANVIL_RCON_TIMEOUT_MS", 3000, 100, 60_000),
            query_timeout: env_millis("ANVIL_QUERY_TIMEOUT_MS", 3000, 100, 60_000),
            attach_timeout: env_millis("ANVIL_ATTACH_TIMEOUT_MS", 2000, 100, 60_000),
            health_interval: env_millis("ANVIL_HEALTH_INTERVAL_MS", 5000, 250, 10 * 60 * 1000),
            log_monitor_interval: env_millis(
                "ANVIL_LOG_MONITOR_INTERVAL_MS",
                2000,
                250,
                10 * 60 * 1000,
            ),
            docker_image: std::env::var("ANVIL_DOCKER_IMAGE")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.docker_image),
            java_homes: std::env::var("ANVIL_JAVA_HOMES")
                .map(|v| parse_java_homes(&v))
                .unwrap_or_default(),
            default_min_ram_mb,
            default_max_ram_mb,
            log_limits: LogLimits {
                max_lines: env_usize("ANVIL_LOG_MAX_LINES")
                    .map(|v| v.clamp(100, 50_000))
                    .unwrap_or(DEFAULT_LOG_MAX_LINES),
                file_max_bytes: env_u64("ANVIL_LOG_FILE_MAX_BYTES")
                    .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
                    .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES),
                file_max_files: env_usize("ANVIL_LOG_FILE_MAX_FILES")
                    .map(|v| v.clamp(1, 20))
                    .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES),
            },
        }
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.data_root.join("instances")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn java_homes_skip_malformed_entries() {
        let homes = parse_java_homes("8=/opt/java8, 21 = /opt/java21 ,x=/nope,17=,=/empty");
        assert_eq!(homes.len(), 2);
        assert_eq!(homes.get(&8), Some(&PathBuf::from("/opt/java8")));
        assert_eq!(homes.get(&21), Some(&PathBuf::from("/opt/java21")));
    }

    #[test]
    fn defaults_are_consistent() {
        let cfg = AgentConfig::default();
        assert!(cfg.port_range.start <= cfg.port_range.end);
        assert!(cfg.default_min_ram_mb <= cfg.default_max_ram_mb);
        assert_eq!(cfg.stop_poll_interval, Duration::from_secs(1));
    }
}
