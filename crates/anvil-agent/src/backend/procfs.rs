//! `/proc` readers for locally spawned workloads.

#[cfg(target_os = "linux")]
use std::sync::OnceLock;

use crate::stats::CpuCounters;

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn page_size() -> u64 {
    4096
}

/// Fields after the `(comm)` column of `/proc/<pid>/stat`, which may itself contain spaces.
fn stat_fields(stat: &str) -> Option<Vec<&str>> {
    let end = stat.rfind(')')?;
    let rest = stat.get((end + 2)..)?;
    Some(rest.split_whitespace().collect())
}

/// (pgid, utime + stime) from a `/proc/<pid>/stat` line.
pub(crate) fn parse_stat(stat: &str) -> Option<(i32, u64)> {
    let parts = stat_fields(stat)?;
    let pgid: i32 = parts.get(2)?.parse().ok()?;
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some((pgid, utime.saturating_add(stime)))
}

/// (total jiffies, online cpus) from `/proc/stat`.
pub(crate) fn parse_system_stat(text: &str) -> Option<(u64, u32)> {
    let mut total = None;
    let mut cpus = 0u32;
    for line in text.lines() {
        let mut cols = line.split_whitespace();
        match cols.next() {
            Some("cpu") => {
                total = Some(cols.filter_map(|v| v.parse::<u64>().ok()).sum::<u64>());
            }
            Some(label) if label.starts_with("cpu") => cpus += 1,
            _ => {}
        }
    }
    Some((total?, cpus.max(1)))
}

/// Sums receive/transmit bytes over every interface in a `/proc/<pid>/net/dev` table.
pub(crate) fn parse_net_dev(text: &str) -> Vec<(u64, u64)> {
    text.lines()
        .skip(2)
        .filter_map(|line| {
            let (_, counters) = line.split_once(':')?;
            let cols: Vec<u64> = counters
                .split_whitespace()
                .filter_map(|v| v.parse().ok())
                .collect();
            Some((*cols.first()?, *cols.get(8)?))
        })
        .collect()
}

/// A `kB` value from `/proc/<pid>/status` or `/proc/meminfo`, in bytes.
pub(crate) fn parse_kb_field(text: &str, key: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb.saturating_mul(1024))
    })
}

pub(crate) async fn read_rss_bytes(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/statm"))
        .await
        .ok()?;
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

pub(crate) async fn read_rss_file_bytes(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()?;
    parse_kb_field(&s, "RssFile")
}

pub(crate) async fn read_cmdline(pid: u32) -> Option<String> {
    let raw = tokio::fs::read(format!("/proc/{pid}/cmdline")).await.ok()?;
    let joined = raw
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    Some(joined)
}

/// Pids whose process group is `pgid`, with their cpu ticks.
pub(crate) async fn group_members(pgid: i32) -> Vec<(u32, u64)> {
    let mut out = Vec::new();
    let Ok(mut rd) = tokio::fs::read_dir("/proc").await else {
        return out;
    };
    while let Ok(Some(entry)) = rd.next_entry().await {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await else {
            continue;
        };
        if let Some((g, ticks)) = parse_stat(&stat)
            && g == pgid
        {
            out.push((pid, ticks));
        }
    }
    out.sort_unstable_by_key(|(pid, _)| *pid);
    out
}

pub(crate) async fn system_counters() -> Option<(u64, u32)> {
    let s = tokio::fs::read_to_string("/proc/stat").await.ok()?;
    parse_system_stat(&s)
}

pub(crate) async fn mem_total_bytes() -> Option<u64> {
    let s = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
    parse_kb_field(&s, "MemTotal")
}

pub(crate) async fn net_counters(pid: u32) -> Vec<(u64, u64)> {
    match tokio::fs::read_to_string(format!("/proc/{pid}/net/dev")).await {
        Ok(s) => parse_net_dev(&s),
        Err(_) => Vec::new(),
    }
}

pub(crate) fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as i32, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Cumulative cpu counters of a whole process group.
pub(crate) async fn group_cpu(pgid: i32) -> Option<CpuCounters> {
    let members = group_members(pgid).await;
    if members.is_empty() {
        return None;
    }
    let (system_usage, online_cpus) = system_counters().await?;
    Some(CpuCounters {
        total_usage: members.iter().map(|(_, t)| *t).sum(),
        system_usage,
        online_cpus,
    })
}
