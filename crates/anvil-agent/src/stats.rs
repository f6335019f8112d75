use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use anvil_model::InstanceStats;
use tokio::sync::Mutex;

use crate::error::{Result, RuntimeError};

/// Cumulative CPU counters as reported by the backend, in nanoseconds (container) or clock
/// ticks (process). Only deltas between two samples of the same source are meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub total_usage: u64,
    pub system_usage: u64,
    pub online_cpus: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RawStatsSample {
    pub cpu: CpuCounters,
    /// Previous counters when the backend reports them alongside the current ones.
    pub precpu: Option<CpuCounters>,
    pub memory_usage: u64,
    /// Page cache / file-backed pages included in `memory_usage`.
    pub memory_cache: u64,
    pub memory_limit: u64,
    /// (rx_bytes, tx_bytes) per interface.
    pub networks: Vec<(u64, u64)>,
}

pub fn cpu_percent(prev: &CpuCounters, cur: &CpuCounters) -> f64 {
    let online = cur.online_cpus.max(1) as f64;
    let cpu_delta = cur.total_usage.saturating_sub(prev.total_usage) as f64;
    let system_delta = cur.system_usage.saturating_sub(prev.system_usage) as f64;
    if system_delta <= 0.0 || cpu_delta <= 0.0 {
        return 0.0;
    }
    let pct = (cpu_delta / system_delta) * online * 100.0;
    if pct.is_finite() {
        pct.clamp(0.0, 100.0 * online)
    } else {
        0.0
    }
}

/// Turns a raw sample into reported stats. Without a previous sample CPU is reported as 0.
pub fn compute_stats(
    sample: &RawStatsSample,
    previous: Option<&CpuCounters>,
    sampled_at_unix_ms: u64,
) -> InstanceStats {
    let prev = sample.precpu.as_ref().or(previous);
    let cpu_percent = prev
        .map(|p| cpu_percent(p, &sample.cpu))
        .unwrap_or(0.0);

    let used = sample.memory_usage.saturating_sub(sample.memory_cache);
    let memory_percent = if sample.memory_limit > 0 {
        (used as f64 / sample.memory_limit as f64 * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    let (rx, tx) = sample
        .networks
        .iter()
        .fold((0u64, 0u64), |(rx, tx), (r, t)| {
            (rx.saturating_add(*r), tx.saturating_add(*t))
        });

    InstanceStats {
        cpu_percent,
        online_cpus: sample.cpu.online_cpus.max(1),
        memory_usage_bytes: used,
        memory_limit_bytes: sample.memory_limit,
        memory_percent,
        network_rx_bytes: rx,
        network_tx_bytes: tx,
        sampled_at_unix_ms,
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

type Slot<V> = Arc<Mutex<Option<(Instant, V)>>>;

/// Per-key TTL cache. Concurrent readers of an expired key wait on the key's lock, so one
/// refresh serves all of them; different keys never contend.
pub struct TtlCache<V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<String, Slot<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn slot(&self, key: &str) -> Slot<V> {
        let mut slots = self.slots.lock().await;
        slots.entry(key.to_string()).or_default().clone()
    }

    pub async fn get_or_refresh<F, Fut>(&self, key: &str, refresh: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        self.get_within(key, None, refresh).await
    }

    /// Like `get_or_refresh`, with the caller's staleness bound in place of the default TTL.
    /// A zero bound always refreshes.
    pub async fn get_within<F, Fut>(
        &self,
        key: &str,
        max_age: Option<Duration>,
        refresh: F,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let ttl = max_age.unwrap_or(self.ttl);
        let slot = self.slot(key).await;
        let mut guard = slot.lock().await;
        if let Some((at, v)) = guard.as_ref()
            && self.clock.now().saturating_duration_since(*at) < ttl
        {
            return Ok(v.clone());
        }
        // Failures are not cached; the next reader retries.
        let v = refresh().await?;
        *guard = Some((self.clock.now(), v.clone()));
        Ok(v)
    }

    pub async fn invalidate(&self, key: &str) {
        self.slots.lock().await.remove(key);
    }

    pub async fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.slots.lock().await.retain(|k, _| keep(k));
    }
}

/// Stats sampling with the shared TTL cache and previous-sample tracking for backends that do
/// not report their own previous counters.
pub struct StatsCollector {
    cache: TtlCache<InstanceStats>,
    previous: Mutex<HashMap<String, CpuCounters>>,
}

impl StatsCollector {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: TtlCache::new(ttl, clock),
            previous: Mutex::new(HashMap::new()),
        }
    }

    /// `max_age` of `None` uses the collector's default TTL.
    pub async fn get<F, Fut>(
        &self,
        id: &str,
        max_age: Option<Duration>,
        sample: F,
    ) -> Result<InstanceStats>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RawStatsSample>>,
    {
        self.cache
            .get_within(id, max_age, || async {
                let raw = sample().await?;
                let prev = {
                    let mut map = self.previous.lock().await;
                    map.insert(id.to_string(), raw.cpu)
                };
                Ok::<_, RuntimeError>(compute_stats(&raw, prev.as_ref(), now_unix_ms()))
            })
            .await
    }

    pub async fn forget(&self, id: &str) {
        self.cache.invalidate(id).await;
        self.previous.lock().await.remove(id);
    }
}

pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
pub(crate) mod test_clock {
    use std::sync::Mutex;

    use super::*;

    pub(crate) struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            })
        }

        pub(crate) fn advance(&self, d: Duration) {
            let mut off = self.offset.lock().unwrap();
            *off += d;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::test_clock::ManualClock;
    use super::*;

    fn counters(total: u64, system: u64, cpus: u32) -> CpuCounters {
        CpuCounters {
            total_usage: total,
            system_usage: system,
            online_cpus: cpus,
        }
    }

    #[test]
    fn cpu_percent_uses_deltas_and_stays_in_bounds() {
        let prev = counters(1_000, 10_000, 4);
        let cur = counters(1_500, 12_000, 4);
        assert!((cpu_percent(&prev, &cur) - 100.0).abs() < 1e-9);

        // Counter anomalies must not exceed the theoretical ceiling.
        let cur = counters(100_000, 10_001, 4);
        assert_eq!(cpu_percent(&prev, &cur), 400.0);

        // Reset counters produce zero, not a negative value.
        let cur = counters(10, 5, 2);
        assert_eq!(cpu_percent(&prev, &cur), 0.0);
    }

    #[test]
    fn single_sample_is_not_a_percentage() {
        let raw = RawStatsSample {
            cpu: counters(5_000_000, 9_000_000, 2),
            memory_usage: 300,
            memory_cache: 100,
            memory_limit: 1000,
            networks: vec![(10, 20), (5, 1)],
            ..Default::default()
        };
        let stats = compute_stats(&raw, None, 0);
        assert_eq!(stats.cpu_percent, 0.0);
        assert_eq!(stats.memory_usage_bytes, 200);
        assert!((stats.memory_percent - 20.0).abs() < 1e-9);
        assert_eq!(stats.network_rx_bytes, 15);
        assert_eq!(stats.network_tx_bytes, 21);
    }

    #[tokio::test]
    async fn cache_serves_within_ttl_and_refreshes_after() {
        let clock = ManualClock::new();
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(3), clock.clone());
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let fetch = move || async move { Ok::<_, RuntimeError>(calls.fetch_add(1, Ordering::SeqCst) + 1) };

        assert_eq!(cache.get_or_refresh("a", fetch).await.unwrap(), 1);
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get_or_refresh("a", fetch).await.unwrap(), 1);
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get_or_refresh("a", fetch).await.unwrap(), 2);
        assert_eq!(cache.get_or_refresh("b", fetch).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn caller_bound_overrides_default_ttl() {
        let clock = ManualClock::new();
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(3), clock.clone());
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let fetch = move || async move { Ok::<_, RuntimeError>(calls.fetch_add(1, Ordering::SeqCst) + 1) };

        assert_eq!(cache.get_within("a", None, fetch).await.unwrap(), 1);
        clock.advance(Duration::from_millis(500));
        assert_eq!(cache.get_within("a", Some(Duration::from_millis(100)), fetch).await.unwrap(), 2);
        assert_eq!(cache.get_within("a", Some(Duration::ZERO), fetch).await.unwrap(), 3);
        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.get_within("a", Some(Duration::from_secs(60)), fetch).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn concurrent_pollers_share_one_sample() {
        let clock = ManualClock::new();
        let collector = Arc::new(StatsCollector::new(Duration::from_secs(3), clock));
        let samples = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let collector = collector.clone();
            let samples = samples.clone();
            handles.push(tokio::spawn(async move {
                collector
                    .get("mc", None, || async move {
                        samples.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, RuntimeError>(RawStatsSample {
                            cpu: counters(1, 1, 1),
                            ..Default::default()
                        })
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(samples.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn previous_sample_feeds_next_refresh() {
        let clock = ManualClock::new();
        let collector = StatsCollector::new(Duration::from_secs(1), clock.clone());
        let first = collector
            .get("p", None, || async {
                Ok::<_, RuntimeError>(RawStatsSample {
                    cpu: counters(100, 1_000, 2),
                    ..Default::default()
                })
            })
            .await
            .unwrap();
        assert_eq!(first.cpu_percent, 0.0);

        clock.advance(Duration::from_secs(2));
        let second = collector
            .get("p", None, || async {
                Ok::<_, RuntimeError>(RawStatsSample {
                    cpu: counters(200, 2_000, 2),
                    ..Default::default()
                })
            })
            .await
            .unwrap();
        assert!((second.cpu_percent - 20.0).abs() < 1e-9);
    }
}
