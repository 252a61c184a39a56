use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::errors::{Error, Result};
use crate::proxy::{Proxy, Scheme};

/// Penalty added to the priority of an entry that was popped but skipped for
/// not matching the requested scheme, so chronic mismatches drift down.
const REPUSH_PENALTY: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Requests a proxy needs before it is health-ranked.
    pub min_req_proxy: u32,
    /// Error-rate ceiling; crossing it discards the proxy for good.
    pub max_error_rate: f64,
    /// Average response time ceiling in seconds.
    pub max_resp_time: f64,
    /// Refill threshold consulted by the broker's serve loop.
    pub min_queue: usize,
    /// How long `get` waits for a proxy before giving up.
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_req_proxy: 5,
            max_error_rate: 0.5,
            max_resp_time: 8.0,
            min_queue: 5,
            wait_timeout: Duration::from_secs(5),
        }
    }
}

/// Established-tier entry. The heap is a max-heap, so the comparison is
/// reversed to pop the smallest `avg_resp_time` first; `seq` breaks ties by
/// insertion order.
#[derive(Debug)]
struct PoolEntry {
    key: f64,
    seq: u64,
    proxy: Proxy,
}

impl Ord for PoolEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .partial_cmp(&self.key)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PoolEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PoolEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PoolEntry {}

#[derive(Debug, Default)]
struct PoolInner {
    pool: BinaryHeap<PoolEntry>,
    newcomers: VecDeque<Proxy>,
}

/// Health-ranked selection structure with two tiers: a FIFO of newcomers
/// still earning a track record, and a min-heap of established proxies
/// ordered by average response time.
///
/// All state sits behind one mutex; `get` suspends on a notification that
/// `put` rings. A proxy is owned by exactly one holder at a time: taking it
/// out of the pool transfers ownership to the caller, `put` hands it back.
#[derive(Debug)]
pub struct ProxyPool {
    cfg: PoolConfig,
    inner: Mutex<PoolInner>,
    bell: Notify,
    seq: AtomicU64,
}

impl ProxyPool {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(cfg: PoolConfig) -> Self {
        ProxyPool {
            cfg,
            inner: Mutex::new(PoolInner::default()),
            bell: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.cfg
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.pool.len() + inner.newcomers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Files the proxy into its tier. Newcomers queue up FIFO; once past
    /// `min_req_proxy` requests a proxy is either health-ranked or, over
    /// either ceiling, permanently discarded.
    pub fn put(&self, proxy: Proxy) {
        let exceeded = proxy.error_rate() > self.cfg.max_error_rate
            || proxy.avg_resp_time() > self.cfg.max_resp_time;

        {
            let mut inner = self.inner.lock();
            if proxy.requests() < self.cfg.min_req_proxy {
                log::debug!("{} added to newcomers", proxy.as_text());
                inner.newcomers.push_back(proxy);
            } else if exceeded {
                log::debug!(
                    "{} removed from proxy pool (error rate {:.2}, avg resp {:.2}s)",
                    proxy.as_text(),
                    proxy.error_rate(),
                    proxy.avg_resp_time()
                );
            } else {
                log::debug!("{} added to pool", proxy.as_text());
                let entry = PoolEntry {
                    key: proxy.avg_resp_time(),
                    seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
                    proxy,
                };
                inner.pool.push(entry);
            }
        }
        self.bell.notify_waiters();
    }

    /// Takes the best proxy supporting `scheme`, waiting up to the
    /// configured timeout for one to arrive. Never blocks forever: a pool
    /// that stays empty yields `NoProxyAvailable`.
    pub async fn get(&self, scheme: Scheme) -> Result<Proxy> {
        let deadline = tokio::time::Instant::now() + self.cfg.wait_timeout;
        loop {
            let notified = self.bell.notified();
            if let Some(proxy) = self.try_take(scheme) {
                return Ok(proxy);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::NoProxyAvailable(self.cfg.wait_timeout));
            }
        }
    }

    fn try_take(&self, scheme: Scheme) -> Option<Proxy> {
        let mut inner = self.inner.lock();

        // Established tier first: pop best entries, skipping mismatches.
        // The scan is capped so recycling can never loop forever.
        let cap = 3 * inner.pool.len();
        let mut skipped = Vec::new();
        let mut taken = None;
        let mut popped = 0;
        while popped < cap {
            let entry = match inner.pool.pop() {
                Some(entry) => entry,
                None => break,
            };
            popped += 1;
            if entry.proxy.supports(scheme) {
                taken = Some(entry.proxy);
                break;
            }
            skipped.push(PoolEntry {
                key: entry.key + REPUSH_PENALTY,
                ..entry
            });
        }
        for entry in skipped {
            inner.pool.push(entry);
        }
        if taken.is_some() {
            return taken;
        }

        // Fall through to the newcomers FIFO, same bounded scan.
        for _ in 0..inner.newcomers.len() {
            match inner.newcomers.pop_front() {
                Some(proxy) if proxy.supports(scheme) => return Some(proxy),
                Some(proxy) => inner.newcomers.push_back(proxy),
                None => break,
            }
        }
        None
    }

    /// Removes the proxy from whichever tier holds it. Heap removal rebuilds
    /// the heap; O(n log n) is acceptable since removals are rare next to
    /// gets.
    pub fn remove(&self, host: &str, port: u16) -> Option<Proxy> {
        let mut inner = self.inner.lock();

        if let Some(pos) = inner
            .newcomers
            .iter()
            .position(|p| p.host == host && p.port == port)
        {
            return inner.newcomers.remove(pos);
        }

        let mut entries = std::mem::take(&mut inner.pool).into_vec();
        let pos = entries
            .iter()
            .position(|e| e.proxy.host == host && e.proxy.port == port);
        let removed = pos.map(|i| entries.swap_remove(i));
        inner.pool = entries.into_iter().collect();
        removed.map(|e| e.proxy)
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Proto;
    use std::sync::Arc;

    fn established(host: &str, avg: Duration, proto: Proto) -> Proxy {
        let mut proxy = Proxy::new(host, 8080, vec![]).unwrap();
        for _ in 0..5 {
            proxy.record_attempt();
        }
        proxy.log("Request: success", Some(avg), None);
        proxy.add_type(proto, None);
        proxy
    }

    fn newcomer(host: &str, proto: Proto) -> Proxy {
        let mut proxy = Proxy::new(host, 8080, vec![]).unwrap();
        proxy.add_type(proto, None);
        proxy
    }

    #[tokio::test]
    async fn get_returns_proxies_in_non_decreasing_avg_order() {
        let pool = ProxyPool::new();
        pool.put(established("10.0.0.2", Duration::from_millis(500), Proto::Http));
        pool.put(established("10.0.0.1", Duration::from_millis(200), Proto::Http));
        pool.put(established("10.0.0.3", Duration::from_millis(900), Proto::Http));

        let mut last = 0.0;
        for _ in 0..3 {
            let proxy = pool.get(Scheme::Http).await.unwrap();
            assert!(proxy.avg_resp_time() >= last);
            last = proxy.avg_resp_time();
        }
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn ties_break_by_insertion_order() {
        let pool = ProxyPool::new();
        pool.put(established("10.0.0.1", Duration::from_millis(300), Proto::Http));
        pool.put(established("10.0.0.2", Duration::from_millis(300), Proto::Http));

        assert_eq!(pool.get(Scheme::Http).await.unwrap().host, "10.0.0.1");
        assert_eq!(pool.get(Scheme::Http).await.unwrap().host, "10.0.0.2");
    }

    #[tokio::test]
    async fn newcomers_promote_once_seasoned() {
        let pool = ProxyPool::new();

        // Four requests: still a newcomer.
        let mut p = Proxy::new("10.0.0.9", 8080, vec![]).unwrap();
        p.add_type(Proto::Http, None);
        for _ in 0..4 {
            p.record_attempt();
        }
        p.log("Request: success", Some(Duration::from_millis(500)), None);
        pool.put(p);
        assert_eq!(pool.len(), 1);

        let mut p = pool.get(Scheme::Http).await.unwrap();
        assert_eq!(p.requests(), 4);

        // One more successful use crosses min_req_proxy.
        p.record_attempt();
        p.log("Request: success", Some(Duration::from_millis(500)), None);
        pool.put(p);

        // A fresh newcomer must not shadow the established proxy.
        pool.put(newcomer("10.0.0.10", Proto::Http));

        let first = pool.get(Scheme::Http).await.unwrap();
        assert_eq!(first.host, "10.0.0.9");
        let second = pool.get(Scheme::Http).await.unwrap();
        assert_eq!(second.host, "10.0.0.10");
    }

    #[tokio::test]
    async fn unhealthy_proxies_are_discarded() {
        let pool = ProxyPool::new();

        let mut p = Proxy::new("10.0.0.6", 8080, vec![]).unwrap();
        p.add_type(Proto::Http, None);
        for _ in 0..6 {
            p.record_attempt();
            p.log("Connection: timeout", None, Some("connection_timeout"));
        }
        pool.put(p);
        assert!(pool.is_empty());

        // Slow but seasoned: over the response-time ceiling.
        let slow = established("10.0.0.7", Duration::from_secs(20), Proto::Http);
        pool.put(slow);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn scheme_filter_recycles_mismatches() {
        let pool = ProxyPool::new();
        pool.put(established("10.0.0.1", Duration::from_millis(100), Proto::Http));
        pool.put(established("10.0.0.2", Duration::from_millis(200), Proto::Https));

        let https = pool.get(Scheme::Https).await.unwrap();
        assert_eq!(https.host, "10.0.0.2");

        // The skipped HTTP proxy is still there.
        assert_eq!(pool.len(), 1);
        let http = pool.get(Scheme::Http).await.unwrap();
        assert_eq!(http.host, "10.0.0.1");
    }

    #[tokio::test]
    async fn exhausted_pool_fails_within_the_wait_window() {
        let pool = ProxyPool::with_config(PoolConfig {
            wait_timeout: Duration::from_millis(100),
            ..Default::default()
        });

        let started = std::time::Instant::now();
        let result = pool.get(Scheme::Http).await;
        assert!(matches!(result, Err(Error::NoProxyAvailable(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn get_wakes_up_on_put() {
        let pool = Arc::new(ProxyPool::with_config(PoolConfig {
            wait_timeout: Duration::from_secs(5),
            ..Default::default()
        }));

        let writer = Arc::clone(&pool);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.put(newcomer("10.0.0.5", Proto::Http));
        });

        let proxy = pool.get(Scheme::Http).await.unwrap();
        assert_eq!(proxy.host, "10.0.0.5");
    }

    #[tokio::test]
    async fn heap_order_survives_removal() {
        let pool = ProxyPool::new();
        for (host, ms) in [
            ("10.0.0.1", 100),
            ("10.0.0.2", 200),
            ("10.0.0.3", 300),
            ("10.0.0.4", 400),
            ("10.0.0.5", 500),
        ] {
            pool.put(established(host, Duration::from_millis(ms), Proto::Http));
        }

        assert!(pool.remove("10.0.0.3", 8080).is_some());
        assert!(pool.remove("10.0.0.3", 8080).is_none());
        assert_eq!(pool.len(), 4);

        let mut hosts = vec![];
        let mut last = 0.0;
        while let Ok(proxy) = pool.get(Scheme::Http).await {
            assert!(proxy.avg_resp_time() >= last);
            last = proxy.avg_resp_time();
            hosts.push(proxy.host.clone());
            if pool.is_empty() {
                break;
            }
        }
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.4", "10.0.0.5"]);
    }
}
