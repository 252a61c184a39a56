use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::checker::Checker;
use crate::errors::Result;
use crate::geolite::GeoLookup;
use crate::judge::{default_judges, Judge, JudgeSet};
use crate::pool::{PoolConfig, ProxyPool};
use crate::providers::{default_providers, Candidate, Provider};
use crate::proxy::{Anonymity, Proto, Proxy};
use crate::resolver::Resolver;
use crate::server::{Server, ServerConfig};

/// Pause between grabbing cycles in serve mode.
pub const GRAB_PAUSE: Duration = Duration::from_secs(180);

/// The maximum number of providers that are scraped concurrently.
pub const MAX_CONCURRENT_PROVIDERS: usize = 3;

const CANDIDATE_QUEUE_BOUND: usize = 500;
const OUTPUT_QUEUE_BOUND: usize = 64;

/// Ceiling on the dedup set; past it candidates pass through unchecked
/// rather than grow memory without bound.
const MAX_TRACKED_UNIQUE: usize = 50_000;

#[derive(Debug, Clone, Default)]
pub struct GrabOptions {
    pub types: Vec<Proto>,
    /// 0 means unlimited.
    pub limit: usize,
    pub countries: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FindOptions {
    pub types: Vec<Proto>,
    /// 0 means unlimited.
    pub limit: usize,
    pub countries: Vec<String>,
    pub levels: Vec<Anonymity>,
    /// Probe judges with POST instead of GET.
    pub post: bool,
    /// Only emit proxies that validated every requested type, not just one.
    pub strict: bool,
    pub verify_ssl: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            types: vec![Proto::Http, Proto::Https],
            limit: 0,
            countries: vec![],
            levels: vec![],
            post: false,
            strict: false,
            verify_ssl: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    /// Pool level under which the next grab cycle starts.
    pub min_queue: usize,
    pub find: FindOptions,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            min_queue: 5,
            find: FindOptions::default(),
        }
    }
}

/// Orchestrates providers, dedup, resolution, checking and publication,
/// either to a consumer channel (`grab`/`find`) or into a pool drained by
/// the rotating server (`serve`).
pub struct Broker {
    resolver: Resolver,
    geo: Arc<GeoLookup>,
    providers: Vec<Arc<dyn Provider>>,
    judges: Vec<Judge>,
    ext_ip: Mutex<Option<IpAddr>>,
    pub timeout: Duration,
    pub max_conn: usize,
    pub max_tries: usize,
    unique: Arc<Mutex<HashSet<(String, u16)>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    server: Mutex<Option<Arc<Server>>>,
}

impl Broker {
    pub fn new(resolver: Resolver) -> Self {
        Broker {
            resolver,
            geo: Arc::new(GeoLookup::open()),
            providers: default_providers(),
            judges: default_judges(),
            ext_ip: Mutex::new(None),
            timeout: Duration::from_secs(8),
            max_conn: 200,
            max_tries: 3,
            unique: Arc::new(Mutex::new(HashSet::new())),
            tasks: Mutex::new(vec![]),
            server: Mutex::new(None),
        }
    }

    /// Replaces the built-in provider set.
    pub fn with_providers(mut self, providers: Vec<Arc<dyn Provider>>) -> Self {
        self.providers = providers;
        self
    }

    /// Replaces the built-in judge endpoints.
    pub fn with_judges(mut self, judges: Vec<Judge>) -> Self {
        self.judges = judges;
        self
    }

    /// Pins the external IP instead of discovering it at startup.
    pub fn with_ext_ip(self, ip: IpAddr) -> Self {
        *self.ext_ip.lock() = Some(ip);
        self
    }

    /// Scrape, dedup, resolve and emit without checking. The channel closes
    /// when `limit` proxies were emitted or every provider is exhausted.
    pub async fn grab(&self, opts: GrabOptions) -> mpsc::Receiver<Proxy> {
        let (cand_tx, cand_rx) = mpsc::channel(CANDIDATE_QUEUE_BOUND);
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_QUEUE_BOUND);

        self.spawn_provider_cycle(cand_tx);
        let task = tokio::spawn(Self::funnel(
            cand_rx,
            out_tx,
            self.resolver.clone(),
            Arc::clone(&self.geo),
            Arc::clone(&self.unique),
            opts,
            self.timeout,
        ));
        self.tasks.lock().push(task);
        out_rx
    }

    /// As `grab`, then validate through the checker; only proxies with at
    /// least one surviving scheme are emitted.
    pub async fn find(&self, opts: FindOptions) -> Result<mpsc::Receiver<Proxy>> {
        let checker = Arc::new(self.build_checker(&opts).await?);
        let grab_rx = self
            .grab(GrabOptions {
                types: opts.types.clone(),
                limit: 0,
                countries: opts.countries.clone(),
            })
            .await;

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_QUEUE_BOUND);
        let task = tokio::spawn(Self::check_stage(
            grab_rx,
            out_tx,
            checker,
            self.max_conn,
            opts.limit,
        ));
        self.tasks.lock().push(task);
        Ok(out_rx)
    }

    /// Starts the rotating server and keeps its pool refilled with checked
    /// proxies. Runs until `stop`.
    pub async fn serve(&self, opts: ServeOptions) -> Result<SocketAddr> {
        let checker = Arc::new(self.build_checker(&opts.find).await?);
        let pool = Arc::new(ProxyPool::with_config(PoolConfig {
            min_queue: opts.min_queue,
            ..PoolConfig::default()
        }));
        let server = Arc::new(Server::with_config(
            &opts.host,
            opts.port,
            Arc::clone(&pool),
            self.resolver.clone(),
            ServerConfig {
                timeout: self.timeout,
                max_tries: self.max_tries,
                ..ServerConfig::default()
            },
        ));
        let addr = server.start().await?;
        *self.server.lock() = Some(Arc::clone(&server));

        let providers = self.providers.clone();
        let resolver = self.resolver.clone();
        let geo = Arc::clone(&self.geo);
        let unique = Arc::clone(&self.unique);
        let find_opts = opts.find.clone();
        let min_queue = opts.min_queue;
        let max_conn = self.max_conn;
        let timeout = self.timeout;

        let task = tokio::spawn(async move {
            loop {
                let (cand_tx, cand_rx) = mpsc::channel(CANDIDATE_QUEUE_BOUND);
                let (proxy_tx, proxy_rx) = mpsc::channel(OUTPUT_QUEUE_BOUND);

                let scrape = {
                    let providers = providers.clone();
                    tokio::spawn(async move {
                        Self::run_providers(providers, cand_tx).await;
                    })
                };
                let funnel = tokio::spawn(Self::funnel(
                    cand_rx,
                    proxy_tx,
                    resolver.clone(),
                    Arc::clone(&geo),
                    Arc::clone(&unique),
                    GrabOptions {
                        types: find_opts.types.clone(),
                        limit: 0,
                        countries: find_opts.countries.clone(),
                    },
                    timeout,
                ));

                Self::check_into_pool(proxy_rx, Arc::clone(&pool), Arc::clone(&checker), max_conn)
                    .await;
                let _ = scrape.await;
                let _ = funnel.await;

                log::debug!("grab cycle finished, pool holds {} proxies", pool.len());

                let cycle_end = tokio::time::Instant::now();
                while pool.len() >= min_queue {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                tokio::time::sleep_until(cycle_end + GRAB_PAUSE).await;
            }
        });
        self.tasks.lock().push(task);
        Ok(addr)
    }

    /// Cancels every pending fetch, check and the server; drains the dedup
    /// set. Calling it twice is the same as once.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(server) = self.server.lock().take() {
            server.stop();
        }
        self.unique.lock().clear();
        log::debug!("broker stopped");
    }

    async fn build_checker(&self, opts: &FindOptions) -> Result<Checker> {
        // The external IP is discovered once and reused across cycles;
        // failure here is fatal for checking.
        let pinned = *self.ext_ip.lock();
        let ext_ip = match pinned {
            Some(ip) => ip,
            None => {
                let ip = self.resolver.get_real_ext_ip().await?;
                *self.ext_ip.lock() = Some(ip);
                ip
            }
        };
        let judges = JudgeSet::setup(
            self.judges.clone(),
            &self.resolver,
            ext_ip,
            opts.verify_ssl,
            &opts.types,
        )
        .await?;

        let mut checker = Checker::new(ext_ip, Arc::new(judges), opts.types.clone());
        checker.timeout = self.timeout;
        checker.max_tries = self.max_tries;
        checker.expected_levels = opts.levels.clone();
        checker.strict = opts.strict;
        if opts.post {
            checker.method = "POST".to_string();
        }
        Ok(checker)
    }

    fn spawn_provider_cycle(&self, cand_tx: mpsc::Sender<Candidate>) {
        let providers = self.providers.clone();
        let task = tokio::spawn(async move {
            Self::run_providers(providers, cand_tx).await;
        });
        self.tasks.lock().push(task);
    }

    /// Fetches every provider once, at most `MAX_CONCURRENT_PROVIDERS` at a
    /// time. Candidates of one provider keep their source order.
    async fn run_providers(providers: Vec<Arc<dyn Provider>>, cand_tx: mpsc::Sender<Candidate>) {
        stream::iter(providers)
            .for_each_concurrent(MAX_CONCURRENT_PROVIDERS, |provider| {
                let tx = cand_tx.clone();
                async move {
                    for candidate in provider.fetch().await {
                        if tx.send(candidate).await.is_err() {
                            break;
                        }
                    }
                }
            })
            .await;
    }

    /// Dedup, resolve, tag geo and country-filter candidates into proxies.
    async fn funnel(
        mut cand_rx: mpsc::Receiver<Candidate>,
        out_tx: mpsc::Sender<Proxy>,
        resolver: Resolver,
        geo: Arc<GeoLookup>,
        unique: Arc<Mutex<HashSet<(String, u16)>>>,
        opts: GrabOptions,
        timeout: Duration,
    ) {
        let mut emitted = 0usize;
        while let Some(candidate) = cand_rx.recv().await {
            if out_tx.is_closed() {
                break;
            }

            let ip = match resolver.resolve(&candidate.host).await {
                Ok(ip) => ip,
                Err(_) => {
                    log::debug!(
                        "dropping {}:{} from {}: unresolvable",
                        candidate.host,
                        candidate.port,
                        candidate.source
                    );
                    continue;
                }
            };

            if !Self::is_unique(&unique, ip.to_string(), candidate.port) {
                continue;
            }

            let hint = if candidate.expected_types.is_empty() {
                opts.types.clone()
            } else {
                candidate.expected_types.clone()
            };
            let mut proxy = match Proxy::new(&ip.to_string(), candidate.port, hint) {
                Ok(proxy) => proxy,
                Err(_) => continue,
            };
            proxy.timeout = timeout;
            proxy.geo = geo.country(ip);

            if !opts.countries.is_empty() && !opts.countries.contains(&proxy.geo.iso_code) {
                continue;
            }

            if out_tx.send(proxy).await.is_err() {
                break;
            }
            emitted += 1;
            if opts.limit > 0 && emitted >= opts.limit {
                break;
            }
        }
    }

    fn is_unique(unique: &Mutex<HashSet<(String, u16)>>, host: String, port: u16) -> bool {
        let mut set = unique.lock();
        if set.len() >= MAX_TRACKED_UNIQUE {
            return true;
        }
        set.insert((host, port))
    }

    /// Fans proxies out to checker tasks under the `max_conn` cap and
    /// forwards the validated ones.
    async fn check_stage(
        mut rx: mpsc::Receiver<Proxy>,
        out_tx: mpsc::Sender<Proxy>,
        checker: Arc<Checker>,
        max_conn: usize,
        limit: usize,
    ) {
        let sem = Arc::new(Semaphore::new(max_conn.max(1)));
        let emitted = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(mut proxy) => {
                        if out_tx.is_closed()
                            || (limit > 0 && emitted.load(Ordering::Relaxed) >= limit)
                        {
                            break;
                        }
                        let sem = Arc::clone(&sem);
                        let checker = Arc::clone(&checker);
                        let out = out_tx.clone();
                        let emitted = Arc::clone(&emitted);
                        workers.spawn(async move {
                            let _permit = match sem.acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => return,
                            };
                            if checker.check_proxy(&mut proxy).await {
                                let n = emitted.fetch_add(1, Ordering::Relaxed);
                                if limit == 0 || n < limit {
                                    let _ = out.send(proxy).await;
                                }
                            }
                        });
                    }
                    None => break,
                },
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
            }
        }

        while workers.join_next().await.is_some() {}
    }

    /// Serve-mode tail of the pipeline: validated proxies land in the pool.
    async fn check_into_pool(
        mut rx: mpsc::Receiver<Proxy>,
        pool: Arc<ProxyPool>,
        checker: Arc<Checker>,
        max_conn: usize,
    ) {
        let sem = Arc::new(Semaphore::new(max_conn.max(1)));
        let mut workers = JoinSet::new();

        while let Some(mut proxy) = rx.recv().await {
            let sem = Arc::clone(&sem);
            let checker = Arc::clone(&checker);
            let pool = Arc::clone(&pool);
            workers.spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if checker.check_proxy(&mut proxy).await {
                    pool.put(proxy);
                }
            });
            if workers.len() > 512 {
                workers.join_next().await;
            }
        }
        while workers.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_set_tracks_and_clears() {
        let unique = Arc::new(Mutex::new(HashSet::new()));
        assert!(Broker::is_unique(&unique, "1.2.3.4".into(), 8080));
        assert!(!Broker::is_unique(&unique, "1.2.3.4".into(), 8080));
        assert!(Broker::is_unique(&unique, "1.2.3.4".into(), 8081));
        assert!(Broker::is_unique(&unique, "5.6.7.8".into(), 8080));

        unique.lock().clear();
        assert!(Broker::is_unique(&unique, "1.2.3.4".into(), 8080));
    }
}
