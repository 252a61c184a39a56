use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::errors::{Error, Result};
use crate::utils::ttl_cache::TtlCache;

/// Lifetime of cached DNS answers.
const DNS_CACHE_TTL: Duration = Duration::from_secs(300);
const DNS_CACHE_CAPACITY: usize = 4096;

/// Endpoints that echo the caller's public IP in a bare text body.
const EXT_IP_HOSTS: &[&str] = &[
    "https://wtfismyip.com/text",
    "http://api.ipify.org/",
    "http://ipinfo.io/ip",
    "http://ipv4.icanhazip.com/",
    "http://myexternalip.com/raw",
    "http://ifconfig.io/ip",
];

/// Async DNS with a TTL cache, plus discovery of this host's external IP.
#[derive(Clone)]
pub struct Resolver {
    dns: Arc<TokioAsyncResolver>,
    cache: Arc<Mutex<TtlCache<String, IpAddr>>>,
    timeout: Duration,
}

impl Resolver {
    pub fn new() -> Self {
        let dns = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Resolver {
            dns: Arc::new(dns),
            cache: Arc::new(Mutex::new(TtlCache::new(DNS_CACHE_TTL, DNS_CACHE_CAPACITY))),
            timeout: Duration::from_secs(8),
        }
    }

    /// True when `host` is an IPv4 or IPv6 literal, so no DNS is needed.
    pub fn host_is_ip(host: &str) -> bool {
        host.parse::<IpAddr>().is_ok()
    }

    /// Resolves `host` to one IP. Literals pass through untouched; names go
    /// through DNS behind the cache.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        if let Some(ip) = self.cache.lock().get(&host.to_string()).copied() {
            log::trace!("host {} served from the dns cache", host);
            return Ok(ip);
        }

        let lookup = tokio::time::timeout(self.timeout, self.dns.lookup_ip(host))
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
            .map_err(|e| {
                log::debug!("failed to resolve {}: {}", host, e);
                Error::Resolve {
                    host: host.to_string(),
                }
            })?;

        match lookup.iter().next() {
            Some(ip) => {
                log::debug!("resolved host {}: {}", host, ip);
                self.cache.lock().insert(host.to_string(), ip);
                Ok(ip)
            }
            None => Err(Error::Resolve {
                host: host.to_string(),
            }),
        }
    }

    /// Public IP of the machine running us, learned from the first
    /// answering what's-my-IP endpoint. The set is shuffled so no single
    /// endpoint takes all the traffic.
    pub async fn get_real_ext_ip(&self) -> Result<IpAddr> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::FatalConfig(format!("http client: {}", e)))?;

        let mut hosts: Vec<&str> = EXT_IP_HOSTS.to_vec();
        hosts.shuffle(&mut rand::thread_rng());

        for host in hosts {
            match client.get(host).send().await {
                Ok(response) => match response.text().await {
                    Ok(body) => {
                        if let Ok(ip) = body.trim().parse::<IpAddr>() {
                            log::info!("external ip ({}) retrieved using {}", ip, host);
                            return Ok(ip);
                        }
                    }
                    Err(e) => log::debug!("{}: {}", host, e),
                },
                Err(e) => log::debug!("{}: {}", host, e),
            }
        }

        Err(Error::FatalConfig(
            "unable to determine the external IP address of this host".to_string(),
        ))
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
