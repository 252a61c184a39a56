use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{stream, StreamExt};
use url::Url;

use crate::errors::{Error, Result};
use crate::proxy::Proto;
use crate::resolver::Resolver;

/// How many judges are probed at once during startup.
const PROBE_CONCURRENCY: usize = 5;

/// Header tokens that give a proxy away. The startup probe records how often
/// each occurs in the judge's direct response so the checker only counts
/// occurrences a proxy itself introduced.
pub const PROXY_INDICATORS: &[&str] = &["via", "x-forwarded-for", "forwarded", "proxy-connection"];

/// The scheme family a judge can vouch for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeScheme {
    Http,
    Https,
    Smtp,
}

impl JudgeScheme {
    /// Family of judges needed to validate `proto`.
    pub fn for_proto(proto: Proto) -> Self {
        match proto {
            Proto::Https => JudgeScheme::Https,
            Proto::Connect25 => JudgeScheme::Smtp,
            _ => JudgeScheme::Http,
        }
    }

    fn index(&self) -> usize {
        match self {
            JudgeScheme::Http => 0,
            JudgeScheme::Https => 1,
            JudgeScheme::Smtp => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JudgeScheme::Http => "HTTP",
            JudgeScheme::Https => "HTTPS",
            JudgeScheme::Smtp => "SMTP",
        }
    }
}

impl fmt::Display for JudgeScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An external endpoint that echoes request headers and the observed client
/// IP. SMTP judges are only connect targets and are trusted blindly.
#[derive(Debug, Clone)]
pub struct Judge {
    pub url: Url,
    pub host: String,
    pub scheme: JudgeScheme,
    pub ip_address: Option<IpAddr>,
    pub is_working: bool,
    pub verify_ssl: bool,
    pub timeout: Duration,
    pub marks: BTreeMap<String, usize>,
}

impl Judge {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::Judge {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let scheme = match url.scheme() {
            "http" => JudgeScheme::Http,
            "https" => JudgeScheme::Https,
            "smtp" => JudgeScheme::Smtp,
            other => {
                return Err(Error::Judge {
                    url: url.to_string(),
                    reason: format!("unsupported judge scheme {}", other),
                })
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::Judge {
                url: url.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_string();

        let mut marks = BTreeMap::new();
        for token in PROXY_INDICATORS {
            marks.insert(token.to_string(), 0);
        }

        Ok(Judge {
            url,
            host,
            scheme,
            ip_address: None,
            is_working: false,
            verify_ssl: false,
            timeout: Duration::from_secs(8),
            marks,
        })
    }

    /// Probes the judge directly (no proxy). A working judge resolves,
    /// answers 2xx and echoes our external IP; the indicator baseline is
    /// recorded from the body.
    pub async fn check_host(&mut self, resolver: &Resolver, ext_ip: IpAddr) -> bool {
        if self.scheme == JudgeScheme::Smtp {
            self.is_working = true;
            return true;
        }

        let ip = match resolver.resolve(&self.host).await {
            Ok(ip) => ip,
            Err(e) => {
                log::debug!("{} did not resolve: {}", self, e);
                return false;
            }
        };
        self.ip_address = Some(ip);

        let client = match reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(!self.verify_ssl)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                log::debug!("{}: {}", self, e);
                return false;
            }
        };

        match client.get(self.url.clone()).send().await {
            Ok(response) if response.status().is_success() => {
                if let Ok(page) = response.text().await {
                    let page = page.to_lowercase();
                    self.is_working = page.contains(&ext_ip.to_string().to_lowercase());
                    for token in PROXY_INDICATORS {
                        self.marks
                            .insert(token.to_string(), page.matches(token).count());
                    }
                }
            }
            Ok(response) => log::debug!("{} answered {}", self, response.status()),
            Err(e) => log::debug!("{}: {}", self, e),
        }

        if self.is_working {
            log::debug!("{} is working", self);
        } else {
            log::debug!("{} is not working", self);
        }
        self.is_working
    }
}

impl fmt::Display for Judge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Judge [{}] {}>", self.scheme, self.host)
    }
}

/// The built-in judge endpoints.
pub fn default_judges() -> Vec<Judge> {
    [
        "http://httpheader.net/azenv.php",
        "http://httpbin.org/get?show_env",
        "https://httpbin.org/get?show_env",
        "https://www.proxy-listen.de/azenv.php",
        "http://azenv.net/",
        "https://httpheader.net/azenv.php",
        "http://mojeip.net.pl/asdfa/azenv.php",
        "http://proxyjudge.us",
        "http://pascal.hoez.free.fr/azenv.php",
        "smtp://smtp.gmail.com",
        "smtp://aspmx.l.google.com",
    ]
    .iter()
    .filter_map(|url| Judge::new(url).ok())
    .collect()
}

/// Working judges grouped by scheme family, handed out round-robin.
#[derive(Debug)]
pub struct JudgeSet {
    by_family: [Vec<Judge>; 3],
    cursors: [AtomicUsize; 3],
}

impl JudgeSet {
    /// Probes `judges` and keeps the working ones. Fails fast when a family
    /// needed by `expected_types` ends up empty: checking would only produce
    /// false negatives.
    pub async fn setup(
        judges: Vec<Judge>,
        resolver: &Resolver,
        ext_ip: IpAddr,
        verify_ssl: bool,
        expected_types: &[Proto],
    ) -> Result<Self> {
        let stime = tokio::time::Instant::now();
        let needed: Vec<JudgeScheme> = {
            let mut families = vec![];
            for proto in expected_types {
                let family = JudgeScheme::for_proto(*proto);
                if !families.contains(&family) {
                    families.push(family);
                }
            }
            families
        };

        let probed: Vec<Judge> = stream::iter(judges)
            .filter(|judge| {
                let keep = needed.contains(&judge.scheme);
                async move { keep }
            })
            .map(|mut judge| {
                judge.verify_ssl = verify_ssl;
                let resolver = resolver.clone();
                async move {
                    judge.check_host(&resolver, ext_ip).await;
                    judge
                }
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await;

        let mut by_family: [Vec<Judge>; 3] = Default::default();
        for judge in probed {
            if judge.is_working {
                by_family[judge.scheme.index()].push(judge);
            }
        }

        for family in &needed {
            if by_family[family.index()].is_empty() {
                return Err(Error::FatalConfig(format!(
                    "no working judges found for the {} scheme family",
                    family
                )));
            }
        }

        let total: usize = by_family.iter().map(|f| f.len()).sum();
        log::info!("{} judges added, Runtime {:?}", total, stime.elapsed());

        Ok(JudgeSet {
            by_family,
            cursors: Default::default(),
        })
    }

    /// Builds a set from already-probed judges, without network access.
    pub fn from_judges(judges: Vec<Judge>) -> Self {
        let mut by_family: [Vec<Judge>; 3] = Default::default();
        for judge in judges {
            by_family[judge.scheme.index()].push(judge);
        }
        JudgeSet {
            by_family,
            cursors: Default::default(),
        }
    }

    /// Next judge of the family, round-robin.
    pub fn next(&self, family: JudgeScheme) -> Option<Judge> {
        let judges = &self.by_family[family.index()];
        if judges.is_empty() {
            return None;
        }
        let n = self.cursors[family.index()].fetch_add(1, Ordering::Relaxed);
        Some(judges[n % judges.len()].clone())
    }

    pub fn available(&self, family: JudgeScheme) -> usize {
        self.by_family[family.index()].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn judge_scheme_from_url() {
        assert_eq!(
            Judge::new("http://azenv.net/").unwrap().scheme,
            JudgeScheme::Http
        );
        assert_eq!(
            Judge::new("https://httpbin.org/get").unwrap().scheme,
            JudgeScheme::Https
        );
        assert_eq!(
            Judge::new("smtp://smtp.gmail.com").unwrap().scheme,
            JudgeScheme::Smtp
        );
        assert!(Judge::new("ftp://example.com").is_err());
    }

    #[test]
    fn families_for_protocols() {
        assert_eq!(JudgeScheme::for_proto(Proto::Http), JudgeScheme::Http);
        assert_eq!(JudgeScheme::for_proto(Proto::Connect80), JudgeScheme::Http);
        assert_eq!(JudgeScheme::for_proto(Proto::Socks4), JudgeScheme::Http);
        assert_eq!(JudgeScheme::for_proto(Proto::Socks5), JudgeScheme::Http);
        assert_eq!(JudgeScheme::for_proto(Proto::Https), JudgeScheme::Https);
        assert_eq!(JudgeScheme::for_proto(Proto::Connect25), JudgeScheme::Smtp);
    }

    #[test]
    fn round_robin_cycles_through_family() {
        let judges = vec![
            Judge::new("http://one.example/azenv.php").unwrap(),
            Judge::new("http://two.example/azenv.php").unwrap(),
        ];
        let set = JudgeSet::from_judges(judges);

        let picks: Vec<String> = (0..4)
            .map(|_| set.next(JudgeScheme::Http).unwrap().host)
            .collect();
        assert_eq!(picks[0], "one.example");
        assert_eq!(picks[1], "two.example");
        assert_eq!(picks[2], "one.example");
        assert_eq!(picks[3], "two.example");
        assert!(set.next(JudgeScheme::Https).is_none());
    }
}
