use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use tokio::time::Instant;

use crate::errors::{Error, Result};
use crate::judge::{Judge, JudgeScheme, JudgeSet, PROXY_INDICATORS};
use crate::negotiators::{NegotiateTarget, Negotiator};
use crate::proxy::{Anonymity, Proto, Proxy};
use crate::utils::http::{get_headers, ResponseParser};

lazy_static! {
    static ref IP_RE: Regex = Regex::new(r"\d+\.\d+\.\d+\.\d+").unwrap();
}

/// Protocols are tried expensive-first so a CONNECT-only proxy is not
/// misfiled as plain HTTP.
const CHECK_ORDER: [Proto; 6] = [
    Proto::Connect80,
    Proto::Connect25,
    Proto::Socks5,
    Proto::Socks4,
    Proto::Https,
    Proto::Http,
];

/// Validates proxies against judges and grades their anonymity. One checker
/// is shared by all validation tasks; every mutation lands on the proxy.
#[derive(Debug)]
pub struct Checker {
    pub timeout: Duration,
    pub max_tries: usize,
    pub method: String,
    pub expected_types: Vec<Proto>,
    pub expected_levels: Vec<Anonymity>,
    /// A proxy passes only when every requested type validated.
    pub strict: bool,
    ext_ip: IpAddr,
    judges: Arc<JudgeSet>,
}

impl Checker {
    pub fn new(ext_ip: IpAddr, judges: Arc<JudgeSet>, expected_types: Vec<Proto>) -> Self {
        Checker {
            timeout: Duration::from_secs(8),
            max_tries: 3,
            method: "GET".to_string(),
            expected_types,
            expected_levels: vec![],
            strict: false,
            ext_ip,
            judges,
        }
    }

    /// Tries every requested protocol on the proxy and records the working
    /// ones in `proxy.types`. Returns whether at least one survived.
    pub async fn check_proxy(&self, proxy: &mut Proxy) -> bool {
        for proto in CHECK_ORDER {
            if !self.expected_types.contains(&proto) {
                continue;
            }
            // A provider hint narrows the schemes worth spending tries on.
            // Strict mode needs every requested type, so no narrowing there.
            if !self.strict
                && !proxy.expected_types.is_empty()
                && !proxy.expected_types.contains(&proto)
            {
                continue;
            }

            let mut outcome = None;
            for _ in 0..self.max_tries {
                match self.check_proto(proxy, proto).await {
                    Ok(level) => {
                        outcome = Some(level);
                        break;
                    }
                    Err(e) => {
                        log::debug!("{}:{} [{}] {}", proxy.host, proxy.port, proto, e);
                    }
                }
            }

            if let Some(level) = outcome {
                if proto == Proto::Http && !self.expected_levels.is_empty() {
                    match level {
                        Some(lvl) if self.expected_levels.contains(&lvl) => {}
                        _ => continue,
                    }
                }
                proxy.add_type(proto, level);
            }
        }

        proxy.close().await;
        proxy.set_negotiator_proto(None);
        if self.strict {
            self.expected_types
                .iter()
                .all(|proto| proxy.types().contains(*proto))
        } else {
            !proxy.types().is_empty()
        }
    }

    /// One validation attempt for one protocol: fresh stream, handshake and,
    /// for plain HTTP, a judge probe grading anonymity.
    async fn check_proto(&self, proxy: &mut Proxy, proto: Proto) -> Result<Option<Anonymity>> {
        let family = JudgeScheme::for_proto(proto);
        let judge = self.judges.next(family).ok_or_else(|| Error::Judge {
            url: family.to_string(),
            reason: "no working judges for this scheme family".to_string(),
        })?;

        proxy.set_negotiator_proto(Some(proto));
        proxy.log(&format!("Selected judge: {}", judge), None, None);
        proxy.timeout = self.timeout;
        proxy.connect().await?;

        let stime = Instant::now();
        let target = match proto {
            Proto::Https => NegotiateTarget::new(&judge.host, 443),
            Proto::Connect80 => NegotiateTarget::new(&judge.host, 80),
            Proto::Connect25 => NegotiateTarget::new(&judge.host, 25),
            Proto::Socks4 | Proto::Socks5 => {
                let ip = judge.ip_address.and_then(|ip| match ip {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                });
                NegotiateTarget {
                    host: judge.host.clone(),
                    ip,
                    port: 80,
                }
            }
            Proto::Http => NegotiateTarget::new(&judge.host, 80),
        };

        let ngtr = Negotiator::for_proto(proto);
        if let Err(e) = ngtr.negotiate(proxy, &target).await {
            proxy.close().await;
            return Err(e);
        }

        let result = match proto {
            Proto::Http => self.probe_judge(proxy, &judge).await.map(Some),
            // A 2xx CONNECT reply is the whole validation; nothing of the
            // client is visible past the tunnel.
            Proto::Https => Ok(Some(Anonymity::High)),
            _ => Ok(None),
        };
        proxy.close().await;

        match result {
            Ok(level) => {
                proxy.log("Request: success", Some(stime.elapsed()), None);
                Ok(level)
            }
            Err(e) => {
                proxy.log("Request: failed", None, Some("request_failed"));
                Err(e)
            }
        }
    }

    /// Issues a probe through the proxied stream and grades the echo.
    async fn probe_judge(&self, proxy: &mut Proxy, judge: &Judge) -> Result<Anonymity> {
        let mut path = judge.url.path().to_string();
        if let Some(query) = judge.url.query() {
            path = format!("{}?{}", path, query);
        }

        let request = self.build_raw_request(
            &judge.host,
            &path,
            Negotiator::for_proto(Proto::Http).use_full_path(),
            None,
        );
        proxy.send(request.as_bytes()).await?;
        let data = proxy.recv_all().await?;

        let response = ResponseParser::parse(data.as_slice());
        if response.status_code != Some(200) {
            return Err(Error::Judge {
                url: judge.url.to_string(),
                reason: format!(
                    "answered {} through the proxy",
                    response.status_code.unwrap_or(0)
                ),
            });
        }

        let content = response.body.to_lowercase();
        if !IP_RE.is_match(&content) {
            return Err(Error::Judge {
                url: judge.url.to_string(),
                reason: "echo carries no client IP".to_string(),
            });
        }

        Ok(self.classify_anonymity(&content, &judge.marks))
    }

    /// Anonymity from a judge echo. An IP leak beats everything; otherwise a
    /// proxy indicator (beyond the judge's direct-probe baseline) lowers the
    /// grade to Anonymous. Accepts JSON echoes (a `headers` object) and
    /// HTML/plaintext ones.
    pub fn classify_anonymity(&self, content: &str, marks: &BTreeMap<String, usize>) -> Anonymity {
        let content = content.to_lowercase();

        let leaked = IP_RE
            .find_iter(&content)
            .any(|m| m.as_str() == self.ext_ip.to_string());
        if leaked {
            return Anonymity::Transparent;
        }

        if let Ok(value) = serde_json::from_str::<serde_json::Value>(content.trim()) {
            if let Some(headers) = value.get("headers").and_then(|h| h.as_object()) {
                let indicator = headers
                    .keys()
                    .any(|k| PROXY_INDICATORS.contains(&k.to_lowercase().as_str()));
                return if indicator {
                    Anonymity::Anonymous
                } else {
                    Anonymity::High
                };
            }
        }

        let indicator = PROXY_INDICATORS.iter().any(|token| {
            let baseline = marks.get(*token).copied().unwrap_or(0);
            content.matches(token).count() > baseline
        });
        if indicator {
            Anonymity::Anonymous
        } else {
            Anonymity::High
        }
    }

    fn build_raw_request(
        &self,
        host: &str,
        path: &str,
        use_full_path: bool,
        data: Option<&str>,
    ) -> String {
        let mut request = if use_full_path {
            format!("{} http://{}{} HTTP/1.1\r\n", self.method, host, path)
        } else {
            format!("{} {} HTTP/1.1\r\n", self.method, path)
        };

        let (mut headers, _rv) = get_headers(true);
        let data = data.unwrap_or("");
        headers.insert("Host".to_string(), host.to_string());
        headers.insert("Connection".to_string(), "close".to_string());
        headers.insert("Content-Length".to_string(), data.len().to_string());
        if self.method == "POST" {
            headers.insert(
                "Content-Type".to_string(),
                "application/octet-stream".to_string(),
            );
        }
        for (k, v) in headers.iter() {
            request += format!("{}: {}\r\n", k, v).as_str();
        }
        request += "\r\n";
        request += data;

        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::JudgeSet;

    fn checker() -> Checker {
        let judges = Arc::new(JudgeSet::from_judges(vec![]));
        Checker::new("203.0.113.7".parse().unwrap(), judges, vec![Proto::Http])
    }

    fn no_marks() -> BTreeMap<String, usize> {
        BTreeMap::new()
    }

    #[test]
    fn high_when_nothing_leaks() {
        let c = checker();
        let body = "REMOTE_ADDR = 198.51.100.1\nHTTP_ACCEPT = */*";
        assert_eq!(c.classify_anonymity(body, &no_marks()), Anonymity::High);
    }

    #[test]
    fn indicator_header_lowers_to_anonymous() {
        let c = checker();
        let body = "REMOTE_ADDR = 198.51.100.1\nHTTP_VIA = 1.1 testproxy";
        assert_eq!(c.classify_anonymity(body, &no_marks()), Anonymity::Anonymous);
    }

    #[test]
    fn leaked_ip_is_transparent() {
        let c = checker();
        let body = "REMOTE_ADDR = 198.51.100.1\nHTTP_X_FORWARDED_FOR: 203.0.113.7";
        assert_eq!(
            c.classify_anonymity(body, &no_marks()),
            Anonymity::Transparent
        );
    }

    #[test]
    fn adding_indicators_never_raises_the_grade() {
        let c = checker();
        let clean = "REMOTE_ADDR = 198.51.100.1";
        let with_via = "REMOTE_ADDR = 198.51.100.1\nvia: 1.1 relay";
        let with_leak = "REMOTE_ADDR = 198.51.100.1\nx-forwarded-for: 203.0.113.7";

        let base = c.classify_anonymity(clean, &no_marks());
        let lowered = c.classify_anonymity(with_via, &no_marks());
        let lowest = c.classify_anonymity(with_leak, &no_marks());
        assert!(lowered <= base);
        assert!(lowest <= lowered);
        assert_eq!(base, Anonymity::High);
        assert_eq!(lowered, Anonymity::Anonymous);
        assert_eq!(lowest, Anonymity::Transparent);
    }

    #[test]
    fn json_echo_with_headers_object() {
        let c = checker();
        let clean = r#"{"origin": "198.51.100.1", "headers": {"Accept": "*/*"}}"#;
        let proxied = r#"{"origin": "198.51.100.1", "headers": {"Via": "1.1 relay"}}"#;
        assert_eq!(c.classify_anonymity(clean, &no_marks()), Anonymity::High);
        assert_eq!(
            c.classify_anonymity(proxied, &no_marks()),
            Anonymity::Anonymous
        );
    }

    #[test]
    fn marks_baseline_suppresses_static_page_text() {
        let c = checker();
        // The judge's own page always mentions "via" once.
        let mut marks = BTreeMap::new();
        marks.insert("via".to_string(), 1);

        let direct = "how to use via this judge\nREMOTE_ADDR = 198.51.100.1";
        assert_eq!(c.classify_anonymity(direct, &marks), Anonymity::High);

        let proxied = "how to use via this judge\nREMOTE_ADDR = 198.51.100.1\nhttp_via = relay";
        assert_eq!(c.classify_anonymity(proxied, &marks), Anonymity::Anonymous);
    }

    #[test]
    fn raw_request_shape() {
        let c = checker();
        let request = c.build_raw_request("judge.example", "/azenv.php", true, None);
        assert!(request.starts_with("GET http://judge.example/azenv.php HTTP/1.1\r\n"));
        assert!(request.contains("Host: judge.example\r\n"));
        assert!(request.contains("Connection: close\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }
}
