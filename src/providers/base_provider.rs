use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;

use super::Candidate;
use crate::proxy::Proto;
use crate::utils::http::random_useragent;

lazy_static! {
    /// Plain `ip:port` lines, the format most list sites settle on.
    pub static ref IP_PORT_PATTERN: Regex =
        Regex::new(r"(?P<ip>(?:\d{1,3}\.){3}\d{1,3}):(?P<port>\d{2,5})").unwrap();
}

/// Shared plumbing of every provider: one HTTP client, page fetch that
/// degrades to an empty body, and a regex extractor.
#[derive(Debug, Clone)]
pub struct BaseProvider {
    pub domain: String,
    pub proto: Vec<Proto>,
    pub client: Client,
}

impl BaseProvider {
    pub fn new(domain: &str, proto: Vec<Proto>) -> Self {
        BaseProvider {
            domain: domain.to_string(),
            proto,
            client: Client::builder()
                .user_agent(random_useragent(false))
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn start(&self) {
        log::debug!("Try to get proxies from {}", self.domain);
    }

    pub async fn get_html(&self, url: &str) -> String {
        match self.client.get(url).send().await {
            Ok(response) => match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    log::debug!("{}: {}", self.domain, e);
                    String::new()
                }
            },
            Err(e) => {
                log::debug!("{}: {}", self.domain, e);
                String::new()
            }
        }
    }

    pub fn find_proxies(&self, pattern: &Regex, html: &str) -> Vec<Candidate> {
        let mut proxies = vec![];
        for cap in pattern.captures_iter(html) {
            let (ip, port) = match (cap.name("ip"), cap.name("port")) {
                (Some(ip), Some(port)) => (ip.as_str(), port.as_str()),
                _ => continue,
            };
            let port = match port.parse::<u16>() {
                Ok(port) => port,
                Err(_) => continue,
            };
            proxies.push(Candidate {
                host: ip.to_string(),
                port,
                expected_types: self.proto.clone(),
                source: self.domain.clone(),
            })
        }
        log::debug!("{} proxies received from {}", proxies.len(), self.domain);
        proxies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ip_port_pairs_in_source_order() {
        let base = BaseProvider::new("test.local", vec![Proto::Http]);
        let html = "nodes:\n1.2.3.4:8080\njunk 300000\n5.6.7.8:3128\n";
        let found = base.find_proxies(&IP_PORT_PATTERN, html);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].host, "1.2.3.4");
        assert_eq!(found[0].port, 8080);
        assert_eq!(found[1].host, "5.6.7.8");
        assert_eq!(found[1].port, 3128);
        assert_eq!(found[0].expected_types, vec![Proto::Http]);
        assert_eq!(found[0].source, "test.local");
    }

    #[test]
    fn skips_out_of_range_ports() {
        let base = BaseProvider::new("test.local", vec![]);
        let found = base.find_proxies(&IP_PORT_PATTERN, "1.2.3.4:99999");
        assert!(found.is_empty());
    }
}
