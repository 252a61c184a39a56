use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;

use super::base_provider::BaseProvider;
use super::{Candidate, Provider};
use crate::proxy::Proto;

lazy_static! {
    static ref ROW_PATTERN: Regex =
        Regex::new(r"<td>(?P<ip>(?:\d{1,3}\.){3}\d{1,3})</td><td>(?P<port>\d{2,5})</td>").unwrap();
}

#[derive(Debug, Clone)]
pub struct FreeProxyListNetProvider {
    pub base: BaseProvider,
    pub url: String,
}

impl Default for FreeProxyListNetProvider {
    fn default() -> Self {
        Self {
            base: BaseProvider::new("free-proxy-list.net", vec![Proto::Http, Proto::Https]),
            url: "https://free-proxy-list.net/".to_string(),
        }
    }
}

#[async_trait]
impl Provider for FreeProxyListNetProvider {
    fn name(&self) -> &'static str {
        "free-proxy-list.net"
    }

    fn proto_hint(&self) -> Vec<Proto> {
        self.base.proto.clone()
    }

    async fn fetch(&self) -> Vec<Candidate> {
        self.base.start();
        let html = self.base.get_html(&self.url).await;
        self.base.find_proxies(&ROW_PATTERN, &html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_rows_are_extracted() {
        let provider = FreeProxyListNetProvider::default();
        let html = "<tr><td>1.2.3.4</td><td>8080</td><td>US</td></tr>\
                    <tr><td>5.6.7.8</td><td>3128</td><td>DE</td></tr>";
        let found = provider.base.find_proxies(&ROW_PATTERN, html);
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].host, "5.6.7.8");
        assert_eq!(found[1].port, 3128);
    }
}
