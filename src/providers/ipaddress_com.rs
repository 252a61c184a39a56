use async_trait::async_trait;

use super::base_provider::{BaseProvider, IP_PORT_PATTERN};
use super::{Candidate, Provider};
use crate::proxy::Proto;

#[derive(Debug, Clone)]
pub struct IpaddressComProvider {
    pub base: BaseProvider,
    pub url: String,
}

impl Default for IpaddressComProvider {
    fn default() -> Self {
        Self {
            base: BaseProvider::new("ipaddress.com", vec![Proto::Http, Proto::Https]),
            url: "https://www.ipaddress.com/proxy-list/".to_string(),
        }
    }
}

#[async_trait]
impl Provider for IpaddressComProvider {
    fn name(&self) -> &'static str {
        "ipaddress.com"
    }

    fn proto_hint(&self) -> Vec<Proto> {
        self.base.proto.clone()
    }

    async fn fetch(&self) -> Vec<Candidate> {
        self.base.start();
        let html = self.base.get_html(&self.url).await;
        self.base.find_proxies(&IP_PORT_PATTERN, &html)
    }
}
