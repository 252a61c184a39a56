use async_trait::async_trait;

use super::base_provider::{BaseProvider, IP_PORT_PATTERN};
use super::{Candidate, Provider};
use crate::proxy::Proto;

macro_rules! proxyscrape_provider {
    ($name:ident, $label:literal, $proxytype:literal, $proto:expr) => {
        #[derive(Debug, Clone)]
        pub struct $name {
            pub base: BaseProvider,
            pub url: String,
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    base: BaseProvider::new($label, $proto),
                    url: concat!(
                        "https://api.proxyscrape.com/?request=getproxies&proxytype=",
                        $proxytype
                    )
                    .to_string(),
                }
            }
        }

        #[async_trait]
        impl Provider for $name {
            fn name(&self) -> &'static str {
                $label
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
    };
}

proxyscrape_provider!(
    ProxyscrapeComHttpProvider,
    "proxyscrape.com/http",
    "http",
    vec![Proto::Http, Proto::Https]
);
proxyscrape_provider!(
    ProxyscrapeComSocks4Provider,
    "proxyscrape.com/socks4",
    "socks4",
    vec![Proto::Socks4]
);
proxyscrape_provider!(
    ProxyscrapeComSocks5Provider,
    "proxyscrape.com/socks5",
    "socks5",
    vec![Proto::Socks5]
);
