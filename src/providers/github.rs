use async_trait::async_trait;

use super::base_provider::{BaseProvider, IP_PORT_PATTERN};
use super::{Candidate, Provider};
use crate::proxy::Proto;

const RAW_BASE: &str = "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master";

macro_rules! thespeedx_provider {
    ($name:ident, $label:literal, $file:literal, $proto:expr) => {
        #[derive(Debug, Clone)]
        pub struct $name {
            pub base: BaseProvider,
            pub url: String,
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    base: BaseProvider::new($label, $proto),
                    url: format!("{}/{}", RAW_BASE, $file),
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
                let body = self.base.get_html(&self.url).await;
                self.base.find_proxies(&IP_PORT_PATTERN, &body)
            }
        }
    };
}

thespeedx_provider!(
    TheSpeedXHttpProvider,
    "github.com/TheSpeedX/http",
    "http.txt",
    vec![Proto::Http, Proto::Https]
);
thespeedx_provider!(
    TheSpeedXSocks4Provider,
    "github.com/TheSpeedX/socks4",
    "socks4.txt",
    vec![Proto::Socks4]
);
thespeedx_provider!(
    TheSpeedXSocks5Provider,
    "github.com/TheSpeedX/socks5",
    "socks5.txt",
    vec![Proto::Socks5]
);
