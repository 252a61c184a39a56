pub mod base_provider;
pub mod freeproxylist;
pub mod github;
pub mod ipaddress_com;
pub mod proxyscrape;

use std::sync::Arc;

use async_trait::async_trait;

use crate::proxy::Proto;

/// A candidate scraped from one source, before dedup and resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
    pub expected_types: Vec<Proto>,
    pub source: String,
}

/// One listing site. `fetch` produces a finite, possibly duplicated batch of
/// candidates; failures degrade to an empty batch and are logged, never
/// propagated.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// The protocols this source claims its proxies speak.
    fn proto_hint(&self) -> Vec<Proto>;

    async fn fetch(&self) -> Vec<Candidate>;
}

/// The built-in provider set.
pub fn default_providers() -> Vec<Arc<dyn Provider>> {
    vec![
        Arc::new(freeproxylist::FreeProxyListNetProvider::default()),
        Arc::new(ipaddress_com::IpaddressComProvider::default()),
        Arc::new(proxyscrape::ProxyscrapeComHttpProvider::default()),
        Arc::new(proxyscrape::ProxyscrapeComSocks4Provider::default()),
        Arc::new(proxyscrape::ProxyscrapeComSocks5Provider::default()),
        Arc::new(github::TheSpeedXHttpProvider::default()),
        Arc::new(github::TheSpeedXSocks4Provider::default()),
        Arc::new(github::TheSpeedXSocks5Provider::default()),
    ]
}
