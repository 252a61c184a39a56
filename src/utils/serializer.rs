use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::geolite::GeoData;
use crate::proxy::Proxy;

/// JSON form of a proxy. `ProxyData` round-trips: a re-parsed document
/// rebuilds a proxy with the same identity and validated types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyData {
    pub host: String,
    pub port: u16,
    pub geo: Geo,
    pub types: Vec<ProxyType>,
    pub avg_resp_time: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Geo {
    pub country: Country,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Country {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyType {
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub level: Option<String>,
}

impl From<&Proxy> for ProxyData {
    fn from(proxy: &Proxy) -> Self {
        let avg = proxy.avg_resp_time();
        ProxyData {
            host: proxy.host.clone(),
            port: proxy.port,
            geo: Geo {
                country: Country {
                    code: proxy.geo.iso_code.clone(),
                    name: proxy.geo.name.clone(),
                },
            },
            types: proxy
                .types()
                .iter()
                .map(|(proto, level)| ProxyType {
                    proxy_type: proto.as_str().to_string(),
                    level: level.map(|l| l.as_str().to_string()),
                })
                .collect(),
            avg_resp_time: if avg.is_finite() { avg } else { 0.0 },
            error_rate: proxy.error_rate(),
        }
    }
}

impl ProxyData {
    pub fn into_proxy(self) -> Result<Proxy> {
        let mut proxy = Proxy::new(&self.host, self.port, vec![])?;
        proxy.geo = GeoData {
            iso_code: self.geo.country.code,
            name: self.geo.country.name,
        };
        for tp in self.types {
            let proto = tp.proxy_type.parse()?;
            let level = match tp.level {
                Some(level) => Some(level.parse()?),
                None => None,
            };
            proxy.add_type(proto, level);
        }
        Ok(proxy)
    }
}

/// Parses the plain text form `host:port`.
pub fn parse_text(line: &str) -> Result<(String, u16)> {
    let line = line.trim();
    let (host, port) = line
        .rsplit_once(':')
        .ok_or_else(|| Error::Protocol(format!("malformed proxy line {:?}", line)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::Protocol(format!("malformed proxy port {:?}", port)))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{Anonymity, Proto};

    #[test]
    fn json_round_trip_preserves_identity_and_types() {
        let mut proxy = Proxy::new("1.2.3.4", 8080, vec![]).unwrap();
        proxy.add_type(Proto::Http, Some(Anonymity::Transparent));
        proxy.add_type(Proto::Socks5, None);
        proxy.add_type(Proto::Https, Some(Anonymity::High));

        let json = serde_json::to_string(&ProxyData::from(&proxy)).unwrap();
        let parsed: ProxyData = serde_json::from_str(&json).unwrap();
        let rebuilt = parsed.into_proxy().unwrap();

        assert_eq!(rebuilt.host, proxy.host);
        assert_eq!(rebuilt.port, proxy.port);
        let mut before: Vec<Proto> = proxy.types().protos().collect();
        let mut after: Vec<Proto> = rebuilt.types().protos().collect();
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn text_round_trip() {
        let proxy = Proxy::new("5.6.7.8", 3128, vec![]).unwrap();
        let (host, port) = parse_text(&proxy.as_text()).unwrap();
        assert_eq!(host, proxy.host);
        assert_eq!(port, proxy.port);
    }

    #[test]
    fn text_rejects_garbage() {
        assert!(parse_text("no-port-here").is_err());
        assert!(parse_text("1.2.3.4:notaport").is_err());
    }
}
