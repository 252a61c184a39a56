use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use crate::errors::{Error, Result};
use crate::geolite::GeoData;

/// Number of runtime samples kept per proxy; older samples fall off so the
/// average tracks recent behaviour.
const MAX_RUNTIMES: usize = 32;

/// The protocols a proxy can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Proto {
    Http,
    Https,
    Connect80,
    Connect25,
    Socks4,
    Socks5,
}

impl Proto {
    pub const ALL: [Proto; 6] = [
        Proto::Http,
        Proto::Https,
        Proto::Connect80,
        Proto::Connect25,
        Proto::Socks4,
        Proto::Socks5,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Http => "HTTP",
            Proto::Https => "HTTPS",
            Proto::Connect80 => "CONNECT:80",
            Proto::Connect25 => "CONNECT:25",
            Proto::Socks4 => "SOCKS4",
            Proto::Socks5 => "SOCKS5",
        }
    }

    fn index(&self) -> usize {
        match self {
            Proto::Http => 0,
            Proto::Https => 1,
            Proto::Connect80 => 2,
            Proto::Connect25 => 3,
            Proto::Socks4 => 4,
            Proto::Socks5 => 5,
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Proto {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "HTTP" => Ok(Proto::Http),
            "HTTPS" => Ok(Proto::Https),
            "CONNECT:80" => Ok(Proto::Connect80),
            "CONNECT:25" => Ok(Proto::Connect25),
            "SOCKS4" => Ok(Proto::Socks4),
            "SOCKS5" => Ok(Proto::Socks5),
            other => Err(Error::Protocol(format!("unknown proxy type {}", other))),
        }
    }
}

/// Client-facing scheme families served by the rotating server. Each family
/// lists the protocols able to carry it, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "HTTP",
            Scheme::Https => "HTTPS",
        }
    }

    pub fn proto_priority(&self) -> &'static [Proto] {
        match self {
            Scheme::Http => &[Proto::Http, Proto::Connect80, Proto::Socks5, Proto::Socks4],
            Scheme::Https => &[Proto::Https, Proto::Socks5, Proto::Socks4],
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much a proxy reveals about its client. The order matters: proxy
/// indicators can only lower a classification, never raise it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Anonymity {
    Transparent,
    Anonymous,
    High,
}

impl Anonymity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Anonymity::Transparent => "Transparent",
            Anonymity::Anonymous => "Anonymous",
            Anonymity::High => "High",
        }
    }
}

impl fmt::Display for Anonymity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Anonymity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "transparent" => Ok(Anonymity::Transparent),
            "anonymous" => Ok(Anonymity::Anonymous),
            "high" => Ok(Anonymity::High),
            other => Err(Error::Protocol(format!(
                "unknown anonymity level {}",
                other
            ))),
        }
    }
}

/// Validated protocols of a proxy: bitset membership plus the anonymity
/// level per protocol. Levels only apply to HTTP; HTTPS is pinned High,
/// SOCKS/CONNECT carry none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeMap {
    mask: u8,
    levels: [Option<Anonymity>; 6],
}

impl TypeMap {
    pub fn insert(&mut self, proto: Proto, level: Option<Anonymity>) {
        self.mask |= 1 << proto.index();
        self.levels[proto.index()] = level;
    }

    pub fn contains(&self, proto: Proto) -> bool {
        self.mask & (1 << proto.index()) != 0
    }

    pub fn level(&self, proto: Proto) -> Option<Anonymity> {
        self.levels[proto.index()]
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    pub fn len(&self) -> usize {
        self.mask.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = (Proto, Option<Anonymity>)> + '_ {
        Proto::ALL
            .iter()
            .filter(|p| self.contains(**p))
            .map(|p| (*p, self.level(*p)))
    }

    pub fn protos(&self) -> impl Iterator<Item = Proto> + '_ {
        self.iter().map(|(p, _)| p)
    }
}

/// One proxy candidate and its accumulated health history. The host must be
/// a resolved IP literal; domains are resolved before construction.
///
/// At most one byte stream is open at a time. Whoever holds the `Proxy`
/// (checker, pool or server connection) owns the stream; handing the proxy
/// off releases it.
#[derive(Debug)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub expected_types: Vec<Proto>,
    pub geo: GeoData,
    pub timeout: Duration,
    types: TypeMap,
    logs: Vec<(String, String, Duration)>,
    runtimes: VecDeque<f64>,
    requests: u32,
    errors: BTreeMap<String, u32>,
    negotiator_proto: Option<Proto>,
    stream: Option<TcpStream>,
}

impl Proxy {
    pub fn new(host: &str, port: u16, expected_types: Vec<Proto>) -> Result<Self> {
        if host.parse::<IpAddr>().is_err() {
            return Err(Error::Resolve {
                host: host.to_string(),
            });
        }

        Ok(Proxy {
            host: host.to_string(),
            port,
            expected_types,
            geo: GeoData::default(),
            timeout: Duration::from_secs(8),
            types: TypeMap::default(),
            logs: vec![],
            runtimes: VecDeque::new(),
            requests: 0,
            errors: BTreeMap::new(),
            negotiator_proto: None,
            stream: None,
        })
    }

    pub fn as_text(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn types(&self) -> &TypeMap {
        &self.types
    }

    pub fn add_type(&mut self, proto: Proto, level: Option<Anonymity>) {
        self.types.insert(proto, level);
    }

    pub fn supports(&self, scheme: Scheme) -> bool {
        scheme
            .proto_priority()
            .iter()
            .any(|p| self.types.contains(*p))
    }

    /// Best protocol of this proxy able to carry `scheme`, by the family's
    /// fixed priority order.
    pub fn choose_proto(&self, scheme: Scheme, prefer_connect: bool) -> Option<Proto> {
        if scheme == Scheme::Http && prefer_connect && self.types.contains(Proto::Connect80) {
            return Some(Proto::Connect80);
        }
        scheme
            .proto_priority()
            .iter()
            .copied()
            .find(|p| self.types.contains(*p))
    }

    pub fn requests(&self) -> u32 {
        self.requests
    }

    pub fn record_attempt(&mut self) {
        self.requests += 1;
    }

    pub fn error_count(&self) -> u32 {
        self.errors.values().sum()
    }

    pub fn error_rate(&self) -> f64 {
        self.error_count() as f64 / self.requests.max(1) as f64
    }

    /// Mean of the recorded runtimes; +inf until the first measurement so an
    /// unmeasured proxy never ranks ahead of a measured one.
    pub fn avg_resp_time(&self) -> f64 {
        if self.runtimes.is_empty() {
            return f64::INFINITY;
        }
        let sum: f64 = self.runtimes.iter().sum();
        sum / self.runtimes.len() as f64
    }

    pub fn get_log(&self) -> &[(String, String, Duration)] {
        &self.logs
    }

    pub(crate) fn set_negotiator_proto(&mut self, proto: Option<Proto>) {
        self.negotiator_proto = proto;
    }

    /// Appends an event to the proxy log. An error tag counts against the
    /// proxy's health; a runtime on a non-error event feeds the average.
    pub fn log(&mut self, msg: &str, stime: Option<Duration>, err_tag: Option<&str>) {
        let ngtr = self.negotiator_proto.map(|p| p.as_str()).unwrap_or("INFO");
        log::debug!(
            "{}:{} [{}] {}; Runtime {:?}",
            self.host,
            self.port,
            ngtr,
            msg,
            stime.unwrap_or_default()
        );

        self.logs
            .push((ngtr.to_string(), msg.to_string(), stime.unwrap_or_default()));

        if let Some(tag) = err_tag {
            *self.errors.entry(tag.to_string()).or_insert(0) += 1;
        } else if let Some(runtime) = stime {
            if runtime > Duration::ZERO {
                self.runtimes.push_back(runtime.as_secs_f64());
                if self.runtimes.len() > MAX_RUNTIMES {
                    self.runtimes.pop_front();
                }
            }
        }
    }

    /// Opens a fresh stream to the proxy, closing any previous one. Counts as
    /// a request attempt whether or not the connect succeeds.
    pub async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            self.close().await;
        }
        self.requests += 1;

        let stime = Instant::now();
        match timeout(
            self.timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => {
                self.stream = Some(stream);
                self.log("Connection: success", Some(stime.elapsed()), None);
                Ok(())
            }
            Ok(Err(e)) => {
                self.log("Connection: failed", None, Some("connection_failed"));
                Err(Error::Connect {
                    addr: self.as_text(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.log("Connection: timeout", None, Some("connection_timeout"));
                Err(Error::Timeout(self.timeout))
            }
        }
    }

    pub async fn send(&mut self, body: &[u8]) -> Result<()> {
        let result = {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| Error::Protocol("send on closed proxy stream".into()))?;
            timeout(self.timeout, stream.write_all(body)).await
        };

        match result {
            Ok(Ok(())) => {
                self.log(&format!("Sent {} bytes", body.len()), None, None);
                Ok(())
            }
            Ok(Err(e)) => {
                self.log("Sending: failed", None, Some("send_failed"));
                Err(e.into())
            }
            Err(_) => {
                self.log("Sending: timeout", None, Some("send_timeout"));
                Err(Error::Timeout(self.timeout))
            }
        }
    }

    /// Reads exactly `n` bytes, used by the fixed-size SOCKS replies.
    pub async fn recv_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let stime = Instant::now();
        let result = {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| Error::Protocol("recv on closed proxy stream".into()))?;
            let mut buf = vec![0u8; n];
            match timeout(self.timeout, stream.read_exact(&mut buf)).await {
                Ok(Ok(_)) => Ok(Some(buf)),
                Ok(Err(e)) => Err(e),
                Err(_) => Ok(None),
            }
        };

        match result {
            Ok(Some(buf)) => {
                self.log(
                    &format!("Received {} bytes", buf.len()),
                    Some(stime.elapsed()),
                    None,
                );
                Ok(buf)
            }
            Ok(None) => {
                self.log("Received: timeout", None, Some("recv_timeout"));
                Err(Error::Timeout(self.timeout))
            }
            Err(e) => {
                self.log("Received: failed", None, Some("recv_failed"));
                Err(e.into())
            }
        }
    }

    /// Reads until the end of an HTTP header block. The body and anything
    /// after it stays on the stream, so a CONNECT tunnel remains usable.
    pub async fn recv_head(&mut self) -> Result<Vec<u8>> {
        let stime = Instant::now();
        let result = {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| Error::Protocol("recv on closed proxy stream".into()))?;
            let mut buf = Vec::new();
            let mut chunk = [0u8; 512];
            loop {
                match timeout(self.timeout, stream.read(&mut chunk)).await {
                    Ok(Ok(0)) => break Ok(buf),
                    Ok(Ok(n)) => {
                        buf.extend(&chunk[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 65536 {
                            break Ok(buf);
                        }
                    }
                    Ok(Err(e)) => break Err(e),
                    Err(_) => break Ok(buf),
                }
            }
        };

        match result {
            Ok(buf) if !buf.is_empty() => {
                self.log(
                    &format!("Received {} bytes", buf.len()),
                    Some(stime.elapsed()),
                    None,
                );
                Ok(buf)
            }
            Ok(_) => {
                self.log("Received: empty", None, Some("empty_recv"));
                Err(Error::Protocol("empty response".into()))
            }
            Err(e) => {
                self.log("Received: failed", None, Some("recv_failed"));
                Err(e.into())
            }
        }
    }

    /// Reads until the peer half-closes or goes idle past the timeout.
    pub async fn recv_all(&mut self) -> Result<Vec<u8>> {
        let stime = Instant::now();
        let result = {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| Error::Protocol("recv on closed proxy stream".into()))?;
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                match timeout(self.timeout, stream.read(&mut chunk)).await {
                    Ok(Ok(0)) => break Ok(buf),
                    Ok(Ok(n)) => buf.extend(&chunk[..n]),
                    Ok(Err(e)) => {
                        if buf.is_empty() {
                            break Err(e);
                        }
                        break Ok(buf);
                    }
                    Err(_) => break Ok(buf),
                }
            }
        };

        match result {
            Ok(buf) if !buf.is_empty() => {
                self.log(
                    &format!("Received {} bytes", buf.len()),
                    Some(stime.elapsed()),
                    None,
                );
                Ok(buf)
            }
            Ok(_) => {
                self.log("Received: empty", None, Some("empty_recv"));
                Err(Error::Protocol("empty response".into()))
            }
            Err(e) => {
                self.log("Received: failed", None, Some("recv_failed"));
                Err(e.into())
            }
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            self.log("Connection: closed", None, None);
        }
        self.negotiator_proto = None;
    }

    /// Hands the open stream to the caller, e.g. for splicing client and
    /// proxy traffic in the server.
    pub fn take_stream(&mut self) -> Option<TcpStream> {
        self.stream.take()
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types = vec![];
        for (proto, level) in self.types.iter() {
            if let Some(level) = level {
                types.push(format!("{}: {}", proto, level));
            } else {
                types.push(proto.to_string());
            }
        }

        let avg = self.avg_resp_time();
        write!(
            f,
            "<Proxy {} {:.2}s [{}] {}:{}>",
            self.geo.iso_code,
            if avg.is_finite() { avg } else { 0.0 },
            types.join(", "),
            self.host,
            self.port
        )
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unresolved_host() {
        assert!(Proxy::new("example.com", 8080, vec![]).is_err());
        assert!(Proxy::new("1.2.3.4", 8080, vec![]).is_ok());
        assert!(Proxy::new("2001:db8::1", 1080, vec![]).is_ok());
    }

    #[test]
    fn type_map_bitset() {
        let mut types = TypeMap::default();
        assert!(types.is_empty());

        types.insert(Proto::Http, Some(Anonymity::High));
        types.insert(Proto::Socks5, None);
        assert_eq!(types.len(), 2);
        assert!(types.contains(Proto::Http));
        assert!(types.contains(Proto::Socks5));
        assert!(!types.contains(Proto::Https));
        assert_eq!(types.level(Proto::Http), Some(Anonymity::High));
        assert_eq!(types.level(Proto::Socks5), None);

        let protos: Vec<Proto> = types.protos().collect();
        assert_eq!(protos, vec![Proto::Http, Proto::Socks5]);
    }

    #[test]
    fn scheme_families() {
        let mut proxy = Proxy::new("1.2.3.4", 8080, vec![]).unwrap();
        proxy.add_type(Proto::Socks5, None);

        assert!(proxy.supports(Scheme::Http));
        assert!(proxy.supports(Scheme::Https));
        assert_eq!(proxy.choose_proto(Scheme::Http, false), Some(Proto::Socks5));

        proxy.add_type(Proto::Connect80, None);
        assert_eq!(
            proxy.choose_proto(Scheme::Http, false),
            Some(Proto::Connect80)
        );

        proxy.add_type(Proto::Http, Some(Anonymity::Anonymous));
        assert_eq!(proxy.choose_proto(Scheme::Http, false), Some(Proto::Http));
        assert_eq!(
            proxy.choose_proto(Scheme::Http, true),
            Some(Proto::Connect80)
        );
        assert_eq!(
            proxy.choose_proto(Scheme::Https, false),
            Some(Proto::Socks5)
        );
    }

    #[test]
    fn avg_resp_time_starts_at_infinity() {
        let mut proxy = Proxy::new("1.2.3.4", 8080, vec![]).unwrap();
        assert!(proxy.avg_resp_time().is_infinite());

        proxy.log("Request: success", Some(Duration::from_millis(500)), None);
        proxy.log("Request: success", Some(Duration::from_millis(1500)), None);
        assert!((proxy.avg_resp_time() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn error_rate_counts_tagged_events() {
        let mut proxy = Proxy::new("1.2.3.4", 8080, vec![]).unwrap();
        assert_eq!(proxy.error_rate(), 0.0);

        proxy.record_attempt();
        proxy.record_attempt();
        proxy.log("Connection: timeout", None, Some("connection_timeout"));
        assert_eq!(proxy.requests(), 2);
        assert_eq!(proxy.error_count(), 1);
        assert!((proxy.error_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn runtimes_buffer_is_bounded() {
        let mut proxy = Proxy::new("1.2.3.4", 8080, vec![]).unwrap();
        for _ in 0..(MAX_RUNTIMES + 10) {
            proxy.log("Request: success", Some(Duration::from_secs(1)), None);
        }
        assert!((proxy.avg_resp_time() - 1.0).abs() < 1e-9);
        assert_eq!(proxy.runtimes.len(), MAX_RUNTIMES);
    }

    #[test]
    fn display_form() {
        let mut proxy = Proxy::new("10.0.0.1", 8080, vec![]).unwrap();
        proxy.add_type(Proto::Http, Some(Anonymity::Anonymous));
        proxy.add_type(Proto::Https, Some(Anonymity::High));
        assert_eq!(
            proxy.to_string(),
            "<Proxy -- 0.00s [HTTP: Anonymous, HTTPS: High] 10.0.0.1:8080>"
        );
    }
}
