use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use url::Url;

use crate::errors::{Error, Result};
use crate::negotiators::{NegotiateTarget, Negotiator};
use crate::pool::ProxyPool;
use crate::proxy::{Proto, Proxy, Scheme};
use crate::resolver::Resolver;
use crate::utils::http::{RequestParser, ResponseParser};
use crate::utils::serializer::parse_text;
use crate::utils::ttl_cache::TtlCache;

const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const NO_CONTENT: &[u8] = b"HTTP/1.1 204 No Content\r\n\r\n";
const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\n\r\n";

/// Virtual host reserved for the control API.
const CONTROL_HOST: &str = "proxycontrol";

const REQUEST_CHUNK: usize = 65536;
const SPLICE_CHUNK: usize = 16384;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Idle deadline for every read/write on either side.
    pub timeout: Duration,
    /// Upstream proxies tried per client request before giving up.
    pub max_tries: usize,
    /// Prefer CONNECT:80 over plain HTTP when the proxy has both.
    pub prefer_connect: bool,
    /// Accepted status codes of proxied HTTP responses; empty accepts all.
    pub http_allowed_codes: Vec<u16>,
    pub history_ttl: Duration,
    pub history_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            max_tries: 3,
            prefer_connect: false,
            http_allowed_codes: vec![],
            history_ttl: Duration::from_secs(600),
            history_capacity: 1000,
        }
    }
}

/// Distributes incoming client requests over the proxy pool. Every accepted
/// connection picks the best matching proxy, splices bytes both ways and
/// reports the outcome back into the pool.
pub struct Server {
    host: String,
    port: u16,
    pool: Arc<ProxyPool>,
    resolver: Resolver,
    cfg: ServerConfig,
    history: Mutex<TtlCache<String, String>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    conns: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(host: &str, port: u16, pool: Arc<ProxyPool>, resolver: Resolver) -> Self {
        Self::with_config(host, port, pool, resolver, ServerConfig::default())
    }

    pub fn with_config(
        host: &str,
        port: u16,
        pool: Arc<ProxyPool>,
        resolver: Resolver,
        cfg: ServerConfig,
    ) -> Self {
        let history = TtlCache::new(cfg.history_ttl, cfg.history_capacity);
        Server {
            host: host.to_string(),
            port,
            pool,
            resolver,
            cfg,
            history: Mutex::new(history),
            acceptor: Mutex::new(None),
            conns: Mutex::new(vec![]),
        }
    }

    /// Binds the listener and spawns the accept loop. Returns the bound
    /// address, which matters when the configured port is 0.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let addr = listener.local_addr()?;
        log::info!("Listening on http://{}", addr);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.accept_loop(listener).await });
        *self.acceptor.lock() = Some(handle);
        Ok(addr)
    }

    /// Cancels the accept loop and every in-flight connection. Safe to call
    /// more than once.
    pub fn stop(&self) {
        if let Some(handle) = self.acceptor.lock().take() {
            handle.abort();
            log::info!("Server is stopped");
        }
        for conn in self.conns.lock().drain(..) {
            conn.abort();
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    log::debug!("Accepted connection from {}", peer);
                    let this = Arc::clone(&self);
                    let handle = tokio::spawn(async move {
                        if let Err(e) = this.handle_client(stream).await {
                            log::debug!("client {}: {}", peer, e);
                        }
                    });
                    let mut conns = self.conns.lock();
                    conns.retain(|h| !h.is_finished());
                    conns.push(handle);
                }
                Err(e) => log::warn!("accept failed: {}", e),
            }
        }
    }

    async fn handle_client(&self, mut client: TcpStream) -> Result<()> {
        let (raw, request) = self.read_request(&mut client).await?;
        if !request.is_complete() {
            let _ = client.write_all(BAD_GATEWAY).await;
            return Err(Error::Protocol("malformed request head".into()));
        }

        if request.get_host().as_deref() == Some(CONTROL_HOST) {
            return self.handle_control(&request, &mut client).await;
        }

        let method = request.method.clone().unwrap_or_default();
        let scheme = if method == "CONNECT" {
            Scheme::Https
        } else {
            Scheme::Http
        };
        let (target_host, target_port) = self.target_of(&request, scheme)?;
        let request_key = match scheme {
            Scheme::Https => format!("{}:{}", target_host, target_port),
            Scheme::Http => request.path.clone().unwrap_or_default(),
        };

        for attempt in 0..self.cfg.max_tries {
            let mut proxy = match self.pool.get(scheme).await {
                Ok(proxy) => proxy,
                Err(e) => {
                    log::debug!("{} request failed: {}", scheme, e);
                    let _ = client.write_all(BAD_GATEWAY).await;
                    return Ok(());
                }
            };
            proxy.timeout = self.cfg.timeout;
            log::debug!(
                "attempt {}: {} {} via {}",
                attempt + 1,
                scheme,
                request_key,
                proxy.as_text()
            );

            let outcome = self
                .attempt(
                    &mut client,
                    &mut proxy,
                    scheme,
                    &raw,
                    &target_host,
                    target_port,
                    &request_key,
                )
                .await;

            proxy.close().await;
            proxy.set_negotiator_proto(None);
            let failed_mid_stream = match &outcome {
                Err((_, delivered)) => *delivered > 0,
                Ok(_) => false,
            };
            self.pool.put(proxy);

            match outcome {
                Ok(_) => return Ok(()),
                Err((e, _)) if failed_mid_stream => return Err(e),
                Err((e, _)) => {
                    log::debug!("attempt failed before reaching the client: {}", e)
                }
            }
        }

        let _ = client.write_all(BAD_GATEWAY).await;
        Ok(())
    }

    /// One try through one proxy. Returns the bytes delivered to the client;
    /// on failure the byte count tells the caller whether a retry is still
    /// transparent.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        client: &mut TcpStream,
        proxy: &mut Proxy,
        scheme: Scheme,
        raw: &[u8],
        target_host: &str,
        target_port: u16,
        request_key: &str,
    ) -> std::result::Result<u64, (Error, u64)> {
        let proto = proxy
            .choose_proto(scheme, self.cfg.prefer_connect)
            .ok_or_else(|| {
                (
                    Error::Protocol(format!(
                        "{} carries no protocol for {}",
                        proxy.as_text(),
                        scheme
                    )),
                    0,
                )
            })?;
        proxy.set_negotiator_proto(Some(proto));
        let stime = Instant::now();

        let mut announce = false;
        let setup = async {
            proxy.connect().await?;
            match (scheme, proto) {
                // The upstream speaks CONNECT itself: forward the client's
                // request verbatim and let its 200 flow back.
                (Scheme::Https, Proto::Https) => proxy.send(raw).await?,
                (Scheme::Https, _) => {
                    let ip = self.resolve_v4(target_host).await?;
                    Negotiator::for_proto(proto)
                        .negotiate(proxy, &NegotiateTarget::with_ip(target_host, ip, target_port))
                        .await?;
                    announce = true;
                }
                (Scheme::Http, Proto::Connect80) => {
                    Negotiator::for_proto(proto)
                        .negotiate(proxy, &NegotiateTarget::new(target_host, 80))
                        .await?;
                    proxy.send(raw).await?;
                }
                (Scheme::Http, Proto::Socks4 | Proto::Socks5) => {
                    let ip = self.resolve_v4(target_host).await?;
                    Negotiator::for_proto(proto)
                        .negotiate(proxy, &NegotiateTarget::with_ip(target_host, ip, target_port))
                        .await?;
                    proxy.send(raw).await?;
                }
                (Scheme::Http, _) => proxy.send(raw).await?,
            }
            Ok::<(), Error>(())
        }
        .await;
        if let Err(e) = setup {
            return Err((e, 0));
        }

        self.history
            .lock()
            .insert(request_key.to_string(), proxy.as_text());

        let mut announced: u64 = 0;
        if announce {
            let head = format!(
                "HTTP/1.1 200 Connection established\r\nX-Proxy-Info: {}\r\n\r\n",
                proxy.as_text()
            );
            if let Err(e) = client.write_all(head.as_bytes()).await {
                return Err((e.into(), 0));
            }
            announced = head.len() as u64;
        }

        let inject = if announce {
            None
        } else {
            Some(format!("X-Proxy-Info: {}", proxy.as_text()))
        };
        let check_codes = scheme == Scheme::Http && !self.cfg.http_allowed_codes.is_empty();

        let upstream = match proxy.take_stream() {
            Some(stream) => stream,
            None => return Err((Error::Protocol("proxy stream lost".into()), announced)),
        };

        match self.splice(client, upstream, inject, check_codes).await {
            Ok(streamed) if streamed + announced > 0 => {
                proxy.log("Streaming: finished", Some(stime.elapsed()), None);
                Ok(streamed + announced)
            }
            Ok(_) => {
                proxy.log("Streaming: empty response", None, Some("empty_recv"));
                Err((
                    Error::Protocol("no data returned through the proxy".into()),
                    0,
                ))
            }
            Err((e, streamed)) => {
                proxy.log("Streaming: failed", None, Some("stream_error"));
                Err((e, streamed + announced))
            }
        }
    }

    /// Bidirectional copy between the client and the upstream proxy. Each
    /// direction preserves byte order; an idle timeout ends the splice. The
    /// returned count is what reached the client.
    async fn splice(
        &self,
        client: &mut TcpStream,
        mut upstream: TcpStream,
        inject: Option<String>,
        check_codes: bool,
    ) -> std::result::Result<u64, (Error, u64)> {
        let idle = self.cfg.timeout;
        let allowed = self.cfg.http_allowed_codes.clone();

        let (mut client_r, mut client_w) = client.split();
        let (mut proxy_r, mut proxy_w) = upstream.split();

        let client_to_proxy = async {
            let mut buf = vec![0u8; SPLICE_CHUNK];
            loop {
                let n = match timeout(idle, client_r.read(&mut buf)).await {
                    Ok(Ok(0)) => {
                        let _ = proxy_w.shutdown().await;
                        break Ok(());
                    }
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => break Err(Error::from(e)),
                    Err(_) => break Ok(()),
                };
                if let Err(e) = proxy_w.write_all(&buf[..n]).await {
                    break Err(e.into());
                }
            }
        };

        let proxy_to_client = async {
            let mut buf = vec![0u8; SPLICE_CHUNK];
            let mut total: u64 = 0;
            let mut inject = inject;
            let mut first = true;
            loop {
                let n = match timeout(idle, proxy_r.read(&mut buf)).await {
                    Ok(Ok(0)) => {
                        let _ = client_w.shutdown().await;
                        break (Ok(()), total);
                    }
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => break (Err(Error::from(e)), total),
                    Err(_) => break (Ok(()), total),
                };
                let mut data = buf[..n].to_vec();
                if first {
                    first = false;
                    if check_codes {
                        let status = ResponseParser::parse(&data).status_code.unwrap_or(0);
                        if !allowed.contains(&status) {
                            break (
                                Err(Error::Protocol(format!(
                                    "status {} not in the allowed set",
                                    status
                                ))),
                                total,
                            );
                        }
                    }
                    if let Some(header) = inject.take() {
                        data = inject_after_status_line(&data, &header);
                    }
                }
                if let Err(e) = client_w.write_all(&data).await {
                    break (Err(Error::from(e)), total);
                }
                total += data.len() as u64;
            }
        };

        let (up, (down, total)) = tokio::join!(client_to_proxy, proxy_to_client);
        match (up, down) {
            (_, Err(e)) => Err((e, total)),
            (Err(e), _) => Err((e, total)),
            _ => Ok(total),
        }
    }

    async fn read_request(&self, client: &mut TcpStream) -> Result<(Vec<u8>, RequestParser)> {
        let mut raw = vec![0u8; REQUEST_CHUNK];
        let n = timeout(self.cfg.timeout, client.read(&mut raw))
            .await
            .map_err(|_| Error::Timeout(self.cfg.timeout))??;
        raw.truncate(n);
        if n == 0 {
            return Err(Error::Protocol(
                "client closed before sending a request".into(),
            ));
        }

        let mut request = RequestParser::parse(&raw);
        // POST bodies may arrive in a second segment.
        if request.method.as_deref() == Some("POST")
            && raw.ends_with(b"\r\n\r\n")
            && request.content_length() > 0
        {
            let mut more = vec![0u8; REQUEST_CHUNK];
            if let Ok(Ok(n)) = timeout(self.cfg.timeout, client.read(&mut more)).await {
                more.truncate(n);
                raw.extend_from_slice(&more);
                request = RequestParser::parse(&raw);
            }
        }
        Ok((raw, request))
    }

    fn target_of(&self, request: &RequestParser, scheme: Scheme) -> Result<(String, u16)> {
        let path = request.path.clone().unwrap_or_default();
        if scheme == Scheme::Https {
            let (host, port) = path
                .rsplit_once(':')
                .ok_or_else(|| Error::Protocol(format!("malformed CONNECT target {:?}", path)))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::Protocol(format!("malformed CONNECT port {:?}", port)))?;
            Ok((host.to_string(), port))
        } else {
            if let Ok(url) = Url::parse(&path) {
                if let Some(host) = url.host_str() {
                    return Ok((host.to_string(), url.port_or_known_default().unwrap_or(80)));
                }
            }
            let host = request
                .get_host()
                .ok_or_else(|| Error::Protocol("request without a host".into()))?;
            let port = request
                .headers
                .get("host")
                .and_then(|h| h.rsplit_once(':').and_then(|(_, p)| p.parse().ok()))
                .unwrap_or(80);
            Ok((host, port))
        }
    }

    /// Control API under the `proxycontrol` virtual host.
    async fn handle_control(&self, request: &RequestParser, client: &mut TcpStream) -> Result<()> {
        let path = request.path.clone().unwrap_or_default();
        let path = path
            .strip_prefix("http://proxycontrol")
            .unwrap_or(&path)
            .to_string();

        if let Some(params) = path.strip_prefix("/api/remove/") {
            match parse_text(params) {
                Ok((host, port)) => {
                    self.pool.remove(&host, port);
                    log::debug!("control api removed {}:{}", host, port);
                    client.write_all(NO_CONTENT).await?;
                }
                Err(_) => {
                    client.write_all(NOT_FOUND).await?;
                }
            }
        } else if let Some(params) = path.strip_prefix("/api/history/") {
            match params.split_once(':') {
                Some(("url", url)) => {
                    let proxy = self.history.lock().get(&url.to_string()).cloned();
                    let body = serde_json::json!({ "proxy": proxy }).to_string();
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
                        body.len()
                    );
                    client.write_all(head.as_bytes()).await?;
                    client.write_all(body.as_bytes()).await?;
                }
                _ => {
                    client.write_all(NOT_FOUND).await?;
                }
            }
        } else {
            client.write_all(NOT_FOUND).await?;
        }
        Ok(())
    }

    async fn resolve_v4(&self, host: &str) -> Result<Ipv4Addr> {
        match self.resolver.resolve(host).await? {
            IpAddr::V4(ip) => Ok(ip),
            IpAddr::V6(_) => Err(Error::Resolve {
                host: host.to_string(),
            }),
        }
    }
}

/// Splices an extra header right after the HTTP status line.
fn inject_after_status_line(data: &[u8], header: &str) -> Vec<u8> {
    if let Some(pos) = data.windows(2).position(|w| w == b"\r\n") {
        let mut out = Vec::with_capacity(data.len() + header.len() + 2);
        out.extend_from_slice(&data[..pos + 2]);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&data[pos + 2..]);
        out
    } else {
        data.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_injected_after_the_status_line() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        let out = inject_after_status_line(data, "X-Proxy-Info: 1.2.3.4:8080");
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nX-Proxy-Info: 1.2.3.4:8080\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn data_without_status_line_is_left_alone() {
        let data = b"raw bytes, no headers";
        let out = inject_after_status_line(data, "X-Proxy-Info: x");
        assert_eq!(out, data);
    }
}
