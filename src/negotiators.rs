use std::net::Ipv4Addr;

use byteorder::{BigEndian, WriteBytesExt};

use crate::errors::{Error, Result};
use crate::proxy::{Proto, Proxy};
use crate::utils::http::{get_headers, ResponseParser};

const SMTP_READY: &[u8] = b"220";

/// Where the proxy should connect to. SOCKS negotiation needs the resolved
/// IPv4 of the target; the CONNECT family only needs the hostname.
#[derive(Debug, Clone)]
pub struct NegotiateTarget {
    pub host: String,
    pub ip: Option<Ipv4Addr>,
    pub port: u16,
}

impl NegotiateTarget {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            ip: None,
            port,
        }
    }

    pub fn with_ip(host: &str, ip: Ipv4Addr, port: u16) -> Self {
        Self {
            host: host.to_string(),
            ip: Some(ip),
            port,
        }
    }
}

/// Per-protocol handshake over an already-open proxy stream. One closed set
/// of variants, one operation; the checker decides retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiator {
    Http,
    Https,
    Connect80,
    Connect25,
    Socks4,
    Socks5,
}

impl Negotiator {
    pub fn for_proto(proto: Proto) -> Self {
        match proto {
            Proto::Http => Negotiator::Http,
            Proto::Https => Negotiator::Https,
            Proto::Connect80 => Negotiator::Connect80,
            Proto::Connect25 => Negotiator::Connect25,
            Proto::Socks4 => Negotiator::Socks4,
            Proto::Socks5 => Negotiator::Socks5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Negotiator::Http => "HTTP",
            Negotiator::Https => "HTTPS",
            Negotiator::Connect80 => "CONNECT:80",
            Negotiator::Connect25 => "CONNECT:25",
            Negotiator::Socks4 => "SOCKS4",
            Negotiator::Socks5 => "SOCKS5",
        }
    }

    /// Whether the judge response should be graded for anonymity.
    pub fn check_anon_lvl(&self) -> bool {
        matches!(self, Negotiator::Http)
    }

    /// Whether probe requests must carry the absolute URI in the request
    /// line (plain HTTP proxying) rather than just the path.
    pub fn use_full_path(&self) -> bool {
        matches!(self, Negotiator::Http)
    }

    pub async fn negotiate(&self, proxy: &mut Proxy, target: &NegotiateTarget) -> Result<()> {
        match self {
            // No handshake; the request itself is the protocol.
            Negotiator::Http => Ok(()),
            Negotiator::Https => self.connect_tunnel(proxy, &target.host, target.port).await,
            Negotiator::Connect80 => self.connect_tunnel(proxy, &target.host, 80).await,
            Negotiator::Connect25 => {
                self.connect_tunnel(proxy, &target.host, 25).await?;
                let greeting = proxy.recv_exact(3).await?;
                if greeting != SMTP_READY {
                    proxy.log("Failed (invalid SMTP greeting)", None, Some("bad_greeting"));
                    return Err(Error::handshake(
                        self.name(),
                        "target did not answer with SMTP 220",
                    ));
                }
                proxy.log("Request is granted", None, None);
                Ok(())
            }
            Negotiator::Socks4 => self.socks4(proxy, target).await,
            Negotiator::Socks5 => self.socks5(proxy, target).await,
        }
    }

    async fn connect_tunnel(&self, proxy: &mut Proxy, host: &str, port: u16) -> Result<()> {
        let (headers, _) = get_headers(false);
        let user_agent = headers.get("User-Agent").cloned().unwrap_or_default();
        let payload = format!(
            "CONNECT {0}:{1} HTTP/1.1\r\nHost: {0}\r\nUser-Agent: {2}\r\nConnection: keep-alive\r\n\r\n",
            host, port, user_agent
        );
        proxy.send(payload.as_bytes()).await?;

        let head = proxy.recv_head().await?;
        let response = ResponseParser::parse(head.as_slice());
        if !response.is_success() {
            let status = response.status_code.unwrap_or(0);
            proxy.log(
                &format!("Connect: failed. HTTP status: {}", status),
                None,
                Some("bad_status"),
            );
            return Err(Error::handshake(
                self.name(),
                format!("CONNECT answered {}", status),
            ));
        }
        proxy.log("Connect: success", None, None);
        Ok(())
    }

    async fn socks4(&self, proxy: &mut Proxy, target: &NegotiateTarget) -> Result<()> {
        let ip = target
            .ip
            .ok_or_else(|| Error::handshake(self.name(), "target IPv4 required"))?;

        let mut packet = Vec::with_capacity(9);
        packet.write_u8(4)?;
        packet.write_u8(1)?;
        packet.write_u16::<BigEndian>(target.port)?;
        packet.extend_from_slice(&ip.octets());
        packet.write_u8(0)?;

        proxy.send(packet.as_slice()).await?;
        let resp = proxy.recv_exact(8).await?;

        if resp[0] != 0x00 || resp[1] != 0x5A {
            proxy.log("Failed (invalid data)", None, Some("bad_reply"));
            return Err(Error::handshake(
                self.name(),
                format!("request rejected with code {:#04x}", resp[1]),
            ));
        }
        proxy.log("Request is granted", None, None);
        Ok(())
    }

    async fn socks5(&self, proxy: &mut Proxy, target: &NegotiateTarget) -> Result<()> {
        proxy.send(&[5, 1, 0]).await?;
        let resp = proxy.recv_exact(2).await?;

        if resp[0] != 0x05 {
            proxy.log("Invalid version", None, Some("bad_version"));
            return Err(Error::handshake(self.name(), "unexpected version byte"));
        }
        if resp[1] == 0xff {
            proxy.log("Failed (auth is required)", None, Some("auth_required"));
            return Err(Error::handshake(self.name(), "authentication required"));
        }
        if resp[1] != 0x00 {
            proxy.log("Failed (invalid data)", None, Some("bad_reply"));
            return Err(Error::handshake(self.name(), "method negotiation failed"));
        }

        let ip = target
            .ip
            .ok_or_else(|| Error::handshake(self.name(), "target IPv4 required"))?;

        let mut packet = Vec::with_capacity(10);
        packet.write_u8(5)?;
        packet.write_u8(1)?;
        packet.write_u8(0)?;
        packet.write_u8(1)?;
        packet.extend_from_slice(&ip.octets());
        packet.write_u16::<BigEndian>(target.port)?;

        proxy.send(packet.as_slice()).await?;
        let resp = proxy.recv_exact(10).await?;

        if resp[0] != 0x05 || resp[1] != 0x00 {
            proxy.log("Failed (invalid data)", None, Some("bad_reply"));
            return Err(Error::handshake(
                self.name(),
                format!("connect request rejected with code {:#04x}", resp[1]),
            ));
        }
        proxy.log("Request is granted", None, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn proxy_to(listener: &TcpListener) -> Proxy {
        let addr = listener.local_addr().unwrap();
        let mut proxy = Proxy::new("127.0.0.1", addr.port(), vec![]).unwrap();
        proxy.connect().await.unwrap();
        proxy
    }

    #[tokio::test]
    async fn socks5_handshake_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut proxy = proxy_to(&listener).await;

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            sock.write_all(&[5, 0]).await.unwrap();

            let mut request = [0u8; 10];
            sock.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..4], &[5, 1, 0, 1]);
            assert_eq!(&request[4..8], &[93, 184, 216, 34]);
            assert_eq!(u16::from_be_bytes([request[8], request[9]]), 80);
            sock.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = NegotiateTarget::with_ip("example.com", Ipv4Addr::new(93, 184, 216, 34), 80);
        Negotiator::Socks5
            .negotiate(&mut proxy, &target)
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn socks4_rejection_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut proxy = proxy_to(&listener).await;

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 9];
            sock.read_exact(&mut request).await.unwrap();
            assert_eq!(request[0], 4);
            // 0x5B: request rejected or failed
            sock.write_all(&[0, 0x5B, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let target = NegotiateTarget::with_ip("example.com", Ipv4Addr::new(93, 184, 216, 34), 80);
        let result = Negotiator::Socks4.negotiate(&mut proxy, &target).await;
        assert!(matches!(result, Err(Error::Handshake { .. })));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_tunnel_accepts_2xx() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut proxy = proxy_to(&listener).await;

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
            sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
        });

        let target = NegotiateTarget::new("example.com", 443);
        Negotiator::Https
            .negotiate(&mut proxy, &target)
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_tunnel_rejects_error_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut proxy = proxy_to(&listener).await;

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await.unwrap();
        });

        let target = NegotiateTarget::new("example.com", 80);
        let result = Negotiator::Connect80.negotiate(&mut proxy, &target).await;
        assert!(matches!(result, Err(Error::Handshake { .. })));
        server.await.unwrap();
    }

    #[test]
    fn flags_follow_protocol() {
        assert!(Negotiator::Http.check_anon_lvl());
        assert!(Negotiator::Http.use_full_path());
        for ngtr in [
            Negotiator::Https,
            Negotiator::Connect80,
            Negotiator::Connect25,
            Negotiator::Socks4,
            Negotiator::Socks5,
        ] {
            assert!(!ngtr.check_anon_lvl());
            assert!(!ngtr.use_full_path());
        }
    }
}
