use std::collections::BTreeMap;

use httparse::{Status, EMPTY_HEADER};
use rand::Rng;
use url::Url;

pub fn random_useragent(random_value: bool) -> String {
    let name = option_env!("CARGO_PKG_NAME").unwrap_or("proxyhive");
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("0.0.0");

    let mut rv = "".to_string();
    if random_value {
        let mut rng = rand::thread_rng();
        rv.push('/');
        rv.push_str(rng.gen_range(1000..9999).to_string().as_str())
    }

    format!("{}/{}{}", name, version, rv)
}

/// Default header set for probe requests. Returns the headers plus the random
/// tag appended to the User-Agent, so callers can verify the response echoes
/// this exact request.
pub fn get_headers(random_value: bool) -> (BTreeMap<String, String>, String) {
    let ua = random_useragent(random_value);
    let rv = ua.split('/').last().unwrap_or_default().to_string();

    let mut headers = BTreeMap::new();
    headers.insert("User-Agent".to_string(), ua);
    headers.insert("Accept".to_string(), "*/*".to_string());
    headers.insert("Accept-Encoding".to_string(), "identity".to_string());
    headers.insert("Pragma".to_string(), "no-cache".to_string());
    headers.insert("Cache-Control".to_string(), "no-cache".to_string());
    headers.insert("Cookie".to_string(), "cookie=ok".to_string());
    headers.insert("Referer".to_string(), "https://google.com/".to_string());

    (headers, rv)
}

#[derive(Debug, Default)]
pub struct RequestParser {
    pub method: Option<String>,
    pub path: Option<String>,
    pub version: Option<u8>,
    pub headers: BTreeMap<String, String>,
}

impl RequestParser {
    pub fn parse(data: &[u8]) -> Self {
        let mut request = RequestParser::default();
        let mut chunk = vec![EMPTY_HEADER; 128];
        let mut parser = httparse::Request::new(&mut chunk);

        if let Ok(Status::Complete(_)) = parser.parse(data) {
            if let Some(method) = parser.method {
                request.method = Some(method.to_uppercase());
            }
            if let Some(path) = parser.path {
                request.path = Some(path.to_string());
            }
            request.version = parser.version;
            for header in parser.headers.iter() {
                request.headers.insert(
                    header.name.to_lowercase(),
                    String::from_utf8_lossy(header.value).to_string(),
                );
            }
        }

        request
    }

    pub fn is_complete(&self) -> bool {
        self.method.is_some() && self.path.is_some()
    }

    /// Host of the request target: the absolute URI when present, otherwise
    /// the Host header. A trailing `:port` is stripped.
    pub fn get_host(&self) -> Option<String> {
        if let Some(path) = &self.path {
            if let Ok(url) = Url::parse(path.as_str()) {
                if let Some(host) = url.host_str() {
                    return Some(host.to_string());
                }
            }
        }

        if let Some(host) = self.headers.get("host") {
            let host = host.split(':').next().unwrap_or(host);
            return Some(host.to_string());
        }

        None
    }

    pub fn content_length(&self) -> usize {
        self.headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct ResponseParser {
    pub version: Option<u8>,
    pub status_code: Option<u16>,
    pub reason: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub raw: String,
}

impl ResponseParser {
    pub fn parse(data: &[u8]) -> Self {
        let mut response = ResponseParser::default();
        let mut chunk = vec![EMPTY_HEADER; 128];
        let mut parser = httparse::Response::new(&mut chunk);

        if let Ok(Status::Complete(n)) = parser.parse(data) {
            response.version = parser.version;
            response.status_code = parser.code;
            response.reason = parser.reason.map(|r| r.to_string());
            response.raw.push_str(&String::from_utf8_lossy(&data[..n]));

            for header in parser.headers.iter() {
                response.headers.insert(
                    header.name.to_lowercase(),
                    String::from_utf8_lossy(header.value).to_string(),
                );
            }

            response.body = String::from_utf8_lossy(&data[n..]).to_string();
            response.raw.push_str(response.body.as_str());
        } else {
            response.raw.push_str(&String::from_utf8_lossy(data))
        }
        response
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status_code, Some(code) if (200..300).contains(&code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_absolute_uri() {
        let raw = b"GET http://azenv.net/ HTTP/1.1\r\nHost: azenv.net\r\nConnection: close\r\n\r\n";
        let req = RequestParser::parse(raw);
        assert_eq!(req.method.as_deref(), Some("GET"));
        assert_eq!(req.path.as_deref(), Some("http://azenv.net/"));
        assert_eq!(req.get_host().as_deref(), Some("azenv.net"));
    }

    #[test]
    fn parse_request_connect() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let req = RequestParser::parse(raw);
        assert_eq!(req.method.as_deref(), Some("CONNECT"));
        assert_eq!(req.path.as_deref(), Some("example.com:443"));
        assert_eq!(req.get_host().as_deref(), Some("example.com"));
    }

    #[test]
    fn parse_response_with_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nhello";
        let resp = ResponseParser::parse(raw);
        assert_eq!(resp.status_code, Some(200));
        assert!(resp.is_success());
        assert_eq!(resp.headers.get("content-type").unwrap(), "text/plain");
        assert_eq!(resp.body, "hello");
    }

    #[test]
    fn parse_response_bad_gateway() {
        let resp = ResponseParser::parse(b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
        assert_eq!(resp.status_code, Some(502));
        assert!(!resp.is_success());
    }

    #[test]
    fn headers_carry_random_tag() {
        let (headers, rv) = get_headers(true);
        assert!(headers.get("User-Agent").unwrap().ends_with(&rv));
        assert_eq!(headers.get("Accept-Encoding").unwrap(), "identity");
    }
}
