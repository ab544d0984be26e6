use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::http::{HeaderMap, HeaderValue, Method, Version, header, request::Parts};
use bytes::Bytes;
use url::Url;

/// Facts about the inbound request, captured once when it arrives.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub version: Version,
    pub scheme: String,
    /// Host without port.
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// Address and port this node accepted the request on.
    pub server_addr: IpAddr,
    pub server_port: u16,
    pub body: Bytes,
}

impl RequestInfo {
    /// Build from an absolute URL, as a client connected to `url`'s own host would send it.
    pub fn new(method: Method, url: &str) -> Result<Self, url::ParseError> {
        let parsed = Url::parse(url)?;
        let host = parsed
            .host_str()
            .ok_or(url::ParseError::EmptyHost)?
            .to_string();
        let port = parsed.port_or_known_default().unwrap_or(80);

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&host) {
            headers.insert(header::HOST, value);
        }

        Ok(Self {
            method,
            version: Version::HTTP_11,
            scheme: parsed.scheme().to_string(),
            host,
            port,
            path: parsed.path().to_string(),
            query: parsed.query().map(str::to_string),
            headers,
            server_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server_port: port,
            body: Bytes::new(),
        })
    }

    /// Build from a request accepted on `local`.
    pub fn from_parts(parts: &Parts, body: Bytes, local: SocketAddr) -> Self {
        let authority = parts
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|authority| authority.to_string()));
        let (host, port) = match authority.as_deref().map(split_authority) {
            Some((host, port)) => (host, port.unwrap_or(local.port())),
            None => (local.ip().to_string(), local.port()),
        };

        let server_addr = if local.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            local.ip()
        };

        Self {
            method: parts.method.clone(),
            version: parts.version,
            scheme: parts.uri.scheme_str().unwrap_or("http").to_string(),
            host,
            port,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers.clone(),
            server_addr,
            server_port: local.port(),
            body,
        }
    }

    /// Path plus query string, as sent on the request line.
    pub fn request_uri(&self) -> String {
        match self.query.as_deref() {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }

    pub fn full_uri(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.request_uri())
    }

    pub fn header_str(&self, name: &header::HeaderName) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }
}

fn split_authority(authority: &str) -> (String, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal.
        if let Some((addr, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|port| port.parse().ok());
            return (addr.to_string(), port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            (host.to_string(), port.parse().ok())
        }
        _ => (authority.to_string(), None),
    }
}
