//! Read-only view over an inbound request used by condition matching.
//!
//! The transport layer buffers the request body once and builds an
//! [`HttpRequestView`]; query string, form/JSON body fields and cookies are
//! parsed eagerly so that matching never allocates or fails.
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, header, request::Parts};

/// Accessors a condition may read. Implementations must be cheap and infallible.
pub trait RequestView: Send + Sync {
    fn method(&self) -> &Method;
    fn path(&self) -> &str;
    /// Path plus query string, as received.
    fn uri(&self) -> &str;
    /// Host without port, from the `Host` header or the absolute URI.
    fn host(&self) -> Option<&str>;
    fn header(&self, name: &str) -> Option<&str>;
    fn query_param(&self, name: &str) -> Option<&str>;
    fn post_param(&self, name: &str) -> Option<&str>;
    fn cookie(&self, name: &str) -> Option<&str>;
    fn client_ip(&self) -> Option<IpAddr>;
}

/// [`RequestView`] over a buffered HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequestView {
    method: Method,
    uri: Uri,
    path_and_query: String,
    headers: HeaderMap,
    host: Option<String>,
    query: HashMap<String, String>,
    form: HashMap<String, String>,
    cookies: HashMap<String, String>,
    client_addr: Option<SocketAddr>,
    body: Bytes,
}

impl HttpRequestView {
    pub fn new(parts: Parts, body: Bytes, client_addr: Option<SocketAddr>) -> Self {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| parts.uri.host())
            .map(strip_port);
        let query = parts.uri.query().map(parse_urlencoded).unwrap_or_default();
        let form = parse_body_params(&parts.headers, &body);
        let cookies = parse_cookies(&parts.headers);

        Self {
            method: parts.method,
            uri: parts.uri,
            path_and_query,
            headers: parts.headers,
            host,
            query,
            form,
            cookies,
            client_addr,
            body,
        }
    }

    /// Convenience constructor from a whole `http::Request`.
    pub fn from_request(req: http::Request<Bytes>, client_addr: Option<SocketAddr>) -> Self {
        let (parts, body) = req.into_parts();
        Self::new(parts, body, client_addr)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn full_uri(&self) -> &Uri {
        &self.uri
    }

    pub fn query_string(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }
}

impl RequestView for HttpRequestView {
    fn method(&self) -> &Method {
        &self.method
    }

    fn path(&self) -> &str {
        self.uri.path()
    }

    fn uri(&self) -> &str {
        &self.path_and_query
    }

    fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    fn post_param(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    fn client_ip(&self) -> Option<IpAddr> {
        // First X-Forwarded-For hop wins over the socket peer
        self.header("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .and_then(|hop| hop.trim().parse().ok())
            .or_else(|| self.client_addr.map(|addr| addr.ip()))
    }
}

fn strip_port(host: &str) -> String {
    if host.starts_with('[') {
        // IPv6 literal, keep the brackets off
        return host
            .trim_start_matches('[')
            .split(']')
            .next()
            .unwrap_or(host)
            .to_string();
    }
    host.split(':').next().unwrap_or(host).to_string()
}

fn parse_urlencoded(input: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(input.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn parse_body_params(headers: &HeaderMap, body: &Bytes) -> HashMap<String, String> {
    if body.is_empty() {
        return HashMap::new();
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        return url::form_urlencoded::parse(body)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
    }

    if content_type.starts_with("application/json") {
        // Only top-level scalar fields are addressable
        if let Ok(serde_json::Value::Object(fields)) = serde_json::from_slice(body) {
            return fields
                .into_iter()
                .filter_map(|(k, v)| match v {
                    serde_json::Value::String(s) => Some((k, s)),
                    serde_json::Value::Number(n) => Some((k, n.to_string())),
                    serde_json::Value::Bool(b) => Some((k, b.to_string())),
                    _ => None,
                })
                .collect();
        }
    }

    HashMap::new()
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use http::Request;

    use super::*;

    fn view(req: Request<Bytes>) -> HttpRequestView {
        HttpRequestView::from_request(req, Some("10.0.0.7:5123".parse().unwrap()))
    }

    #[test]
    fn test_query_and_path() {
        let v = view(
            Request::builder()
                .uri("/orders/42?status=open&page=2")
                .body(Bytes::new())
                .unwrap(),
        );
        assert_eq!(v.path(), "/orders/42");
        assert_eq!(v.uri(), "/orders/42?status=open&page=2");
        assert_eq!(v.query_param("status"), Some("open"));
        assert_eq!(v.query_param("missing"), None);
    }

    #[test]
    fn test_form_body_params() {
        let v = view(
            Request::builder()
                .method(Method::POST)
                .uri("/api")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Bytes::from_static(b"module=pdm&method=query"))
                .unwrap(),
        );
        assert_eq!(v.post_param("module"), Some("pdm"));
        assert_eq!(v.post_param("method"), Some("query"));
    }

    #[test]
    fn test_json_body_params() {
        let v = view(
            Request::builder()
                .method(Method::POST)
                .uri("/api")
                .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
                .body(Bytes::from_static(br#"{"module":"pdm","retries":3,"nested":{"a":1}}"#))
                .unwrap(),
        );
        assert_eq!(v.post_param("module"), Some("pdm"));
        assert_eq!(v.post_param("retries"), Some("3"));
        assert_eq!(v.post_param("nested"), None);
    }

    #[test]
    fn test_host_cookie_and_ip() {
        let v = view(
            Request::builder()
                .uri("/")
                .header(header::HOST, "api.example.com:8443")
                .header(header::COOKIE, "session=abc; theme=dark")
                .body(Bytes::new())
                .unwrap(),
        );
        assert_eq!(v.host(), Some("api.example.com"));
        assert_eq!(v.cookie("theme"), Some("dark"));
        assert_eq!(v.client_ip(), Some("10.0.0.7".parse().unwrap()));
    }

    #[test]
    fn test_forwarded_for_takes_precedence() {
        let v = view(
            Request::builder()
                .uri("/")
                .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
                .body(Bytes::new())
                .unwrap(),
        );
        assert_eq!(v.client_ip(), Some("203.0.113.9".parse().unwrap()));
    }
}
