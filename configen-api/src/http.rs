use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use surf::http::headers::HeaderName;
use surf::http::Method;
use surf::{Client, Url};
use utils::surf_logging::SurfLogging;

/// Headers attached to every authorized request so intermediaries never serve
/// a stale response.
pub const NO_CACHE_HEADERS: [(&str, &str); 3] = [
    ("Cache-Control", "no-cache, no-store, must-revalidate"),
    ("Pragma", "no-cache"),
    ("Expires", "0"),
];

/// A request about to be handed to the transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new<S: Into<String>>(method: Method, url: S) -> Self {
        Self {
            method,
            url: url.into(),
            headers: vec![],
            body: None,
        }
    }

    pub fn get<S: Into<String>>(url: S) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post<S: Into<String>>(url: S, body: Option<Value>) -> Self {
        let mut request = Self::new(Method::Post, url);
        request.body = body;
        request
    }

    pub fn put<S: Into<String>>(url: S, body: Option<Value>) -> Self {
        let mut request = Self::new(Method::Put, url);
        request.body = body;
        request
    }

    pub fn delete<S: Into<String>>(url: S) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// What came back from the wire, reduced to what the client needs.
///
/// Transport failures are represented as the synthetic `status: 0` response
/// instead of an error, so every call site can branch on the status uniformly.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    pub set_cookies: Vec<String>,
}

impl RawResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn network_failure() -> Self {
        Self {
            status: 0,
            body: String::new(),
            set_cookies: vec![],
        }
    }
}

/// The seam between the client and the network. Production uses
/// [`SurfTransport`]; tests script responses through a mock.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> RawResponse;
}

/// Transport backed by a [`surf::Client`] with request logging.
pub struct SurfTransport {
    client: Client,
}

impl SurfTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new().with(SurfLogging),
        }
    }
}

impl Default for SurfTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for SurfTransport {
    async fn send(&self, request: HttpRequest) -> RawResponse {
        let url = match Url::parse(&request.url) {
            Ok(url) => url,
            Err(err) => {
                log::warn!("Invalid request URL {}: {}", request.url, err);
                return RawResponse::network_failure();
            }
        };

        let mut req = surf::Request::new(request.method, url);
        for (name, value) in &request.headers {
            match HeaderName::from_str(name) {
                Ok(name) => {
                    req.insert_header(name, value.as_str());
                }
                Err(err) => log::warn!("Skipping invalid header {}: {}", name, err),
            }
        }
        if let Some(body) = &request.body {
            match surf::Body::from_json(body) {
                Ok(body) => req.set_body(body),
                Err(err) => {
                    log::warn!("Failed to encode request body: {}", err);
                    return RawResponse::network_failure();
                }
            }
        }

        let mut response = match self.client.send(req).await {
            Ok(response) => response,
            Err(err) => {
                log::warn!("Request to {} failed: {}", request.url, err);
                return RawResponse::network_failure();
            }
        };

        let body = match response.body_string().await {
            Ok(body) => body,
            Err(err) => {
                log::warn!("Failed to read response body from {}: {}", request.url, err);
                String::new()
            }
        };
        let set_cookies = response
            .header(surf::http::headers::SET_COOKIE)
            .map(|values| values.iter().map(|value| value.as_str().to_string()).collect())
            .unwrap_or_default();

        RawResponse {
            status: u16::from(response.status()),
            body,
            set_cookies,
        }
    }
}

/// Minimal cookie jar standing in for the browser's `credentials: include`.
/// Session cookies set by the auth endpoints are replayed on every request.
#[derive(Default)]
pub struct CookieJar {
    cookies: Mutex<HashMap<String, String>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record any `Set-Cookie` headers carried by `response`. An empty value
    /// removes the cookie.
    pub fn absorb(&self, response: &RawResponse) {
        if response.set_cookies.is_empty() {
            return;
        }
        let mut cookies = self.lock();
        for raw in &response.set_cookies {
            let Some(pair) = raw.split(';').next() else {
                continue;
            };
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim();
            let value = value.trim();
            if name.is_empty() {
                continue;
            }
            if value.is_empty() {
                cookies.remove(name);
            } else {
                cookies.insert(name.to_string(), value.to_string());
            }
        }
    }

    /// Value for the `Cookie` header, or `None` when the jar is empty.
    pub fn header_value(&self) -> Option<String> {
        let cookies = self.lock();
        if cookies.is_empty() {
            return None;
        }
        let mut pairs: Vec<String> = cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        pairs.sort();
        Some(pairs.join("; "))
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.cookies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
