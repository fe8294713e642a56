use crate::cache::{CacheConfig, CacheOptions, CacheStats, RequestCache};
use crate::error::Error;
use crate::http::{CookieJar, HttpRequest, HttpTransport, RawResponse, SurfTransport, NO_CACHE_HEADERS};
use crate::response::ApiResponse;
use crate::session::{
    AuthStatus, FileSessionStorage, MemorySessionStorage, PersistedSession, SessionStorage,
};
use chrono::Duration;
use getset::Getters;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

const DEFAULT_API_URL: &str = "https://api.configen.example/api";

/// Environment variable overriding the API base address.
pub const API_URL_ENV: &str = "CONFIGEN_API_URL";

/// Client configuration. The base address is never hardcoded in request
/// logic; it comes from here (or the `CONFIGEN_API_URL` environment variable).
#[derive(Clone, Debug, Getters)]
#[get = "pub"]
pub struct ClientConfig {
    base_url: String,
    cache: CacheConfig,
    /// Freshness window for the token refresh result.
    refresh_ttl: Duration,
    /// Freshness window for the session verify result.
    verify_ttl: Duration,
    /// Where the session status/email survive restarts. `None` keeps them in
    /// memory only.
    session_file: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        Self {
            base_url: base_url.into(),
            cache: CacheConfig::default(),
            refresh_ttl: Duration::seconds(5),
            verify_ttl: Duration::seconds(10),
            session_file: None,
        }
    }

    pub fn from_env() -> Self {
        match std::env::var(API_URL_ENV) {
            Ok(url) if !url.is_empty() => Self::new(url),
            _ => Self::default(),
        }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    pub fn with_verify_ttl(mut self, ttl: Duration) -> Self {
        self.verify_ttl = ttl;
        self
    }

    pub fn with_session_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.session_file = Some(path.into());
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL)
    }
}

/// Outcome of a server-side session check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCheck {
    /// The server confirmed the session.
    Valid,
    /// The server rejected the session (or it is locally unauthenticated).
    Invalid,
    /// The server could not be reached; nothing is known.
    Unreachable,
}

pub(crate) struct ClientCore {
    config: ClientConfig,
    transport: Arc<dyn HttpTransport>,
    cookies: CookieJar,
    storage: Arc<dyn SessionStorage>,
    cache: RequestCache<ApiResponse>,
}

impl ClientCore {
    /// Send a request with the session cookies attached, absorbing any
    /// cookies the response sets.
    async fn send_raw(&self, mut request: HttpRequest) -> RawResponse {
        if let Some(cookie) = self.cookies.header_value() {
            request.headers.push(("Cookie".to_string(), cookie));
        }
        let response = self.transport.send(request).await;
        self.cookies.absorb(&response);
        response
    }

    /// The authenticated fetch wrapper: no-cache headers, cookies, and a
    /// single refresh-and-retry on 401. Failures come back as the synthetic
    /// `status: 0` response, never as an error.
    async fn authorized_fetch(self: &Arc<Self>, request: HttpRequest) -> RawResponse {
        let request = with_default_headers(request);
        let response = self.send_raw(request.clone()).await;

        if response.status == 401 {
            log::info!("Received 401 for {}, attempting token refresh", request.url);
            if self.refresh_token().await {
                log::info!("Token refreshed, retrying {}", request.url);
                return self.send_raw(request).await;
            }
        }
        response
    }

    /// Refresh the session token. Routed through the cache store under the
    /// refresh URL with a short TTL, so concurrent 401s across simultaneous
    /// requests trigger exactly one refresh.
    async fn refresh_token(self: &Arc<Self>) -> bool {
        let url = format!("{}/auth/refresh", self.config.base_url());
        let core = Arc::clone(self);
        let request_url = url.clone();
        let result = self
            .cache
            .execute(
                &url,
                move || async move {
                    let mut request = HttpRequest::post(&request_url, None);
                    for (name, value) in NO_CACHE_HEADERS {
                        request = request.with_header(name, value);
                    }
                    let raw = core.send_raw(request).await;
                    Ok(ApiResponse::from_raw(&raw))
                },
                CacheOptions::with_ttl(*self.config.refresh_ttl()),
            )
            .await;

        match result {
            Ok(response) => {
                let refreshed = response.status == 200;
                log::info!("Token refresh result: {}", refreshed);
                if refreshed {
                    self.storage.update_status(AuthStatus::Authenticated);
                }
                refreshed
            }
            Err(err) => {
                log::warn!("Token refresh failed: {}", err);
                false
            }
        }
    }
}

fn with_default_headers(request: HttpRequest) -> HttpRequest {
    let mut headers: Vec<(String, String)> =
        vec![("Content-Type".to_string(), "application/json".to_string())];
    for (name, value) in NO_CACHE_HEADERS {
        headers.push((name.to_string(), value.to_string()));
    }
    // caller-supplied headers are applied after the defaults and win
    headers.extend(request.headers.clone());
    HttpRequest { headers, ..request }
}

/// Client for the configen API: authentication, registration, and the generic
/// resource helpers, all funneled through the request cache.
pub struct ConfigenClient {
    core: Arc<ClientCore>,
    sweeper: JoinHandle<()>,
}

impl ConfigenClient {
    /// Build a client with the surf transport and the storage implied by the
    /// config. Must be called within a tokio runtime (the cache sweeper is
    /// spawned here).
    pub fn new(config: ClientConfig) -> Self {
        let storage: Arc<dyn SessionStorage> = match config.session_file() {
            Some(path) => Arc::new(FileSessionStorage::new(path.clone())),
            None => Arc::new(MemorySessionStorage::new()),
        };
        Self::with_parts(config, Arc::new(SurfTransport::new()), storage)
    }

    /// Build a client over an explicit transport and session storage.
    pub fn with_parts(
        config: ClientConfig,
        transport: Arc<dyn HttpTransport>,
        storage: Arc<dyn SessionStorage>,
    ) -> Self {
        let cache = RequestCache::new(config.cache().clone());
        let sweeper = cache.spawn_sweeper();
        let core = Arc::new(ClientCore {
            config,
            transport,
            cookies: CookieJar::new(),
            storage,
            cache,
        });
        Self { core, sweeper }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }

    pub fn storage(&self) -> Arc<dyn SessionStorage> {
        Arc::clone(&self.core.storage)
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}{}", self.core.config.base_url(), endpoint)
    }

    /// POST `/auth/login`. A non-2xx answer surfaces the server's `detail`
    /// message; failures are never cached, so a corrected retry goes out
    /// immediately.
    pub async fn login(&self, email: &str, password: &str) -> Result<Value, Error> {
        let url = self.endpoint_url("/auth/login");
        let core = Arc::clone(&self.core);
        let request_url = url.clone();
        let body = json!({ "email": email, "password": password });

        let response = self
            .core
            .cache
            .execute(
                &url,
                move || async move {
                    let raw = core.send_raw(with_default_headers(HttpRequest::post(
                        &request_url,
                        Some(body),
                    )))
                    .await;
                    if raw.status == 0 {
                        return Err(Error::network("login request did not reach the server"));
                    }
                    let envelope = ApiResponse::from_raw(&raw);
                    if !envelope.ok {
                        return Err(Error::authentication(envelope.message()));
                    }
                    Ok(envelope)
                },
                CacheOptions::default(),
            )
            .await?;
        Ok(response.data)
    }

    /// POST `/auth/refresh`; `true` on a 200.
    pub async fn refresh_token(&self) -> bool {
        self.core.refresh_token().await
    }

    /// POST `/auth/logout`, then drop every cached response and cookie.
    /// `true` unless the server was unreachable.
    pub async fn logout(&self) -> bool {
        let url = self.endpoint_url("/auth/logout");
        let core = Arc::clone(&self.core);
        let request_url = url.clone();
        let result = self
            .core
            .cache
            .execute(
                &url,
                move || async move {
                    let raw = core.send_raw(HttpRequest::post(&request_url, None)).await;
                    Ok(ApiResponse::from_raw(&raw))
                },
                CacheOptions::default(),
            )
            .await;

        self.core.cache.clear(None);
        self.core.cookies.clear();
        matches!(result, Ok(response) if response.status != 0)
    }

    /// GET `/auth/verify` with a cache buster, judged by status alone (the
    /// body is never read). A locally persisted `unauthenticated` status
    /// resolves without touching the network.
    pub async fn verify_session(&self) -> AuthCheck {
        if self.core.storage.load().status == AuthStatus::Unauthenticated {
            log::debug!("Skipping server verify: locally unauthenticated");
            return AuthCheck::Invalid;
        }

        let url = utils::query::with_cache_buster(&self.endpoint_url("/auth/verify"));
        let core = Arc::clone(&self.core);
        let request_url = url.clone();
        let result = self
            .core
            .cache
            .execute(
                &url,
                move || async move {
                    let mut request = HttpRequest::get(&request_url).with_header("Accept", "*/*");
                    for (name, value) in NO_CACHE_HEADERS {
                        request = request.with_header(name, value);
                    }
                    let raw = core.send_raw(request).await;
                    // only the status matters here
                    Ok(ApiResponse {
                        ok: raw.ok(),
                        status: raw.status,
                        data: Value::Null,
                        error: None,
                        text: String::new(),
                        text_content: false,
                    })
                },
                CacheOptions::with_ttl(*self.core.config.verify_ttl()),
            )
            .await;

        match result {
            Ok(response) if response.status == 200 => {
                self.core.storage.update_status(AuthStatus::Authenticated);
                AuthCheck::Valid
            }
            Ok(response) if response.status == 0 => {
                log::warn!("Auth verify unreachable");
                AuthCheck::Unreachable
            }
            Ok(response) => {
                log::info!("Auth verify rejected with status {}", response.status);
                self.core.storage.update_status(AuthStatus::Unauthenticated);
                AuthCheck::Invalid
            }
            Err(err) => {
                log::warn!("Auth verify failed: {}", err);
                AuthCheck::Unreachable
            }
        }
    }

    /// Boolean form of [`verify_session`](Self::verify_session).
    pub async fn check_auth(&self) -> bool {
        self.verify_session().await == AuthCheck::Valid
    }

    /// POST `/register/request-code`.
    pub async fn register_request_code(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Value, Error> {
        self.register_post(
            "/register/request-code",
            json!({ "email": email, "password": password }),
        )
        .await
    }

    /// POST `/register/verify`.
    pub async fn register_verify(&self, email: &str, code: &str) -> Result<Value, Error> {
        self.register_post("/register/verify", json!({ "email": email, "code": code }))
            .await
    }

    async fn register_post(&self, endpoint: &str, body: Value) -> Result<Value, Error> {
        let url = self.endpoint_url(endpoint);
        let core = Arc::clone(&self.core);
        let request_url = url.clone();
        let response = self
            .core
            .cache
            .execute(
                &url,
                move || async move {
                    let raw = core.send_raw(with_default_headers(HttpRequest::post(
                        &request_url,
                        Some(body),
                    )))
                    .await;
                    if raw.status == 0 {
                        return Err(Error::network("registration request did not reach the server"));
                    }
                    let envelope = ApiResponse::from_raw(&raw);
                    if !envelope.ok {
                        return Err(Error::registration(envelope.message()));
                    }
                    Ok(envelope)
                },
                CacheOptions::default(),
            )
            .await?;
        Ok(response.data)
    }

    /// GET a resource. A cache-busting query parameter keeps intermediaries
    /// honest; concurrent calls for the same resource still coalesce through
    /// the base-key match on the pending map.
    pub async fn get(&self, endpoint: &str) -> ApiResponse {
        let url = utils::query::with_cache_buster(&self.endpoint_url(endpoint));
        self.execute_envelope(&url, HttpRequest::get(&url)).await
    }

    pub async fn post(&self, endpoint: &str, data: Value) -> ApiResponse {
        let url = self.endpoint_url(endpoint);
        let request = HttpRequest::post(&url, Some(data));
        self.execute_envelope(&url, request).await
    }

    pub async fn put(&self, endpoint: &str, data: Value) -> ApiResponse {
        let url = self.endpoint_url(endpoint);
        let request = HttpRequest::put(&url, Some(data));
        self.execute_envelope(&url, request).await
    }

    pub async fn delete(&self, endpoint: &str) -> ApiResponse {
        let url = self.endpoint_url(endpoint);
        self.execute_envelope(&url, HttpRequest::delete(&url)).await
    }

    async fn execute_envelope(&self, url: &str, request: HttpRequest) -> ApiResponse {
        let core = Arc::clone(&self.core);
        let result = self
            .core
            .cache
            .execute(
                url,
                move || async move {
                    let raw = core.authorized_fetch(request).await;
                    Ok(ApiResponse::from_raw(&raw))
                },
                CacheOptions::default(),
            )
            .await;
        match result {
            Ok(response) => response,
            Err(err) => ApiResponse::from_error(&err),
        }
    }

    /// GET `/account/info`, with a non-ok answer mapped to a status error.
    pub async fn account_info(&self) -> Result<Value, Error> {
        let response = self.get("/account/info").await;
        if !response.ok {
            log::warn!("Failed to load account info: {}", response.message());
            return Err(Error::status(response.status, response.message()));
        }
        Ok(response.data)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.core.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.core.cache.clear(None);
    }

    /// Persist a session transition on behalf of the session manager.
    pub fn persist_session(&self, session: &PersistedSession) {
        self.core.storage.store(session);
    }
}

impl Drop for ConfigenClient {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}
