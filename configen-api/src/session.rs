use crate::client::{AuthCheck, ConfigenClient};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;
use strum_macros::{Display, EnumString};
use tokio::task::JoinHandle;

/// Local view of the server-side session truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Unknown,
    Authenticated,
    Unauthenticated,
}

impl Default for AuthStatus {
    fn default() -> Self {
        AuthStatus::Unknown
    }
}

/// The two durable session fields: status and last-known email.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub status: AuthStatus,
    pub email: Option<String>,
}

impl PersistedSession {
    pub fn authenticated<S: Into<String>>(email: S) -> Self {
        Self {
            status: AuthStatus::Authenticated,
            email: Some(email.into()),
        }
    }

    pub fn unauthenticated() -> Self {
        Self {
            status: AuthStatus::Unauthenticated,
            email: None,
        }
    }
}

/// Durable storage for the session fields, surviving restarts.
///
/// Implementations never fail loudly: a broken backing store degrades to the
/// default (`unknown`) session with a log line.
pub trait SessionStorage: Send + Sync {
    fn load(&self) -> PersistedSession;
    fn store(&self, session: &PersistedSession);

    fn update_status(&self, status: AuthStatus) {
        let mut session = self.load();
        session.status = status;
        self.store(&session);
    }
}

/// In-memory storage, used by default and in tests.
#[derive(Default)]
pub struct MemorySessionStorage {
    session: Mutex<PersistedSession>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(session: PersistedSession) -> Self {
        Self {
            session: Mutex::new(session),
        }
    }
}

impl SessionStorage for MemorySessionStorage {
    fn load(&self) -> PersistedSession {
        lock(&self.session).clone()
    }

    fn store(&self, session: &PersistedSession) {
        *lock(&self.session) = session.clone();
    }
}

/// JSON-file storage, the durable analog of the browser's local storage.
pub struct FileSessionStorage {
    path: PathBuf,
}

impl FileSessionStorage {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl SessionStorage for FileSessionStorage {
    fn load(&self) -> PersistedSession {
        match fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(session) => session,
                Err(err) => {
                    log::warn!("Corrupt session file {}: {}", self.path.display(), err);
                    PersistedSession::default()
                }
            },
            Err(_) => PersistedSession::default(),
        }
    }

    fn store(&self, session: &PersistedSession) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                log::warn!("Cannot create session directory {}: {}", parent.display(), err);
                return;
            }
        }
        match serde_json::to_string_pretty(session) {
            Ok(contents) => {
                if let Err(err) = fs::write(&self.path, contents) {
                    log::warn!("Cannot write session file {}: {}", self.path.display(), err);
                }
            }
            Err(err) => log::warn!("Cannot encode session: {}", err),
        }
    }
}

/// Account data returned by `/account/info`. Unknown fields are ignored,
/// missing fields tolerated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserAccount {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub requests_this_month: Option<u64>,
    #[serde(default)]
    pub request_limit: Option<u64>,
    #[serde(default)]
    pub limit_reset_date: Option<String>,
}

/// The signed-in user as known to the session manager. `account` is `None`
/// while only the provisional (persisted) identity is available.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUser {
    pub email: String,
    pub account: Option<UserAccount>,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Interval of the background token refresh.
    pub auto_refresh_interval: StdDuration,
    /// Upper bound on how long the loading flag may stay set; the underlying
    /// request is not aborted when it elapses.
    pub login_grace: StdDuration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_refresh_interval: StdDuration::from_secs(55 * 60),
            login_grace: StdDuration::from_secs(15),
        }
    }
}

/// In-memory session fields, shared with the background refresh task so a
/// failed scheduled refresh can revoke them.
#[derive(Default)]
struct SessionState {
    status: Mutex<AuthStatus>,
    user: Mutex<Option<SessionUser>>,
}

impl SessionState {
    fn set(&self, status: AuthStatus, user: Option<SessionUser>) {
        *lock(&self.status) = status;
        *lock(&self.user) = user;
    }
}

/// Process-wide session state machine: `unknown -> {authenticated,
/// unauthenticated}`, `authenticated -> unauthenticated` on logout or failed
/// refresh, `unauthenticated -> authenticated` on login or a successful
/// verify/refresh during the startup check.
pub struct AuthSession {
    client: Arc<ConfigenClient>,
    config: SessionConfig,
    state: Arc<SessionState>,
    loading: Arc<AtomicBool>,
    check_in_progress: AtomicBool,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    loading_guard: Mutex<Option<JoinHandle<()>>>,
}

impl AuthSession {
    pub fn new(client: Arc<ConfigenClient>) -> Self {
        Self::with_config(client, SessionConfig::default())
    }

    pub fn with_config(client: Arc<ConfigenClient>, config: SessionConfig) -> Self {
        Self {
            client,
            config,
            state: Arc::new(SessionState::default()),
            loading: Arc::new(AtomicBool::new(false)),
            check_in_progress: AtomicBool::new(false),
            refresh_task: Mutex::new(None),
            loading_guard: Mutex::new(None),
        }
    }

    pub fn status(&self) -> AuthStatus {
        *lock(&self.state.status)
    }

    pub fn user(&self) -> Option<SessionUser> {
        lock(&self.state.user).clone()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Resolve the session on startup: restore the persisted state
    /// provisionally, then confirm or revoke it against the server.
    /// Concurrent re-entry returns the current status without a second check.
    pub async fn check_session(&self) -> AuthStatus {
        if self.check_in_progress.swap(true, Ordering::SeqCst) {
            log::debug!("Session check already in progress");
            return self.status();
        }
        let status = self.run_session_check().await;
        self.check_in_progress.store(false, Ordering::SeqCst);
        status
    }

    async fn run_session_check(&self) -> AuthStatus {
        let persisted = self.client.storage().load();
        log::info!("Checking session, persisted status: {}", persisted.status);

        let email = match (persisted.status, persisted.email) {
            (AuthStatus::Unauthenticated, _) => {
                self.mark_unauthenticated();
                return AuthStatus::Unauthenticated;
            }
            (AuthStatus::Authenticated, Some(email)) => email,
            _ => {
                self.mark_unauthenticated();
                return AuthStatus::Unauthenticated;
            }
        };

        // provisional state, restored before any server round trip
        self.set_state(
            AuthStatus::Authenticated,
            Some(SessionUser {
                email: email.clone(),
                account: None,
            }),
        );

        match self.client.verify_session().await {
            AuthCheck::Valid => {
                log::info!("Session confirmed, loading account data");
                self.load_user_data(&email).await;
                self.start_auto_refresh();
                AuthStatus::Authenticated
            }
            AuthCheck::Invalid => {
                log::info!("Session rejected, attempting token refresh");
                if self.client.refresh_token().await {
                    self.load_user_data(&email).await;
                    self.start_auto_refresh();
                    AuthStatus::Authenticated
                } else {
                    self.mark_unauthenticated();
                    AuthStatus::Unauthenticated
                }
            }
            AuthCheck::Unreachable => {
                // keep the provisional session instead of logging the user
                // out over a network blip; the next check settles it
                log::warn!("Verify unreachable, keeping provisional session for {}", email);
                self.start_auto_refresh();
                AuthStatus::Authenticated
            }
        }
    }

    async fn load_user_data(&self, fallback_email: &str) {
        match self.client.account_info().await {
            Ok(data) => match serde_json::from_value::<UserAccount>(data) {
                Ok(account) => {
                    let email = if account.email.is_empty() {
                        fallback_email.to_string()
                    } else {
                        account.email.clone()
                    };
                    self.client
                        .persist_session(&PersistedSession::authenticated(email.clone()));
                    self.set_state(
                        AuthStatus::Authenticated,
                        Some(SessionUser {
                            email,
                            account: Some(account),
                        }),
                    );
                }
                Err(err) => {
                    log::warn!("Unexpected account payload: {}", err);
                    self.keep_provisional(fallback_email);
                }
            },
            Err(err) => {
                // the session itself is still considered valid
                log::warn!("Account data unavailable: {}", err);
                self.keep_provisional(fallback_email);
            }
        }
    }

    fn keep_provisional(&self, email: &str) {
        self.client
            .persist_session(&PersistedSession::authenticated(email));
        self.set_state(
            AuthStatus::Authenticated,
            Some(SessionUser {
                email: email.to_string(),
                account: None,
            }),
        );
    }

    /// Log in and transition to `authenticated` on success.
    pub async fn login(&self, email: &str, password: &str) -> Result<(), Error> {
        self.begin_loading();
        let result = self.client.login(email, password).await;
        self.end_loading();

        match result {
            Ok(_) => {
                self.client
                    .persist_session(&PersistedSession::authenticated(email));
                self.set_state(
                    AuthStatus::Authenticated,
                    Some(SessionUser {
                        email: email.to_string(),
                        account: None,
                    }),
                );
                self.start_auto_refresh();
                Ok(())
            }
            Err(err) => {
                log::warn!("Login failed: {}", err);
                Err(err)
            }
        }
    }

    /// Log out: local state is reset before the server request goes out.
    pub async fn logout(&self) -> bool {
        self.stop_auto_refresh();
        self.mark_unauthenticated();
        self.client.logout().await
    }

    pub async fn register_request_code(&self, email: &str, password: &str) -> Result<(), Error> {
        self.begin_loading();
        let result = self.client.register_request_code(email, password).await;
        self.end_loading();
        result.map(|_| ())
    }

    pub async fn register_verify(&self, email: &str, code: &str) -> Result<(), Error> {
        self.begin_loading();
        let result = self.client.register_verify(email, code).await;
        self.end_loading();
        result.map(|_| ())
    }

    fn set_state(&self, status: AuthStatus, user: Option<SessionUser>) {
        self.state.set(status, user);
    }

    fn mark_unauthenticated(&self) {
        self.set_state(AuthStatus::Unauthenticated, None);
        self.client
            .persist_session(&PersistedSession::unauthenticated());
    }

    fn begin_loading(&self) {
        self.loading.store(true, Ordering::SeqCst);
        let loading = Arc::clone(&self.loading);
        let grace = self.config.login_grace;
        let guard = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if loading.swap(false, Ordering::SeqCst) {
                log::warn!("Cleared stuck loading flag after {:?}", grace);
            }
        });
        if let Some(previous) = lock(&self.loading_guard).replace(guard) {
            previous.abort();
        }
    }

    fn end_loading(&self) {
        self.loading.store(false, Ordering::SeqCst);
        if let Some(guard) = lock(&self.loading_guard).take() {
            guard.abort();
        }
    }

    /// Spawn the background token refresh. Skips work while the persisted
    /// status is not `authenticated`; a failed refresh runs the logout flow
    /// (in-memory and persisted state revoked, server logout issued) and
    /// stops the task.
    fn start_auto_refresh(&self) {
        let mut slot = lock(&self.refresh_task);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let client = Arc::clone(&self.client);
        let state = Arc::clone(&self.state);
        let interval = self.config.auto_refresh_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.storage().load().status != AuthStatus::Authenticated {
                    log::debug!("Skipping token refresh: not authenticated locally");
                    continue;
                }
                if !client.refresh_token().await {
                    log::warn!("Scheduled token refresh failed, logging out");
                    state.set(AuthStatus::Unauthenticated, None);
                    client.persist_session(&PersistedSession::unauthenticated());
                    client.logout().await;
                    break;
                }
            }
        }));
    }

    fn stop_auto_refresh(&self) {
        if let Some(task) = lock(&self.refresh_task).take() {
            task.abort();
        }
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        self.stop_auto_refresh();
        if let Some(guard) = lock(&self.loading_guard).take() {
            guard.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::client::ClientConfig;
    use crate::testing::MockTransport;
    use tempdir::TempDir;

    fn session_with(
        transport: Arc<MockTransport>,
        persisted: PersistedSession,
    ) -> AuthSession {
        session_with_config(transport, persisted, SessionConfig::default())
    }

    fn session_with_config(
        transport: Arc<MockTransport>,
        persisted: PersistedSession,
        session_config: SessionConfig,
    ) -> AuthSession {
        let config = ClientConfig::new("https://api.test/api").with_cache(CacheConfig {
            cleanup_delay: StdDuration::from_millis(10),
            ..CacheConfig::default()
        });
        let client = Arc::new(ConfigenClient::with_parts(
            config,
            transport,
            Arc::new(MemorySessionStorage::seeded(persisted)),
        ));
        AuthSession::with_config(client, session_config)
    }

    const ACCOUNT_BODY: &str = r#"{
        "email": "user@example.com",
        "id": 7,
        "requests_this_month": 3,
        "request_limit": 100,
        "limit_reset_date": "2026-09-01"
    }"#;

    #[tokio::test]
    async fn startup_confirms_persisted_session() {
        let transport = MockTransport::new();
        transport.stub("/auth/verify", MockTransport::status(200));
        transport.stub("/account/info", MockTransport::json(200, ACCOUNT_BODY));
        let session = session_with(
            Arc::clone(&transport),
            PersistedSession::authenticated("user@example.com"),
        );

        let status = session.check_session().await;

        assert_eq!(status, AuthStatus::Authenticated);
        let user = session.user().unwrap();
        assert_eq!(user.email, "user@example.com");
        let account = user.account.unwrap();
        assert_eq!(account.request_limit, Some(100));
        assert_eq!(account.requests_this_month, Some(3));
    }

    #[tokio::test]
    async fn rejected_session_recovers_through_refresh() {
        let transport = MockTransport::new();
        transport.stub("/auth/verify", MockTransport::status(401));
        transport.stub("/auth/refresh", MockTransport::status(200));
        transport.stub("/account/info", MockTransport::json(200, ACCOUNT_BODY));
        let session = session_with(
            Arc::clone(&transport),
            PersistedSession::authenticated("user@example.com"),
        );

        let status = session.check_session().await;

        assert_eq!(status, AuthStatus::Authenticated);
        assert_eq!(
            session.client.storage().load().status,
            AuthStatus::Authenticated
        );
        assert_eq!(transport.count_matching("/auth/refresh"), 1);
    }

    #[tokio::test]
    async fn failed_refresh_revokes_the_session() {
        let transport = MockTransport::new();
        transport.stub("/auth/verify", MockTransport::status(401));
        transport.stub("/auth/refresh", MockTransport::status(401));
        let session = session_with(
            Arc::clone(&transport),
            PersistedSession::authenticated("user@example.com"),
        );

        let status = session.check_session().await;

        assert_eq!(status, AuthStatus::Unauthenticated);
        assert!(session.user().is_none());
        let persisted = session.client.storage().load();
        assert_eq!(persisted.status, AuthStatus::Unauthenticated);
        assert!(persisted.email.is_none());
    }

    #[tokio::test]
    async fn unreachable_server_keeps_provisional_session() {
        // no stubs: every request comes back as a synthetic network failure
        let transport = MockTransport::new();
        let session = session_with(
            Arc::clone(&transport),
            PersistedSession::authenticated("user@example.com"),
        );

        let status = session.check_session().await;

        assert_eq!(status, AuthStatus::Authenticated);
        let user = session.user().unwrap();
        assert_eq!(user.email, "user@example.com");
        assert!(user.account.is_none());
        assert_eq!(
            session.client.storage().load().status,
            AuthStatus::Authenticated
        );
    }

    #[tokio::test]
    async fn persisted_unauthenticated_resolves_without_network() {
        let transport = MockTransport::new();
        let session = session_with(Arc::clone(&transport), PersistedSession::unauthenticated());

        let status = session.check_session().await;

        assert_eq!(status, AuthStatus::Unauthenticated);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn unknown_status_resolves_to_unauthenticated() {
        let transport = MockTransport::new();
        let session = session_with(Arc::clone(&transport), PersistedSession::default());

        let status = session.check_session().await;

        assert_eq!(status, AuthStatus::Unauthenticated);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn login_transitions_to_authenticated() {
        let transport = MockTransport::new();
        transport.stub("/auth/login", MockTransport::json(200, r#"{"id": 7}"#));
        let session = session_with(Arc::clone(&transport), PersistedSession::default());

        session.login("user@example.com", "hunter2").await.unwrap();

        assert_eq!(session.status(), AuthStatus::Authenticated);
        assert!(!session.is_loading());
        let persisted = session.client.storage().load();
        assert_eq!(persisted.status, AuthStatus::Authenticated);
        assert_eq!(persisted.email.as_deref(), Some("user@example.com"));
    }

    #[tokio::test]
    async fn failed_login_surfaces_server_message() {
        let transport = MockTransport::new();
        transport.stub(
            "/auth/login",
            MockTransport::json(401, r#"{"detail":"invalid credentials"}"#),
        );
        let session = session_with(Arc::clone(&transport), PersistedSession::default());

        let err = session.login("user@example.com", "wrong").await.unwrap_err();

        assert!(matches!(
            err.kind(),
            crate::ErrorKind::Authentication(message) if message.as_str() == "invalid credentials"
        ));
        assert_ne!(session.status(), AuthStatus::Authenticated);
        assert!(!session.is_loading());
    }

    #[tokio::test]
    async fn failed_scheduled_refresh_runs_the_logout_flow() {
        let transport = MockTransport::new();
        transport.stub("/auth/verify", MockTransport::status(200));
        transport.stub("/account/info", MockTransport::json(200, ACCOUNT_BODY));
        transport.stub("/auth/logout", MockTransport::status(200));
        // no refresh stub: the scheduled refresh fails
        let session = session_with_config(
            Arc::clone(&transport),
            PersistedSession::authenticated("user@example.com"),
            SessionConfig {
                auto_refresh_interval: StdDuration::from_millis(50),
                ..SessionConfig::default()
            },
        );

        assert_eq!(session.check_session().await, AuthStatus::Authenticated);
        assert!(session.user().is_some());

        tokio::time::sleep(StdDuration::from_millis(150)).await;

        assert_eq!(session.status(), AuthStatus::Unauthenticated);
        assert!(session.user().is_none());
        assert_eq!(
            session.client.storage().load(),
            PersistedSession::unauthenticated()
        );
        assert_eq!(transport.count_matching("/auth/refresh"), 1);
        assert_eq!(transport.count_matching("/auth/logout"), 1);
    }

    #[tokio::test]
    async fn logout_resets_local_state_first() {
        let transport = MockTransport::new();
        transport.stub("/auth/logout", MockTransport::status(200));
        let session = session_with(
            Arc::clone(&transport),
            PersistedSession::authenticated("user@example.com"),
        );
        session.set_state(
            AuthStatus::Authenticated,
            Some(SessionUser {
                email: "user@example.com".to_string(),
                account: None,
            }),
        );

        assert!(session.logout().await);

        assert_eq!(session.status(), AuthStatus::Unauthenticated);
        assert!(session.user().is_none());
        assert_eq!(
            session.client.storage().load(),
            PersistedSession::unauthenticated()
        );
    }

    #[tokio::test]
    async fn file_storage_round_trips() {
        let dir = TempDir::new("configen-session").unwrap();
        let path = dir.path().join("session.json");
        let storage = FileSessionStorage::new(&path);

        assert_eq!(storage.load(), PersistedSession::default());

        let session = PersistedSession::authenticated("user@example.com");
        storage.store(&session);
        assert_eq!(storage.load(), session);

        storage.update_status(AuthStatus::Unauthenticated);
        let reloaded = storage.load();
        assert_eq!(reloaded.status, AuthStatus::Unauthenticated);
        assert_eq!(reloaded.email.as_deref(), Some("user@example.com"));
    }

    #[tokio::test]
    async fn corrupt_session_file_degrades_to_default() {
        let dir = TempDir::new("configen-session").unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json at all").unwrap();

        let storage = FileSessionStorage::new(&path);
        assert_eq!(storage.load(), PersistedSession::default());
    }
}
