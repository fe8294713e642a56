pub mod cache;
mod client;
mod error;
pub mod http;
mod response;
pub mod session;

#[cfg(test)]
mod testing;

pub use cache::{CacheConfig, CacheOptions, CacheStats, RequestCache};
pub use client::{AuthCheck, ClientConfig, ConfigenClient, API_URL_ENV};
pub use error::{Error, ErrorKind};
pub use http::{HttpRequest, HttpTransport, RawResponse, SurfTransport};
pub use response::ApiResponse;
pub use session::{
    AuthSession, AuthStatus, FileSessionStorage, MemorySessionStorage, PersistedSession,
    SessionConfig, SessionStorage, SessionUser, UserAccount,
};
