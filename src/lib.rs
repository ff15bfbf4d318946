//! Usage: LearnHub authenticated API client.
//!
//! Every request goes through [`ApiClient::execute`]. On a 401 the client
//! refreshes the access token at most once per expiry, no matter how many
//! requests observed the 401 concurrently, then retries each request once.

pub mod app;
mod client;
pub mod infra;
mod session;
mod shared;

pub use client::dispatcher::{ApiClient, ApiClientBuilder};
pub use client::refresh::{
    RefreshCoordinator, RefreshPolicy, DEFAULT_REFRESH_MAX_ATTEMPTS,
    DEFAULT_REFRESH_RETRY_BASE_DELAY, DEFAULT_REFRESH_TIMEOUT,
};
pub use client::refresher::{
    HttpTokenRefresher, RefreshError, RefreshFuture, RefreshRequest, TokenRefresher,
    DEFAULT_REFRESH_PATH,
};
pub use client::request::{OutboundRequest, TransportRequest};
pub use client::response::ApiResponse;
pub use client::transport::{
    HttpTransport, ReqwestTransport, TransportError, TransportErrorKind, TransportFuture,
};
pub use infra::settings::{ApiSettings, ClientSettings, LogSettings, SessionSettings};
pub use infra::token_store::{FileTokenStore, MemoryTokenStore, StoreError, StoredTokens, TokenStore};
pub use session::{InvalidationEvent, InvalidationReason, Session, SessionSnapshot, TokenSet};
pub use shared::error::{ApiError, ApiResult, AuthFailureReason};
