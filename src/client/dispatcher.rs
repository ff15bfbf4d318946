//! Usage: Authenticated request dispatch (attach bearer, detect 401, refresh once, retry once).

use super::refresh::{RefreshCoordinator, RefreshPolicy};
use super::refresher::{HttpTokenRefresher, TokenRefresher, DEFAULT_REFRESH_PATH};
use super::request::OutboundRequest;
use super::response::ApiResponse;
use super::transport::{HttpTransport, ReqwestTransport};
use crate::infra::settings::{ApiSettings, ClientSettings};
use crate::infra::token_store::FileTokenStore;
use crate::session::Session;
use crate::shared::error::{ApiError, ApiResult, AuthFailureReason};
use crate::shared::time::duration_millis;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Initial,
    Retry,
}

impl Attempt {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Retry => "retry",
        }
    }
}

struct ClientInner {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    session: Arc<Session>,
    coordinator: RefreshCoordinator,
    request_timeout: Option<Duration>,
}

/// Cheap to clone; all clones share one session and one refresh coordinator.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.base_url)
            .field("session", &self.inner.session)
            .field("coordinator", &self.inner.coordinator)
            .finish()
    }
}

impl ApiClient {
    pub fn builder(base_url: impl Into<String>) -> ApiClientBuilder {
        ApiClientBuilder::new(base_url)
    }

    /// Production wiring: reqwest transport, HTTP refresher, optional file token store.
    pub fn from_settings(settings: &ClientSettings) -> ApiResult<Self> {
        let session = match settings.session.token_store_path.as_ref() {
            Some(path) => {
                let session = Session::with_store(Arc::new(FileTokenStore::new(path)));
                match session.restore_from_store() {
                    Ok(true) => {}
                    Ok(false) => tracing::debug!(path = %path.display(), "no persisted tokens"),
                    Err(err) => tracing::warn!("ignoring unreadable token store: {}", err),
                }
                session
            }
            None => Session::new(),
        };

        ApiClientBuilder::new(settings.api.base_url.clone())
            .api_settings(&settings.api)
            .session(Arc::new(session))
            .build()
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.inner.coordinator
    }

    /// Issue `request`, transparently surviving one access-token expiry.
    ///
    /// Non-401 responses are returned untouched whatever their status. A 401
    /// triggers (or joins) a refresh and a single retry; a 401 on the retry is
    /// terminal.
    pub async fn execute(&self, request: &OutboundRequest) -> ApiResult<ApiResponse> {
        let observed = self.inner.session.access_token();
        let response = self
            .send_once(request, observed.as_deref(), Attempt::Initial)
            .await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        if !self.inner.session.has_refresh_token() {
            tracing::info!(
                method = %request.method(),
                path = request.path(),
                "401 without refresh token; authentication required"
            );
            return Err(ApiError::auth_required(AuthFailureReason::NoRefreshToken));
        }

        let token = self
            .inner
            .coordinator
            .ensure_refreshed(observed.as_deref())
            .await?;

        let retried = self
            .send_once(request, Some(token.as_str()), Attempt::Retry)
            .await?;
        if retried.is_unauthorized() {
            tracing::warn!(
                method = %request.method(),
                path = request.path(),
                "request still unauthorized after token refresh"
            );
            return Err(ApiError::auth_required(
                AuthFailureReason::RetryUnauthorized,
            ));
        }
        Ok(retried)
    }

    async fn send_once(
        &self,
        request: &OutboundRequest,
        access_token: Option<&str>,
        attempt: Attempt,
    ) -> ApiResult<ApiResponse> {
        let transport_request =
            request.to_transport(&self.inner.base_url, access_token, self.inner.request_timeout)?;

        match self.inner.transport.send(&transport_request).await {
            Ok(response) => {
                tracing::debug!(
                    method = %request.method(),
                    path = request.path(),
                    status = response.status().as_u16(),
                    attempt = attempt.as_str(),
                    authenticated = access_token.is_some(),
                    "api request completed"
                );
                Ok(response)
            }
            Err(err) => {
                tracing::warn!(
                    method = %request.method(),
                    path = request.path(),
                    attempt = attempt.as_str(),
                    kind = err.kind.as_str(),
                    "api request transport failure: {}",
                    err.message
                );
                Err(err.into())
            }
        }
    }
}

pub struct ApiClientBuilder {
    base_url: String,
    refresh_path: String,
    transport: Option<Arc<dyn HttpTransport>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    session: Option<Arc<Session>>,
    policy: RefreshPolicy,
    api_settings: Option<ApiSettings>,
    request_timeout: Option<Duration>,
}

impl ApiClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            transport: None,
            refresher: None,
            session: None,
            policy: RefreshPolicy::default(),
            api_settings: None,
            request_timeout: None,
        }
    }

    /// Take refresh path, refresh policy and reqwest timeouts from settings.
    pub fn api_settings(mut self, settings: &ApiSettings) -> Self {
        self.refresh_path = settings.refresh_path.clone();
        self.policy = settings.refresh_policy();
        self.api_settings = Some(settings.clone());
        self
    }

    pub fn refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    pub fn refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Per-request deadline passed to the transport (refresh calls use the policy timeout).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn build(self) -> ApiResult<ApiClient> {
        let base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ApiError::config("base_url is required"));
        }
        reqwest::Url::parse(&base_url)
            .map_err(|e| ApiError::config(format!("invalid base_url {base_url}: {e}")))?;

        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => {
                let settings = self.api_settings.unwrap_or_default();
                Arc::new(ReqwestTransport::new(&settings)?)
            }
        };
        let refresher: Arc<dyn TokenRefresher> = match self.refresher {
            Some(refresher) => refresher,
            None => Arc::new(HttpTokenRefresher::new(
                Arc::clone(&transport),
                &base_url,
                &self.refresh_path,
            )?),
        };
        let session = self.session.unwrap_or_default();
        let coordinator = RefreshCoordinator::new(Arc::clone(&session), refresher, self.policy);

        tracing::debug!(
            base_url = %base_url,
            refresh_path = %self.refresh_path,
            refresh_timeout_ms = duration_millis(self.policy.timeout),
            "api client ready"
        );

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                base_url,
                transport,
                session,
                coordinator,
                request_timeout: self.request_timeout,
            }),
        })
    }
}
