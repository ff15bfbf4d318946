//! Usage: Refresh endpoint client (`POST /auth/refresh`) and response/error-body parsing.

use super::request::{join_url, TransportRequest};
use super::transport::HttpTransport;
use crate::session::TokenSet;
use crate::shared::error::{ApiResult, AuthFailureReason};
use crate::shared::security::mask_token;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";
const ERROR_SNIPPET_MAX_CHARS: usize = 500;
const ERROR_MESSAGE_MAX_CHARS: usize = 240;

#[derive(Clone)]
pub struct RefreshRequest {
    pub access_token: Option<String>,
    pub refresh_token: String,
}

impl fmt::Debug for RefreshRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshRequest")
            .field(
                "access_token",
                &self.access_token.as_deref().map(mask_token),
            )
            .field("refresh_token", &mask_token(&self.refresh_token))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh request failed: {0}")]
    Transport(String),
    #[error("refresh endpoint rejected the refresh token: status={status}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },
    #[error("refresh response invalid: {0}")]
    InvalidResponse(String),
    #[error("refresh timed out after {0:?}")]
    Timeout(Duration),
}

impl RefreshError {
    /// Only network failures are worth another attempt; a rejection is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn auth_reason(&self) -> AuthFailureReason {
        match self {
            Self::Transport(_) => AuthFailureReason::RefreshTransport,
            Self::Rejected { status, .. } => AuthFailureReason::RefreshRejected { status: *status },
            Self::InvalidResponse(_) => AuthFailureReason::RefreshInvalidResponse,
            Self::Timeout(_) => AuthFailureReason::RefreshTimeout,
        }
    }
}

pub type RefreshFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TokenSet, RefreshError>> + Send + 'a>>;

/// Performs exactly one refresh call per invocation.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(&'a self, request: &'a RefreshRequest) -> RefreshFuture<'a>;
}

pub struct HttpTokenRefresher {
    transport: Arc<dyn HttpTransport>,
    url: Url,
}

impl fmt::Debug for HttpTokenRefresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTokenRefresher")
            .field("url", &self.url.as_str())
            .finish()
    }
}

impl HttpTokenRefresher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: &str,
        refresh_path: &str,
    ) -> ApiResult<Self> {
        Ok(Self {
            transport,
            url: join_url(base_url, refresh_path)?,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn refresh_impl(&self, request: &RefreshRequest) -> Result<TokenSet, RefreshError> {
        let payload = serde_json::json!({
            "accessToken": request.access_token.as_deref().map(str::trim),
            "refreshToken": request.refresh_token.trim(),
        });
        let body = serde_json::to_vec(&payload)
            .map_err(|e| RefreshError::InvalidResponse(format!("encode refresh body: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let transport_request = TransportRequest {
            method: Method::POST,
            url: self.url.clone(),
            headers,
            body: Bytes::from(body),
            timeout: None,
        };

        let response = self
            .transport
            .send(&transport_request)
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        parse_refresh_response(response.status(), response.body())
    }
}

impl TokenRefresher for HttpTokenRefresher {
    fn refresh<'a>(&'a self, request: &'a RefreshRequest) -> RefreshFuture<'a> {
        Box::pin(self.refresh_impl(request))
    }
}

pub(crate) fn parse_refresh_response(
    status: StatusCode,
    body: &[u8],
) -> Result<TokenSet, RefreshError> {
    let body = String::from_utf8_lossy(body);

    if !status.is_success() {
        let (code, message) = parse_error_details(&body);
        tracing::warn!(
            status = status.as_u16(),
            code = code.as_deref().unwrap_or(""),
            body = %sanitize_error_body_snippet(&body),
            "refresh endpoint rejected refresh token"
        );
        return Err(RefreshError::Rejected {
            status: status.as_u16(),
            code,
            message: message.map(|m| m.chars().take(ERROR_MESSAGE_MAX_CHARS).collect()),
        });
    }

    let value: Value = serde_json::from_str(&body)
        .map_err(|e| RefreshError::InvalidResponse(format!("json invalid: {e}")))?;

    let access_token = string_field(&value, &["accessToken", "access_token"])
        .ok_or_else(|| RefreshError::InvalidResponse("missing accessToken".to_string()))?;
    let refresh_token = string_field(&value, &["refreshToken", "refresh_token"]);
    let expires_at = ["expiresAt", "expires_at"]
        .iter()
        .find_map(|key| value.get(*key).and_then(parse_i64_lossy))
        .filter(|v| *v > 0);

    Ok(TokenSet {
        access_token,
        refresh_token,
        expires_at,
    })
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        value
            .get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

fn parse_i64_lossy(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lc = key.trim().to_ascii_lowercase();
    key_lc.contains("token") || key_lc.contains("secret") || key_lc == "authorization"
}

fn redact_sensitive_json_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if is_sensitive_key(key) {
                    if let Some(raw) = nested.as_str() {
                        *nested = Value::String(mask_token(raw));
                        continue;
                    }
                }
                redact_sensitive_json_fields(nested);
            }
        }
        Value::Array(items) => {
            for nested in items {
                redact_sensitive_json_fields(nested);
            }
        }
        _ => {}
    }
}

fn sanitize_error_body_snippet(body: &str) -> String {
    if let Ok(mut value) = serde_json::from_str::<Value>(body) {
        redact_sensitive_json_fields(&mut value);
        if let Ok(encoded) = serde_json::to_string(&value) {
            return encoded.chars().take(ERROR_SNIPPET_MAX_CHARS).collect();
        }
    }
    body.chars().take(ERROR_SNIPPET_MAX_CHARS).collect()
}

fn parse_error_details(body: &str) -> (Option<String>, Option<String>) {
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return (None, None),
    };

    let mut code = string_field(&value, &["code"]);
    let mut message = string_field(&value, &["message", "error_description"]);

    if let Some(error_value) = value.get("error") {
        if let Some(err_str) = error_value.as_str() {
            if code.is_none() {
                code = Some(err_str.trim().to_string());
            }
        } else if error_value.is_object() {
            if code.is_none() {
                code = string_field(error_value, &["code", "type"]);
            }
            if message.is_none() {
                message = string_field(error_value, &["message"]);
            }
        }
    }

    (code, message)
}
