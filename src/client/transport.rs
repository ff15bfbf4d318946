//! Usage: HTTP transport seam (`send(request) -> status, headers, body`) plus the reqwest implementation.

use super::request::TransportRequest;
use super::response::ApiResponse;
use crate::infra::settings::ApiSettings;
use crate::shared::error::{ApiError, ApiResult};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Body,
    Other,
}

impl TransportErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Body => "body",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{} failure: {message}", .kind.as_str())]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<TransportError> for ApiError {
    fn from(value: TransportError) -> Self {
        ApiError::transport(value.to_string())
    }
}

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ApiResponse, TransportError>> + Send + 'a>>;

/// Object-safe so tests and embedders can swap the network layer.
pub trait HttpTransport: Send + Sync {
    fn send<'a>(&'a self, request: &'a TransportRequest) -> TransportFuture<'a>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(settings: &ApiSettings) -> ApiResult<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_secs(u64::from(
                settings.connect_timeout_seconds.max(1),
            )));
        if settings.request_timeout_seconds > 0 {
            builder = builder.timeout(Duration::from_secs(u64::from(
                settings.request_timeout_seconds,
            )));
        }
        let client = builder
            .build()
            .map_err(|e| ApiError::config(format!("http client init failed: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send_impl(&self, request: &TransportRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| classify_reqwest_error(&e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| {
            TransportError::new(
                TransportErrorKind::Body,
                format!("response body read failed: {e}"),
            )
        })?;
        Ok(ApiResponse::new(status, headers, body))
    }
}

impl HttpTransport for ReqwestTransport {
    fn send<'a>(&'a self, request: &'a TransportRequest) -> TransportFuture<'a> {
        Box::pin(self.send_impl(request))
    }
}

pub(crate) fn classify_reqwest_error(err: &reqwest::Error) -> TransportError {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportErrorKind::Body
    } else {
        TransportErrorKind::Other
    };
    TransportError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display_names_kind() {
        let err = TransportError::new(TransportErrorKind::Connect, "connection refused");
        assert_eq!(err.to_string(), "connect failure: connection refused");

        let api: ApiError = err.into();
        assert_eq!(
            api.to_string(),
            "TRANSPORT_ERROR: connect failure: connection refused"
        );
    }

    #[test]
    fn reqwest_transport_builds_from_default_settings() {
        ReqwestTransport::new(&ApiSettings::default()).expect("client builds");
    }
}
