//! Usage: Response passed back to callers untouched (status, headers, opaque body).

use crate::shared::error::{ApiError, ApiResult};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ApiResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> ApiResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::Decode {
            message: format!("response json invalid (status={}): {e}", self.status.as_u16()),
        })
    }

    /// Turn a non-2xx response into [`ApiError::Application`].
    pub fn error_for_status(self) -> ApiResult<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(ApiError::Application {
            status: self.status.as_u16(),
            body: self.body,
        })
    }
}
