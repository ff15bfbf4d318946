//! Usage: Immutable, replayable description of one API call.

use crate::shared::error::{ApiError, ApiResult};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use std::time::Duration;

/// A call to be issued (and possibly re-issued once after a refresh).
///
/// The body is held as [`Bytes`], so cloning is cheap and a retry never needs
/// a stream that has already been consumed.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
}

impl OutboundRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// `Authorization` is owned by the session and is replaced on send.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> ApiResult<Self> {
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| ApiError::invalid_request(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ApiError::invalid_request(format!("invalid header value for {name}: {e}")))?;
        Ok(self.header(name, value))
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T: serde::Serialize + ?Sized>(mut self, value: &T) -> ApiResult<Self> {
        let encoded = serde_json::to_vec(value)
            .map_err(|e| ApiError::invalid_request(format!("failed to serialize json body: {e}")))?;
        self.body = Bytes::from(encoded);
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Resolve against `base_url` and attach the bearer token (or none).
    pub(crate) fn to_transport(
        &self,
        base_url: &str,
        access_token: Option<&str>,
        timeout: Option<Duration>,
    ) -> ApiResult<TransportRequest> {
        let mut url = join_url(base_url, &self.path)?;
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                pairs.append_pair(key, value);
            }
        }

        let mut headers = self.headers.clone();
        headers.remove(AUTHORIZATION);
        if let Some(token) = access_token {
            headers.insert(AUTHORIZATION, bearer_value(token)?);
        }

        Ok(TransportRequest {
            method: self.method.clone(),
            url,
            headers,
            body: self.body.clone(),
            timeout,
        })
    }
}

/// Fully resolved request handed to an [`crate::HttpTransport`].
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

pub(crate) fn bearer_value(token: &str) -> ApiResult<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
        .map_err(|e| ApiError::invalid_request(format!("access token is not a valid header: {e}")))?;
    value.set_sensitive(true);
    Ok(value)
}

pub(crate) fn join_url(base_url: &str, path: &str) -> ApiResult<Url> {
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(ApiError::invalid_request("base_url is empty"));
    }
    let path = path.trim();
    let joined = if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    };
    Url::parse(&joined).map_err(|e| ApiError::invalid_request(format!("invalid url {joined}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_keeps_base_path_prefix() {
        let url = join_url("https://api.learnhub.test/v1/", "/courses").expect("url");
        assert_eq!(url.as_str(), "https://api.learnhub.test/v1/courses");

        let url = join_url("https://api.learnhub.test/v1", "enrollments/7").expect("url");
        assert_eq!(url.as_str(), "https://api.learnhub.test/v1/enrollments/7");
    }

    #[test]
    fn join_url_rejects_empty_base() {
        assert!(join_url("  ", "/courses").is_err());
    }

    #[test]
    fn to_transport_replaces_caller_authorization() {
        let request = OutboundRequest::get("/me")
            .header(AUTHORIZATION, HeaderValue::from_static("Bearer caller"))
            .query("include", "badges");

        let sent = request
            .to_transport("http://localhost:8080", Some("session-token"), None)
            .expect("transport request");
        assert_eq!(sent.bearer_token(), Some("session-token"));
        assert_eq!(sent.url.as_str(), "http://localhost:8080/me?include=badges");
        assert_eq!(sent.headers.get_all(AUTHORIZATION).iter().count(), 1);

        let anonymous = request
            .to_transport("http://localhost:8080", None, None)
            .expect("transport request");
        assert!(anonymous.headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn json_body_is_replayable() {
        let request = OutboundRequest::post("/enrollments")
            .json(&serde_json::json!({ "courseId": 42 }))
            .expect("json body");

        let first = request
            .to_transport("http://localhost", Some("t1"), None)
            .expect("first");
        let second = request
            .to_transport("http://localhost", Some("t2"), None)
            .expect("second");
        assert_eq!(first.body, second.body);
        assert_eq!(
            first.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
        assert_eq!(second.bearer_token(), Some("t2"));
    }

    #[test]
    fn try_header_reports_invalid_input() {
        let err = OutboundRequest::get("/").try_header("bad header", "x").expect_err("invalid");
        assert_eq!(err.code(), "SEC_INVALID_INPUT");
    }
}
