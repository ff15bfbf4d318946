//! Usage: Unified client error model (every failure renders as a stable `CODE: message` string).

use bytes::Bytes;
use std::fmt;

pub type ApiResult<T> = Result<T, ApiError>;

/// Why a request ended with [`ApiError::AuthenticationRequired`].
///
/// All reasons are terminal for the request that observed them; callers are
/// expected to route the user back to login. The reason exists for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthFailureReason {
    /// The server answered 401 and the session holds no refresh token.
    NoRefreshToken,
    RefreshRejected { status: u16 },
    RefreshTransport,
    RefreshTimeout,
    RefreshInvalidResponse,
    RefreshAborted,
    /// The retried request was still rejected with a freshly refreshed token.
    RetryUnauthorized,
}

impl AuthFailureReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoRefreshToken => "no_refresh_token",
            Self::RefreshRejected { .. } => "refresh_rejected",
            Self::RefreshTransport => "refresh_transport",
            Self::RefreshTimeout => "refresh_timeout",
            Self::RefreshInvalidResponse => "refresh_invalid_response",
            Self::RefreshAborted => "refresh_aborted",
            Self::RetryUnauthorized => "retry_unauthorized",
        }
    }
}

impl fmt::Display for AuthFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RefreshRejected { status } => write!(f, "{} status={status}", self.as_str()),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Network-level failure; never triggers a refresh.
    #[error("TRANSPORT_ERROR: {message}")]
    Transport { message: String },

    #[error("AUTH_RELOGIN_REQUIRED: authentication required ({reason})")]
    AuthenticationRequired { reason: AuthFailureReason },

    /// Non-success response, produced only by [`crate::ApiResponse::error_for_status`].
    #[error("APPLICATION_ERROR: server returned status={status}")]
    Application { status: u16, body: Bytes },

    #[error("SEC_INVALID_INPUT: {message}")]
    InvalidRequest { message: String },

    #[error("DECODE_ERROR: {message}")]
    Decode { message: String },

    #[error("CONFIG_ERROR: {message}")]
    Config { message: String },
}

impl ApiError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub const fn auth_required(reason: AuthFailureReason) -> Self {
        Self::AuthenticationRequired { reason }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::AuthenticationRequired { .. } => "AUTH_RELOGIN_REQUIRED",
            Self::Application { .. } => "APPLICATION_ERROR",
            Self::InvalidRequest { .. } => "SEC_INVALID_INPUT",
            Self::Decode { .. } => "DECODE_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
        }
    }

    pub fn is_authentication_required(&self) -> bool {
        matches!(self, Self::AuthenticationRequired { .. })
    }

    pub fn auth_failure_reason(&self) -> Option<AuthFailureReason> {
        match self {
            Self::AuthenticationRequired { reason } => Some(*reason),
            _ => None,
        }
    }
}

impl From<ApiError> for String {
    fn from(value: ApiError) -> Self {
        value.to_string()
    }
}
