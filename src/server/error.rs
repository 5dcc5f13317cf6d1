//! HTTP error mapping
//!
//! One error type for every handler, with a fixed mapping to status codes:
//! denied access is 401, a project whose ownership is still settling is 503
//! (retryable), a failed hop to the owning node is 502, and subprocess or
//! disk failures are 500. Bodies are plain text; git clients surface them
//! verbatim.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::cache::CacheError;
use crate::cluster::{DirectoryError, ProxyError};
use crate::work::WorkError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    NotFound(String),

    #[error("server is starting up, retry later")]
    Starting,

    #[error("project {0} is not available yet, retry later")]
    NotReady(u64),

    #[error("upstream node failed with {status}: {message}")]
    RemoteNode { status: u16, message: String },

    #[error(transparent)]
    Git(#[from] grange_git::Error),

    #[error(transparent)]
    Work(#[from] WorkError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PermissionDenied(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Starting | ApiError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::RemoteNode { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Git(_) | ApiError::Work(_) | ApiError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<DirectoryError> for ApiError {
    fn from(e: DirectoryError) -> Self {
        let DirectoryError::NotReady(project_id) = e;
        ApiError::NotReady(project_id)
    }
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Remote { status, message } => ApiError::RemoteNode { status, message },
            ProxyError::Transport(e) => ApiError::RemoteNode {
                status: 502,
                message: e.to_string(),
            },
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Directory(e) => e.into(),
            CacheError::Proxy(e) => e.into(),
            CacheError::Io(e) => e.into(),
            CacheError::Index(e) => ApiError::Io(std::io::Error::other(e)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        } else {
            tracing::debug!("request rejected: {self}");
        }
        (status, self.to_string()).into_response()
    }
}
