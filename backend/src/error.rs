use std::time::Duration;

use actix_web::{
    error::BlockingError,
    http::{header, StatusCode},
    HttpResponse, ResponseError,
};
use common::req::{ErrorBody, RejectedReading, STATUS_PENDING_APPROVAL};
use thiserror::Error;

use crate::limiter::retry_after_secs;

/// Failures a handler can answer with. Each maps to exactly one status code.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad or missing credential. Permanent, clients must not retry.
    #[error("invalid credential")]
    Auth,

    /// Registered but not yet approved by an operator. Expected steady state.
    #[error("device is awaiting approval")]
    PendingApproval,

    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },

    #[error("{message}")]
    Validation {
        message: String,
        rejected: Vec<RejectedReading>,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            rejected: Vec::new(),
        }
    }
}

impl From<BlockingError> for ApiError {
    fn from(e: BlockingError) -> Self {
        Self::Internal(anyhow::anyhow!("blocking task failed: {e}"))
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Auth => StatusCode::UNAUTHORIZED,
            ApiError::PendingApproval => StatusCode::FORBIDDEN,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut body = ErrorBody {
            message: self.to_string(),
            status: None,
            retry_after: None,
            rejected: Vec::new(),
        };
        let mut res = HttpResponse::build(self.status_code());

        match self {
            ApiError::PendingApproval => body.status = Some(STATUS_PENDING_APPROVAL.into()),
            ApiError::RateLimited { retry_after } => {
                let secs = retry_after_secs(*retry_after);
                body.retry_after = Some(secs);
                res.insert_header((header::RETRY_AFTER, secs.to_string()));
            }
            ApiError::Validation { rejected, .. } => body.rejected = rejected.clone(),
            ApiError::Internal(e) => log::error!("{e:#}"),
            _ => {}
        }

        res.json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(ApiError::Auth.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::PendingApproval.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::RateLimited {
                retry_after: Duration::from_secs(3)
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ApiError::validation("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Conflict("x".into()).status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn rate_limited_sets_retry_after_header() {
        let res = ApiError::RateLimited {
            retry_after: Duration::from_millis(2_500),
        }
        .error_response();
        assert_eq!(
            res.headers().get(header::RETRY_AFTER).unwrap().to_str().unwrap(),
            "3"
        );
    }
}
