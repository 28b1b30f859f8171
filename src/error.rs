//! HTTP error mapping for the serving front-end.

use std::fmt;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

/// Errors surfaced to HTTP callers. Bodies carry just the status code
/// digits; clients treat anything non-200 as "try elsewhere".
#[derive(Debug)]
pub enum ServiceError {
    BadRequest(String),
    /// The requested app/depot is not served by any federated account.
    Unauthorized,
    NotFound,
    MethodNotAllowed,
    /// Initial sign-ins and manifest generation are still in progress.
    Unavailable,
    /// The CM server did not answer in time.
    GatewayTimeout,
    Internal(anyhow::Error),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::BadRequest(reason) => write!(f, "Bad Request: {reason}"),
            ServiceError::Unauthorized => write!(f, "Unauthorized"),
            ServiceError::NotFound => write!(f, "Not Found"),
            ServiceError::MethodNotAllowed => write!(f, "Method Not Allowed"),
            ServiceError::Unavailable => write!(f, "Service Unavailable"),
            ServiceError::GatewayTimeout => write!(f, "Gateway Timeout"),
            ServiceError::Internal(err) => write!(f, "Internal Server Error: {err:?}"),
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ServiceError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let ServiceError::Internal(_) = self {
            tracing::error!("{self}");
        }
        let status = self.status_code();
        HttpResponse::build(status)
            .content_type("text/plain; charset=utf-8")
            .body(status.as_u16().to_string())
    }
}

impl From<actix::MailboxError> for ServiceError {
    fn from(err: actix::MailboxError) -> Self {
        ServiceError::Internal(anyhow::anyhow!(err))
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::Internal(err)
    }
}
