use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/* ============================= TYPES ============================= */

/// Semantic error kinds for every operation the exposer performs.
///
/// `Transient` and `Fatal` carry the operation name and the identity of the
/// object being acted on (name or label selector) so failures can be traced
/// back to a specific analysis.
#[derive(Debug, Error)]
pub enum ExposerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not authorised: {0}")]
    Unauthorised(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient failure during {op} on {subject}: {message}")]
    Transient {
        op: &'static str,
        subject: String,
        message: String,
    },

    #[error("internal failure during {op} on {subject}: {message}")]
    Fatal {
        op: &'static str,
        subject: String,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, ExposerError>;

impl ExposerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn unauthorised(message: impl Into<String>) -> Self {
        Self::Unauthorised(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn transient(
        op: &'static str,
        subject: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::Transient {
            op,
            subject: subject.into(),
            message: message.to_string(),
        }
    }

    pub fn fatal(op: &'static str, subject: impl Into<String>, message: impl ToString) -> Self {
        Self::Fatal {
            op,
            subject: subject.into(),
            message: message.to_string(),
        }
    }

    /// True for errors worth one in-process retry (see the upsert engine).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorised(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Fatal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/* ============================= CLASSIFICATION ============================= */

/// Map a cluster API error onto a semantic kind, tagging it with the
/// operation and the object identity it was issued against.
pub fn classify_kube(op: &'static str, subject: impl Into<String>, err: kube::Error) -> ExposerError {
    let subject = subject.into();
    match err {
        kube::Error::Api(ae) => match ae.code {
            404 => ExposerError::NotFound(format!("{subject}: {}", ae.message)),
            409 => ExposerError::Conflict(format!("{subject}: {}", ae.message)),
            429 | 500..=599 => ExposerError::transient(op, subject, ae.message),
            _ => ExposerError::fatal(op, subject, ae.message),
        },
        // Connection-level failures are retriable; the cluster remains the
        // source of truth and a later attempt converges.
        kube::Error::HyperError(e) => ExposerError::transient(op, subject, e),
        kube::Error::Service(e) => ExposerError::transient(op, subject, e),
        other => ExposerError::fatal(op, subject, other),
    }
}

/// Map an egress HTTP error (side-car, apps-service, permissions, sink).
pub fn classify_http(op: &'static str, subject: impl Into<String>, err: reqwest::Error) -> ExposerError {
    let subject = subject.into();
    match err.status() {
        Some(code) if code.as_u16() == 404 => {
            ExposerError::NotFound(format!("{subject}: upstream returned 404"))
        }
        Some(code) if code.is_client_error() => {
            ExposerError::fatal(op, subject, format!("upstream returned {code}"))
        }
        _ => ExposerError::transient(op, subject, err),
    }
}

/* ============================= HTTP RESPONSE ============================= */

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for ExposerError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request_failed_fatal");
        }

        let body = match &self {
            ExposerError::Transient { op, subject, message }
            | ExposerError::Fatal { op, subject, message } => ErrorBody {
                message: message.clone(),
                details: Some(format!("{op} on {subject}")),
            },
            other => ErrorBody {
                message: other.to_string(),
                details: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

/* ============================= TESTS ============================= */
