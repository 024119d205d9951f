use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::cluster::ClusterError;

/// The step of a request that talked to a host when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Attach,
    AttachWait,
    Schedule,
    Stop,
    ListHosts,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Connect => write!(f, "host connect failed"),
            Phase::Attach => write!(f, "attach failed"),
            Phase::AttachWait => write!(f, "attach wait failed"),
            Phase::Schedule => write!(f, "schedule failed"),
            Phase::Stop => write!(f, "stop failed"),
            Phase::ListHosts => write!(f, "list hosts failed"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("{field} {message}")]
    Validation { field: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No hosts available")]
    NoHostsAvailable,

    #[error("{phase}: {message}")]
    Transport { phase: Phase, message: String },

    #[error("Job is not running yet and attaching would block")]
    AttachWouldWait,

    #[error("Interactive attach requires an upgradeable connection")]
    UpgradeRequired,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Map a cluster failure that happened during `phase`.
    ///
    /// Missing hosts and jobs stay `NotFound` so callers see a 404 no matter
    /// which step noticed it.
    pub fn cluster(phase: Phase, err: ClusterError) -> Self {
        match err {
            ClusterError::HostNotFound(id) => Self::NotFound(format!("host {}", id)),
            ClusterError::JobNotFound(id) => Self::NotFound(format!("job {}", id)),
            ClusterError::AttachWouldWait => Self::AttachWouldWait,
            other => Self::Transport {
                phase,
                message: other.to_string(),
            },
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NoHostsAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Transport { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AttachWouldWait => StatusCode::CONFLICT,
            Self::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::NoHostsAvailable => "no_hosts_available",
            Self::Transport { .. } => "transport_error",
            Self::AttachWouldWait => "attach_would_wait",
            Self::UpgradeRequired => "upgrade_required",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<CatalogError> for ControllerError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::InvalidImage { .. } => Self::validation("artifact.uri", "is invalid"),
            CatalogError::Load(msg) => Self::Internal(msg),
            not_found => Self::NotFound(not_found.to_string()),
        }
    }
}

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let body = match &self {
            Self::Validation { field, message } => json!({ "field": field, "message": message }),
            other => json!({ "code": other.code(), "message": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}
