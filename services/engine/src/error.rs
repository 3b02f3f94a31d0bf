//! Error kinds
//!
//! One enum for every failure the engine surfaces. Remote controller
//! failures are captured as a [`RestFailure`] first and then mapped onto a
//! kind by status code.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status reported for a request that never reached the controller.
pub const CONNECT_FAILURE: i32 = -1;

/// Engine error kinds
#[derive(Debug, Error)]
pub enum LbaasError {
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("certificate storage failure: {0}")]
    CertificateStorage(String),

    #[error("rescheduling failed for load balancer {0}: no eligible agent")]
    ReschedulingFailed(String),

    #[error("unknown info type: {0}")]
    ModelMap(String),

    #[error("controller returned {0}")]
    Rest(RestFailure),

    #[error("{0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, LbaasError>;

impl LbaasError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        LbaasError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            LbaasError::NotFound { .. } => true,
            LbaasError::Rest(f) => f.status == 404,
            _ => false,
        }
    }

    /// Semantic kind name, stable across variants carrying a [`RestFailure`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            LbaasError::NotFound { .. } => ErrorKind::NotFound,
            LbaasError::Conflict(_) => ErrorKind::Conflict,
            LbaasError::BadRequest(_) => ErrorKind::BadRequest,
            LbaasError::NotAuthorized(_) => ErrorKind::NotAuthorized,
            LbaasError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            LbaasError::Timeout(_) => ErrorKind::Timeout,
            LbaasError::CertificateStorage(_) => ErrorKind::CertificateStorage,
            LbaasError::ReschedulingFailed(_) => ErrorKind::ReschedulingFailed,
            LbaasError::ModelMap(_) => ErrorKind::ModelMap,
            LbaasError::Rest(f) => f.kind(),
            LbaasError::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    BadRequest,
    NotAuthorized,
    ServiceUnavailable,
    Timeout,
    CertificateStorage,
    ReschedulingFailed,
    ModelMap,
    Unknown,
}

/// Structured failure from a controller call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestFailure {
    pub status: i32,
    pub reason: String,
    pub description: String,
}

impl RestFailure {
    pub fn new(status: i32, reason: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            description: description.into(),
        }
    }

    pub fn connect(description: impl Into<String>) -> Self {
        Self::new(CONNECT_FAILURE, "connection failed", description)
    }

    pub fn kind(&self) -> ErrorKind {
        match self.status {
            400 => ErrorKind::BadRequest,
            401 | 403 => ErrorKind::NotAuthorized,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            408 | 504 => ErrorKind::Timeout,
            CONNECT_FAILURE | 503 => ErrorKind::ServiceUnavailable,
            _ => ErrorKind::Unknown,
        }
    }
}

impl std::fmt::Display for RestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.status, self.reason, self.description)
    }
}

impl From<RestFailure> for LbaasError {
    fn from(failure: RestFailure) -> Self {
        LbaasError::Rest(failure)
    }
}

impl From<std::io::Error> for LbaasError {
    fn from(e: std::io::Error) -> Self {
        LbaasError::Unknown(e.to_string())
    }
}

impl From<serde_json::Error> for LbaasError {
    fn from(e: serde_json::Error) -> Self {
        LbaasError::Unknown(format!("json: {}", e))
    }
}
