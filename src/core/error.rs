//! Unified error handling for pingmesh
//!
//! Every store and engine in the crate reports failures through [`CoreError`].
//! HTTP adapters map the variants onto status codes with [`CoreError::status`]
//! and onto a stable machine-readable code with [`CoreError::code`].

use std::fmt;

use http::StatusCode;

/// Error taxonomy shared by the registry, policy store, routing engine and stats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Unknown instance, image or stats window
    NotFound(String),

    /// Instance id already registered under a different name/image pair
    DuplicateId(String),

    /// Policy rejected by validation
    PolicyInvalid(String),

    /// Routing found zero eligible candidates for an image
    NoHealthyInstance(String),

    /// Backing state stores are not initialized yet
    NotReady(String),

    /// Policy mutation attempted without the admin credential
    Unauthorized(String),

    /// Malformed register payload
    InvalidInstance(String),

    /// Internal system errors
    Internal(String),
}

impl CoreError {
    /// Stable taxonomy string used in API bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::DuplicateId(_) => "duplicate_id",
            CoreError::PolicyInvalid(_) => "policy_invalid",
            CoreError::NoHealthyInstance(_) => "no_healthy_instance",
            CoreError::NotReady(_) => "not_ready",
            CoreError::Unauthorized(_) => "unauthorized",
            CoreError::InvalidInstance(_) => "invalid_instance",
            CoreError::Internal(_) => "internal",
        }
    }

    /// HTTP status an edge adapter should answer with.
    ///
    /// An empty pool (`NoHealthyInstance`) and a balancer still starting up
    /// (`NotReady`) never share a status.
    pub fn status(&self) -> StatusCode {
        match self {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::DuplicateId(_) => StatusCode::CONFLICT,
            CoreError::PolicyInvalid(_) | CoreError::InvalidInstance(_) => StatusCode::BAD_REQUEST,
            CoreError::NoHealthyInstance(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::NotReady(_) => StatusCode::BAD_GATEWAY,
            CoreError::Unauthorized(_) => StatusCode::FORBIDDEN,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Detail message without the category prefix.
    pub fn detail(&self) -> &str {
        match self {
            CoreError::NotFound(msg)
            | CoreError::DuplicateId(msg)
            | CoreError::PolicyInvalid(msg)
            | CoreError::NoHealthyInstance(msg)
            | CoreError::NotReady(msg)
            | CoreError::Unauthorized(msg)
            | CoreError::InvalidInstance(msg)
            | CoreError::Internal(msg) => msg,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::NotFound(msg) => write!(f, "Resource not found: {msg}"),
            CoreError::DuplicateId(msg) => write!(f, "Duplicate instance id: {msg}"),
            CoreError::PolicyInvalid(msg) => write!(f, "Invalid routing policy: {msg}"),
            CoreError::NoHealthyInstance(msg) => write!(f, "No healthy instance: {msg}"),
            CoreError::NotReady(msg) => write!(f, "Not ready: {msg}"),
            CoreError::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            CoreError::InvalidInstance(msg) => write!(f, "Invalid instance: {msg}"),
            CoreError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<CoreError> for Box<pingora_error::Error> {
    fn from(err: CoreError) -> Self {
        let etype = match err {
            CoreError::NoHealthyInstance(_) | CoreError::NotReady(_) => {
                pingora_error::ErrorType::ConnectNoRoute
            }
            _ => pingora_error::ErrorType::InternalError,
        };
        pingora_error::Error::explain(etype, err.to_string())
    }
}

/// Result type alias for core operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> CoreResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> CoreResult<T> {
        self.map_err(|e| CoreError::Internal(format!("{context}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(CoreError::NotFound("x".into()).code(), "not_found");
        assert_eq!(CoreError::DuplicateId("x".into()).code(), "duplicate_id");
        assert_eq!(CoreError::PolicyInvalid("x".into()).code(), "policy_invalid");
        assert_eq!(
            CoreError::NoHealthyInstance("x".into()).code(),
            "no_healthy_instance"
        );
        assert_eq!(CoreError::NotReady("x".into()).code(), "not_ready");
    }

    #[test]
    fn test_no_healthy_and_not_ready_differ() {
        let empty = CoreError::NoHealthyInstance("demo-app".into());
        let starting = CoreError::NotReady("stores".into());
        assert_eq!(empty.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_ne!(empty.status(), starting.status());
    }

    #[test]
    fn test_with_context() {
        let res: Result<(), &str> = Err("boom");
        let err = res.with_context("exporting").unwrap_err();
        assert_eq!(err, CoreError::Internal("exporting: boom".into()));
        assert_eq!(err.detail(), "exporting: boom");
    }
}
