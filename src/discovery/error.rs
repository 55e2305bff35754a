//! Error taxonomy for a discovery run

use std::time::Duration;
use thiserror::Error;
use tonic::{Code, Status};

/// Errors raised while discovering a single function or serving its capture session
///
/// Every variant is scoped to one function (or one declaration). The orchestrator
/// collects them per function and never lets one escape across function boundaries.
/// The type is `Clone` so a shared failure (for example a dev image that did not
/// build) can be recorded against every function that depended on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("no runtime matches handler '{0}'")]
    UnsupportedRuntime(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unsupported resource kind: {0}")]
    UnsupportedResourceKind(String),

    #[error("invalid declaration: {0}")]
    InvalidDeclaration(String),

    #[error("failed to build image {image}: {diagnostic}")]
    BuildError { image: String, diagnostic: String },

    #[error("failed to run container from {image}: {message}")]
    RunError { image: String, message: String },

    #[error("function '{function}' did not finish discovery within {timeout:?}")]
    DiscoveryTimeout { function: String, timeout: Duration },

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("unknown capture session '{0}'")]
    UnknownSession(String),

    #[error("capture session '{0}' is already closed")]
    SessionClosed(String),

    #[error("capture server error: {0}")]
    Server(String),

    #[error("discovery was cancelled")]
    Cancelled,
}

impl DiscoveryError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidDeclaration(reason.into())
    }

    pub fn timeout(function: impl Into<String>, timeout: Duration) -> Self {
        Self::DiscoveryTimeout {
            function: function.into(),
            timeout,
        }
    }

    /// Short machine-friendly name of the variant, used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedRuntime(_) => "UnsupportedRuntime",
            Self::ProtocolViolation(_) => "ProtocolViolation",
            Self::UnsupportedResourceKind(_) => "UnsupportedResourceKind",
            Self::InvalidDeclaration(_) => "InvalidDeclaration",
            Self::BuildError { .. } => "BuildError",
            Self::RunError { .. } => "RunError",
            Self::DiscoveryTimeout { .. } => "DiscoveryTimeout",
            Self::ResourceNotFound(_) => "ResourceNotFound",
            Self::UnknownSession(_) => "UnknownSession",
            Self::SessionClosed(_) => "SessionClosed",
            Self::Server(_) => "Server",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Maps the error onto the status returned to a worker over the capture protocol
    pub fn into_status(self) -> Status {
        let code = match &self {
            Self::ProtocolViolation(_) | Self::SessionClosed(_) => Code::FailedPrecondition,
            Self::UnsupportedResourceKind(_) => Code::Unimplemented,
            Self::InvalidDeclaration(_) => Code::InvalidArgument,
            Self::ResourceNotFound(_) | Self::UnknownSession(_) => Code::NotFound,
            Self::DiscoveryTimeout { .. } => Code::DeadlineExceeded,
            Self::Cancelled => Code::Cancelled,
            _ => Code::Internal,
        };
        Status::new(code, self.to_string())
    }
}

impl From<DiscoveryError> for Status {
    fn from(err: DiscoveryError) -> Self {
        err.into_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            DiscoveryError::protocol("first message must be an init request")
                .into_status()
                .code(),
            Code::FailedPrecondition
        );
        assert_eq!(
            DiscoveryError::UnsupportedResourceKind("99".into())
                .into_status()
                .code(),
            Code::Unimplemented
        );
        assert_eq!(
            DiscoveryError::ResourceNotFound("bucket:uploads".into())
                .into_status()
                .code(),
            Code::NotFound
        );
        assert_eq!(
            DiscoveryError::BuildError {
                image: "img".into(),
                diagnostic: "boom".into()
            }
            .into_status()
            .code(),
            Code::Internal
        );
    }

    #[test]
    fn test_timeout_message_names_function() {
        let err = DiscoveryError::timeout("checkout", Duration::from_secs(30));
        assert_eq!(
            err.to_string(),
            "function 'checkout' did not finish discovery within 30s"
        );
        assert_eq!(err.kind(), "DiscoveryTimeout");
    }

    #[test]
    fn test_timeout_message_keeps_sub_second_precision() {
        let err = DiscoveryError::timeout("checkout", Duration::from_millis(250));
        assert_eq!(
            err.to_string(),
            "function 'checkout' did not finish discovery within 250ms"
        );
    }
}
