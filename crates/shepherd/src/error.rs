//! Error taxonomy for service lifecycle management.
//!
//! Every lifecycle error carries the name of the service it originated
//! from so failures stay attributable across retries and batch runs.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// Invalid or incomplete service configuration. Never retried.
    #[error("Service '{service}' config error: {message}")]
    Config { service: String, message: String },

    /// The service could not be spawned, or never became healthy across
    /// all retry attempts.
    #[error("Service '{service}' startup failed: {message}")]
    Startup { service: String, message: String },

    /// A health probe never passed within its deadline. Distinct from a
    /// hard spawn failure.
    #[error("Service '{service}' health check failed: {message}")]
    HealthCheck { service: String, message: String },

    /// Termination could not be confirmed even after forceful escalation.
    #[error("Service '{service}' stop failed: {message}")]
    Stop { service: String, message: String },

    #[error("Service '{service}' not found")]
    NotFound { service: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServiceError {
    /// The service this error originated from, if it names one.
    pub fn service(&self) -> Option<&str> {
        match self {
            ServiceError::Config { service, .. }
            | ServiceError::Startup { service, .. }
            | ServiceError::HealthCheck { service, .. }
            | ServiceError::Stop { service, .. }
            | ServiceError::NotFound { service } => Some(service),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_carry_service_name() {
        let err = ServiceError::Startup {
            service: "ollama".to_string(),
            message: "spawn failed".to_string(),
        };
        assert_eq!(err.service(), Some("ollama"));
        assert!(err.to_string().contains("ollama"));

        let err = ServiceError::NotFound {
            service: "ghost".to_string(),
        };
        assert_eq!(err.service(), Some("ghost"));
    }

    #[test]
    fn test_io_errors_have_no_service() {
        let err = ServiceError::Io(std::io::Error::other("boom"));
        assert_eq!(err.service(), None);
    }
}
