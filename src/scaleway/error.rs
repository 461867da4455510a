//! Error types for the Scaleway backend.

use scaleway_rs::{ScalewayApiError, ScalewayError};
use thiserror::Error;

use crate::backend::{BackendErrorKind, Classify};
use crate::config::ConfigError;

/// Errors raised by the Scaleway backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayBackendError {
    /// Raised when the credentials or options are unusable.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when the requested image label cannot be resolved.
    #[error("image '{label}' (arch {arch}) not found in zone {zone}")]
    ImageNotFound {
        /// Image label passed by the caller.
        label: String,
        /// Architecture used for the lookup.
        arch: String,
        /// Zone used for the lookup.
        zone: String,
    },
    /// Raised when a named resource does not exist.
    #[error("{resource} {name} not found")]
    NotFound {
        /// Resource kind.
        resource: &'static str,
        /// Name or identifier that was looked up.
        name: String,
    },
    /// Raised when the request never produced a response.
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Request URL.
        url: String,
        /// Error message from the HTTP client.
        message: String,
    },
    /// Raised when the API answers with an error status.
    #[error("provider error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Classification derived from the status and error type.
        kind: BackendErrorKind,
        /// Message returned by the provider.
        message: String,
    },
    /// Raised when a successful response cannot be decoded.
    #[error("unexpected response from {url}: {message}")]
    Decode {
        /// Request URL.
        url: String,
        /// Decoder error message.
        message: String,
    },
    /// Wrapper for failures reported by the provider SDK.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the provider SDK.
        message: String,
        /// Classification of the failure.
        kind: BackendErrorKind,
    },
}

impl Classify for ScalewayBackendError {
    fn kind(&self) -> BackendErrorKind {
        match self {
            Self::Config(_) | Self::ImageNotFound { .. } => BackendErrorKind::InvalidRequest,
            Self::NotFound { .. } => BackendErrorKind::NotFound,
            Self::Transport { .. } => BackendErrorKind::Transient,
            Self::Api { kind, .. } | Self::Provider { kind, .. } => *kind,
            Self::Decode { .. } => BackendErrorKind::Other,
        }
    }
}

/// Classifies an API failure from its HTTP status and Scaleway error type.
pub(crate) fn classify(status: u16, etype: Option<&str>) -> BackendErrorKind {
    if matches!(etype, Some("not_found" | "unknown_resource")) {
        return BackendErrorKind::NotFound;
    }
    match status {
        404 => BackendErrorKind::NotFound,
        409 => BackendErrorKind::AlreadyExists,
        401 | 403 => BackendErrorKind::Unauthorized,
        400 | 412 | 422 => BackendErrorKind::InvalidRequest,
        429 | 500..=599 => BackendErrorKind::Transient,
        _ => BackendErrorKind::Other,
    }
}

impl ScalewayBackendError {
    /// Builds an [`ScalewayBackendError::Api`] from an error response body.
    pub(crate) fn from_response(status: u16, body: &[u8]) -> Self {
        match serde_json::from_slice::<ScalewayApiError>(body) {
            Ok(api_err) => Self::Api {
                status,
                kind: classify(status, Some(api_err.etype.as_str())),
                message: api_err.message,
            },
            Err(_) => Self::Api {
                status,
                kind: classify(status, None),
                message: String::from_utf8_lossy(body).trim().to_owned(),
            },
        }
    }
}

impl From<ScalewayError> for ScalewayBackendError {
    fn from(value: ScalewayError) -> Self {
        let kind = match &value {
            ScalewayError::Api(api_err) => classify(0, Some(api_err.etype.as_str())),
            _ => BackendErrorKind::Other,
        };
        Self::Provider {
            message: value.to_string(),
            kind,
        }
    }
}

impl From<ConfigError> for ScalewayBackendError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(404, None, BackendErrorKind::NotFound)]
    #[case(400, Some("unknown_resource"), BackendErrorKind::NotFound)]
    #[case(409, Some("conflict"), BackendErrorKind::AlreadyExists)]
    #[case(403, Some("permissions_denied"), BackendErrorKind::Unauthorized)]
    #[case(400, Some("invalid_arguments"), BackendErrorKind::InvalidRequest)]
    #[case(503, None, BackendErrorKind::Transient)]
    #[case(418, None, BackendErrorKind::Other)]
    fn classifies_api_failures(
        #[case] status: u16,
        #[case] etype: Option<&str>,
        #[case] expected: BackendErrorKind,
    ) {
        assert_eq!(classify(status, etype), expected);
    }

    #[test]
    fn error_bodies_keep_the_provider_message() {
        let body = br#"{"type":"not_found","message":"resource is not found","resource":"instance_server","resource_id":"srv-1"}"#;

        let err = ScalewayBackendError::from_response(404, body);

        assert_eq!(
            err,
            ScalewayBackendError::Api {
                status: 404,
                kind: BackendErrorKind::NotFound,
                message: String::from("resource is not found"),
            }
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn unstructured_bodies_fall_back_to_the_raw_text() {
        let err = ScalewayBackendError::from_response(502, b" bad gateway \n");

        assert_eq!(err.kind(), BackendErrorKind::Transient);
        assert_eq!(err.to_string(), "provider error (502): bad gateway");
    }
}
