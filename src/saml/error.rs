//! Error types for the SAML trust, request and validation layers.

use std::path::PathBuf;

/// IdP metadata could not be turned into a trust descriptor.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("failed to read metadata file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata could not be parsed: {0}")]
    MalformedXml(String),

    #[error("metadata missing {0}")]
    MissingField(&'static str),

    #[error("metadata field {field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// The trust relationship is missing or unusable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("SAML trust configuration has not been initialized")]
    TrustNotInitialized,

    #[error("SAML trust configuration failed to load: {0}")]
    TrustUnavailable(String),

    #[error("invalid SAML setting {setting}: {reason}")]
    Invalid { setting: &'static str, reason: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why an IdP response was rejected. Each variant names the check that
/// failed; details are for server-side logs only.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed SAML response: {0}")]
    Malformed(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("IdP returned status {0}")]
    StatusNotSuccess(String),

    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch { expected: String, actual: String },

    #[error("audience mismatch: expected {expected}, got {actual:?}")]
    AudienceMismatch {
        expected: String,
        actual: Vec<String>,
    },

    #[error("assertion expired at {0}")]
    Expired(String),

    #[error("assertion not valid before {0}")]
    NotYetValid(String),

    #[error("response addressed to {actual}, expected {expected}")]
    DestinationMismatch { expected: String, actual: String },

    #[error("response answers request {actual:?}, expected {expected}")]
    InResponseToMismatch {
        expected: String,
        actual: Option<String>,
    },

    #[error("unsolicited response: no outstanding request for this RelayState")]
    UnsolicitedResponse,

    #[error("assertion {0} has already been used")]
    Replayed(String),

    #[error("assertion has no subject NameID")]
    NoSubject,
}

impl ValidationError {
    /// Stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::Malformed(_) => "malformed",
            ValidationError::SignatureInvalid(_) => "signature_invalid",
            ValidationError::StatusNotSuccess(_) => "status_not_success",
            ValidationError::IssuerMismatch { .. } => "issuer_mismatch",
            ValidationError::AudienceMismatch { .. } => "audience_mismatch",
            ValidationError::Expired(_) => "expired",
            ValidationError::NotYetValid(_) => "not_yet_valid",
            ValidationError::DestinationMismatch { .. } => "destination_mismatch",
            ValidationError::InResponseToMismatch { .. } => "in_response_to_mismatch",
            ValidationError::UnsolicitedResponse => "unsolicited_response",
            ValidationError::Replayed(_) => "replayed",
            ValidationError::NoSubject => "no_subject",
        }
    }
}
