//! SAML 2.0 Web Browser SSO, service-provider side.
//!
//! - [`metadata`] turns IdP metadata into a [`TrustDescriptor`]
//! - [`trust`] holds the process-wide [`TrustConfig`] behind a [`TrustState`]
//! - [`request`] builds AuthnRequests for the HTTP-Redirect binding
//! - [`validator`] checks IdP responses and extracts the [`SamlIdentity`]
//! - [`authenticator`] ties the two protocol legs together
//!
//! Nothing in this module creates sessions; binding an identity to a session
//! happens in [`crate::auth`].

pub mod authenticator;
mod error;
pub mod metadata;
mod replay;
pub mod request;
mod signature;
pub mod trust;
pub mod validator;
pub mod xml;

#[cfg(test)]
pub(crate) mod test_support;

pub use authenticator::SamlAuthenticator;
pub use error::{ConfigurationError, MetadataError, ValidationError};
pub use metadata::{MetadataLoader, TrustDescriptor};
pub use replay::ReplayCache;
pub use request::{AuthRequestBuilder, RequestError};
pub use trust::{TrustConfig, TrustState};
pub use validator::{AssertionValidator, SamlIdentity, ValidationContext};

/// XML namespaces used by SAML 2.0 and XML-DSig.
pub mod ns {
    pub const PROTOCOL: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
    pub const ASSERTION: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
    pub const DSIG: &str = "http://www.w3.org/2000/09/xmldsig#";
    pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
}

/// SAML status and confirmation method URIs.
pub mod uri {
    pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
    pub const CM_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";
}
