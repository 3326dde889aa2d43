use std::path::PathBuf;

use serde::Deserialize;

use super::ConfigError;

/// Largest accepted `clock_skew_ms` (one hour).
pub const MAX_CLOCK_SKEW_MS: u64 = 60 * 60 * 1000;

/// Trust relationship with the identity provider and this service provider's
/// own identity.
///
/// The IdP side (SSO endpoint, signing certificate, entity ID) comes from the
/// metadata file. The SP entity ID is always static configuration and is
/// never taken from IdP metadata.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamlConfig {
    /// IdP metadata XML file.
    pub metadata_path: PathBuf,

    /// PEM certificate that pins the IdP signing key.
    /// When set it replaces the certificate embedded in the metadata.
    #[serde(default)]
    pub idp_certificate_path: Option<PathBuf>,

    /// Entity ID of this service provider; assertions must be addressed to it.
    pub sp_entity_id: String,

    /// Path of the assertion consumer endpoint.
    #[serde(default = "default_callback_path")]
    pub callback_path: String,

    /// Absolute URL of the assertion consumer endpoint as seen by the browser.
    /// When set it is sent in AuthnRequests, published in SP metadata, and
    /// enforced against the response `Destination` and bearer `Recipient`.
    #[serde(default)]
    pub acs_url: Option<String>,

    /// Accepted clock skew between this host and the IdP, in milliseconds.
    /// At most [`MAX_CLOCK_SKEW_MS`].
    #[serde(default = "default_clock_skew_ms")]
    pub clock_skew_ms: u64,

    /// Where the browser lands after a successful login when no
    /// `return_to` was requested.
    #[serde(default = "default_login_redirect")]
    pub login_redirect: String,

    /// Correlate responses with the AuthnRequests this SP issued.
    /// Unsolicited (IdP-initiated) responses are rejected when enabled.
    #[serde(default)]
    pub request_correlation: bool,

    /// Lifetime of an outstanding AuthnRequest, in seconds.
    #[serde(default = "default_request_ttl")]
    pub request_ttl_secs: u64,

    /// Requested NameID format.
    #[serde(default)]
    pub name_id_format: Option<String>,

    /// Ask the IdP to re-authenticate even when it holds a session.
    #[serde(default)]
    pub force_authn: bool,

    /// Sign HTTP-Redirect AuthnRequests with the SP key.
    #[serde(default)]
    pub sign_requests: bool,

    /// PEM private key used to sign AuthnRequests.
    #[serde(default)]
    pub sp_private_key_path: Option<PathBuf>,

    /// PEM certificate published in SP metadata.
    #[serde(default)]
    pub sp_certificate_path: Option<PathBuf>,

    /// Assertion attribute names mapped onto the session identity.
    #[serde(default)]
    pub attributes: AttributeMapping,
}

impl SamlConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sp_entity_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "saml.sp_entity_id cannot be empty".into(),
            ));
        }
        if !self.callback_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "saml.callback_path must start with '/'".into(),
            ));
        }
        if !is_local_path(&self.login_redirect) {
            return Err(ConfigError::Validation(
                "saml.login_redirect must be a local path".into(),
            ));
        }
        if let Some(acs_url) = &self.acs_url {
            let parsed = url::Url::parse(acs_url).map_err(|e| {
                ConfigError::Validation(format!("saml.acs_url is not a valid URL: {e}"))
            })?;
            if !matches!(parsed.scheme(), "https" | "http") {
                return Err(ConfigError::Validation(
                    "saml.acs_url must be an http(s) URL".into(),
                ));
            }
        }
        if self.clock_skew_ms > MAX_CLOCK_SKEW_MS {
            return Err(ConfigError::Validation(format!(
                "saml.clock_skew_ms cannot exceed {MAX_CLOCK_SKEW_MS}"
            )));
        }
        if self.request_correlation && self.request_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "saml.request_ttl_secs cannot be zero when request correlation is enabled".into(),
            ));
        }
        if self.sign_requests && self.sp_private_key_path.is_none() {
            return Err(ConfigError::Validation(
                "saml.sign_requests requires saml.sp_private_key_path".into(),
            ));
        }
        Ok(())
    }

    /// Settings that are accepted but probably wrong.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(acs_url) = &self.acs_url
            && let Ok(parsed) = url::Url::parse(acs_url)
            && parsed.path() != self.callback_path
        {
            warnings.push(format!(
                "saml.acs_url path '{}' differs from saml.callback_path '{}'; \
                 a reverse proxy must rewrite it",
                parsed.path(),
                self.callback_path
            ));
        }
        warnings
    }
}

/// Names of the assertion attributes copied onto the identity.
/// Each name is matched against both `Name` and `FriendlyName`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeMapping {
    #[serde(default = "default_email_attribute")]
    pub email: String,

    #[serde(default = "default_name_attribute")]
    pub name: String,

    #[serde(default = "default_roles_attribute")]
    pub roles: String,
}

impl Default for AttributeMapping {
    fn default() -> Self {
        Self {
            email: default_email_attribute(),
            name: default_name_attribute(),
            roles: default_roles_attribute(),
        }
    }
}

/// True for same-origin paths such as `/dashboard`; rejects `//host` and
/// absolute URLs so redirects cannot leave the application.
pub fn is_local_path(path: &str) -> bool {
    path.starts_with('/') && !path.starts_with("//") && !path.starts_with("/\\")
}

fn default_callback_path() -> String {
    "/login/callback".to_string()
}

fn default_clock_skew_ms() -> u64 {
    5000
}

fn default_login_redirect() -> String {
    "/dashboard".to_string()
}

fn default_request_ttl() -> u64 {
    600
}

fn default_email_attribute() -> String {
    "email".to_string()
}

fn default_name_attribute() -> String {
    "name".to_string()
}

fn default_roles_attribute() -> String {
    "roles".to_string()
}
