//! Configuration for the SAML service provider.
//!
//! Configuration is loaded from a TOML file. `${VAR}` references are expanded
//! from the environment before parsing, so secrets such as key paths can be
//! supplied at deploy time.
//!
//! ```toml
//! [server]
//! port = 3000
//!
//! [saml]
//! metadata_path = "saml/idp-metadata.xml"
//! sp_entity_id = "https://yourapp.example.com/saml"
//!
//! [session]
//! secure = true
//! ```

mod observability;
mod saml;
mod server;
mod session;

use std::path::Path;

pub use observability::*;
pub use saml::*;
use serde::Deserialize;
pub use server::*;
pub use session::*;

/// File name looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "saml-sso.toml";

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Trust relationship with the identity provider.
    pub saml: SamlConfig,

    /// Session cookie and lifetime.
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        let config: AppConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.saml.validate()?;
        self.session.validate()?;

        let reserved = [
            "/",
            "/login",
            "/logout",
            "/dashboard",
            "/health",
            "/saml/metadata",
        ];
        if reserved.contains(&self.saml.callback_path.as_str()) {
            return Err(ConfigError::Validation(format!(
                "saml.callback_path '{}' collides with a built-in route",
                self.saml.callback_path
            )));
        }

        Ok(())
    }

    /// Settings that are accepted but probably wrong. Reported once logging
    /// is up, since validation runs before tracing is initialized.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = self.saml.warnings();
        if !self.session.secure && !self.server.host.is_loopback() {
            warnings.push(
                "session.secure is disabled on a non-loopback bind address; \
                 session cookies will be sent over plain HTTP"
                    .to_string(),
            );
        }
        warnings
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Variables appearing after a `#` on the same line are left untouched.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(format!("invalid env pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else { continue };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);

            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
