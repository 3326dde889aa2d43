use serde::Deserialize;

use super::ConfigError;

/// Session cookie configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Cookie name.
    #[serde(default = "default_session_cookie")]
    pub cookie_name: String,

    /// Cookie path. The session is scoped to this application path.
    #[serde(default = "default_cookie_path")]
    pub cookie_path: String,

    /// Session duration in seconds.
    #[serde(default = "default_session_duration")]
    pub duration_secs: u64,

    /// Secure cookie (HTTPS only).
    #[serde(default = "default_true")]
    pub secure: bool,

    /// SameSite cookie attribute.
    #[serde(default)]
    pub same_site: SameSite,

    /// Interval between sweeps of expired sessions, pending logins and
    /// replay-cache entries. 0 disables the sweep; expiry is still enforced
    /// on every lookup.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_session_cookie(),
            cookie_path: default_cookie_path(),
            duration_secs: default_session_duration(),
            secure: true,
            same_site: SameSite::default(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl SessionConfig {
    /// Validate the session configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cookie_name.is_empty() {
            return Err(ConfigError::Validation(
                "Session cookie name cannot be empty".into(),
            ));
        }
        if !self.cookie_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Session cookie path must start with '/'".into(),
            ));
        }
        if self.duration_secs == 0 {
            return Err(ConfigError::Validation(
                "Session duration cannot be zero".into(),
            ));
        }
        if self.same_site == SameSite::None && !self.secure {
            return Err(ConfigError::Validation(
                "SameSite=None cookies must also be secure".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameSite {
    #[default]
    Lax,
    Strict,
    None,
}

fn default_session_cookie() -> String {
    "saml_session".to_string()
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_session_duration() -> u64 {
    8 * 60 * 60
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_session_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_same_site_none_requires_secure() {
        let config = SessionConfig {
            same_site: SameSite::None,
            secure: false,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_duration_rejected() {
        let config = SessionConfig {
            duration_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
