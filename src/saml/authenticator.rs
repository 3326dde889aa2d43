//! SP-initiated login: issuing AuthnRequests and consuming the IdP's answer.

use std::sync::Arc;

use chrono::Utc;
use url::Url;
use uuid::Uuid;

use super::{
    AssertionValidator, AuthRequestBuilder, ReplayCache, SamlIdentity, TrustState,
    ValidationContext, ValidationError,
};
use crate::{
    auth::{AuthError, PendingAuthRequest, SharedSessionStore},
    config::{SamlConfig, is_local_path},
};

/// Runs both legs of the Web Browser SSO profile.
///
/// Pending AuthnRequests are kept in the session store, keyed by the
/// RelayState sent with them. Sessions themselves are never created here.
pub struct SamlAuthenticator {
    trust: TrustState,
    validator: AssertionValidator,
    pending: SharedSessionStore,
    request_correlation: bool,
    request_ttl: chrono::Duration,
    login_redirect: String,
}

impl SamlAuthenticator {
    pub fn new(
        trust: TrustState,
        replay: Arc<ReplayCache>,
        pending: SharedSessionStore,
        config: &SamlConfig,
    ) -> Self {
        let request_ttl = i64::try_from(config.request_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);

        Self {
            trust,
            validator: AssertionValidator::new(replay),
            pending,
            request_correlation: config.request_correlation,
            request_ttl,
            login_redirect: config.login_redirect.clone(),
        }
    }

    pub fn trust(&self) -> &TrustState {
        &self.trust
    }

    /// How long an unanswered AuthnRequest stays valid.
    pub fn request_ttl(&self) -> chrono::Duration {
        self.request_ttl
    }

    /// Build an AuthnRequest and return the IdP URL to redirect the browser to.
    ///
    /// `return_to` is honoured after login only if it is a local path.
    pub async fn authorization_url(&self, return_to: Option<&str>) -> Result<Url, AuthError> {
        let trust = self.trust.ready()?;
        let request = AuthRequestBuilder::build(&self.trust)?;

        let relay_state = Uuid::new_v4().simple().to_string();
        let url = request.redirect_url(Some(&relay_state), trust.request_signing_key())?;

        let return_to = return_to
            .filter(|path| is_local_path(path))
            .map(str::to_string);
        self.pending
            .store_pending_request(PendingAuthRequest {
                relay_state,
                request_id: request.id.clone(),
                return_to,
                created_at: request.issue_instant,
            })
            .await?;

        tracing::debug!(
            request_id = %request.id,
            destination = %request.destination,
            issuer = %request.issuer,
            signed = trust.request_signing_key().is_some(),
            "Issued SAML AuthnRequest"
        );
        Ok(url)
    }

    /// Validate a posted `SAMLResponse`.
    ///
    /// Returns the asserted identity and the local path to continue to.
    pub async fn exchange_response(
        &self,
        saml_response: &str,
        relay_state: Option<&str>,
    ) -> Result<(SamlIdentity, String), AuthError> {
        let trust = self.trust.ready()?;
        let now = Utc::now();

        let pending = match relay_state.filter(|s| !s.is_empty()) {
            Some(relay_state) => self
                .pending
                .take_pending_request(relay_state)
                .await?
                .filter(|p| !p.is_expired_at(self.request_ttl, now)),
            None => None,
        };

        let expected_request_id = if self.request_correlation {
            let pending = pending
                .as_ref()
                .ok_or(ValidationError::UnsolicitedResponse)?;
            Some(pending.request_id.clone())
        } else {
            None
        };

        let ctx = ValidationContext {
            expected_request_id,
            now,
        };
        let identity = self
            .validator
            .validate_with(saml_response.as_bytes(), trust, &ctx)?;

        let return_to = pending
            .and_then(|p| p.return_to)
            .unwrap_or_else(|| self.login_redirect.clone());
        Ok((identity, return_to))
    }
}
