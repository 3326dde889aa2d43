//! SAML login routes.
//!
//! - `POST /login` - builds an AuthnRequest and redirects to the IdP
//! - `POST {callback_path}` - Assertion Consumer Service (HTTP-POST binding)
//! - `GET|POST /logout` - ends the local session

use axum::{
    Form,
    extract::{Query, State, rejection::FormRejection},
    response::Response,
};
use serde::Deserialize;
use tower_cookies::{
    Cookie, Cookies,
    cookie::{SameSite as CookieSameSite, time::Duration as CookieDuration},
};

use super::found;
use crate::{
    AppState,
    auth::{AuthError, SessionId},
    config::{SameSite, SessionConfig},
};

/// Query parameters for the login endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct LoginParams {
    /// Local path to land on after login.
    pub return_to: Option<String>,
}

/// Form posted by the IdP to the Assertion Consumer Service.
#[derive(Debug, Deserialize)]
pub struct SamlCallbackForm {
    #[serde(rename = "SAMLResponse")]
    pub saml_response: String,
    #[serde(rename = "RelayState", default)]
    pub relay_state: Option<String>,
}

/// Start SP-initiated login.
#[tracing::instrument(name = "saml.login", skip(state, params))]
pub async fn login(
    State(state): State<AppState>,
    Query(params): Query<LoginParams>,
) -> Result<Response, AuthError> {
    let url = state
        .authenticator
        .authorization_url(params.return_to.as_deref())
        .await?;

    Ok(found(url.as_str()))
}

/// Assertion Consumer Service.
///
/// A rejected response sends the browser back to the login page; the reason
/// is only logged.
#[tracing::instrument(name = "saml.callback", skip(state, cookies, form))]
pub async fn callback(
    State(state): State<AppState>,
    cookies: Cookies,
    form: Result<Form<SamlCallbackForm>, FormRejection>,
) -> Result<Response, AuthError> {
    let Form(form) = match form {
        Ok(form) => form,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "Malformed SAML callback");
            return Ok(found("/"));
        }
    };

    let (identity, return_to) = match state
        .authenticator
        .exchange_response(&form.saml_response, form.relay_state.as_deref())
        .await
    {
        Ok(result) => result,
        Err(AuthError::Rejected(e)) => {
            tracing::warn!(reason = e.kind(), error = %e, "SAML response rejected");
            return Ok(found("/"));
        }
        Err(e) => return Err(e),
    };

    let session_config = &state.config.session;

    // Login always starts from a fresh session ID.
    if let Some(previous) = cookies
        .get(&session_config.cookie_name)
        .and_then(|c| SessionId::parse(c.value()))
        && let Err(e) = state.binder.destroy(&previous).await
    {
        tracing::warn!(error = %e, "Failed to destroy previous session");
    }

    let name_id = identity.name_id.clone();
    let issuer = identity.issuer.clone();
    let session_id = state.binder.bind(identity).await?;

    cookies.add(build_session_cookie(
        session_config,
        &session_id,
        state.binder.duration(),
    ));

    tracing::info!(
        name_id = %name_id,
        issuer = %issuer,
        return_to = %return_to,
        "SAML session created"
    );

    Ok(found(&return_to))
}

/// End the local session and return to the login page.
///
/// Single Logout with the IdP is not performed.
#[tracing::instrument(name = "saml.logout", skip(state, cookies))]
pub async fn logout(State(state): State<AppState>, cookies: Cookies) -> Response {
    let session_config = &state.config.session;

    if let Some(id) = cookies
        .get(&session_config.cookie_name)
        .and_then(|c| SessionId::parse(c.value()))
    {
        match state.binder.destroy(&id).await {
            Ok(()) => tracing::info!("Session ended"),
            Err(e) => tracing::warn!(error = %e, "Failed to destroy session on logout"),
        }
    }

    cookies.add(build_removal_cookie(session_config));
    found("/")
}

fn cookie_same_site(same_site: SameSite) -> CookieSameSite {
    match same_site {
        SameSite::Strict => CookieSameSite::Strict,
        SameSite::Lax => CookieSameSite::Lax,
        SameSite::None => CookieSameSite::None,
    }
}

fn build_session_cookie(
    session_config: &SessionConfig,
    id: &SessionId,
    duration: chrono::Duration,
) -> Cookie<'static> {
    Cookie::build((session_config.cookie_name.clone(), id.as_str().to_string()))
        .path(session_config.cookie_path.clone())
        .http_only(true)
        .secure(session_config.secure)
        .same_site(cookie_same_site(session_config.same_site))
        .max_age(CookieDuration::seconds(duration.num_seconds()))
        .build()
}

fn build_removal_cookie(session_config: &SessionConfig) -> Cookie<'static> {
    Cookie::build(session_config.cookie_name.clone())
        .path(session_config.cookie_path.clone())
        .http_only(true)
        .secure(session_config.secure)
        .same_site(cookie_same_site(session_config.same_site))
        .max_age(CookieDuration::ZERO)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_attributes() {
        let config = SessionConfig {
            cookie_path: "/app".into(),
            same_site: SameSite::Strict,
            ..Default::default()
        };
        let id = SessionId::generate();

        let cookie = build_session_cookie(&config, &id, chrono::Duration::hours(2));
        assert_eq!(cookie.name(), "saml_session");
        assert_eq!(cookie.value(), id.as_str());
        assert_eq!(cookie.path(), Some("/app"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(CookieSameSite::Strict));
        assert_eq!(cookie.max_age(), Some(CookieDuration::hours(2)));
    }

    #[test]
    fn test_removal_cookie_expires_immediately() {
        let cookie = build_removal_cookie(&SessionConfig::default());
        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(CookieDuration::ZERO));
    }
}
