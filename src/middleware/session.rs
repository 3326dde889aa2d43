//! Session enforcement for protected pages.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tower_cookies::Cookies;

use crate::{AppState, auth::Access, routes::found};

/// Admit requests that carry a live session; send everyone else to the login page.
///
/// The resolved [`SamlIdentity`](crate::saml::SamlIdentity) is inserted into the
/// request extensions for downstream handlers.
pub async fn require_session(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    // Set by CookieManagerLayer
    let session_cookie = req
        .extensions()
        .get::<Cookies>()
        .and_then(|cookies| cookies.get(&state.config.session.cookie_name))
        .map(|cookie| cookie.value().to_string());

    match state.gate.check(session_cookie.as_deref()).await {
        Access::Authenticated(identity) => {
            tracing::debug!(
                name_id = %identity.name_id,
                path = %req.uri().path(),
                "Session accepted"
            );
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Access::Anonymous => {
            tracing::debug!(path = %req.uri().path(), "No valid session, redirecting to login");
            found("/")
        }
    }
}
