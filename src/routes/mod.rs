pub mod auth;
pub mod health;
pub mod metadata;
pub mod pages;

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

/// A `302 Found` redirect.
///
/// Browser SSO expects 302; axum's `Redirect::to` answers 303.
pub(crate) fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}
