//! Service-provider metadata for registering with the IdP.

use axum::{
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::{AppState, auth::AuthError};

const SAML_METADATA_CONTENT_TYPE: &str = "application/samlmetadata+xml";

/// `GET /saml/metadata`
///
/// 404 when no absolute ACS URL is configured, since the metadata would be
/// unusable without one.
#[tracing::instrument(name = "saml.metadata", skip(state))]
pub async fn sp_metadata(State(state): State<AppState>) -> Result<Response, AuthError> {
    let trust = state.authenticator.trust().ready()?;

    Ok(match trust.sp_metadata_xml() {
        Some(xml) => ([(header::CONTENT_TYPE, SAML_METADATA_CONTENT_TYPE)], xml).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            "SP metadata requires saml.acs_url to be configured",
        )
            .into_response(),
    })
}
