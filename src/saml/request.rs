//! AuthnRequest construction for the HTTP-Redirect binding.

use std::io::Write;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use flate2::{Compression, write::DeflateEncoder};
use openssl::{
    hash::MessageDigest,
    pkey::{PKey, Private},
    sign::Signer,
};
use samael::{
    metadata::EntityDescriptor, service_provider::ServiceProviderBuilder, traits::ToXml,
};
use url::{Url, form_urlencoded};

use super::{ConfigurationError, TrustState, signature::RSA_SHA256};

/// An AuthnRequest ready to be sent to the IdP.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// Unique, unpredictable request ID (`InResponseTo` of the answer).
    pub id: String,
    pub issue_instant: DateTime<Utc>,
    /// IdP SSO endpoint the request is addressed to.
    pub destination: Url,
    /// SP entity ID.
    pub issuer: String,
    /// Serialized `samlp:AuthnRequest`.
    pub xml: String,
}

impl AuthRequest {
    /// Browser redirect target for the HTTP-Redirect binding.
    ///
    /// The request is DEFLATE-compressed, base64-encoded and appended as
    /// `SAMLRequest` to the SSO endpoint, keeping any query the endpoint
    /// already has. With a signing key the `SigAlg` and `Signature`
    /// parameters are added over the SAML parameters only.
    pub fn redirect_url(
        &self,
        relay_state: Option<&str>,
        signing_key: Option<&PKey<Private>>,
    ) -> Result<Url, RequestError> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(self.xml.as_bytes())?;
        let compressed = encoder.finish()?;
        let saml_request = STANDARD.encode(compressed);

        let mut params = form_urlencoded::Serializer::new(String::new());
        params.append_pair("SAMLRequest", &saml_request);
        if let Some(relay_state) = relay_state {
            params.append_pair("RelayState", relay_state);
        }

        let query = match signing_key {
            Some(key) => {
                params.append_pair("SigAlg", RSA_SHA256);
                let signed_part = params.finish();
                let mut signer = Signer::new(MessageDigest::sha256(), key)?;
                signer.update(signed_part.as_bytes())?;
                let signature = STANDARD.encode(signer.sign_to_vec()?);

                let mut signature_param = form_urlencoded::Serializer::new(String::new());
                signature_param.append_pair("Signature", &signature);
                format!("{signed_part}&{}", signature_param.finish())
            }
            None => params.finish(),
        };

        let mut url = self.destination.clone();
        let combined = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
            _ => query,
        };
        url.set_query(Some(&combined));
        Ok(url)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("failed to compress AuthnRequest: {0}")]
    Deflate(#[from] std::io::Error),

    #[error("failed to sign AuthnRequest: {0}")]
    Signing(#[from] openssl::error::ErrorStack),
}

/// Builds AuthnRequests from the trust configuration.
pub struct AuthRequestBuilder;

impl AuthRequestBuilder {
    /// Build a fresh AuthnRequest addressed to the metadata SSO endpoint.
    ///
    /// Fails closed when trust was never loaded or failed to load.
    pub fn build(trust: &TrustState) -> Result<AuthRequest, ConfigurationError> {
        let trust = trust.ready()?;
        let destination = trust.descriptor.sso_endpoint.clone();

        let idp_metadata = EntityDescriptor {
            entity_id: Some(trust.descriptor.idp_entity_id.clone()),
            ..Default::default()
        };
        let sp = ServiceProviderBuilder::default()
            .entity_id(trust.sp_entity_id.clone())
            .acs_url(trust.acs_url.as_ref().map(Url::to_string))
            .idp_metadata(idp_metadata)
            .authn_name_id_format(trust.name_id_format.clone())
            .force_authn(trust.force_authn)
            .build()
            .map_err(|e| unbuildable(e.to_string()))?;

        let authn_request = sp
            .make_authentication_request(destination.as_str())
            .map_err(|e| unbuildable(e.to_string()))?;
        let xml = ToXml::to_string(&authn_request).map_err(|e| unbuildable(e.to_string()))?;

        Ok(AuthRequest {
            id: authn_request.id.clone(),
            issue_instant: authn_request.issue_instant,
            destination,
            issuer: trust.sp_entity_id.clone(),
            xml,
        })
    }
}

/// The SP settings cannot be turned into an AuthnRequest.
fn unbuildable(reason: String) -> ConfigurationError {
    ConfigurationError::Invalid {
        setting: "saml",
        reason: format!("cannot build AuthnRequest: {reason}"),
    }
}
