//! The process-wide trust relationship with the IdP.
//!
//! Trust is loaded once, before the server accepts connections, and is
//! read-only afterwards. Consumers never see a partially built
//! configuration: they ask [`TrustState::ready`] and fail closed otherwise.

use std::{path::Path, sync::Arc};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use openssl::{
    pkey::{PKey, Private, Public},
    x509::X509,
};
use url::Url;

use super::{ConfigurationError, MetadataError, MetadataLoader, TrustDescriptor};
use crate::config::{AttributeMapping, SamlConfig};

const DEFAULT_NAME_ID_FORMAT: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";

/// Immutable trust configuration shared by the request builder and the
/// assertion validator.
#[derive(Debug, Clone)]
pub struct TrustConfig {
    pub descriptor: TrustDescriptor,
    pub sp_entity_id: String,
    pub callback_path: String,
    pub acs_url: Option<Url>,
    pub clock_skew: chrono::Duration,
    pub name_id_format: Option<String>,
    pub force_authn: bool,
    pub attributes: AttributeMapping,
    verification_key: PKey<Public>,
    request_signing_key: Option<PKey<Private>>,
    sp_certificate: Option<X509>,
}

impl TrustConfig {
    /// Combine the IdP descriptor with this SP's static settings.
    pub fn new(
        descriptor: TrustDescriptor,
        config: &SamlConfig,
    ) -> Result<Self, ConfigurationError> {
        let verification_key = public_key_of(&descriptor.signing_certificate)?;

        let acs_url = config
            .acs_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| ConfigurationError::Invalid {
                setting: "saml.acs_url",
                reason: e.to_string(),
            })?;

        let clock_skew = i64::try_from(config.clock_skew_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .ok_or_else(|| ConfigurationError::Invalid {
                setting: "saml.clock_skew_ms",
                reason: "value out of range".into(),
            })?;

        Ok(Self {
            descriptor,
            sp_entity_id: config.sp_entity_id.clone(),
            callback_path: config.callback_path.clone(),
            acs_url,
            clock_skew,
            name_id_format: config.name_id_format.clone(),
            force_authn: config.force_authn,
            attributes: config.attributes.clone(),
            verification_key,
            request_signing_key: None,
            sp_certificate: None,
        })
    }

    /// Load metadata and any configured key material from disk.
    pub async fn load(config: &SamlConfig) -> Result<Self, TrustLoadError> {
        let descriptor = MetadataLoader::load_file(&config.metadata_path).await?;
        let mut trust = Self::new(descriptor, config)?;

        if let Some(path) = &config.idp_certificate_path {
            let pem = read_file(path).await?;
            trust = trust.with_pinned_certificate(&pem)?;
        }

        if config.sign_requests
            && let Some(path) = &config.sp_private_key_path
        {
            let pem = read_file(path).await?;
            trust = trust.with_request_signing_key(&pem)?;
        }

        if let Some(path) = &config.sp_certificate_path {
            let pem = read_file(path).await?;
            trust = trust.with_sp_certificate(&pem)?;
        }

        Ok(trust)
    }

    /// Trust `pem` instead of the certificate embedded in the metadata.
    pub fn with_pinned_certificate(mut self, pem: &str) -> Result<Self, ConfigurationError> {
        let key = public_key_of(pem)?;
        if pem.trim() != self.descriptor.signing_certificate.trim() {
            tracing::info!(
                idp_entity_id = %self.descriptor.idp_entity_id,
                "Pinned IdP certificate overrides the certificate in metadata"
            );
        }
        self.verification_key = key;
        self.descriptor.signing_certificate = pem.trim().to_string();
        Ok(self)
    }

    /// Sign outgoing AuthnRequests with this PEM private key.
    pub fn with_request_signing_key(mut self, pem: &str) -> Result<Self, ConfigurationError> {
        let key = PKey::private_key_from_pem(pem.as_bytes()).map_err(|e| {
            ConfigurationError::Invalid {
                setting: "saml.sp_private_key_path",
                reason: e.to_string(),
            }
        })?;
        self.request_signing_key = Some(key);
        Ok(self)
    }

    /// Publish this PEM certificate in SP metadata.
    pub fn with_sp_certificate(mut self, pem: &str) -> Result<Self, ConfigurationError> {
        let certificate =
            X509::from_pem(pem.as_bytes()).map_err(|e| ConfigurationError::Invalid {
                setting: "saml.sp_certificate_path",
                reason: e.to_string(),
            })?;
        self.sp_certificate = Some(certificate);
        Ok(self)
    }

    /// Key that IdP signatures are checked against. Keys embedded in
    /// responses are never used.
    pub fn verification_key(&self) -> &PKey<Public> {
        &self.verification_key
    }

    pub fn request_signing_key(&self) -> Option<&PKey<Private>> {
        self.request_signing_key.as_ref()
    }

    /// SP metadata for registering this service with the IdP.
    /// Requires an absolute ACS URL.
    pub fn sp_metadata_xml(&self) -> Option<String> {
        use quick_xml::escape::escape;

        let acs_url = self.acs_url.as_ref()?;

        let mut xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{}">
  <md:SPSSODescriptor AuthnRequestsSigned="{}" WantAssertionsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">"#,
            escape(self.sp_entity_id.as_str()),
            self.request_signing_key.is_some(),
        );

        if let Some(body) = self
            .sp_certificate
            .as_ref()
            .and_then(|cert| cert.to_der().ok())
            .map(|der| STANDARD.encode(der))
        {
            xml.push_str(&format!(
                r#"
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
        <ds:X509Data>
          <ds:X509Certificate>{body}</ds:X509Certificate>
        </ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>"#
            ));
        }

        xml.push_str(&format!(
            r#"
    <md:NameIDFormat>{}</md:NameIDFormat>
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{}" index="0" isDefault="true"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#,
            escape(
                self.name_id_format
                    .as_deref()
                    .unwrap_or(DEFAULT_NAME_ID_FORMAT)
            ),
            escape(acs_url.as_str()),
        ));

        Some(xml)
    }
}

/// Trust could not be established at startup.
#[derive(Debug, thiserror::Error)]
pub enum TrustLoadError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Lifecycle of the trust relationship.
#[derive(Debug, Clone, Default)]
pub enum TrustState {
    #[default]
    Uninitialized,
    Ready(Arc<TrustConfig>),
    /// Loading failed; SAML endpoints refuse traffic until the deployment is fixed.
    Failed(String),
}

impl TrustState {
    /// Load trust for `config`, logging the outcome.
    pub async fn initialize(config: &SamlConfig) -> Self {
        match TrustConfig::load(config).await {
            Ok(trust) => {
                tracing::info!(
                    idp_entity_id = %trust.descriptor.idp_entity_id,
                    sso_endpoint = %trust.descriptor.sso_endpoint,
                    sp_entity_id = %trust.sp_entity_id,
                    "SAML trust configuration loaded"
                );
                TrustState::Ready(Arc::new(trust))
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    metadata_path = %config.metadata_path.display(),
                    "SAML trust configuration failed to load; login is unavailable"
                );
                TrustState::Failed(e.to_string())
            }
        }
    }

    /// The loaded configuration, or the reason there is none.
    pub fn ready(&self) -> Result<&Arc<TrustConfig>, ConfigurationError> {
        match self {
            TrustState::Ready(trust) => Ok(trust),
            TrustState::Uninitialized => Err(ConfigurationError::TrustNotInitialized),
            TrustState::Failed(reason) => Err(ConfigurationError::TrustUnavailable(reason.clone())),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            TrustState::Uninitialized => "uninitialized",
            TrustState::Ready(_) => "ready",
            TrustState::Failed(_) => "failed",
        }
    }
}

fn public_key_of(pem: &str) -> Result<PKey<Public>, ConfigurationError> {
    let invalid = |reason: String| ConfigurationError::Invalid {
        setting: "IdP signing certificate",
        reason,
    };
    let certificate = X509::from_pem(pem.as_bytes()).map_err(|e| invalid(e.to_string()))?;
    certificate.public_key().map_err(|e| invalid(e.to_string()))
}

async fn read_file(path: &Path) -> Result<String, ConfigurationError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })
}
