//! IdP metadata parsing.
//!
//! The document is deserialized with `samael` and reduced to the three facts
//! the trust relationship needs: the IdP entity ID, the HTTP-Redirect SSO
//! endpoint and the signing certificate. The SP's own entity ID is deployment
//! configuration and is never taken from here.

use std::path::Path;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use openssl::x509::X509;
use quick_xml::{Reader, events::Event};
use samael::metadata::{EntityDescriptor, HTTP_REDIRECT_BINDING};
use url::Url;

use super::MetadataError;

/// What the IdP metadata says about the trust relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustDescriptor {
    /// `entityID` of the IdP; assertions must be issued by it.
    pub idp_entity_id: String,
    /// HTTP-Redirect `SingleSignOnService` location.
    pub sso_endpoint: Url,
    /// PEM-encoded signing certificate.
    pub signing_certificate: String,
}

impl TrustDescriptor {
    /// The signing certificate, parsed.
    pub fn certificate(&self) -> Result<X509, MetadataError> {
        X509::from_pem(self.signing_certificate.as_bytes()).map_err(|e| {
            MetadataError::InvalidField {
                field: "signing certificate",
                reason: e.to_string(),
            }
        })
    }
}

/// Parses IdP metadata documents.
pub struct MetadataLoader;

impl MetadataLoader {
    /// Read and parse a metadata file.
    pub async fn load_file(path: impl AsRef<Path>) -> Result<TrustDescriptor, MetadataError> {
        let path = path.as_ref();
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| MetadataError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
        Self::load(&contents)
    }

    /// Parse an `EntityDescriptor` document.
    pub fn load(xml: &str) -> Result<TrustDescriptor, MetadataError> {
        reject_doctype(xml)?;
        let entity: EntityDescriptor = samael::metadata::de::from_str(xml)
            .map_err(|e| MetadataError::MalformedXml(e.to_string()))?;
        Self::from_entity(&entity)
    }

    /// Reduce already parsed metadata to a [`TrustDescriptor`].
    pub fn from_entity(entity: &EntityDescriptor) -> Result<TrustDescriptor, MetadataError> {
        let idp_entity_id = entity
            .entity_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(MetadataError::MissingField("entityID"))?
            .to_string();

        let idp = entity
            .idp_sso_descriptors
            .as_ref()
            .and_then(|descriptors| descriptors.first())
            .ok_or(MetadataError::MissingField("IDPSSODescriptor"))?;

        let location = idp
            .single_sign_on_services
            .iter()
            .find(|service| service.binding == HTTP_REDIRECT_BINDING)
            .map(|service| service.location.as_str())
            .ok_or(MetadataError::MissingField(
                "SingleSignOnService with HTTP-Redirect binding",
            ))?;
        let sso_endpoint = parse_endpoint(location.trim())?;

        // Keys without a `use` attribute serve both purposes.
        let certificate = idp
            .key_descriptors
            .iter()
            .filter(|key| matches!(key.key_use.as_deref(), None | Some("signing")))
            .filter_map(|key| key.key_info.x509_data.as_ref())
            .flat_map(|data| data.certificates.iter())
            .find(|body| !body.trim().is_empty())
            .ok_or(MetadataError::MissingField("signing certificate"))?;
        let signing_certificate = certificate_to_pem(certificate)?;

        Ok(TrustDescriptor {
            idp_entity_id,
            sso_endpoint,
            signing_certificate,
        })
    }
}

/// Refuse DTDs before the document reaches the deserializer, so no entity
/// declaration is ever honoured.
fn reject_doctype(xml: &str) -> Result<(), MetadataError> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::DocType(_)) => {
                return Err(MetadataError::MalformedXml(
                    "document type declarations are not allowed".into(),
                ));
            }
            Ok(Event::Start(_) | Event::Empty(_) | Event::Eof) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(MetadataError::MalformedXml(e.to_string())),
        }
    }
}

fn parse_endpoint(location: &str) -> Result<Url, MetadataError> {
    let url = Url::parse(location).map_err(|e| MetadataError::InvalidField {
        field: "SingleSignOnService Location",
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "https" | "http") || url.host().is_none() {
        return Err(MetadataError::InvalidField {
            field: "SingleSignOnService Location",
            reason: format!("'{location}' is not an absolute http(s) URL"),
        });
    }
    Ok(url)
}

/// Convert the base64 DER body of an `X509Certificate` element to PEM,
/// checking that it really is a certificate.
fn certificate_to_pem(body: &str) -> Result<String, MetadataError> {
    let invalid = |reason: String| MetadataError::InvalidField {
        field: "signing certificate",
        reason,
    };

    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let der = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| invalid(format!("not base64: {e}")))?;
    let certificate = X509::from_der(&der).map_err(|e| invalid(e.to_string()))?;
    let pem = certificate.to_pem().map_err(|e| invalid(e.to_string()))?;
    String::from_utf8(pem).map_err(|e| invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::test_support::{IDP_ENTITY_ID, IDP_SSO_URL, TestIdp};

    fn metadata(entity_id: &str, services: &str, key_descriptors: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{entity_id}">
  <md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    {key_descriptors}
    {services}
  </md:IDPSSODescriptor>
</md:EntityDescriptor>"#
        )
    }

    fn key_descriptor(usage: Option<&str>, cert: &str) -> String {
        let usage = usage.map(|u| format!(r#" use="{u}""#)).unwrap_or_default();
        format!(
            r#"<md:KeyDescriptor{usage}><ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Data><ds:X509Certificate>
{cert}
</ds:X509Certificate></ds:X509Data></ds:KeyInfo></md:KeyDescriptor>"#
        )
    }

    const REDIRECT_SERVICE: &str = r#"<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example/sso"/>"#;

    #[test]
    fn test_load_valid_metadata() {
        let idp = TestIdp::new();
        let descriptor = MetadataLoader::load(&idp.metadata_xml()).unwrap();

        assert_eq!(descriptor.idp_entity_id, IDP_ENTITY_ID);
        assert_eq!(descriptor.sso_endpoint.as_str(), IDP_SSO_URL);
        assert!(
            descriptor
                .signing_certificate
                .starts_with("-----BEGIN CERTIFICATE-----")
        );
        assert_eq!(
            descriptor.certificate().unwrap().to_der().unwrap(),
            idp.certificate.to_der().unwrap()
        );
    }

    #[test]
    fn test_prefers_redirect_binding() {
        let idp = TestIdp::new();
        let services = r#"
<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://idp.example/sso/post"/>
<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example/sso/redirect"/>"#;
        let xml = metadata(
            IDP_ENTITY_ID,
            services,
            &key_descriptor(Some("signing"), &idp.certificate_base64()),
        );

        let descriptor = MetadataLoader::load(&xml).unwrap();
        assert_eq!(
            descriptor.sso_endpoint.as_str(),
            "https://idp.example/sso/redirect"
        );
    }

    #[test]
    fn test_captured_jumpcloud_metadata() {
        let descriptor =
            MetadataLoader::load(include_str!("testdata/jumpcloud-idp-metadata.xml")).unwrap();

        assert_eq!(descriptor.idp_entity_id, "pillar-idp-2");
        assert_eq!(
            descriptor.sso_endpoint.as_str(),
            "https://sso.jumpcloud.com/saml2/pillar-idp"
        );
        assert!(descriptor.certificate().is_ok());
    }

    #[test]
    fn test_entities_descriptor_is_not_an_idp_entity() {
        let idp = TestIdp::new();
        let xml = format!(
            r#"<md:EntitiesDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata">
<md:EntityDescriptor entityID="{IDP_ENTITY_ID}"><md:IDPSSODescriptor>{}{REDIRECT_SERVICE}</md:IDPSSODescriptor></md:EntityDescriptor>
</md:EntitiesDescriptor>"#,
            key_descriptor(None, &idp.certificate_base64())
        );

        assert!(MetadataLoader::load(&xml).is_err());
    }

    #[test]
    fn test_encryption_only_key_is_not_a_signing_key() {
        let idp = TestIdp::new();
        let xml = metadata(
            IDP_ENTITY_ID,
            REDIRECT_SERVICE,
            &key_descriptor(Some("encryption"), &idp.certificate_base64()),
        );

        assert!(matches!(
            MetadataLoader::load(&xml),
            Err(MetadataError::MissingField("signing certificate"))
        ));
    }

    #[test]
    fn test_malformed_xml() {
        assert!(matches!(
            MetadataLoader::load("<md:EntityDescriptor"),
            Err(MetadataError::MalformedXml(_))
        ));
        assert!(MetadataLoader::load("plain text").is_err());
    }

    #[test]
    fn test_doctype_rejected() {
        let idp = TestIdp::new();
        let xml = format!(
            "<!DOCTYPE md [<!ENTITY idp \"{IDP_ENTITY_ID}\">]>\n{}",
            idp.metadata_xml().replace(r#"<?xml version="1.0" encoding="UTF-8"?>"#, "")
        );

        assert!(matches!(
            MetadataLoader::load(&xml),
            Err(MetadataError::MalformedXml(reason)) if reason.contains("document type")
        ));
    }

    #[test]
    fn test_missing_fields() {
        let idp = TestIdp::new();
        let keys = key_descriptor(None, &idp.certificate_base64());

        assert!(matches!(
            MetadataLoader::load(&metadata("", REDIRECT_SERVICE, &keys)),
            Err(MetadataError::MissingField("entityID"))
        ));
        assert!(MetadataLoader::load(&metadata(IDP_ENTITY_ID, "", &keys)).is_err());
        assert!(MetadataLoader::load(&metadata(IDP_ENTITY_ID, REDIRECT_SERVICE, "")).is_err());
        assert!(matches!(
            MetadataLoader::load(
                r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="x"/>"#
            ),
            Err(MetadataError::MissingField("IDPSSODescriptor"))
        ));
    }

    #[test]
    fn test_invalid_fields() {
        let idp = TestIdp::new();
        let keys = key_descriptor(None, &idp.certificate_base64());
        let relative = r#"<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="/sso"/>"#;

        assert!(matches!(
            MetadataLoader::load(&metadata(IDP_ENTITY_ID, relative, &keys)),
            Err(MetadataError::InvalidField { .. })
        ));
        assert!(matches!(
            MetadataLoader::load(&metadata(
                IDP_ENTITY_ID,
                REDIRECT_SERVICE,
                &key_descriptor(None, "bm90IGEgY2VydGlmaWNhdGU=")
            )),
            Err(MetadataError::InvalidField { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_file() {
        let idp = TestIdp::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idp-metadata.xml");
        std::fs::write(&path, idp.metadata_xml()).unwrap();

        let descriptor = MetadataLoader::load_file(&path).await.unwrap();
        assert_eq!(descriptor.idp_entity_id, IDP_ENTITY_ID);

        let missing = MetadataLoader::load_file(dir.path().join("nope.xml")).await;
        assert!(matches!(missing, Err(MetadataError::Io { .. })));
    }
}
