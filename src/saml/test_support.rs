//! Test identity provider: a key pair, a self-signed certificate, metadata
//! and signed SAML responses built the way real IdPs emit them.

use std::sync::OnceLock;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::{MessageDigest, hash},
    pkey::{PKey, Private},
    rsa::Rsa,
    sign::Signer,
    x509::{X509, X509Builder, X509NameBuilder},
};
use quick_xml::escape::escape;

use super::{
    MetadataLoader, TrustConfig, ns,
    signature::{DIGEST_SHA256, RSA_SHA256, TRANSFORM_ENVELOPED, digest_method, signature_digest},
    xml::XmlDocument,
};
use crate::config::SamlConfig;

pub const IDP_ENTITY_ID: &str = "https://idp.example/metadata";
pub const IDP_SSO_URL: &str = "https://idp.example/sso";
pub const SP_ENTITY_ID: &str = "https://yourapp.example.com/saml";
pub const ACS_URL: &str = "https://yourapp.example.com/login/callback";
pub const SUBJECT: &str = "alice@example.com";

const EMAIL_FORMAT: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";

#[derive(Clone)]
pub struct TestIdp {
    pub key: PKey<Private>,
    pub certificate: X509,
}

impl TestIdp {
    /// The IdP that tests trust.
    pub fn new() -> Self {
        static IDP: OnceLock<TestIdp> = OnceLock::new();
        IDP.get_or_init(|| Self::generate("test-idp.example.com"))
            .clone()
    }

    /// A second IdP with its own key, for impersonation tests.
    pub fn other() -> Self {
        static OTHER: OnceLock<TestIdp> = OnceLock::new();
        OTHER
            .get_or_init(|| Self::generate("attacker.example.com"))
            .clone()
    }

    fn generate(common_name: &str) -> Self {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", common_name).unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        Self {
            key,
            certificate: builder.build(),
        }
    }

    pub fn certificate_base64(&self) -> String {
        STANDARD.encode(self.certificate.to_der().unwrap())
    }

    pub fn certificate_pem(&self) -> String {
        String::from_utf8(self.certificate.to_pem().unwrap()).unwrap()
    }

    pub fn private_key_pem(&self) -> String {
        String::from_utf8(self.key.private_key_to_pem_pkcs8().unwrap()).unwrap()
    }

    pub fn metadata_xml(&self) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{IDP_ENTITY_ID}">
  <md:IDPSSODescriptor WantAuthnRequestsSigned="false" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
        <ds:X509Data>
          <ds:X509Certificate>{}</ds:X509Certificate>
        </ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>
    <md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example/slo"/>
    <md:NameIDFormat>{EMAIL_FORMAT}</md:NameIDFormat>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{IDP_SSO_URL}"/>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{IDP_SSO_URL}"/>
  </md:IDPSSODescriptor>
</md:EntityDescriptor>"#,
            self.certificate_base64()
        )
    }

    /// Trust configuration pointing at this IdP with the default SP settings.
    pub fn trust_config(&self) -> TrustConfig {
        let descriptor = MetadataLoader::load(&self.metadata_xml()).unwrap();
        TrustConfig::new(descriptor, &saml_config()).unwrap()
    }

    /// A valid response for [`SUBJECT`], signed at the assertion level.
    pub fn response(&self) -> ResponseBuilder<'_> {
        ResponseBuilder::new(self)
    }
}

/// SP settings used throughout the tests.
pub fn saml_config() -> SamlConfig {
    toml::from_str(&format!(
        r#"
metadata_path = "idp-metadata.xml"
sp_entity_id = "{SP_ENTITY_ID}"
acs_url = "{ACS_URL}"
"#
    ))
    .unwrap()
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct ResponseBuilder<'a> {
    idp: &'a TestIdp,
    pub response_id: String,
    pub assertion_id: String,
    issuer: String,
    audience: Option<String>,
    name_id: Option<String>,
    issue_instant: DateTime<Utc>,
    not_before: DateTime<Utc>,
    not_on_or_after: DateTime<Utc>,
    in_response_to: Option<String>,
    destination: Option<String>,
    recipient: Option<String>,
    status: String,
    attributes: Vec<(String, Vec<String>)>,
    sign_assertion: bool,
    sign_response: bool,
    signature_algorithm: String,
    digest_algorithm: String,
}

impl<'a> ResponseBuilder<'a> {
    fn new(idp: &'a TestIdp) -> Self {
        let now = Utc::now();
        Self {
            idp,
            response_id: format!("_resp{}", uuid::Uuid::new_v4().simple()),
            assertion_id: format!("_assert{}", uuid::Uuid::new_v4().simple()),
            issuer: IDP_ENTITY_ID.to_string(),
            audience: Some(SP_ENTITY_ID.to_string()),
            name_id: Some(SUBJECT.to_string()),
            issue_instant: now,
            not_before: now - Duration::minutes(1),
            not_on_or_after: now + Duration::minutes(5),
            in_response_to: None,
            destination: Some(ACS_URL.to_string()),
            recipient: Some(ACS_URL.to_string()),
            status: super::uri::STATUS_SUCCESS.to_string(),
            attributes: vec![
                ("email".into(), vec![SUBJECT.into()]),
                ("name".into(), vec!["Alice Example".into()]),
                ("roles".into(), vec!["admin".into(), "staff".into()]),
            ],
            sign_assertion: true,
            sign_response: false,
            signature_algorithm: RSA_SHA256.to_string(),
            digest_algorithm: DIGEST_SHA256.to_string(),
        }
    }

    pub fn issuer(mut self, issuer: &str) -> Self {
        self.issuer = issuer.to_string();
        self
    }

    pub fn audience(mut self, audience: Option<&str>) -> Self {
        self.audience = audience.map(str::to_string);
        self
    }

    pub fn name_id(mut self, name_id: Option<&str>) -> Self {
        self.name_id = name_id.map(str::to_string);
        self
    }

    pub fn valid_between(mut self, not_before: DateTime<Utc>, not_on_or_after: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self.not_on_or_after = not_on_or_after;
        self
    }

    pub fn in_response_to(mut self, request_id: &str) -> Self {
        self.in_response_to = Some(request_id.to_string());
        self
    }

    pub fn destination(mut self, destination: Option<&str>) -> Self {
        self.destination = destination.map(str::to_string);
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    pub fn sign_response_only(mut self) -> Self {
        self.sign_assertion = false;
        self.sign_response = true;
        self
    }

    pub fn sign_both(mut self) -> Self {
        self.sign_assertion = true;
        self.sign_response = true;
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.sign_assertion = false;
        self.sign_response = false;
        self
    }

    pub fn algorithms(mut self, signature: &str, digest: &str) -> Self {
        self.signature_algorithm = signature.to_string();
        self.digest_algorithm = digest.to_string();
        self
    }

    /// The response document, signed as configured.
    pub fn xml(&self) -> String {
        let mut assertion = self.assertion("");
        if self.sign_assertion {
            let unsigned = self.document(&assertion, "");
            let signature = self.signature_for(&unsigned, &self.assertion_id);
            assertion = self.assertion(&signature);
        }

        let unsigned = self.document(&assertion, "");
        if !self.sign_response {
            return unsigned;
        }
        let signature = self.signature_for(&unsigned, &self.response_id);
        self.document(&assertion, &signature)
    }

    /// The response as the browser posts it in `SAMLResponse`.
    pub fn encoded(&self) -> String {
        STANDARD.encode(self.xml())
    }

    /// The bare assertion element, signed if assertion signing is enabled.
    pub fn assertion_xml(&self) -> String {
        let assertion = self.assertion("");
        if !self.sign_assertion {
            return assertion;
        }
        let unsigned = self.document(&assertion, "");
        self.assertion(&self.signature_for(&unsigned, &self.assertion_id))
    }

    /// Wrap `assertion` in this builder's response envelope.
    pub fn document(&self, assertion: &str, signature: &str) -> String {
        let destination = self
            .destination
            .as_ref()
            .map(|d| format!(r#" Destination="{}""#, escape(d.as_str())))
            .unwrap_or_default();
        let in_response_to = self
            .in_response_to
            .as_ref()
            .map(|id| format!(r#" InResponseTo="{id}""#))
            .unwrap_or_default();

        format!(
            r#"<samlp:Response xmlns:samlp="{}" xmlns:saml="{}" ID="{}" Version="2.0" IssueInstant="{}"{destination}{in_response_to}><saml:Issuer>{}</saml:Issuer>{signature}<samlp:Status><samlp:StatusCode Value="{}"/></samlp:Status>{assertion}</samlp:Response>"#,
            ns::PROTOCOL,
            ns::ASSERTION,
            self.response_id,
            timestamp(self.issue_instant),
            escape(self.issuer.as_str()),
            self.status,
        )
    }

    fn assertion(&self, signature: &str) -> String {
        let name_id = self
            .name_id
            .as_ref()
            .map(|n| {
                format!(
                    r#"<saml:NameID Format="{EMAIL_FORMAT}">{}</saml:NameID>"#,
                    escape(n.as_str())
                )
            })
            .unwrap_or_default();
        let recipient = self
            .recipient
            .as_ref()
            .map(|r| format!(r#" Recipient="{}""#, escape(r.as_str())))
            .unwrap_or_default();
        let in_response_to = self
            .in_response_to
            .as_ref()
            .map(|id| format!(r#" InResponseTo="{id}""#))
            .unwrap_or_default();
        let audience = self
            .audience
            .as_ref()
            .map(|a| {
                format!(
                    "<saml:AudienceRestriction><saml:Audience>{}</saml:Audience></saml:AudienceRestriction>",
                    escape(a.as_str())
                )
            })
            .unwrap_or_default();

        let mut attributes = String::new();
        if !self.attributes.is_empty() {
            attributes.push_str("<saml:AttributeStatement>");
            for (name, values) in &self.attributes {
                attributes.push_str(&format!(
                    r#"<saml:Attribute Name="{name}" NameFormat="urn:oasis:names:tc:SAML:2.0:attrname-format:basic">"#
                ));
                for value in values {
                    attributes.push_str(&format!(
                        r#"<saml:AttributeValue xsi:type="xs:string">{}</saml:AttributeValue>"#,
                        escape(value.as_str())
                    ));
                }
                attributes.push_str("</saml:Attribute>");
            }
            attributes.push_str("</saml:AttributeStatement>");
        }

        let issue_instant = timestamp(self.issue_instant);
        let not_on_or_after = timestamp(self.not_on_or_after);
        format!(
            r#"<saml:Assertion xmlns:saml="{}" xmlns:xs="http://www.w3.org/2001/XMLSchema" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" ID="{}" Version="2.0" IssueInstant="{issue_instant}"><saml:Issuer>{}</saml:Issuer>{signature}<saml:Subject>{name_id}<saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer"><saml:SubjectConfirmationData NotOnOrAfter="{not_on_or_after}"{recipient}{in_response_to}/></saml:SubjectConfirmation></saml:Subject><saml:Conditions NotBefore="{}" NotOnOrAfter="{not_on_or_after}">{audience}</saml:Conditions><saml:AuthnStatement AuthnInstant="{issue_instant}" SessionIndex="_session{}"><saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement>{attributes}</saml:Assertion>"#,
            ns::ASSERTION,
            self.assertion_id,
            escape(self.issuer.as_str()),
            timestamp(self.not_before),
            self.assertion_id,
        )
    }

    /// Enveloped signature over the element with `id` inside `document`.
    fn signature_for(&self, document: &str, id: &str) -> String {
        let doc = XmlDocument::parse(document).unwrap();
        let target = doc.find_by_id(id).unwrap();
        let canonical = doc.canonicalize(target, None, &["xs".to_string()]);

        let digest_md = digest_method(&self.digest_algorithm).unwrap_or(MessageDigest::sha256());
        let digest = STANDARD.encode(hash(digest_md, canonical.as_bytes()).unwrap());

        let signed_info = format!(
            r##"<ds:SignedInfo><ds:CanonicalizationMethod Algorithm="{exc}"/><ds:SignatureMethod Algorithm="{}"/><ds:Reference URI="#{id}"><ds:Transforms><ds:Transform Algorithm="{TRANSFORM_ENVELOPED}"/><ds:Transform Algorithm="{exc}"><ec:InclusiveNamespaces xmlns:ec="{exc}" PrefixList="xs"/></ds:Transform></ds:Transforms><ds:DigestMethod Algorithm="{}"/><ds:DigestValue>{digest}</ds:DigestValue></ds:Reference></ds:SignedInfo>"##,
            self.signature_algorithm,
            self.digest_algorithm,
            exc = ns::EXC_C14N,
        );

        let wrapper = format!(r#"<ds:Signature xmlns:ds="{}">{signed_info}</ds:Signature>"#, ns::DSIG);
        let wrapper_doc = XmlDocument::parse(&wrapper).unwrap();
        let signed_info_element = wrapper_doc.root().child(ns::DSIG, "SignedInfo").unwrap();
        let canonical_signed_info = wrapper_doc.canonicalize(signed_info_element, None, &[]);

        let signature_md =
            signature_digest(&self.signature_algorithm).unwrap_or(MessageDigest::sha256());
        let mut signer = Signer::new(signature_md, &self.idp.key).unwrap();
        signer.update(canonical_signed_info.as_bytes()).unwrap();
        let signature_value = STANDARD.encode(signer.sign_to_vec().unwrap());

        format!(
            r#"<ds:Signature xmlns:ds="{}">{signed_info}<ds:SignatureValue>{signature_value}</ds:SignatureValue><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>"#,
            ns::DSIG,
            self.idp.certificate_base64(),
        )
    }
}

/// Flip one bit in the first `SignatureValue` of `xml`.
pub fn flip_signature_byte(xml: &str) -> String {
    const OPEN: &str = "<ds:SignatureValue>";
    let start = xml.find(OPEN).unwrap() + OPEN.len();
    let end = start + xml[start..].find("</ds:SignatureValue>").unwrap();

    let mut bytes = STANDARD.decode(&xml[start..end]).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;

    format!("{}{}{}", &xml[..start], STANDARD.encode(bytes), &xml[end..])
}
