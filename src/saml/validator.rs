//! Validation of IdP responses received through the HTTP-POST binding.
//!
//! Checks run in a fixed order and stop at the first failure. Nothing is
//! recorded (in particular, the assertion ID is not marked as used) unless
//! every check passes.

use std::{collections::BTreeMap, sync::Arc};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use openssl::pkey::{PKeyRef, Public};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{
    ReplayCache, TrustConfig, ValidationError, ns, signature,
    uri::{CM_BEARER, STATUS_SUCCESS},
    xml::{Element, XmlDocument},
};

const EMAIL_NAME_ID_FORMAT: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";

/// How long an assertion ID is remembered when the assertion carries no
/// expiry of its own.
const UNBOUNDED_REPLAY_RETENTION_HOURS: i64 = 24;

/// The authenticated principal extracted from a valid assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamlIdentity {
    /// Subject `NameID`.
    pub name_id: String,
    pub name_id_format: Option<String>,
    /// IdP entity ID that issued the assertion.
    pub issuer: String,
    pub session_index: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub roles: Vec<String>,
    /// All attributes, keyed by `Name` and, where present, `FriendlyName`.
    pub attributes: BTreeMap<String, Vec<String>>,
    pub authenticated_at: DateTime<Utc>,
}

/// Per-call inputs that are not part of the trust configuration.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// ID of the AuthnRequest this response must answer, when known.
    pub expected_request_id: Option<String>,
    /// Evaluation instant for the validity window.
    pub now: DateTime<Utc>,
}

impl Default for ValidationContext {
    fn default() -> Self {
        Self {
            expected_request_id: None,
            now: Utc::now(),
        }
    }
}

impl ValidationContext {
    /// Validate now, requiring `InResponseTo` to equal `request_id`.
    pub fn expecting(request_id: impl Into<String>) -> Self {
        Self {
            expected_request_id: Some(request_id.into()),
            ..Self::default()
        }
    }
}

/// Validates `SAMLResponse` payloads against the trust configuration.
#[derive(Debug, Clone)]
pub struct AssertionValidator {
    replay: Arc<ReplayCache>,
}

impl AssertionValidator {
    pub fn new(replay: Arc<ReplayCache>) -> Self {
        Self { replay }
    }

    /// Validate a base64 `SAMLResponse` at the current time.
    pub fn validate(
        &self,
        raw_response: &[u8],
        trust: &TrustConfig,
    ) -> Result<SamlIdentity, ValidationError> {
        self.validate_with(raw_response, trust, &ValidationContext::default())
    }

    pub fn validate_with(
        &self,
        raw_response: &[u8],
        trust: &TrustConfig,
        ctx: &ValidationContext,
    ) -> Result<SamlIdentity, ValidationError> {
        let xml = decode_response(raw_response)?;
        let doc = XmlDocument::parse(&xml).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let (response, assertion) = locate_assertion(&doc)?;

        check_signatures(&doc, response, assertion, trust)?;
        check_status(response)?;
        check_issuers(response, assertion, trust)?;
        check_audience(assertion, trust)?;

        let subject = assertion.child(ns::ASSERTION, "Subject");
        let bearer = subject.and_then(bearer_confirmation_data);
        let expires_at = check_validity_window(assertion, bearer, trust.clock_skew, ctx.now)?;

        check_recipient(response, bearer, trust)?;
        check_in_response_to(response, bearer, ctx)?;

        let identity = extract_identity(assertion, subject, trust, ctx.now)?;

        let assertion_id = assertion.attribute("ID").unwrap_or_default();
        let retain_until = expires_at.unwrap_or_else(|| {
            ctx.now
                .checked_add_signed(Duration::hours(UNBOUNDED_REPLAY_RETENTION_HOURS))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });
        if !self
            .replay
            .check_and_record(assertion_id, retain_until, ctx.now)
        {
            return Err(ValidationError::Replayed(assertion_id.to_string()));
        }

        tracing::debug!(
            issuer = %identity.issuer,
            assertion_id,
            "SAML assertion accepted"
        );
        Ok(identity)
    }
}

fn decode_response(raw: &[u8]) -> Result<String, ValidationError> {
    let compact: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if compact.is_empty() {
        return Err(ValidationError::Malformed("empty SAMLResponse".into()));
    }
    let bytes = STANDARD
        .decode(&compact)
        .map_err(|e| ValidationError::Malformed(format!("SAMLResponse is not base64: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|_| ValidationError::Malformed("SAMLResponse is not UTF-8".into()))
}

/// The `Response` root and its single direct `Assertion` child.
fn locate_assertion(doc: &XmlDocument) -> Result<(Element<'_>, Element<'_>), ValidationError> {
    let response = doc.root();
    if !response.is(ns::PROTOCOL, "Response") {
        return Err(ValidationError::Malformed(format!(
            "root element is {}, expected samlp:Response",
            response.local_name()
        )));
    }
    if response
        .child(ns::ASSERTION, "EncryptedAssertion")
        .is_some()
    {
        return Err(ValidationError::Malformed(
            "encrypted assertions are not supported".into(),
        ));
    }

    let mut assertions = response.children_named(ns::ASSERTION, "Assertion");
    let assertion = assertions
        .next()
        .ok_or_else(|| ValidationError::Malformed("response contains no assertion".into()))?;
    if assertions.next().is_some() {
        return Err(ValidationError::Malformed(
            "response contains more than one assertion".into(),
        ));
    }
    if assertion.attribute("ID").is_none_or(str::is_empty) {
        return Err(ValidationError::Malformed("assertion has no ID".into()));
    }
    Ok((response, assertion))
}

fn check_signatures(
    doc: &XmlDocument,
    response: Element<'_>,
    assertion: Element<'_>,
    trust: &TrustConfig,
) -> Result<(), ValidationError> {
    doc.ensure_unique_ids()
        .map_err(|e| ValidationError::SignatureInvalid(e.to_string()))?;

    let response_signed = signature::is_signed(response);
    let assertion_signed = signature::is_signed(assertion);
    if !response_signed && !assertion_signed {
        return Err(ValidationError::SignatureInvalid(
            "neither the response nor the assertion is signed".into(),
        ));
    }

    let key: &PKeyRef<Public> = trust.verification_key();
    if response_signed {
        signature::verify_enveloped(doc, response, key)
            .map_err(|e| ValidationError::SignatureInvalid(format!("response: {e}")))?;
    }
    if assertion_signed {
        signature::verify_enveloped(doc, assertion, key)
            .map_err(|e| ValidationError::SignatureInvalid(format!("assertion: {e}")))?;
    }
    Ok(())
}

fn check_status(response: Element<'_>) -> Result<(), ValidationError> {
    let code = response
        .child(ns::PROTOCOL, "Status")
        .and_then(|status| status.child(ns::PROTOCOL, "StatusCode"))
        .ok_or_else(|| ValidationError::Malformed("response has no StatusCode".into()))?;

    match code.attribute("Value") {
        Some(STATUS_SUCCESS) => Ok(()),
        value => {
            let mut status = value.unwrap_or("<none>").to_string();
            if let Some(sub) = code
                .child(ns::PROTOCOL, "StatusCode")
                .and_then(|sub| sub.attribute("Value"))
            {
                status.push_str(" / ");
                status.push_str(sub);
            }
            Err(ValidationError::StatusNotSuccess(status))
        }
    }
}

fn check_issuers(
    response: Element<'_>,
    assertion: Element<'_>,
    trust: &TrustConfig,
) -> Result<(), ValidationError> {
    let expected = &trust.descriptor.idp_entity_id;
    let mismatch = |actual: Option<String>| ValidationError::IssuerMismatch {
        expected: expected.clone(),
        actual: actual.unwrap_or_default(),
    };

    let assertion_issuer = assertion
        .child(ns::ASSERTION, "Issuer")
        .and_then(Element::trimmed_text);
    if assertion_issuer.as_ref() != Some(expected) {
        return Err(mismatch(assertion_issuer));
    }

    if let Some(issuer) = response.child(ns::ASSERTION, "Issuer") {
        let actual = issuer.trimmed_text();
        if actual.as_ref() != Some(expected) {
            return Err(mismatch(actual));
        }
    }
    Ok(())
}

fn check_audience(assertion: Element<'_>, trust: &TrustConfig) -> Result<(), ValidationError> {
    let expected = &trust.sp_entity_id;
    let restrictions: Vec<_> = assertion
        .child(ns::ASSERTION, "Conditions")
        .map(|c| c.children_named(ns::ASSERTION, "AudienceRestriction").collect())
        .unwrap_or_default();

    if restrictions.is_empty() {
        return Err(ValidationError::AudienceMismatch {
            expected: expected.clone(),
            actual: Vec::new(),
        });
    }

    for restriction in restrictions {
        let audiences: Vec<String> = restriction
            .children_named(ns::ASSERTION, "Audience")
            .filter_map(Element::trimmed_text)
            .collect();
        if !audiences.contains(expected) {
            return Err(ValidationError::AudienceMismatch {
                expected: expected.clone(),
                actual: audiences,
            });
        }
    }
    Ok(())
}

/// `SubjectConfirmationData` of the first bearer confirmation.
fn bearer_confirmation_data(subject: Element<'_>) -> Option<Element<'_>> {
    subject
        .children_named(ns::ASSERTION, "SubjectConfirmation")
        .find(|c| c.attribute("Method") == Some(CM_BEARER))
        .and_then(|c| c.child(ns::ASSERTION, "SubjectConfirmationData"))
}

/// Check the Conditions window and the bearer expiry, both widened by
/// `skew`. Returns the latest instant the assertion could still be
/// accepted, if it has one.
fn check_validity_window(
    assertion: Element<'_>,
    bearer: Option<Element<'_>>,
    skew: Duration,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let conditions = assertion.child(ns::ASSERTION, "Conditions");

    // Saturate rather than overflow when the skew is huge.
    if let Some(not_before) = instant(conditions, "NotBefore")?
        && now
            < not_before
                .checked_sub_signed(skew)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
    {
        return Err(ValidationError::NotYetValid(not_before.to_rfc3339()));
    }

    let mut expires_at: Option<DateTime<Utc>> = None;
    for not_on_or_after in [
        instant(conditions, "NotOnOrAfter")?,
        instant(bearer, "NotOnOrAfter")?,
    ]
    .into_iter()
    .flatten()
    {
        let limit = not_on_or_after
            .checked_add_signed(skew)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if now >= limit {
            return Err(ValidationError::Expired(not_on_or_after.to_rfc3339()));
        }
        expires_at = Some(expires_at.map_or(limit, |current| current.min(limit)));
    }
    Ok(expires_at)
}

fn instant(
    element: Option<Element<'_>>,
    attribute: &str,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let Some(value) = element.and_then(|e| e.attribute(attribute)) else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| ValidationError::Malformed(format!("{attribute} '{value}': {e}")))
}

fn check_recipient(
    response: Element<'_>,
    bearer: Option<Element<'_>>,
    trust: &TrustConfig,
) -> Result<(), ValidationError> {
    let Some(acs_url) = &trust.acs_url else {
        return Ok(());
    };

    let targets = [
        response.attribute("Destination"),
        bearer.and_then(|b| b.attribute("Recipient")),
    ];
    for actual in targets.into_iter().flatten() {
        if Url::parse(actual.trim()).ok().as_ref() != Some(acs_url) {
            return Err(ValidationError::DestinationMismatch {
                expected: acs_url.to_string(),
                actual: actual.to_string(),
            });
        }
    }
    Ok(())
}

fn check_in_response_to(
    response: Element<'_>,
    bearer: Option<Element<'_>>,
    ctx: &ValidationContext,
) -> Result<(), ValidationError> {
    let Some(expected) = &ctx.expected_request_id else {
        return Ok(());
    };

    let actual = response.attribute("InResponseTo");
    if actual != Some(expected.as_str()) {
        return Err(ValidationError::InResponseToMismatch {
            expected: expected.clone(),
            actual: actual.map(str::to_string),
        });
    }
    if let Some(bearer_actual) = bearer.and_then(|b| b.attribute("InResponseTo"))
        && bearer_actual != expected
    {
        return Err(ValidationError::InResponseToMismatch {
            expected: expected.clone(),
            actual: Some(bearer_actual.to_string()),
        });
    }
    Ok(())
}

fn extract_identity(
    assertion: Element<'_>,
    subject: Option<Element<'_>>,
    trust: &TrustConfig,
    now: DateTime<Utc>,
) -> Result<SamlIdentity, ValidationError> {
    let name_id_element = subject
        .and_then(|s| s.child(ns::ASSERTION, "NameID"))
        .ok_or(ValidationError::NoSubject)?;
    let name_id = name_id_element
        .trimmed_text()
        .ok_or(ValidationError::NoSubject)?;
    let name_id_format = name_id_element.attribute("Format").map(str::to_string);

    let issuer = assertion
        .child(ns::ASSERTION, "Issuer")
        .and_then(Element::trimmed_text)
        .unwrap_or_default();

    let authn_statement = assertion.child(ns::ASSERTION, "AuthnStatement");
    let session_index = authn_statement
        .and_then(|s| s.attribute("SessionIndex"))
        .map(str::to_string);
    let authenticated_at = instant(authn_statement, "AuthnInstant")?.unwrap_or(now);

    let attributes = collect_attributes(assertion);
    let first = |key: &str| attributes.get(key).and_then(|v| v.first()).cloned();

    let email = first(&trust.attributes.email).or_else(|| {
        (name_id_format.as_deref() == Some(EMAIL_NAME_ID_FORMAT)).then(|| name_id.clone())
    });
    let name = first(&trust.attributes.name);
    let roles = attributes
        .get(&trust.attributes.roles)
        .cloned()
        .unwrap_or_default();

    Ok(SamlIdentity {
        name_id,
        name_id_format,
        issuer,
        session_index,
        email,
        name,
        roles,
        attributes,
        authenticated_at,
    })
}

fn collect_attributes(assertion: Element<'_>) -> BTreeMap<String, Vec<String>> {
    let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let statements = assertion.children_named(ns::ASSERTION, "AttributeStatement");
    for attribute in statements.flat_map(|s| s.children_named(ns::ASSERTION, "Attribute")) {
        let values: Vec<String> = attribute
            .children_named(ns::ASSERTION, "AttributeValue")
            .map(|v| v.text().trim().to_string())
            .collect();

        let keys = [attribute.attribute("Name"), attribute.attribute("FriendlyName")];
        for key in keys.into_iter().flatten().filter(|k| !k.is_empty()) {
            attributes
                .entry(key.to_string())
                .or_default()
                .extend(values.iter().cloned());
        }
    }
    for values in attributes.values_mut() {
        values.dedup();
    }
    attributes
}
