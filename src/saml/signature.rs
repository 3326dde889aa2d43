//! Enveloped XML-DSig verification.
//!
//! Supports what SAML IdPs emit in practice: exclusive canonicalization,
//! the enveloped-signature transform, one same-document reference, RSA
//! signatures and SHA-1/SHA-2 digests. Verification always uses the key
//! from the trust configuration; `KeyInfo` in the message is ignored.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use openssl::{
    hash::{MessageDigest, hash},
    pkey::{HasPublic, PKeyRef},
    sign::Verifier,
};

use super::{
    ns,
    xml::{Element, XmlDocument},
};

pub(crate) const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub(crate) const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub(crate) const RSA_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384";
pub(crate) const RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";

pub(crate) const DIGEST_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub(crate) const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub(crate) const DIGEST_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#sha384";
pub(crate) const DIGEST_SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";

pub(crate) const TRANSFORM_ENVELOPED: &str =
    "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

#[derive(Debug, thiserror::Error)]
pub(crate) enum SignatureError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("more than one {0}")]
    Multiple(&'static str),

    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("reference {uri:?} does not point at the signed element #{id}")]
    ReferenceMismatch { uri: Option<String>, id: String },

    #[error("digest does not match signed content")]
    DigestMismatch,

    #[error("invalid base64 in {0}")]
    Encoding(&'static str),

    #[error("signature does not verify against the trusted certificate")]
    BadSignature,

    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

/// Message digest for a `SignatureMethod` algorithm URI.
pub(crate) fn signature_digest(algorithm: &str) -> Option<MessageDigest> {
    match algorithm {
        RSA_SHA1 => Some(MessageDigest::sha1()),
        RSA_SHA256 => Some(MessageDigest::sha256()),
        RSA_SHA384 => Some(MessageDigest::sha384()),
        RSA_SHA512 => Some(MessageDigest::sha512()),
        _ => None,
    }
}

pub(crate) fn digest_method(algorithm: &str) -> Option<MessageDigest> {
    match algorithm {
        DIGEST_SHA1 => Some(MessageDigest::sha1()),
        DIGEST_SHA256 => Some(MessageDigest::sha256()),
        DIGEST_SHA384 => Some(MessageDigest::sha384()),
        DIGEST_SHA512 => Some(MessageDigest::sha512()),
        _ => None,
    }
}

/// True when `element` carries a direct `ds:Signature` child.
pub(crate) fn is_signed(element: Element<'_>) -> bool {
    element.child(ns::DSIG, "Signature").is_some()
}

/// Verify the enveloped signature that is a direct child of `target` and
/// references it by ID.
pub(crate) fn verify_enveloped<T: HasPublic>(
    doc: &XmlDocument,
    target: Element<'_>,
    key: &PKeyRef<T>,
) -> Result<(), SignatureError> {
    let mut signatures = target.children_named(ns::DSIG, "Signature");
    let signature = signatures.next().ok_or(SignatureError::Missing("Signature"))?;
    if signatures.next().is_some() {
        return Err(SignatureError::Multiple("Signature"));
    }

    let signed_info = signature
        .child(ns::DSIG, "SignedInfo")
        .ok_or(SignatureError::Missing("SignedInfo"))?;

    let c14n_method = signed_info
        .child(ns::DSIG, "CanonicalizationMethod")
        .ok_or(SignatureError::Missing("CanonicalizationMethod"))?;
    require_exc_c14n(c14n_method)?;
    let signed_info_prefixes = inclusive_prefixes(c14n_method);

    let signature_algorithm = signed_info
        .child(ns::DSIG, "SignatureMethod")
        .and_then(|m| m.attribute("Algorithm"))
        .ok_or(SignatureError::Missing("SignatureMethod"))?;
    let signature_md = signature_digest(signature_algorithm)
        .ok_or_else(|| SignatureError::UnsupportedAlgorithm(signature_algorithm.to_string()))?;

    let mut references = signed_info.children_named(ns::DSIG, "Reference");
    let reference = references.next().ok_or(SignatureError::Missing("Reference"))?;
    if references.next().is_some() {
        return Err(SignatureError::Multiple("Reference"));
    }

    let target_id = target
        .attribute("ID")
        .ok_or(SignatureError::Missing("ID on signed element"))?;
    let uri = reference.attribute("URI");
    if uri.and_then(|u| u.strip_prefix('#')) != Some(target_id) {
        return Err(SignatureError::ReferenceMismatch {
            uri: uri.map(str::to_string),
            id: target_id.to_string(),
        });
    }

    let mut enveloped = false;
    let mut reference_prefixes = Vec::new();
    if let Some(transforms) = reference.child(ns::DSIG, "Transforms") {
        for transform in transforms.children_named(ns::DSIG, "Transform") {
            match transform.attribute("Algorithm") {
                Some(TRANSFORM_ENVELOPED) => enveloped = true,
                Some(ns::EXC_C14N) => reference_prefixes = inclusive_prefixes(transform),
                other => {
                    return Err(SignatureError::UnsupportedAlgorithm(
                        other.unwrap_or("<none>").to_string(),
                    ));
                }
            }
        }
    }
    if !enveloped {
        return Err(SignatureError::Missing("enveloped-signature transform"));
    }

    let digest_algorithm = reference
        .child(ns::DSIG, "DigestMethod")
        .and_then(|m| m.attribute("Algorithm"))
        .ok_or(SignatureError::Missing("DigestMethod"))?;
    let digest_md = digest_method(digest_algorithm)
        .ok_or_else(|| SignatureError::UnsupportedAlgorithm(digest_algorithm.to_string()))?;
    let expected_digest = reference
        .child(ns::DSIG, "DigestValue")
        .map(|v| decode_base64(&v.text(), "DigestValue"))
        .ok_or(SignatureError::Missing("DigestValue"))??;

    let canonical_target =
        doc.canonicalize(target, Some(signature.node_id()), &reference_prefixes);
    let actual_digest = hash(digest_md, canonical_target.as_bytes())?;
    if actual_digest.len() != expected_digest.len()
        || !openssl::memcmp::eq(&actual_digest, &expected_digest)
    {
        return Err(SignatureError::DigestMismatch);
    }

    let signature_value = signature
        .child(ns::DSIG, "SignatureValue")
        .map(|v| decode_base64(&v.text(), "SignatureValue"))
        .ok_or(SignatureError::Missing("SignatureValue"))??;

    let canonical_signed_info = doc.canonicalize(signed_info, None, &signed_info_prefixes);
    let mut verifier = Verifier::new(signature_md, key)?;
    verifier.update(canonical_signed_info.as_bytes())?;
    // openssl reports a malformed signature blob as an error rather than `false`.
    match verifier.verify(&signature_value) {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(SignatureError::BadSignature),
    }
}

fn require_exc_c14n(method: Element<'_>) -> Result<(), SignatureError> {
    match method.attribute("Algorithm") {
        Some(ns::EXC_C14N) => Ok(()),
        other => Err(SignatureError::UnsupportedAlgorithm(
            other.unwrap_or("<none>").to_string(),
        )),
    }
}

fn inclusive_prefixes(method: Element<'_>) -> Vec<String> {
    method
        .child(ns::EXC_C14N, "InclusiveNamespaces")
        .and_then(|inc| inc.attribute("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn decode_base64(text: &str, field: &'static str) -> Result<Vec<u8>, SignatureError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|_| SignatureError::Encoding(field))
}
