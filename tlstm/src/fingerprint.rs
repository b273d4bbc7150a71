//! Certificate fingerprints: digesting, normalization, comparison.
//!
//! A fingerprint is the SHA-256 digest of a certificate's DER encoding,
//! rendered as lowercase hex. Operators write fingerprints in whatever
//! format their tooling emits (`AB:CD:...`, uppercase, dashed); comparison
//! always happens on the normalized form, so format never matters.

use std::fmt;

use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::prelude::*;

/// The presented bytes are not a decodable certificate, so there is no
/// canonical encoding to digest.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("certificate has no canonical encoding to fingerprint")]
pub struct FingerprintUnavailable;

/// Normalized fingerprint of a certificate.
///
/// Stored in normalized form (lowercase hex, no separators), so equality on
/// `Fingerprint` values is exactly the matcher's comparison.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Digests `cert`'s DER encoding.
    ///
    /// Fails with [`FingerprintUnavailable`] when the bytes do not decode as
    /// a certificate.
    pub fn of_cert(cert: &CertificateDer<'_>) -> Result<Self, FingerprintUnavailable> {
        if X509Certificate::from_der(cert.as_ref()).is_err() {
            return Err(FingerprintUnavailable);
        }
        Ok(Self(hex::encode(Sha256::digest(cert.as_ref()))))
    }

    /// Builds a fingerprint from operator-supplied text, normalizing case
    /// and separators.
    pub fn from_text(text: &str) -> Self {
        Self(normalize(text))
    }

    /// The normalized lowercase-hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Lowercases `text` and strips separator punctuation.
///
/// Keeps ASCII alphanumerics only, so `"AA:BB"`, `"aa-bb"`, and `"aabb"` all
/// normalize to `"aabb"`. Idempotent.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Compares two fingerprint renderings after normalizing both sides.
///
/// An *absent* expected value is the caller's business: no pinning
/// configured is not a match.
pub fn matches(expected: &str, actual: &str) -> bool {
    normalize(expected) == normalize(actual)
}
