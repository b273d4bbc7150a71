//! Post-handshake identity binding.
//!
//! Once a channel is established and the peer's chain has passed
//! verification, the session still has to be tied to the identity the upper
//! layers reason about: a security name derived from the peer certificate, a
//! fixed security level, and a session identifier. Binding also re-checks
//! the configured fingerprint pin against what was actually presented, so a
//! connection can never outlive a repository mismatch.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tracing::{debug, warn};
use x509_parser::prelude::*;

use crate::config::TrustConfig;
use crate::fingerprint::{Fingerprint, FingerprintUnavailable, matches, normalize};

/// Longest security name a session may carry, in octets.
pub const MAX_SECURITY_NAME_LEN: usize = 255;

/// Errors raised while binding an established session to an identity.
#[derive(Debug, Error)]
pub enum BindError {
    /// The remote end presented no certificate at all.
    #[error("remote end presented no certificate")]
    NoPeerCertificate,
    /// The presented certificate does not digest to the pinned fingerprint.
    #[error("presented fingerprint {actual} does not match pinned {expected}")]
    PeerIdentityMismatch {
        /// The pin from configuration, normalized.
        expected: String,
        /// What the peer actually presented.
        actual: Fingerprint,
    },
    /// The presented certificate could not be fingerprinted.
    #[error(transparent)]
    FingerprintUnavailable(#[from] FingerprintUnavailable),
    /// No usable security name could be derived from the certificate.
    #[error("could not derive a security name: {reason}")]
    IdentityExtractionFailed {
        /// What specifically went wrong.
        reason: &'static str,
    },
}

/// Security level a bound session reports upward.
///
/// Sessions bound over an encrypting channel always carry
/// [`SecurityLevel::AuthPriv`]; the lower levels exist so callers can
/// compare against the full protocol range.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SecurityLevel {
    /// Neither authentication nor privacy.
    NoAuthNoPriv,
    /// Authentication without privacy.
    AuthNoPriv,
    /// Authentication and privacy.
    AuthPriv,
}

impl SecurityLevel {
    /// Canonical protocol spelling.
    pub fn as_str(&self) -> &'static str {
        match *self {
            Self::NoAuthNoPriv => "noAuthNoPriv",
            Self::AuthNoPriv => "authNoPriv",
            Self::AuthPriv => "authPriv",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Identifier for one bound session, unique within the process.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The identity a verified session carries for its lifetime.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    session_id: SessionId,
    security_name: String,
    security_level: SecurityLevel,
    fingerprint: Fingerprint,
}

impl SessionRecord {
    /// Binds an established session to the identity in its peer chain.
    ///
    /// `peer` is the chain the remote end presented, leaf first, exactly as
    /// the channel layer reports it. The security name comes from the
    /// leaf's common name, falling back to its first DNS subject
    /// alternative name; if the configuration pins a remote fingerprint,
    /// the leaf must digest to it.
    pub fn bind(
        peer: Option<&[CertificateDer<'_>]>,
        trust: &TrustConfig,
    ) -> Result<Self, BindError> {
        let chain = peer.filter(|certs| !certs.is_empty()).ok_or_else(|| {
            warn!("remote end presented no certificate");
            BindError::NoPeerCertificate
        })?;
        let leaf = &chain[0];
        let fingerprint = Fingerprint::of_cert(leaf)?;
        if let Some(expected) = &trust.their_fingerprint {
            if !matches(expected, fingerprint.as_str()) {
                warn!(
                    expected = %normalize(expected),
                    actual = %fingerprint,
                    "presented certificate does not match the pinned fingerprint"
                );
                return Err(BindError::PeerIdentityMismatch {
                    expected: normalize(expected),
                    actual: fingerprint,
                });
            }
        }
        let security_name = security_name_of(leaf)?;
        let record = Self {
            session_id: SessionId::next(),
            security_name,
            security_level: SecurityLevel::AuthPriv,
            fingerprint,
        };
        debug!(
            session = %record.session_id,
            security_name = %record.security_name,
            security_level = %record.security_level,
            "bound session to peer identity"
        );
        Ok(record)
    }

    /// The process-unique identifier assigned at bind time.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The security name derived from the peer certificate.
    pub fn security_name(&self) -> &str {
        &self.security_name
    }

    /// Always [`SecurityLevel::AuthPriv`] for sessions bound here.
    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    /// Fingerprint of the peer's leaf certificate.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

fn security_name_of(cert: &CertificateDer<'_>) -> Result<String, BindError> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).map_err(|_| {
        BindError::IdentityExtractionFailed {
            reason: "peer certificate could not be decoded",
        }
    })?;
    let name = common_name(&parsed).or_else(|| first_dns_san(&parsed)).ok_or(
        BindError::IdentityExtractionFailed {
            reason: "no usable name attribute in peer certificate",
        },
    )?;
    if name.len() > MAX_SECURITY_NAME_LEN {
        warn!(len = name.len(), "security name exceeds the protocol bound");
        return Err(BindError::IdentityExtractionFailed {
            reason: "security name exceeds the protocol length bound",
        });
    }
    Ok(name)
}

fn common_name(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn first_dns_san(cert: &X509Certificate<'_>) -> Option<String> {
    let san = cert.subject_alternative_name().ok().flatten()?;
    san.value.general_names.iter().find_map(|name| match name {
        GeneralName::DNSName(dns) => Some((*dns).to_owned()),
        _ => None,
    })
}
