//! Peer certificate verification.
//!
//! The channel layer walks and signature-checks the presented chain, but the
//! final accept/reject decision belongs to this module: a certificate pinned
//! in the repository is trusted no matter what the channel layer concluded,
//! and self-signed certificates may be admitted by local policy. Channel
//! layer failures are first translated into the closed [`VerifyStatus`] set
//! so that policy never has to reason about transport-specific error shapes.

use std::fmt;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, Error, SignatureScheme};
use tracing::{debug, warn};
use x509_parser::prelude::*;

use crate::config::TrustConfig;
use crate::fingerprint::Fingerprint;
use crate::store::{CertScope, CertSelector, CertStore};

macro_rules! statuses {
    {$($name:ident($code:expr) $desc:expr;)*} => {
        /// Closed set of verification outcomes for a single certificate.
        ///
        /// Every error the channel layer can produce collapses into one of
        /// these; outcomes without a dedicated entry become [`Other`].
        ///
        /// [`Other`]: VerifyStatus::Other
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
        pub enum VerifyStatus {
            $(#[doc = $desc] $name,)*
        }

        impl VerifyStatus {
            /// Stable lowercase token, suitable for log fields.
            pub fn as_str(&self) -> &'static str {
                match *self {
                    $(Self::$name => $code,)*
                }
            }

            /// Human-readable account of the outcome.
            pub fn description(&self) -> &'static str {
                match *self {
                    $(Self::$name => $desc,)*
                }
            }
        }

        impl fmt::Display for VerifyStatus {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }
    }
}

statuses! {
    Ok("ok") "the certificate verified cleanly";
    BadEncoding("bad-encoding") "the certificate could not be decoded";
    NotYetValid("not-yet-valid") "the certificate's validity period has not begun";
    Expired("expired") "the certificate's validity period has ended";
    SelfSignedLeaf("self-signed") "the peer certificate itself is self-signed";
    SelfSignedInChain("self-signed-in-chain") "an untrusted self-signed certificate appears in the chain";
    UnknownIssuer("unknown-issuer") "the chain does not terminate in a configured trust anchor";
    Untrusted("untrusted") "no verification path covering the certificate could be built";
    NameMismatch("name-mismatch") "the certificate does not cover the requested name";
    Revoked("revoked") "the certificate has been revoked";
    RevocationUnknown("revocation-unknown") "the certificate's revocation status could not be determined";
    BadSignature("bad-signature") "a signature in the chain failed to verify";
    Other("other") "the channel layer failed for a reason outside the translation table";
}

/// Translates a channel layer error into the closed [`VerifyStatus`] set.
pub fn classify(err: &Error) -> VerifyStatus {
    use CertificateError::*;
    let reason = match err {
        Error::InvalidCertificate(reason) => reason,
        _ => return VerifyStatus::Other,
    };
    match reason {
        BadEncoding => VerifyStatus::BadEncoding,
        NotValidYet | NotValidYetContext { .. } => VerifyStatus::NotYetValid,
        Expired | ExpiredContext { .. } => VerifyStatus::Expired,
        UnknownIssuer => VerifyStatus::UnknownIssuer,
        NotValidForName | NotValidForNameContext { .. } => VerifyStatus::NameMismatch,
        Revoked => VerifyStatus::Revoked,
        UnknownRevocationStatus
        | ExpiredRevocationList
        | ExpiredRevocationListContext { .. } => VerifyStatus::RevocationUnknown,
        BadSignature => VerifyStatus::BadSignature,
        _ => VerifyStatus::Other,
    }
}

/// Maps a rejecting status back onto the channel layer's error vocabulary.
fn rejection(status: VerifyStatus) -> Error {
    use VerifyStatus::*;
    let reason = match status {
        BadEncoding => CertificateError::BadEncoding,
        NotYetValid => CertificateError::NotValidYet,
        Expired => CertificateError::Expired,
        SelfSignedLeaf | SelfSignedInChain | UnknownIssuer | Untrusted => {
            CertificateError::UnknownIssuer
        }
        NameMismatch => CertificateError::NotValidForName,
        Revoked => CertificateError::Revoked,
        RevocationUnknown => CertificateError::UnknownRevocationStatus,
        BadSignature => CertificateError::BadSignature,
        Ok | Other => CertificateError::ApplicationVerificationFailure,
    };
    Error::InvalidCertificate(reason)
}

/// Decides whether one certificate of a presented chain is acceptable.
///
/// `tentative` is the channel layer's verdict for this certificate and
/// `status` its translated cause. The policy is deliberately small: a
/// fingerprint pinned in the repository's remote-peer scope wins outright,
/// self-signed certificates are admitted when local policy says so, and
/// everything else keeps the channel layer's verdict.
pub fn decide_peer(
    store: &dyn CertStore,
    allow_self_signed: bool,
    cert: &CertificateDer<'_>,
    depth: usize,
    tentative: bool,
    status: VerifyStatus,
) -> bool {
    let fingerprint = Fingerprint::of_cert(cert).ok();
    debug!(
        depth,
        tentative,
        %status,
        fingerprint = fingerprint.as_ref().map(Fingerprint::as_str).unwrap_or("unknown"),
        subject = %subject_of(cert),
        "evaluating peer certificate"
    );
    if let Some(fingerprint) = &fingerprint {
        if store
            .find(CertScope::RemotePeer, CertSelector::Fingerprint(fingerprint))
            .is_some()
        {
            debug!(depth, "accepting certificate pinned in the repository");
            return true;
        }
    }
    if allow_self_signed
        && matches!(
            status,
            VerifyStatus::SelfSignedLeaf | VerifyStatus::SelfSignedInChain
        )
    {
        debug!(depth, "accepting self-signed certificate by local policy");
        return true;
    }
    debug!(depth, tentative, "returning channel layer verdict unchanged");
    tentative
}

fn subject_of(cert: &CertificateDer<'_>) -> String {
    match X509Certificate::from_der(cert.as_ref()) {
        Ok((_, parsed)) => parsed.subject().to_string(),
        Err(_) => "<undecodable>".into(),
    }
}

/// Derives the status the channel layer would have attributed to the
/// certificate at `depth`, given the verdict for the chain as a whole.
///
/// Validity is re-checked from the certificate itself so that an expired or
/// premature certificate keeps that status even when the chain failed for a
/// coarser reason first; self-signed detection attributes the failure to the
/// certificate that is actually self-signed, and any residual chain failure
/// lands on the deepest certificate, where the missing issuer would be.
fn per_cert_status(
    cert: &CertificateDer<'_>,
    depth: usize,
    deepest: usize,
    now: UnixTime,
    chain_status: Option<VerifyStatus>,
) -> VerifyStatus {
    let parsed = match X509Certificate::from_der(cert.as_ref()) {
        Ok((_, parsed)) => parsed,
        Err(_) => return VerifyStatus::BadEncoding,
    };
    let chain_status = match chain_status {
        None => return VerifyStatus::Ok,
        Some(status) => status,
    };
    let now = now.as_secs() as i64;
    if now < parsed.validity().not_before.timestamp() {
        return VerifyStatus::NotYetValid;
    }
    if now > parsed.validity().not_after.timestamp() {
        return VerifyStatus::Expired;
    }
    if parsed.subject() == parsed.issuer() {
        return if depth == 0 {
            VerifyStatus::SelfSignedLeaf
        } else {
            VerifyStatus::SelfSignedInChain
        };
    }
    if depth == deepest {
        chain_status
    } else {
        VerifyStatus::Untrusted
    }
}

/// Runs the per-certificate policy over a whole presented chain.
fn decide_chain(
    store: &dyn CertStore,
    trust: &TrustConfig,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    now: UnixTime,
    chain: Result<(), Error>,
) -> Result<(), Error> {
    let chain_status = match &chain {
        Ok(()) => None,
        Err(err) => {
            let status = classify(err);
            debug!(%status, "channel layer rejected the chain; applying local policy");
            Some(status)
        }
    };
    let deepest = intermediates.len();
    let mut certs = Vec::with_capacity(deepest + 1);
    certs.push(end_entity);
    certs.extend(intermediates);
    // Deepest first, the order the channel layer reports certificates in.
    for depth in (0..certs.len()).rev() {
        let status = per_cert_status(certs[depth], depth, deepest, now, chain_status);
        let tentative = status == VerifyStatus::Ok;
        if !decide_peer(store, trust.allow_self_signed, certs[depth], depth, tentative, status) {
            warn!(depth, %status, "rejecting peer certificate");
            return Err(rejection(status));
        }
    }
    Ok(())
}

/// Server certificate verifier for outbound connections.
///
/// Chain verification runs against the trust anchors seeded from the
/// resolved remote peer entry; the verdict then passes through
/// [`decide_peer`] per certificate, so repository pins and the self-signed
/// policy can override it. Name checking is disabled outright, since peer
/// identity rests on fingerprints rather than on what name was dialed.
#[derive(Debug)]
pub(crate) struct PinnedServerVerifier {
    webpki: Arc<WebPkiServerVerifier>,
    store: Arc<dyn CertStore>,
    trust: TrustConfig,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedServerVerifier {
    pub(crate) fn new(
        roots: rustls::RootCertStore,
        store: Arc<dyn CertStore>,
        trust: TrustConfig,
        provider: &Arc<CryptoProvider>,
    ) -> Result<Self, Error> {
        let algorithms = provider.signature_verification_algorithms;
        let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| Error::General(e.to_string()))?;
        Ok(Self {
            webpki,
            store,
            trust,
            algorithms,
        })
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let chain = match self.webpki.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(_) => Ok(()),
            // The dialed name carries no trust here; identity is pinned.
            Err(Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(()),
            Err(err) => Err(err),
        };
        decide_chain(
            self.store.as_ref(),
            &self.trust,
            end_entity,
            intermediates,
            now,
            chain,
        )?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client certificate verifier for inbound connections.
///
/// Inbound connections carry no trust anchors at all, so the channel layer's
/// tentative verdict is a rejection for every certificate; acceptance comes
/// solely from repository pins and the self-signed policy. Client
/// authentication is not optional.
#[derive(Debug)]
pub(crate) struct PinnedClientVerifier {
    store: Arc<dyn CertStore>,
    trust: TrustConfig,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedClientVerifier {
    pub(crate) fn new(
        store: Arc<dyn CertStore>,
        trust: TrustConfig,
        provider: &Arc<CryptoProvider>,
    ) -> Self {
        Self {
            store,
            trust,
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        // No anchors to advertise; peers pick their identity locally.
        &[]
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, Error> {
        let chain = Err(Error::InvalidCertificate(CertificateError::UnknownIssuer));
        decide_chain(
            self.store.as_ref(),
            &self.trust,
            end_entity,
            intermediates,
            now,
            chain,
        )?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
