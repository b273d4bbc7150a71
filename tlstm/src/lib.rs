//! Certificate trust and identity binding for TLS-secured management
//! transports.
//!
//! tlstm is the security boundary of a management protocol: it builds the
//! client- and server-side secure-channel contexts from locally held identity
//! material, decides during the handshake whether each presented certificate
//! is acceptable (fingerprint pinning with an explicit self-signed override
//! policy), and after the handshake binds the peer's verified identity to a
//! stable security name handed to the protocol layer as an immutable
//! [`SessionRecord`].
//!
//! The certificate repository is consumed through the [`CertStore`] trait;
//! [`CertMemoryStore`] is a ready-made in-memory implementation. The secure
//! channel itself is rustls: [`ClientContext`] and [`ServerContext`] wrap
//! fully configured rustls contexts with the verification policy installed,
//! and [`SessionRecord::bind`] consumes rustls's post-handshake peer
//! certificate accessor output.

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]

use std::sync::Once;

use tracing::{debug, error};

mod config;
mod context;
mod fingerprint;
mod session;
mod store;
#[cfg(test)]
mod tests;
mod verify;

pub use config::TrustConfig;
pub use context::{BuildError, ClientContext, ServerContext};
pub use fingerprint::{Fingerprint, FingerprintUnavailable, matches, normalize};
pub use session::{BindError, MAX_SECURITY_NAME_LEN, SecurityLevel, SessionId, SessionRecord};
pub use store::{CertEntry, CertMemoryStore, CertScope, CertSelector, CertStore};
pub use verify::{VerifyStatus, classify, decide_peer};

/// Whether an endpoint was the initiator of a channel
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a channel
    Client = 0,
    /// The acceptor of a channel
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

/// One-time, process-wide initialization of the secure-channel layer.
///
/// Installs the cryptographic provider the channel layer needs. Runs at most
/// once no matter how many channels are subsequently built and is safe to
/// call concurrently; context builders invoke it implicitly, so calling it
/// directly is only useful to front-load the work.
pub fn bootstrap() {
    static START: Once = Once::new();
    START.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("cryptographic provider was already installed");
        }
    });
}

/// Logs a secure-channel failure with its translated category.
pub(crate) fn log_channel_error(location: &'static str, err: &rustls::Error) {
    match err {
        rustls::Error::InvalidCertificate(reason) => {
            error!(
                location,
                status = %verify::classify(err),
                ?reason,
                "channel layer rejected a certificate"
            );
        }
        other => error!(location, error = %other, "channel layer failure"),
    }
}
