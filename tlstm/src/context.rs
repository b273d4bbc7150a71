//! Channel context construction.
//!
//! A context bundles everything a secure channel needs before any packet
//! moves: the local identity certificate and key, the verification policy,
//! and the channel layer configuration they produce. Identity material is
//! never passed in directly; it is resolved out of the certificate
//! repository by fingerprint, or by the role-scoped default when no
//! fingerprint is configured. Both roles authenticate the other end,
//! unconditionally.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use thiserror::Error;
use tracing::{debug, warn};

use crate::Side;
use crate::config::TrustConfig;
use crate::fingerprint::Fingerprint;
use crate::store::{CertScope, CertSelector, CertStore};
use crate::verify::{PinnedClientVerifier, PinnedServerVerifier};

/// Errors raised while building a channel context.
#[derive(Debug, Error)]
pub enum BuildError {
    /// No identity entry matched the configured fingerprint or the
    /// role-scoped default.
    #[error("no certificate identity is configured for this endpoint")]
    IdentityNotFound,
    /// The identity's private key does not correspond to its certificate.
    #[error("identity certificate and private key do not correspond")]
    KeyMismatch,
    /// No remote peer entry matched the configured fingerprint or the
    /// default, leaving nothing to authenticate the remote end against.
    #[error("no remote peer certificate is configured")]
    PeerNotFound,
    /// The channel layer rejected the assembled material.
    #[error(transparent)]
    ChannelLayer(#[from] rustls::Error),
}

/// Context for outbound connections.
#[derive(Debug, Clone)]
pub struct ClientContext {
    config: Arc<ClientConfig>,
}

impl ClientContext {
    /// Resolves identity and remote peer material from `store` and builds
    /// the channel configuration for an outbound connection.
    ///
    /// The remote peer entry is mandatory here: its chain seeds the trust
    /// anchors the presented server certificate is verified against.
    pub fn build(trust: &TrustConfig, store: Arc<dyn CertStore>) -> Result<Self, BuildError> {
        crate::bootstrap();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let (chain, key) = resolve_identity(Side::Client, trust, store.as_ref())?;
        let peer = match &trust.their_fingerprint {
            Some(text) => {
                let fingerprint = Fingerprint::from_text(text);
                store.find(
                    CertScope::RemotePeer,
                    CertSelector::Fingerprint(&fingerprint),
                )
            }
            None => store.find(CertScope::RemotePeer, CertSelector::Default(Side::Client)),
        };
        let peer = peer.ok_or_else(|| {
            warn!("no remote peer certificate found in the repository");
            BuildError::PeerNotFound
        })?;
        let mut roots = RootCertStore::empty();
        for cert in &peer.chain {
            roots.add(cert.clone())?;
        }
        let verifier = PinnedServerVerifier::new(roots, store, trust.clone(), &provider)?;
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(chain, key)
            .map_err(key_error)?;
        debug!("outbound channel context ready");
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Opens a connection handle toward `server_name`.
    ///
    /// The name routes the connection; it plays no part in authentication,
    /// which rests on the repository pins established at build time.
    pub fn connect(&self, server_name: &str) -> Result<ClientConnection, rustls::Error> {
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| rustls::Error::General("invalid server name".into()))?;
        match ClientConnection::new(self.config.clone(), name) {
            Ok(conn) => Ok(conn),
            Err(err) => {
                crate::log_channel_error("connect", &err);
                Err(err)
            }
        }
    }

    /// The underlying channel configuration, for embedding in a transport.
    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }
}

/// Context for inbound connections.
#[derive(Debug, Clone)]
pub struct ServerContext {
    config: Arc<ServerConfig>,
}

impl ServerContext {
    /// Resolves identity material from `store` and builds the channel
    /// configuration for inbound connections.
    ///
    /// No remote peer entry is required up front; inbound certificates are
    /// judged per connection against the repository and the self-signed
    /// policy.
    pub fn build(trust: &TrustConfig, store: Arc<dyn CertStore>) -> Result<Self, BuildError> {
        crate::bootstrap();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let (chain, key) = resolve_identity(Side::Server, trust, store.as_ref())?;
        let verifier = PinnedClientVerifier::new(store, trust.clone(), &provider);
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(chain, key)
            .map_err(key_error)?;
        debug!("inbound channel context ready");
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Opens a connection handle for one accepted connection.
    pub fn accept(&self) -> Result<ServerConnection, rustls::Error> {
        match ServerConnection::new(self.config.clone()) {
            Ok(conn) => Ok(conn),
            Err(err) => {
                crate::log_channel_error("accept", &err);
                Err(err)
            }
        }
    }

    /// The underlying channel configuration, for embedding in a transport.
    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }
}

fn resolve_identity(
    side: Side,
    trust: &TrustConfig,
    store: &dyn CertStore,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), BuildError> {
    let entry = match &trust.my_fingerprint {
        Some(text) => {
            let fingerprint = Fingerprint::from_text(text);
            store.find(CertScope::Identity, CertSelector::Fingerprint(&fingerprint))
        }
        None => store.find(CertScope::Identity, CertSelector::Default(side)),
    };
    let entry = entry.ok_or_else(|| {
        warn!(?side, "no identity certificate found in the repository");
        BuildError::IdentityNotFound
    })?;
    let key = entry.key.ok_or_else(|| {
        warn!(?side, "identity entry carries no private key");
        BuildError::IdentityNotFound
    })?;
    Ok((entry.chain, key))
}

fn key_error(err: rustls::Error) -> BuildError {
    match err {
        rustls::Error::InconsistentKeys(_) => BuildError::KeyMismatch,
        err => BuildError::ChannelLayer(err),
    }
}
