//! Certificate repository lookup.
//!
//! The repository that stores and indexes certificates is an external
//! collaborator; this module defines the read-only interface the rest of the
//! crate consumes ([`CertStore`]) plus an in-memory implementation for
//! embedders and tests. Entries are indexed under two scopes: identities the
//! local endpoint can present, and remote peers it is prepared to recognize.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::Side;
use crate::fingerprint::{Fingerprint, FingerprintUnavailable};

/// Which class of repository entries a lookup searches.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CertScope {
    /// Certificates (with keys) this endpoint can present as its own
    /// identity.
    Identity,
    /// Certificates of remote peers this endpoint is prepared to recognize.
    RemotePeer,
}

/// Repository lookup key.
#[derive(Debug, Copy, Clone)]
pub enum CertSelector<'a> {
    /// The entry whose certificate digests to this fingerprint.
    Fingerprint(&'a Fingerprint),
    /// The role-scoped default entry.
    Default(Side),
}

/// One repository entry: a certificate chain and, for identity entries, the
/// leaf's private key.
pub struct CertEntry {
    /// Certificate chain, leaf first.
    pub chain: Vec<CertificateDer<'static>>,
    /// Private key corresponding to the leaf; `None` for remote peers.
    pub key: Option<PrivateKeyDer<'static>>,
}

impl Clone for CertEntry {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.as_ref().map(PrivateKeyDer::clone_key),
        }
    }
}

impl fmt::Debug for CertEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key bytes stay out of debug output.
        f.debug_struct("CertEntry")
            .field("chain_len", &self.chain.len())
            .field("has_key", &self.key.is_some())
            .finish()
    }
}

/// Read-only lookup interface onto the certificate repository.
///
/// The repository is authoritative: this crate never writes through it.
/// Implementations must tolerate concurrent lookups; channels being built
/// and verified on separate threads all consult the same store.
pub trait CertStore: Send + Sync + fmt::Debug {
    /// Looks up an entry by scope and key. `None` when nothing matches.
    fn find(&self, scope: CertScope, key: CertSelector<'_>) -> Option<CertEntry>;
}

/// In-memory [`CertStore`] keyed by computed certificate fingerprints.
#[derive(Debug, Default)]
pub struct CertMemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    identities: HashMap<Fingerprint, CertEntry>,
    peers: HashMap<Fingerprint, CertEntry>,
    // Indexed by `Side`; a client and a server default can coexist.
    default_identity: [Option<Fingerprint>; 2],
    default_peer: Option<Fingerprint>,
}

impl CertMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers identity material, indexed by the leaf's fingerprint.
    pub fn add_identity(
        &self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Fingerprint, FingerprintUnavailable> {
        let leaf = chain.first().ok_or(FingerprintUnavailable)?;
        let fingerprint = Fingerprint::of_cert(leaf)?;
        let mut inner = self.inner.write().unwrap();
        inner.identities.insert(
            fingerprint.clone(),
            CertEntry {
                chain,
                key: Some(key),
            },
        );
        Ok(fingerprint)
    }

    /// Registers a remote peer certificate, indexed by its fingerprint.
    pub fn add_peer(
        &self,
        cert: CertificateDer<'static>,
    ) -> Result<Fingerprint, FingerprintUnavailable> {
        let fingerprint = Fingerprint::of_cert(&cert)?;
        let mut inner = self.inner.write().unwrap();
        inner.peers.insert(
            fingerprint.clone(),
            CertEntry {
                chain: vec![cert],
                key: None,
            },
        );
        Ok(fingerprint)
    }

    /// Marks a registered identity as `side`'s default.
    pub fn set_default_identity(&self, side: Side, fingerprint: Fingerprint) {
        self.inner.write().unwrap().default_identity[side as usize] = Some(fingerprint);
    }

    /// Marks a registered peer as the default remote peer.
    pub fn set_default_peer(&self, fingerprint: Fingerprint) {
        self.inner.write().unwrap().default_peer = Some(fingerprint);
    }
}

impl CertStore for CertMemoryStore {
    fn find(&self, scope: CertScope, key: CertSelector<'_>) -> Option<CertEntry> {
        let inner = self.inner.read().unwrap();
        match (scope, key) {
            (CertScope::Identity, CertSelector::Fingerprint(fp)) => {
                inner.identities.get(fp).cloned()
            }
            (CertScope::Identity, CertSelector::Default(side)) => {
                let fp = inner.default_identity[side as usize].as_ref()?;
                inner.identities.get(fp).cloned()
            }
            (CertScope::RemotePeer, CertSelector::Fingerprint(fp)) => inner.peers.get(fp).cloned(),
            (CertScope::RemotePeer, CertSelector::Default(_)) => {
                let fp = inner.default_peer.as_ref()?;
                inner.peers.get(fp).cloned()
            }
        }
    }
}
