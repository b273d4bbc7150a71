//! Per-channel trust configuration.

use tracing::{debug, warn};

/// Trust parameters for one channel.
///
/// Carries the identity selectors and the self-signed policy a context is
/// built from. A context copies the configuration at build time, so a
/// `TrustConfig` can be reconfigured freely between builds without touching
/// channels already constructed from it.
#[derive(Debug, Clone, Default)]
pub struct TrustConfig {
    pub(crate) my_fingerprint: Option<String>,
    pub(crate) their_fingerprint: Option<String>,
    pub(crate) allow_self_signed: bool,
}

impl TrustConfig {
    /// Creates a configuration with no pins and self-signed acceptance off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects which local identity the context presents, by certificate
    /// fingerprint. Unset, the role's default identity is used.
    pub fn my_fingerprint(&mut self, fingerprint: impl Into<String>) -> &mut Self {
        self.my_fingerprint = Some(fingerprint.into());
        self
    }

    /// Pins the expected remote identity, by certificate fingerprint.
    /// Unset, the client falls back to the default remote-peer entry and the
    /// post-handshake fingerprint re-check is skipped.
    pub fn their_fingerprint(&mut self, fingerprint: impl Into<String>) -> &mut Self {
        self.their_fingerprint = Some(fingerprint.into());
        self
    }

    /// Whether certificates failing standard validation solely because they
    /// are self-signed are acceptable. Off by default; enabling it is an
    /// explicit, auditable relaxation for deployments without an authority.
    pub fn allow_self_signed(&mut self, allow: bool) -> &mut Self {
        self.allow_self_signed = allow;
        self
    }

    /// Applies a named configuration token.
    ///
    /// Recognized tokens are `my_fingerprint`, `their_fingerprint`, and
    /// `allow_self_signed` (boolean: `1`/`0`, `true`/`false`, `yes`/`no`).
    /// Unrecognized tokens and unparsable booleans are ignored, so one token
    /// stream can feed several consumers.
    pub fn set(&mut self, token: &str, value: &str) {
        match token {
            "my_fingerprint" => {
                self.my_fingerprint = Some(value.to_owned());
            }
            "their_fingerprint" => {
                self.their_fingerprint = Some(value.to_owned());
            }
            "allow_self_signed" => match parse_bool(value) {
                Some(allow) => {
                    self.allow_self_signed = allow;
                }
                None => warn!(token, value, "ignoring unparsable boolean token"),
            },
            _ => debug!(token, "ignoring unrecognized configuration token"),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
