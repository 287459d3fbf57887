//! The authority-side configuration surface (spec.md §6): the options a caller wires together to
//! mint and verify tokens for one `Location`. A plain, caller-constructed struct — this is a
//! library, not a long-running service with a config file to parse, so there is no format-parsing
//! crate to adopt here (see SPEC_FULL.md "Ambient stack").

use std::collections::HashMap;

use crate::bundle::Verifier;
use crate::caveat::CaveatSet;
use crate::crypto::{EncryptionKey, SigningKey};
use crate::error::Error;
use crate::macaroon::Macaroon;

/// `{location, signing_key, verification_keys, 3p_encryption_keys, 3p_verification_keys}` per
/// spec.md §6. `signing_key` mints this authority's own tokens; `verification_keys` is the
/// rotation set a token verifies under — a token is accepted if it verifies under *any one* of
/// them, so a key can be retired by dropping it from `verification_keys` once no live token still
/// depends on it, without ever needing to touch already-issued tokens.
pub struct AuthorityConfig {
    pub location: String,
    pub signing_key: SigningKey,
    pub verification_keys: Vec<SigningKey>,
    pub third_party_encryption_keys: HashMap<String, EncryptionKey>,
    pub third_party_verification_keys: HashMap<String, Vec<EncryptionKey>>,
}

impl AuthorityConfig {
    /// A config for an authority that only ever verifies under its own minting key, with no
    /// third-party collaborators yet configured.
    pub fn new(location: impl Into<String>, signing_key: SigningKey) -> Self {
        let location = location.into();
        let verification_keys = vec![signing_key.clone()];
        AuthorityConfig {
            location,
            signing_key,
            verification_keys,
            third_party_encryption_keys: HashMap::new(),
            third_party_verification_keys: HashMap::new(),
        }
    }

    /// Add a retired (or not-yet-promoted) key to the verification rotation, without changing
    /// which key mints new tokens.
    pub fn add_verification_key(&mut self, key: SigningKey) {
        if !self.verification_keys.contains(&key) {
            self.verification_keys.push(key);
        }
    }

    pub fn add_third_party(&mut self, location: impl Into<String>, key: EncryptionKey) {
        let location = location.into();
        self.third_party_verification_keys
            .entry(location.clone())
            .or_default()
            .push(key.clone());
        self.third_party_encryption_keys.insert(location, key);
    }

    /// Mint a fresh permission token under this authority's current signing key.
    pub fn mint(&self, kid: impl Into<Vec<u8>>) -> Macaroon {
        Macaroon::new(kid.into(), self.location.clone(), &self.signing_key)
    }

    /// A [Verifier] that tries each of `verification_keys` in turn, accepting the first that
    /// verifies. Exists instead of a single `LocalVerifier` because `verification_keys` is a set a
    /// token may verify under any one of (spec.md §6), not a single key looked up by `nonce.kid`.
    pub fn verifier(&self) -> ConfigVerifier<'_> {
        ConfigVerifier { config: self }
    }
}

/// [Verifier] implementation backing [AuthorityConfig::verifier].
pub struct ConfigVerifier<'a> {
    config: &'a AuthorityConfig,
}

impl Verifier for ConfigVerifier<'_> {
    fn verify(&self, permission: &Macaroon, discharges: &[Macaroon]) -> Result<CaveatSet, Error> {
        let mut last_err = Error::bad_signature();
        for key in &self.config.verification_keys {
            match crate::verify::verify(
                permission,
                key,
                discharges,
                &self.config.third_party_verification_keys,
            ) {
                Ok(caveats) => return Ok(caveats),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::ValidityWindow;

    #[test]
    fn verifies_under_current_key() {
        let key = SigningKey::generate();
        let config = AuthorityConfig::new("svc", key);
        let mut m = config.mint(b"k1".to_vec());
        m.add(ValidityWindow::new(0, u64::MAX)).unwrap();

        let verified = config.verifier().verify(&m, &[]).unwrap();
        assert_eq!(1, verified.len());
    }

    #[test]
    fn verifies_under_a_retired_rotation_key() {
        let old_key = SigningKey::generate();
        let mut config = AuthorityConfig::new("svc", old_key.clone());
        let m = Macaroon::new(b"k1".to_vec(), "svc", &old_key);

        // Rotate: a fresh signing key for new mints, but old tokens must keep verifying.
        config.signing_key = SigningKey::generate();
        assert!(config.verifier().verify(&m, &[]).is_ok());

        // Drop the retired key: the same token now fails closed.
        config.verification_keys.retain(|k| *k != old_key);
        assert!(config.verifier().verify(&m, &[]).is_err());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let key = SigningKey::generate();
        let config = AuthorityConfig::new("svc", key);
        let forged = Macaroon::new(b"k1".to_vec(), "svc", &SigningKey::generate());
        assert!(config.verifier().verify(&forged, &[]).is_err());
    }
}
