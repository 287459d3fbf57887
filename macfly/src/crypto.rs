//! Cryptographic primitives: key types, the HMAC tail chain, authenticated sealing of
//! third-party tickets, and the BLAKE2b hash used to derive a nonce's UUID.
//!
//! Everything unsafe is confined to this module, following the same convention as the rest of
//! this lineage's libsodium bindings: one thin, safe wrapper per C call, never exposed directly.

use std::ffi::c_void;
use std::fmt::Write as _;

use crate::error::Error;

/////////////////////////////////////////////// sizes //////////////////////////////////////////////

pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = libsodium_sys::crypto_secretbox_xsalsa20poly1305_NONCEBYTES as usize;
pub const MAC_BYTES: usize = libsodium_sys::crypto_secretbox_MACBYTES as usize;
pub const HASH_BYTES: usize = 32;

////////////////////////////////////////////// KeyBytes /////////////////////////////////////////////

/// Shared representation for [SigningKey] and [EncryptionKey]: 32 random bytes, compared in
/// constant time, scrubbed from memory on drop.
#[derive(Clone)]
struct KeyBytes {
    bytes: [u8; KEY_BYTES],
}

impl KeyBytes {
    fn random() -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        random_bytes(&mut bytes);
        Self { bytes }
    }

    fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self { bytes }
    }

    fn hexdigest(&self) -> String {
        let mut s = String::with_capacity(2 * KEY_BYTES);
        for b in &self.bytes {
            write!(&mut s, "{b:02x}").expect("writing to a String cannot fail");
        }
        s
    }

    fn scrub(&mut self) {
        explicit_bzero(&mut self.bytes);
    }
}

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.scrub();
    }
}

impl Eq for KeyBytes {}

impl PartialEq for KeyBytes {
    fn eq(&self, other: &KeyBytes) -> bool {
        mem_eq(&self.bytes, &other.bytes)
    }
}

impl std::fmt::Debug for KeyBytes {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "{}", self.hexdigest())
    }
}

///////////////////////////////////////////// SigningKey ////////////////////////////////////////////

/// The root HMAC key of a macaroon's tail chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SigningKey(KeyBytes);

impl SigningKey {
    pub fn generate() -> Self {
        Self(KeyBytes::random())
    }

    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(KeyBytes::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0.bytes
    }

    pub fn hexdigest(&self) -> String {
        self.0.hexdigest()
    }
}

/////////////////////////////////////////// EncryptionKey ///////////////////////////////////////////

/// Owned by a third-party location; used to seal and open that location's discharge tickets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncryptionKey(KeyBytes);

impl EncryptionKey {
    pub fn generate() -> Self {
        Self(KeyBytes::random())
    }

    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(KeyBytes::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0.bytes
    }

    pub fn hexdigest(&self) -> String {
        self.0.hexdigest()
    }
}

////////////////////////////////////////////// Tail /////////////////////////////////////////////////

/// The running HMAC signature of a macaroon.
#[derive(Clone, Eq, PartialEq)]
pub struct Tail {
    bytes: [u8; KEY_BYTES],
}

impl Tail {
    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.bytes
    }

    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self { bytes }
    }

    pub fn hexdigest(&self) -> String {
        let mut s = String::with_capacity(2 * KEY_BYTES);
        for b in &self.bytes {
            write!(&mut s, "{b:02x}").expect("writing to a String cannot fail");
        }
        s
    }

    /// As a 32-byte AEAD key, e.g. to decrypt a `VerifierKey` sealed under this tail.
    pub fn as_encryption_key(&self) -> EncryptionKey {
        EncryptionKey::from_bytes(self.bytes)
    }
}

impl std::fmt::Debug for Tail {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "{}", self.hexdigest())
    }
}

/////////////////////////////////////////////// chain ///////////////////////////////////////////////

/// `tail0 = HMAC-SHA256(root_key, location || canonical(nonce))`.
pub fn tail0(root_key: &SigningKey, location: &str, canonical_nonce: &[u8]) -> Tail {
    let mut msg = Vec::with_capacity(location.len() + canonical_nonce.len());
    msg.extend_from_slice(location.as_bytes());
    msg.extend_from_slice(canonical_nonce);
    let mut out = [0u8; KEY_BYTES];
    hmac(&root_key.0.bytes, &msg, &mut out);
    Tail { bytes: out }
}

/// `tail_i = HMAC-SHA256(tail_{i-1}, canonical(caveat_i))`.
pub fn step(tail: &Tail, canonical_caveat: &[u8]) -> Tail {
    let mut out = [0u8; KEY_BYTES];
    hmac(&tail.bytes, canonical_caveat, &mut out);
    Tail { bytes: out }
}

////////////////////////////////////////////// sealing //////////////////////////////////////////////

/// Authenticated-encrypt `plaintext` under `key` with a fresh random nonce. Output is
/// `nonce || ciphertext || tag`.
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Vec<u8> {
    let mut nonce = [0u8; NONCE_BYTES];
    random_bytes(&mut nonce);
    let mut ciphertext = vec![0u8; plaintext.len() + MAC_BYTES];
    let ret = unsafe {
        libsodium_sys::crypto_secretbox_easy(
            ciphertext.as_mut_ptr(),
            plaintext.as_ptr(),
            plaintext.len() as u64,
            nonce.as_ptr(),
            key.0.bytes.as_ptr(),
        )
    };
    assert_eq!(0, ret, "crypto_secretbox_easy cannot fail given valid inputs");
    let mut sealed = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    sealed
}

/// Open a value produced by [seal]. Returns `Crypto` on any failure (wrong key, truncated input,
/// forged ciphertext); never distinguishes the failure mode further, to avoid oracle attacks.
pub fn open(key: &EncryptionKey, sealed: &[u8]) -> Result<Vec<u8>, Error> {
    if sealed.len() < NONCE_BYTES + MAC_BYTES {
        return Err(Error::crypto("sealed value too short to contain a nonce and tag"));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_BYTES);
    let mut plaintext = vec![0u8; ciphertext.len() - MAC_BYTES];
    let ret = unsafe {
        libsodium_sys::crypto_secretbox_open_easy(
            plaintext.as_mut_ptr(),
            ciphertext.as_ptr(),
            ciphertext.len() as u64,
            nonce.as_ptr(),
            key.0.bytes.as_ptr(),
        )
    };
    if ret == 0 {
        Ok(plaintext)
    } else {
        Err(Error::crypto("secretbox authentication failed"))
    }
}

////////////////////////////////////////////// hashing //////////////////////////////////////////////

/// BLAKE2b-256 over arbitrary bytes, unkeyed.
pub fn blake2b256(msg: &[u8]) -> [u8; HASH_BYTES] {
    let mut out = [0u8; HASH_BYTES];
    let ret = unsafe {
        libsodium_sys::crypto_generichash(
            out.as_mut_ptr(),
            HASH_BYTES,
            msg.as_ptr(),
            msg.len() as u64,
            std::ptr::null(),
            0,
        )
    };
    assert_eq!(0, ret, "crypto_generichash cannot fail for a 32-byte digest");
    out
}

/// Derive a 32-byte subkey from `key_bytes` and a domain-separating `msg`, e.g. a third-party
/// session secret derived from a ticket's sealed key material.
pub fn derive(key_bytes: &[u8; KEY_BYTES], msg: &[u8]) -> [u8; KEY_BYTES] {
    let mut out = [0u8; KEY_BYTES];
    hmac(key_bytes, msg, &mut out);
    out
}

/////////////////////////////////////////////// raw FFI //////////////////////////////////////////////

fn hmac(key: &[u8; KEY_BYTES], message: &[u8], out: &mut [u8; KEY_BYTES]) {
    unsafe {
        libsodium_sys::crypto_auth_hmacsha256(
            out.as_mut_ptr(),
            message.as_ptr(),
            message.len() as u64,
            key.as_ptr(),
        );
    }
}

pub fn explicit_bzero(bytes: &mut [u8]) {
    unsafe {
        libsodium_sys::sodium_memzero(bytes.as_mut_ptr() as *mut c_void, bytes.len());
    }
}

pub fn random_bytes(bytes: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(bytes.as_mut_ptr() as *mut c_void, bytes.len());
    }
}

pub fn mem_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let compared = unsafe {
        libsodium_sys::sodium_memcmp(
            lhs.as_ptr() as *const c_void,
            rhs.as_ptr() as *const c_void,
            lhs.len(),
        )
    };
    compared == 0
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_keys_are_random() {
        let a = SigningKey::generate();
        let b = SigningKey::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn seal_open_round_trip() {
        let key = EncryptionKey::generate();
        let plaintext = b"discharge key plus nested caveats";
        let sealed = seal(&key, plaintext);
        let opened = open(&key, &sealed).unwrap();
        assert_eq!(plaintext.to_vec(), opened);
    }

    #[test]
    fn open_fails_with_wrong_key() {
        let key = EncryptionKey::generate();
        let other = EncryptionKey::generate();
        let sealed = seal(&key, b"hello");
        assert!(open(&other, &sealed).is_err());
    }

    #[test]
    fn open_fails_on_truncation() {
        let key = EncryptionKey::generate();
        let mut sealed = seal(&key, b"hello world");
        sealed.truncate(sealed.len() - 1);
        assert!(open(&key, &sealed).is_err());
    }

    #[test]
    fn chain_is_deterministic() {
        let root = SigningKey::from_bytes([7u8; KEY_BYTES]);
        let t0 = tail0(&root, "svc", b"nonce-bytes");
        let t0_again = tail0(&root, "svc", b"nonce-bytes");
        assert_eq!(t0, t0_again);
        let t1 = step(&t0, b"caveat-bytes");
        assert_ne!(t0, t1);
    }

    #[test]
    fn hash_is_deterministic_and_sensitive() {
        let a = blake2b256(b"hello");
        let b = blake2b256(b"hello");
        let c = blake2b256(b"hellp");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
