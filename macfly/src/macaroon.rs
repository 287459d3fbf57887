//! `Nonce` and `Macaroon`: construction, attenuation, the canonical wire encoding, and the
//! bearer-header transport encoding.

use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE, Engine as _};

use crate::builtin::Caveat3P;
use crate::caveat::{Caveat, CaveatSet};
use crate::codec;
use crate::crypto::{self, EncryptionKey, SigningKey, Tail};
use crate::error::Error;

/////////////////////////////////////////////// Nonce ////////////////////////////////////////////////

/// `{KID, RND, Proof}`. `KID` identifies the signing key (for a permission token) or carries the
/// encrypted ticket of the 3P caveat being discharged (for a discharge macaroon). `RND` is 16
/// random bytes sampled once at mint time. `Proof` marks the macaroon finalized: once set, no more
/// caveats may be appended (invariant I-proof).
#[derive(Clone, Eq, PartialEq)]
pub struct Nonce {
    pub kid: Vec<u8>,
    pub rnd: [u8; 16],
    pub proof: bool,
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Nonce")
            .field("kid", &format!("{} bytes", self.kid.len()))
            .field("uuid", &self.uuid_string())
            .field("proof", &self.proof)
            .finish()
    }
}

impl Nonce {
    pub fn generate(kid: Vec<u8>) -> Self {
        let mut rnd = [0u8; 16];
        crypto::random_bytes(&mut rnd);
        Nonce { kid, rnd, proof: false }
    }

    pub fn canonical(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::pack_bytes(&mut out, &self.kid);
        codec::pack_fixed(&mut out, &self.rnd);
        codec::pack_bool(&mut out, self.proof);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        let (kid, rest) = codec::unpack_bytes(buf)?;
        let (rnd, rest) = codec::unpack_fixed(rest, 16)?;
        let (proof, rest) = codec::unpack_bool(rest)?;
        let mut rnd_arr = [0u8; 16];
        rnd_arr.copy_from_slice(rnd);
        Ok((Nonce { kid: kid.to_vec(), rnd: rnd_arr, proof }, rest))
    }

    /// The first 16 bytes of `blake2b256(canonical())`, rendered the way [one_two_eight] renders
    /// any other 16-byte identifier in this lineage.
    pub fn uuid(&self) -> [u8; 16] {
        let digest = crypto::blake2b256(&self.canonical());
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&digest[..16]);
        uuid
    }

    pub fn uuid_string(&self) -> String {
        one_two_eight::encode(&self.uuid())
    }
}

/////////////////////////////////////////////// Macaroon /////////////////////////////////////////////

/// `{Location, Nonce, Caveats, Tail}`. See spec.md §3/§4.4 for the invariants this type
/// maintains: `I-tail` (the running HMAC chain), `I-proof` (no appends once finalized), and
/// `I-attestation` (attestation caveats legal only once `Proof` is set — enforced at verify time,
/// not here, since attestations are typically appended to an as-yet-unproven discharge and the
/// nonce is only flipped to `proof=true` by [Macaroon::finalize] afterward).
#[derive(Clone)]
pub struct Macaroon {
    pub location: String,
    pub nonce: Nonce,
    pub caveats: CaveatSet,
    tail: Tail,
}

impl std::fmt::Debug for Macaroon {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Macaroon")
            .field("location", &self.location)
            .field("nonce", &self.nonce)
            .field("caveats", &self.caveats)
            .field("tail", &self.tail)
            .finish()
    }
}

impl Macaroon {
    /// Mint a fresh permission token: samples a nonce, computes `tail0`, no caveats yet.
    pub fn new(kid: Vec<u8>, location: impl Into<String>, root_key: &SigningKey) -> Self {
        let location = location.into();
        let nonce = Nonce::generate(kid);
        let tail = crypto::tail0(root_key, &location, &nonce.canonical());
        Macaroon { location, nonce, caveats: CaveatSet::new(), tail }
    }

    /// Reconstruct a macaroon's public fields without holding the root key (used by decode and,
    /// internally, by the discharge-opening path which only learns the root key from a ticket).
    fn from_parts(location: String, nonce: Nonce, caveats: CaveatSet, tail: Tail) -> Self {
        Macaroon { location, nonce, caveats, tail }
    }

    pub fn tail(&self) -> &Tail {
        &self.tail
    }

    /// The anti-replay tag a [crate::builtin::BindToParentToken] caveat carries to tie a discharge
    /// to this specific permission token: the first 16 bytes of `blake2b256(self.tail())`. A third
    /// party minting a discharge against a ticket from this token calls this (having received the
    /// token itself over whatever transport carries the discharge request) and embeds the result
    /// via [Macaroon::finalize_with], so the discharge cannot be replayed against a different
    /// permission token that happens to present the same ticket.
    pub fn bind_tag(&self) -> [u8; 16] {
        let digest = crypto::blake2b256(self.tail.as_bytes());
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&digest[..16]);
        tag
    }

    /// Append one caveat, stepping the tail. Rejects if this macaroon is finalized (I-proof) or if
    /// the caveat is an attestation (spec.md §4.4): attestations only become legal through
    /// [Macaroon::finalize_with], the one path that sets `Proof` at the same time it appends them.
    pub fn add(&mut self, caveat: impl Caveat + 'static) -> Result<(), Error> {
        self.add_boxed(Box::new(caveat))
    }

    pub fn add_boxed(&mut self, caveat: Box<dyn Caveat>) -> Result<(), Error> {
        if caveat.is_attestation() {
            return Err(Error::bad_caveat(
                "attestation caveats may only be appended via finalize_with",
            ));
        }
        self.append_unchecked(caveat)
    }

    fn append_unchecked(&mut self, caveat: Box<dyn Caveat>) -> Result<(), Error> {
        if self.nonce.proof {
            return Err(Error::bad_caveat("cannot append a caveat to a finalized macaroon"));
        }
        let body = caveat.pack_body();
        let mut canonical = Vec::new();
        codec::pack_u64(&mut canonical, caveat.type_id().0);
        codec::pack_bytes(&mut canonical, &body);
        self.tail = crypto::step(&self.tail, &canonical);
        self.caveats.push_boxed(caveat);
        Ok(())
    }

    /// Append a third-party caveat: mints a fresh discharge key, seals the nested caveats plus
    /// that key into a ticket under the 3P's encryption key, and seals the key alone under this
    /// macaroon's current tail as the verifier key.
    pub fn add_3p(
        &mut self,
        tp_key: &EncryptionKey,
        tp_location: impl Into<String>,
        inner: CaveatSet,
    ) -> Result<Vec<u8>, Error> {
        if self.nonce.proof {
            return Err(Error::bad_caveat("cannot append a 3P caveat to a finalized macaroon"));
        }
        let tp_location = tp_location.into();
        let discharge_key = SigningKey::generate();

        let mut ticket_plaintext = Vec::new();
        codec::pack_fixed(&mut ticket_plaintext, discharge_key.as_bytes());
        codec::pack_bytes(&mut ticket_plaintext, &inner.encode());
        let ticket = crypto::seal(tp_key, &ticket_plaintext);

        let verifier_key = crypto::seal(&self.tail.as_encryption_key(), discharge_key.as_bytes());

        let caveat = Caveat3P { location: tp_location, verifier_key, ticket: ticket.clone() };
        self.add_boxed(Box::new(caveat))?;
        Ok(ticket)
    }

    /// Scan for the first `Caveat3P` whose location matches `location` (trailing `/` ignored on
    /// both sides), returning its ticket. Used by a client that wants to kick off a 3P discharge.
    pub fn third_party_ticket(&self, location: &str) -> Result<Vec<u8>, Error> {
        let target = location.trim_end_matches('/');
        for caveat in self.caveats.iter() {
            if let Some(c3p) = caveat.as_any().downcast_ref::<Caveat3P>() {
                if c3p.location.trim_end_matches('/') == target {
                    return Ok(c3p.ticket.clone());
                }
            }
        }
        Err(Error::not_found(format!("no third-party caveat for location {location:?}")))
    }

    /// Lock against further attenuation. A discharge is normally finalized right before it is
    /// handed back to the client.
    pub fn finalize(&mut self) {
        self.nonce.proof = true;
    }

    /// Append `caveats` — which may include attestations such as [crate::builtin::IsUser] — and
    /// finalize in the same operation. This is the one sanctioned path for a third party to mint
    /// an attested discharge: appending an attestation through plain [Macaroon::add] is rejected,
    /// and I-proof forbids appending anything once `Proof` is already set, so attestations and
    /// finalization must happen together.
    pub fn finalize_with(
        &mut self,
        caveats: impl IntoIterator<Item = Box<dyn Caveat>>,
    ) -> Result<(), Error> {
        for caveat in caveats {
            self.append_unchecked(caveat)?;
        }
        self.nonce.proof = true;
        Ok(())
    }

    /////////////////////////////////////////// wire form ///////////////////////////////////////////

    /// `[location, nonce, caveat_set_bytes, tail]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::pack_str(&mut out, &self.location);
        codec::pack_bytes(&mut out, &self.nonce.canonical());
        codec::pack_bytes(&mut out, &self.caveats.encode());
        codec::pack_fixed(&mut out, self.tail.as_bytes());
        out
    }

    /// Decode the tuple shape. Does not require (or check against) the root key; tail0
    /// recomputation and signature verification happen in [crate::verify], which does have the
    /// key.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let (location, rest) = codec::unpack_str(buf)?;
        let (nonce_bytes, rest) = codec::unpack_bytes(rest)?;
        let (nonce, nonce_rest) = Nonce::decode(nonce_bytes)?;
        if !nonce_rest.is_empty() {
            return Err(Error::bad_token("trailing bytes in nonce"));
        }
        let (caveat_bytes, rest) = codec::unpack_bytes(rest)?;
        let caveats = CaveatSet::decode(caveat_bytes)?;
        let (tail_bytes, rest) = codec::unpack_fixed(rest, crypto::KEY_BYTES)?;
        if !rest.is_empty() {
            return Err(Error::bad_token("trailing bytes after macaroon tuple"));
        }
        let mut tail_arr = [0u8; crypto::KEY_BYTES];
        tail_arr.copy_from_slice(tail_bytes);
        Ok(Macaroon::from_parts(location, nonce, caveats, Tail::from_bytes(tail_arr)))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.encode())
    }

    pub fn from_base64(s: &str) -> Result<Self, Error> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| Error::bad_token(format!("{e:?}")))?;
        Self::decode(&bytes)
    }

    /// Parse an `Authorization`-style header: `["FlyV1 "]base64[,base64...]`, tolerating
    /// whitespace around each element. Returns one decoded macaroon per element, in header order.
    pub fn parse_header(header: &str) -> Result<Vec<Self>, Error> {
        let body = strip_scheme(header.trim());
        body.split(',')
            .map(|part| Self::from_base64_urlsafe_or_standard(part.trim()))
            .collect()
    }

    fn from_base64_urlsafe_or_standard(s: &str) -> Result<Self, Error> {
        let bytes = URL_SAFE
            .decode(s)
            .or_else(|_| STANDARD.decode(s))
            .map_err(|e| Error::bad_token(format!("{e:?}")))?;
        Self::decode(&bytes)
    }
}

fn strip_scheme(header: &str) -> &str {
    const SCHEME: &str = "flyv1 ";
    if header.len() >= SCHEME.len() && header[..SCHEME.len()].eq_ignore_ascii_case(SCHEME) {
        header[SCHEME.len()..].trim_start()
    } else {
        header
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::ValidityWindow;

    #[test]
    fn encode_decode_round_trip() {
        let key = SigningKey::generate();
        let mut m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        m.add(ValidityWindow::new(100, 200)).unwrap();
        let encoded = m.encode();
        let decoded = Macaroon::decode(&encoded).unwrap();
        assert_eq!(m.location, decoded.location);
        assert_eq!(m.nonce, decoded.nonce);
        assert_eq!(m.tail().as_bytes(), decoded.tail().as_bytes());
        assert_eq!(encoded, decoded.encode());
    }

    #[test]
    fn finalized_macaroon_rejects_append() {
        let key = SigningKey::generate();
        let mut m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        m.finalize();
        assert!(m.add(ValidityWindow::new(0, 1)).is_err());
    }

    #[test]
    fn plain_add_rejects_attestation_caveats() {
        let key = SigningKey::generate();
        let mut m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        assert!(m.add(crate::builtin::IsUser::new("u-123")).is_err());
    }

    #[test]
    fn finalize_with_appends_attestation_and_locks() {
        let key = SigningKey::generate();
        let mut m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        m.finalize_with([
            Box::new(crate::builtin::IsUser::new("u-123")) as Box<dyn Caveat>
        ])
        .unwrap();
        assert!(m.nonce.proof);
        assert_eq!(1, m.caveats.len());
        assert!(m.add(ValidityWindow::new(0, 1)).is_err());
    }

    #[test]
    fn third_party_ticket_lookup() {
        let key = SigningKey::generate();
        let tp_key = EncryptionKey::generate();
        let mut m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        let ticket = m.add_3p(&tp_key, "auth.example/", CaveatSet::new()).unwrap();
        assert_eq!(ticket, m.third_party_ticket("auth.example").unwrap());
        assert!(m.third_party_ticket("other").is_err());
    }

    #[test]
    fn base64_round_trip() {
        let key = SigningKey::generate();
        let m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        let encoded = m.to_base64();
        let decoded = Macaroon::from_base64(&encoded).unwrap();
        assert_eq!(m.encode(), decoded.encode());
    }

    #[test]
    fn header_parsing_strips_scheme_and_splits() {
        let key = SigningKey::generate();
        let a = Macaroon::new(b"a".to_vec(), "svc", &key);
        let b = Macaroon::new(b"b".to_vec(), "svc", &key);
        let header = format!("FlyV1 {}, {}", a.to_base64(), b.to_base64());
        let parsed = Macaroon::parse_header(&header).unwrap();
        assert_eq!(2, parsed.len());
        assert_eq!(a.encode(), parsed[0].encode());
        assert_eq!(b.encode(), parsed[1].encode());
    }
}
