//! Multi-token bundle evaluation (spec.md §4.6, C6): parsing a bearer header into permission
//! candidates and their discharges, verifying with a pluggable [Verifier], attenuating, selecting
//! by predicate, and validating with "any one permission token succeeds" semantics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use biometrics::Counter;

use crate::access::Access;
use crate::caveat::CaveatSet;
use crate::crypto::{self, EncryptionKey, SigningKey};
use crate::error::Error;
use crate::macaroon::Macaroon;

static CACHE_HIT: Counter = Counter::new("macfly.bundle.cache_hit");
static CACHE_MISS: Counter = Counter::new("macfly.bundle.cache_miss");

/////////////////////////////////////////////// TokenKind ////////////////////////////////////////////

/// How a single token in a [Bundle] classifies, mirroring spec.md §3's `Bundle` shape.
#[derive(Clone, Debug)]
pub enum TokenKind {
    Unverified,
    Verified(CaveatSet),
    Failed(Error),
    Discharge,
    /// This token's location differs from the bundle's primary location.
    Foreign,
}

#[derive(Clone)]
pub struct Token {
    pub macaroon: Macaroon,
    pub kind: TokenKind,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Token")
            .field("location", &self.macaroon.location)
            .field("kind", &self.kind)
            .finish()
    }
}

/////////////////////////////////////////////// Bundle ///////////////////////////////////////////////

/// `{location, tokens}`. Parsed from a comma-separated, optionally `FlyV1 `-prefixed bearer
/// header; classifies each element as a permission candidate (location matches) or a potential
/// discharge (it does not).
pub struct Bundle {
    pub location: String,
    pub tokens: Vec<Token>,
}

impl Bundle {
    pub fn parse(header: &str, location: impl Into<String>) -> Result<Self, Error> {
        let location = location.into();
        let macaroons = Macaroon::parse_header(header)?;
        let tokens = macaroons
            .into_iter()
            .map(|m| {
                let kind = if trim_slash(&m.location) == trim_slash(&location) {
                    TokenKind::Unverified
                } else {
                    TokenKind::Foreign
                };
                Token { macaroon: m, kind }
            })
            .collect();
        Ok(Bundle { location, tokens })
    }

    /// Candidate discharges for permission token `p`: every other token in the bundle whose
    /// `Nonce.KID` equals a 3P ticket anywhere in `p`'s caveat set, including inside `IfPresent`
    /// wrappers (the wrapper is unwrapped only for this scan, never for validation).
    pub fn discharges_for(&self, p: &Macaroon) -> Vec<Macaroon> {
        let tickets = collect_tickets(p);
        self.tokens
            .iter()
            .filter(|t| tickets.iter().any(|tk| *tk == t.macaroon.nonce.kid))
            .map(|t| t.macaroon.clone())
            .collect()
    }

    /// Verify every permission candidate (tokens whose location matches this bundle's) against
    /// its own candidate discharge set, updating each [Token]'s [TokenKind] in place.
    pub fn verify_all(&mut self, verifier: &dyn Verifier) {
        let indices: Vec<usize> = self
            .tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| matches!(t.kind, TokenKind::Unverified))
            .map(|(i, _)| i)
            .collect();
        for i in indices {
            let p = self.tokens[i].macaroon.clone();
            let discharges = self.discharges_for(&p);
            self.tokens[i].kind = match verifier.verify(&p, &discharges) {
                Ok(caveats) => TokenKind::Verified(caveats),
                Err(e) => TokenKind::Failed(e),
            };
        }
        // Anything not a permission candidate and consumed as somebody's discharge is reclassified;
        // tokens left `Foreign` stay `Foreign`, everything else that served as a discharge becomes
        // `Discharge` so callers don't mistake it for an independent, unverified permission token.
        let discharge_kids: std::collections::HashSet<Vec<u8>> = self
            .tokens
            .iter()
            .flat_map(|t| collect_tickets(&t.macaroon))
            .collect();
        for token in &mut self.tokens {
            if matches!(token.kind, TokenKind::Unverified)
                && discharge_kids.contains(&token.macaroon.nonce.kid)
            {
                token.kind = TokenKind::Discharge;
            }
        }
    }

    /// Append caveats to every permission token (verified or not). Fails if any targeted token is
    /// a finalized discharge, since a discharge's `Proof` bit forbids further attenuation
    /// regardless of which code path appends to it.
    pub fn attenuate(&mut self, caveats: &CaveatSet) -> Result<(), Error> {
        for token in &mut self.tokens {
            if matches!(token.kind, TokenKind::Discharge) && token.macaroon.nonce.proof {
                return Err(Error::bad_caveat("cannot attenuate a finalized discharge"));
            }
            for caveat in caveats.iter() {
                token.macaroon.add_boxed(caveat.clone_box())?;
            }
            token.kind = TokenKind::Unverified;
        }
        Ok(())
    }

    /// Keep only tokens matching `predicate`.
    pub fn select(&self, predicate: &Predicate) -> Vec<&Token> {
        self.tokens.iter().filter(|t| predicate.matches(t)).collect()
    }

    /// Run `validate(access)` against every verified permission token; succeed if any one
    /// succeeds. On total failure, returns [Error::no_authorized_token] carrying each failure.
    pub fn validate(&self, access: &dyn Access) -> Result<(), Error> {
        let mut failures = Vec::new();
        for token in &self.tokens {
            match &token.kind {
                TokenKind::Verified(caveats) => match caveats.validate(access) {
                    Ok(()) => return Ok(()),
                    Err(e) => failures.push(e.long_form()),
                },
                TokenKind::Failed(e) => failures.push(e.long_form()),
                _ => {}
            }
        }
        Err(Error::no_authorized_token(failures))
    }
}

fn trim_slash(s: &str) -> &str {
    s.trim_end_matches('/')
}

fn collect_tickets(m: &Macaroon) -> Vec<Vec<u8>> {
    let mut tickets = Vec::new();
    collect_tickets_into(&m.caveats, &mut tickets);
    tickets
}

fn collect_tickets_into(caveats: &CaveatSet, out: &mut Vec<Vec<u8>>) {
    for caveat in caveats.iter() {
        if let Some(c3p) = caveat.as_any().downcast_ref::<crate::builtin::Caveat3P>() {
            out.push(c3p.ticket.clone());
        }
        if let Some(nested) = caveat.unwrap() {
            collect_tickets_into(nested, out);
        }
    }
}

/////////////////////////////////////////////// Predicate ////////////////////////////////////////////

/// Composable filters over a bundle's tokens. Domain-specific predicates (e.g. "issued for org
/// X") live with the caller; this enum only supplies the structural `And`/`Or`/`Not` combinators
/// plus the one structural predicate the core can name, location.
pub enum Predicate {
    Location(String),
    Verified,
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn matches(&self, token: &Token) -> bool {
        match self {
            Predicate::Location(loc) => trim_slash(&token.macaroon.location) == trim_slash(loc),
            Predicate::Verified => matches!(token.kind, TokenKind::Verified(_)),
            Predicate::And(a, b) => a.matches(token) && b.matches(token),
            Predicate::Or(a, b) => a.matches(token) || b.matches(token),
            Predicate::Not(a) => !a.matches(token),
        }
    }
}

/////////////////////////////////////////////// Verifier /////////////////////////////////////////////

/// Verifies one permission token against its candidate discharges. [LocalVerifier] does the work
/// in-process; [CachingVerifier] wraps any `Verifier` with an LRU+TTL cache.
pub trait Verifier: Send + Sync {
    fn verify(&self, permission: &Macaroon, discharges: &[Macaroon]) -> Result<CaveatSet, Error>;
}

/// Resolves a signing key from a nonce's `KID` and calls [crate::verify::verify] directly.
pub struct LocalVerifier<F> {
    key_resolver: F,
    tp_keys: HashMap<String, Vec<EncryptionKey>>,
}

impl<F> LocalVerifier<F>
where
    F: Fn(&[u8]) -> Result<SigningKey, Error> + Send + Sync,
{
    pub fn new(key_resolver: F, tp_keys: HashMap<String, Vec<EncryptionKey>>) -> Self {
        LocalVerifier { key_resolver, tp_keys }
    }
}

impl<F> Verifier for LocalVerifier<F>
where
    F: Fn(&[u8]) -> Result<SigningKey, Error> + Send + Sync,
{
    fn verify(&self, permission: &Macaroon, discharges: &[Macaroon]) -> Result<CaveatSet, Error> {
        let root_key = (self.key_resolver)(&permission.nonce.kid)?;
        crate::verify::verify(permission, &root_key, discharges, &self.tp_keys)
    }
}

struct CacheEntry {
    caveats: CaveatSet,
    inserted_at: Instant,
}

/// Wraps any [Verifier] with a capacity-bounded, per-entry-TTL cache keyed by
/// `blake2b256(permission_bytes || sorted(discharge_bytes))`. Only successful verifications are
/// cached, since [Error] is not `Clone`; a failed verification simply re-runs the inner verifier
/// every time. Internally synchronized with a single lock, matching spec.md §5's "single lock or
/// sharded lock over an LRU".
pub struct CachingVerifier<V> {
    inner: V,
    ttl: Duration,
    capacity: usize,
    // Front of the `VecDeque` is least-recently-used.
    entries: Mutex<(HashMap<[u8; 32], CacheEntry>, std::collections::VecDeque<[u8; 32]>)>,
}

impl<V: Verifier> CachingVerifier<V> {
    pub fn new(inner: V, ttl: Duration, capacity: usize) -> Self {
        CachingVerifier {
            inner,
            ttl,
            capacity,
            entries: Mutex::new((HashMap::new(), std::collections::VecDeque::new())),
        }
    }

    fn cache_key(permission: &Macaroon, discharges: &[Macaroon]) -> [u8; 32] {
        let mut msg = permission.encode();
        let mut discharge_bytes: Vec<Vec<u8>> = discharges.iter().map(Macaroon::encode).collect();
        discharge_bytes.sort();
        for d in discharge_bytes {
            msg.extend_from_slice(&d);
        }
        crypto::blake2b256(&msg)
    }
}

impl<V: Verifier> Verifier for CachingVerifier<V> {
    fn verify(&self, permission: &Macaroon, discharges: &[Macaroon]) -> Result<CaveatSet, Error> {
        let key = Self::cache_key(permission, discharges);
        {
            let guard = self.entries.lock().expect("cache mutex poisoned");
            if let Some(entry) = guard.0.get(&key) {
                if entry.inserted_at.elapsed() < self.ttl {
                    CACHE_HIT.click();
                    return Ok(entry.caveats.clone());
                }
            }
        }
        CACHE_MISS.click();
        let caveats = self.inner.verify(permission, discharges)?;

        let mut guard = self.entries.lock().expect("cache mutex poisoned");
        if !guard.0.contains_key(&key) {
            if guard.1.len() >= self.capacity {
                if let Some(oldest) = guard.1.pop_front() {
                    guard.0.remove(&oldest);
                }
            }
            guard.1.push_back(key);
        }
        guard.0.insert(
            key,
            CacheEntry { caveats: caveats.clone(), inserted_at: Instant::now() },
        );
        Ok(caveats)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::ActionMask;
    use crate::builtin::ValidityWindow;

    #[derive(Debug)]
    struct FakeAccess {
        now: u64,
    }

    impl Access for FakeAccess {
        fn now(&self) -> u64 {
            self.now
        }

        fn action(&self) -> Option<ActionMask> {
            None
        }
    }

    fn resolver(key: SigningKey) -> impl Fn(&[u8]) -> Result<SigningKey, Error> + Send + Sync {
        move |_kid: &[u8]| Ok(key.clone())
    }

    #[test]
    fn bundle_parses_and_verifies_single_token() {
        let key = SigningKey::generate();
        let mut m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        m.add(ValidityWindow::new(0, u64::MAX)).unwrap();
        let header = format!("FlyV1 {}", m.to_base64());

        let mut bundle = Bundle::parse(&header, "svc").unwrap();
        let verifier = LocalVerifier::new(resolver(key), HashMap::new());
        bundle.verify_all(&verifier);
        assert!(matches!(bundle.tokens[0].kind, TokenKind::Verified(_)));
        assert!(bundle.validate(&FakeAccess { now: 0 }).is_ok());
    }

    #[test]
    fn any_of_validate_semantics() {
        let good_key = SigningKey::generate();
        let mut good = Macaroon::new(b"good".to_vec(), "svc", &good_key);
        good.add(ValidityWindow::new(0, u64::MAX)).unwrap();

        let bad_key = SigningKey::generate();
        let mut bad = Macaroon::new(b"bad".to_vec(), "svc", &bad_key);
        bad.add(ValidityWindow::new(1_000_000, 1_000_001)).unwrap();

        let header = format!("{},{}", good.to_base64(), bad.to_base64());
        let mut bundle = Bundle::parse(&header, "svc").unwrap();
        let verifier = LocalVerifier::new(
            move |kid: &[u8]| {
                if kid == b"good" {
                    Ok(good_key.clone())
                } else {
                    Ok(bad_key.clone())
                }
            },
            HashMap::new(),
        );
        bundle.verify_all(&verifier);
        assert!(bundle.validate(&FakeAccess { now: 0 }).is_ok());
    }

    #[test]
    fn caching_verifier_reuses_result() {
        let key = SigningKey::generate();
        let m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        let verifier = CachingVerifier::new(
            LocalVerifier::new(resolver(key), HashMap::new()),
            Duration::from_secs(60),
            16,
        );
        let first = verifier.verify(&m, &[]).unwrap();
        let second = verifier.verify(&m, &[]).unwrap();
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn predicate_filters_by_location() {
        let key = SigningKey::generate();
        let m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        let header = m.to_base64();
        let bundle = Bundle::parse(&header, "svc").unwrap();
        let matched = bundle.select(&Predicate::Location("svc".to_owned()));
        assert_eq!(1, matched.len());
        let unmatched = bundle.select(&Predicate::Not(Box::new(Predicate::Location("svc".to_owned()))));
        assert_eq!(0, unmatched.len());
    }
}
