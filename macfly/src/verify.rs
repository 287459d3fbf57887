//! Recomputing a macaroon's tail, resolving third-party caveats against a bundle of candidate
//! discharges, and folding everything into one verified [CaveatSet] ready for [CaveatSet::validate].

use std::collections::HashMap;

use biometrics::Counter;

use crate::builtin::{BindToParentToken, Caveat3P};
use crate::caveat::CaveatSet;
use crate::codec;
use crate::crypto::{self, EncryptionKey, SigningKey};
use crate::error::Error;
use crate::macaroon::Macaroon;

static FIRST_PARTY_VERIFIED: Counter = Counter::new("macfly.verify.first_party_verified");
static FIRST_PARTY_BAD_SIGNATURE: Counter = Counter::new("macfly.verify.first_party_bad_signature");
static THIRD_PARTY_RESOLVED: Counter = Counter::new("macfly.verify.third_party_resolved");
static THIRD_PARTY_DISCHARGE_MISSING: Counter =
    Counter::new("macfly.verify.third_party_discharge_missing");

/// Recursion depth past which we assume a cycle rather than a legitimate discharge chain. No
/// observed deployment nests discharges more than a handful deep.
const MAX_DEPTH: usize = 16;

/// Verify `m` against `root_key`, resolving any third-party caveats it carries against
/// `discharges`. `tp_keys` is the set of encryption keys this verifier trusts per third-party
/// location; a `Caveat3P` naming an unrecognized location fails closed rather than silently
/// trusting whichever macaroon happens to match by ticket bytes.
///
/// Returns the union of verified caveats — this macaroon's own, followed by each matched
/// discharge's verified caveats in caveat-appearance order — ready for [CaveatSet::validate].
pub fn verify(
    m: &Macaroon,
    root_key: &SigningKey,
    discharges: &[Macaroon],
    tp_keys: &HashMap<String, Vec<EncryptionKey>>,
) -> Result<CaveatSet, Error> {
    verify_inner(m, root_key, discharges, tp_keys, m, 0)
}

fn verify_inner(
    m: &Macaroon,
    root_key: &SigningKey,
    discharges: &[Macaroon],
    tp_keys: &HashMap<String, Vec<EncryptionKey>>,
    top: &Macaroon,
    depth: usize,
) -> Result<CaveatSet, Error> {
    if depth > MAX_DEPTH {
        return Err(Error::cycle());
    }

    let mut tail = crypto::tail0(root_key, &m.location, &m.nonce.canonical());
    let mut verified = CaveatSet::new();
    let mut discharge_sets = Vec::new();

    for caveat in m.caveats.iter() {
        let mut canonical = Vec::new();
        codec::pack_u64(&mut canonical, caveat.type_id().0);
        codec::pack_bytes(&mut canonical, &caveat.pack_body());

        // I-attestation: legal only inside a finalized discharge (depth > 0, Proof set).
        if caveat.is_attestation() && (depth == 0 || !m.nonce.proof) {
            return Err(Error::bad_caveat(
                "attestation caveat outside a finalized discharge",
            ));
        }

        if let Some(c3p) = caveat.as_any().downcast_ref::<Caveat3P>() {
            if !tp_keys.contains_key(&c3p.location) {
                return Err(Error::not_found(format!(
                    "unrecognized third-party location {:?}",
                    c3p.location
                )));
            }
            // `VerifierKey` was sealed under the tail as it stood *before* this Caveat3P was
            // appended (macaroon.rs's `add_3p`), so it must be opened with that same pre-step
            // tail, not the tail advanced for this caveat.
            let dk_bytes = crypto::open(&tail.as_encryption_key(), &c3p.verifier_key)
                .map_err(|_| Error::bad_signature())?;
            if dk_bytes.len() != crypto::KEY_BYTES {
                return Err(Error::bad_key("recovered discharge key has the wrong length"));
            }
            let mut dk_arr = [0u8; crypto::KEY_BYTES];
            dk_arr.copy_from_slice(&dk_bytes);
            let dk = SigningKey::from_bytes(dk_arr);

            let discharge = discharges.iter().find(|d| d.nonce.kid == c3p.ticket);
            let discharge = match discharge {
                Some(d) => d,
                None => {
                    THIRD_PARTY_DISCHARGE_MISSING.click();
                    return Err(Error::discharge_missing(c3p.location.clone()));
                }
            };

            let discharge_caveats = verify_inner(discharge, &dk, discharges, tp_keys, top, depth + 1)?;

            for inner in discharge_caveats.iter() {
                if let Some(bind) = inner.as_any().downcast_ref::<BindToParentToken>() {
                    let digest = crypto::blake2b256(top.tail().as_bytes());
                    if digest[..16] != bind.tag[..] {
                        return Err(Error::bad_signature());
                    }
                }
            }
            THIRD_PARTY_RESOLVED.click();
            discharge_sets.push(discharge_caveats);
        }

        tail = crypto::step(&tail, &canonical);
        verified.push_boxed(caveat.clone_box());
    }

    if !crypto::mem_eq(&tail.as_bytes()[..], &m.tail().as_bytes()[..]) {
        FIRST_PARTY_BAD_SIGNATURE.click();
        return Err(Error::bad_signature());
    }
    FIRST_PARTY_VERIFIED.click();

    for set in discharge_sets {
        verified.extend(set);
    }
    Ok(verified)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{Access, ActionMask};
    use crate::builtin::{Action, IsUser, ValidityWindow};

    #[derive(Debug)]
    struct FakeAccess {
        now: u64,
        action: Option<ActionMask>,
    }

    impl Access for FakeAccess {
        fn now(&self) -> u64 {
            self.now
        }

        fn action(&self) -> Option<ActionMask> {
            self.action
        }
    }

    #[test]
    fn chain_scenario() {
        let key = SigningKey::generate();
        let mut m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        m.add(ValidityWindow::new(100, 200)).unwrap();

        let verified = verify(&m, &key, &[], &HashMap::new()).unwrap();
        assert!(verified
            .validate(&FakeAccess { now: 150, action: None })
            .is_ok());
        let err = verified
            .validate(&FakeAccess { now: 201, action: None })
            .unwrap_err();
        assert!(matches!(err, Error::UnauthorizedForAction { .. }));
    }

    #[test]
    fn action_narrowing_scenario() {
        let key = SigningKey::generate();
        let mut m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        m.add(Action::new(ActionMask::from_letters("rw").unwrap())).unwrap();
        let verified = verify(&m, &key, &[], &HashMap::new()).unwrap();
        assert!(verified
            .validate(&FakeAccess { now: 0, action: Some(ActionMask::WRITE) })
            .is_ok());
        assert!(verified
            .validate(&FakeAccess { now: 0, action: Some(ActionMask::CREATE) })
            .is_err());
    }

    #[test]
    fn tampered_tail_is_rejected() {
        let key = SigningKey::generate();
        let mut m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        m.add(ValidityWindow::new(0, u64::MAX)).unwrap();
        let other_key = SigningKey::generate();
        assert!(verify(&m, &other_key, &[], &HashMap::new()).is_err());
    }

    #[test]
    fn third_party_success_and_missing_discharge() {
        let key = SigningKey::generate();
        let tp_key = EncryptionKey::generate();
        let mut m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        let ticket = m.add_3p(&tp_key, "auth", CaveatSet::new()).unwrap();

        let (inner_caveats, mut dm) = crate::thirdparty::open_ticket(&tp_key, "auth", &ticket).unwrap();
        assert_eq!(0, inner_caveats.len());
        dm.finalize_with([Box::new(IsUser::new("u-123")) as Box<dyn crate::caveat::Caveat>])
            .unwrap();

        let mut tp_keys = HashMap::new();
        tp_keys.insert("auth".to_owned(), vec![tp_key.clone()]);

        let verified = verify(&m, &key, &[dm.clone()], &tp_keys).unwrap();
        let users = verified.get_caveats::<IsUser>();
        assert_eq!(1, users.len());
        assert_eq!("u-123", users[0].user_id);

        // Missing discharge.
        assert!(verify(&m, &key, &[], &tp_keys).is_err());
    }

    #[test]
    fn bind_to_parent_token_accepts_matching_tag_rejects_mismatch() {
        use crate::builtin::BindToParentToken;

        let key = SigningKey::generate();
        let tp_key = EncryptionKey::generate();
        let mut m = Macaroon::new(b"k1".to_vec(), "svc", &key);
        let ticket = m.add_3p(&tp_key, "auth", CaveatSet::new()).unwrap();
        let tag = m.bind_tag();

        let (_, mut dm) = crate::thirdparty::open_ticket(&tp_key, "auth", &ticket).unwrap();
        dm.finalize_with([
            Box::new(BindToParentToken::new(tag)) as Box<dyn crate::caveat::Caveat>,
            Box::new(IsUser::new("u-123")) as Box<dyn crate::caveat::Caveat>,
        ])
        .unwrap();

        let mut tp_keys = HashMap::new();
        tp_keys.insert("auth".to_owned(), vec![tp_key.clone()]);

        let verified = verify(&m, &key, &[dm.clone()], &tp_keys).unwrap();
        assert_eq!(1, verified.get_caveats::<IsUser>().len());

        // A discharge bound to a different permission token's tag must be rejected.
        let other = Macaroon::new(b"k2".to_vec(), "svc", &SigningKey::generate());
        let wrong_tag = other.bind_tag();
        let (_, mut mismatched) = crate::thirdparty::open_ticket(&tp_key, "auth", &ticket).unwrap();
        mismatched
            .finalize_with([
                Box::new(BindToParentToken::new(wrong_tag)) as Box<dyn crate::caveat::Caveat>,
                Box::new(IsUser::new("u-123")) as Box<dyn crate::caveat::Caveat>,
            ])
            .unwrap();
        let err = verify(&m, &key, &[mismatched], &tp_keys).unwrap_err();
        assert!(matches!(err, Error::BadSignature { .. }));
    }
}
