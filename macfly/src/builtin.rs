//! The reserved-range caveats every deployment gets for free, plus the `ResourceSet` helper
//! mechanism. None of these know anything about a specific platform's nouns (apps, machines,
//! organizations); they operate purely on the capability surface [crate::access::Access] exposes.

use std::any::Any;
use std::fmt::Debug;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::access::{Access, ActionMask, ResourceValue};
use crate::caveat::{Caveat, CaveatSet, CaveatType, FromBytes, FromJson};
use crate::codec;
use crate::error::Error;

// Reserved type-ids. `< 2^32`, per spec.md §3/§4.2's three-range scheme.
const TYPE_VALIDITY_WINDOW: u64 = 1;
const TYPE_ACTION: u64 = 2;
const TYPE_CAVEAT_3P: u64 = 3;
const TYPE_BIND_TO_PARENT: u64 = 4;
const TYPE_IF_PRESENT: u64 = 5;
const TYPE_IS_USER: u64 = 6;

pub(crate) fn register_all(
    register: &mut dyn FnMut(u64, &'static str, FromBytes, FromJson),
) {
    register(
        TYPE_VALIDITY_WINDOW,
        "validity-window",
        ValidityWindow::from_bytes,
        ValidityWindow::from_json,
    );
    register(TYPE_ACTION, "action", Action::from_bytes, Action::from_json);
    register(
        TYPE_CAVEAT_3P,
        "third-party",
        Caveat3P::from_bytes,
        Caveat3P::from_json,
    );
    register(
        TYPE_BIND_TO_PARENT,
        "bind-to-parent-token",
        BindToParentToken::from_bytes,
        BindToParentToken::from_json,
    );
    register(
        TYPE_IF_PRESENT,
        "if-present",
        IfPresent::from_bytes,
        IfPresent::from_json,
    );
    register(TYPE_IS_USER, "is-user", IsUser::from_bytes, IsUser::from_json);
}

/////////////////////////////////////////////// ValidityWindow //////////////////////////////////////

/// Fails unless `access.now()` falls within `[not_before, not_after]`, inclusive on both ends.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct ValidityWindow {
    pub not_before: u64,
    pub not_after: u64,
}

impl ValidityWindow {
    pub fn new(not_before: u64, not_after: u64) -> Self {
        Self { not_before, not_after }
    }

    fn from_bytes(body: &[u8]) -> Result<Box<dyn Caveat>, Error> {
        let (not_before, rest) = codec::unpack_u64(body)?;
        let (not_after, rest) = codec::unpack_u64(rest)?;
        if !rest.is_empty() {
            return Err(Error::bad_token("trailing bytes in validity-window body"));
        }
        Ok(Box::new(ValidityWindow { not_before, not_after }))
    }

    fn from_json(body: &serde_json::Value) -> Result<Box<dyn Caveat>, Error> {
        let not_before = body["not_before"]
            .as_u64()
            .ok_or_else(|| Error::bad_token("validity-window.not_before must be a u64"))?;
        let not_after = body["not_after"]
            .as_u64()
            .ok_or_else(|| Error::bad_token("validity-window.not_after must be a u64"))?;
        Ok(Box::new(ValidityWindow { not_before, not_after }))
    }
}

impl Caveat for ValidityWindow {
    fn type_id(&self) -> CaveatType {
        CaveatType(TYPE_VALIDITY_WINDOW)
    }

    fn name(&self) -> &'static str {
        "validity-window"
    }

    fn prohibits(&self, access: &dyn Access) -> Result<(), Error> {
        let now = access.now();
        if now < self.not_before || now > self.not_after {
            return Err(Error::unauthorized_for_action(format!(
                "now={now} outside [{}, {}]",
                self.not_before, self.not_after
            )));
        }
        Ok(())
    }

    fn pack_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::pack_u64(&mut out, self.not_before);
        codec::pack_u64(&mut out, self.not_after);
        out
    }

    fn to_json_body(&self) -> serde_json::Value {
        serde_json::json!({ "not_before": self.not_before, "not_after": self.not_after })
    }

    fn clone_box(&self) -> Box<dyn Caveat> {
        Box::new(*self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/////////////////////////////////////////////// Action ///////////////////////////////////////////////

/// Fails unless `access.action()` is a subset of this caveat's mask.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Action(pub ActionMask);

impl Action {
    pub fn new(mask: ActionMask) -> Self {
        Self(mask)
    }

    fn from_bytes(body: &[u8]) -> Result<Box<dyn Caveat>, Error> {
        let (bits, rest) = codec::unpack_u64(body)?;
        if !rest.is_empty() {
            return Err(Error::bad_token("trailing bytes in action body"));
        }
        Ok(Box::new(Action(ActionMask(bits as u32))))
    }

    fn from_json(body: &serde_json::Value) -> Result<Box<dyn Caveat>, Error> {
        let letters = body
            .as_str()
            .ok_or_else(|| Error::bad_token("action body must be a string"))?;
        Ok(Box::new(Action(ActionMask::from_letters(letters)?)))
    }
}

impl Caveat for Action {
    fn type_id(&self) -> CaveatType {
        CaveatType(TYPE_ACTION)
    }

    fn name(&self) -> &'static str {
        "action"
    }

    fn prohibits(&self, access: &dyn Access) -> Result<(), Error> {
        let requested = access
            .action()
            .ok_or_else(|| Error::invalid_access("action caveat needs access.action()"))?;
        if !requested.is_subset_of(self.0) {
            return Err(Error::unauthorized_for_action(format!(
                "requested {:?} not subset of {:?}",
                requested.to_letters(),
                self.0.to_letters()
            )));
        }
        Ok(())
    }

    fn pack_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::pack_u64(&mut out, self.0 .0 as u64);
        out
    }

    fn to_json_body(&self) -> serde_json::Value {
        serde_json::Value::String(self.0.to_letters())
    }

    fn clone_box(&self) -> Box<dyn Caveat> {
        Box::new(*self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/////////////////////////////////////////////// Caveat3P /////////////////////////////////////////////

/// Delegates judgment to a named third party: `location` identifies who must discharge it,
/// `verifier_key` is the discharge key sealed under the *current* tail (recoverable by anyone who
/// has walked the chain that far), `ticket` is the discharge key plus nested caveats sealed under
/// the third party's own key. Resolution happens in [crate::verify]; `prohibits` here only runs
/// once a matching discharge has already been folded into the verified set, so it is a no-op.
#[derive(Clone, Eq, PartialEq)]
pub struct Caveat3P {
    pub location: String,
    pub verifier_key: Vec<u8>,
    pub ticket: Vec<u8>,
}

impl Debug for Caveat3P {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Caveat3P")
            .field("location", &self.location)
            .field("verifier_key", &format!("{} bytes", self.verifier_key.len()))
            .field("ticket", &format!("{} bytes", self.ticket.len()))
            .finish()
    }
}

impl Caveat3P {
    fn from_bytes(body: &[u8]) -> Result<Box<dyn Caveat>, Error> {
        let (location, rest) = codec::unpack_str(body)?;
        let (verifier_key, rest) = codec::unpack_bytes(rest)?;
        let (ticket, rest) = codec::unpack_bytes(rest)?;
        if !rest.is_empty() {
            return Err(Error::bad_token("trailing bytes in third-party body"));
        }
        Ok(Box::new(Caveat3P {
            location,
            verifier_key: verifier_key.to_vec(),
            ticket: ticket.to_vec(),
        }))
    }

    fn from_json(body: &serde_json::Value) -> Result<Box<dyn Caveat>, Error> {
        let location = body["location"]
            .as_str()
            .ok_or_else(|| Error::bad_token("third-party.location must be a string"))?
            .to_owned();
        let verifier_key = STANDARD
            .decode(
                body["verifier_key"]
                    .as_str()
                    .ok_or_else(|| Error::bad_token("third-party.verifier_key must be base64"))?,
            )
            .map_err(|e| Error::bad_token(format!("{e:?}")))?;
        let ticket = STANDARD
            .decode(
                body["ticket"]
                    .as_str()
                    .ok_or_else(|| Error::bad_token("third-party.ticket must be base64"))?,
            )
            .map_err(|e| Error::bad_token(format!("{e:?}")))?;
        Ok(Box::new(Caveat3P { location, verifier_key, ticket }))
    }
}

impl Caveat for Caveat3P {
    fn type_id(&self) -> CaveatType {
        CaveatType(TYPE_CAVEAT_3P)
    }

    fn name(&self) -> &'static str {
        "third-party"
    }

    fn prohibits(&self, _access: &dyn Access) -> Result<(), Error> {
        Ok(())
    }

    fn pack_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::pack_str(&mut out, &self.location);
        codec::pack_bytes(&mut out, &self.verifier_key);
        codec::pack_bytes(&mut out, &self.ticket);
        out
    }

    fn to_json_body(&self) -> serde_json::Value {
        serde_json::json!({
            "location": self.location,
            "verifier_key": STANDARD.encode(&self.verifier_key),
            "ticket": STANDARD.encode(&self.ticket),
        })
    }

    fn clone_box(&self) -> Box<dyn Caveat> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/////////////////////////////////////////// BindToParentToken ////////////////////////////////////////

/// Ties a discharge to the single permission token it was minted alongside. `tag` is the first 16
/// bytes of `blake2b256` of the permission token's (stored, final) tail — [Macaroon::bind_tag]
/// computes it for a 3P service to embed in the discharge it mints; [crate::verify] recomputes it
/// from the token actually being verified, since no caveat gets to see another token's tail through
/// the [Access] capability surface.
///
/// [Macaroon::bind_tag]: crate::macaroon::Macaroon::bind_tag
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct BindToParentToken {
    pub tag: [u8; 16],
}

impl BindToParentToken {
    pub fn new(tag: [u8; 16]) -> Self {
        Self { tag }
    }

    fn from_bytes(body: &[u8]) -> Result<Box<dyn Caveat>, Error> {
        let (bytes, rest) = codec::unpack_fixed(body, 16)?;
        if !rest.is_empty() {
            return Err(Error::bad_token("trailing bytes in bind-to-parent-token body"));
        }
        let mut tag = [0u8; 16];
        tag.copy_from_slice(bytes);
        Ok(Box::new(BindToParentToken { tag }))
    }

    fn from_json(body: &serde_json::Value) -> Result<Box<dyn Caveat>, Error> {
        let encoded = body
            .as_str()
            .ok_or_else(|| Error::bad_token("bind-to-parent-token body must be base64"))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::bad_token(format!("{e:?}")))?;
        if bytes.len() != 16 {
            return Err(Error::bad_token("bind-to-parent-token tag must be 16 bytes"));
        }
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&bytes);
        Ok(Box::new(BindToParentToken { tag }))
    }
}

impl Caveat for BindToParentToken {
    fn type_id(&self) -> CaveatType {
        CaveatType(TYPE_BIND_TO_PARENT)
    }

    fn name(&self) -> &'static str {
        "bind-to-parent-token"
    }

    fn prohibits(&self, _access: &dyn Access) -> Result<(), Error> {
        Ok(())
    }

    fn pack_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::pack_fixed(&mut out, &self.tag);
        out
    }

    fn to_json_body(&self) -> serde_json::Value {
        serde_json::Value::String(STANDARD.encode(self.tag))
    }

    fn clone_box(&self) -> Box<dyn Caveat> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/////////////////////////////////////////////// IfPresent ////////////////////////////////////////////

/// `ifs` runs only when at least one of its inner caveats finds the resource it needs; otherwise
/// the caveat falls back to checking `access.action()` against `else_mask`. See spec.md §4.3.1;
/// this is the one operator subtle enough to deserve a dedicated algorithm rather than a single
/// `prohibits` body doing double duty.
#[derive(Clone)]
pub struct IfPresent {
    pub ifs: CaveatSet,
    pub else_mask: ActionMask,
}

impl Debug for IfPresent {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("IfPresent")
            .field("ifs", &self.ifs)
            .field("else_mask", &self.else_mask.to_letters())
            .finish()
    }
}

impl IfPresent {
    pub fn new(ifs: CaveatSet, else_mask: ActionMask) -> Self {
        Self { ifs, else_mask }
    }

    fn from_bytes(body: &[u8]) -> Result<Box<dyn Caveat>, Error> {
        let (else_bits, rest) = codec::unpack_u64(body)?;
        let (ifs_bytes, rest) = codec::unpack_bytes(rest)?;
        if !rest.is_empty() {
            return Err(Error::bad_token("trailing bytes in if-present body"));
        }
        let ifs = CaveatSet::decode(ifs_bytes)?;
        Ok(Box::new(IfPresent { ifs, else_mask: ActionMask(else_bits as u32) }))
    }

    fn from_json(body: &serde_json::Value) -> Result<Box<dyn Caveat>, Error> {
        let ifs = CaveatSet::from_json(
            body.get("ifs")
                .ok_or_else(|| Error::bad_token("if-present missing \"ifs\""))?,
        )?;
        let else_mask = ActionMask::from_letters(
            body["else"]
                .as_str()
                .ok_or_else(|| Error::bad_token("if-present.else must be a string"))?,
        )?;
        Ok(Box::new(IfPresent { ifs, else_mask }))
    }
}

impl Caveat for IfPresent {
    fn type_id(&self) -> CaveatType {
        CaveatType(TYPE_IF_PRESENT)
    }

    fn name(&self) -> &'static str {
        "if-present"
    }

    fn prohibits(&self, access: &dyn Access) -> Result<(), Error> {
        let mut relevant = false;
        let mut aggregate: Option<Error> = None;
        for inner in self.ifs.iter() {
            match inner.prohibits(access) {
                Ok(()) => relevant = true,
                Err(e) if e.is_resource_unspecified() => {}
                Err(e) => {
                    relevant = true;
                    aggregate = Some(match aggregate {
                        None => e,
                        Some(prior) => Error::bad_caveat(format!(
                            "{}; {}",
                            prior.long_form(),
                            e.long_form()
                        )),
                    });
                }
            }
        }
        if relevant {
            return match aggregate {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }
        let requested = access
            .action()
            .ok_or_else(|| Error::invalid_access("if-present else branch needs access.action()"))?;
        if requested.is_subset_of(self.else_mask) {
            Ok(())
        } else {
            Err(Error::unauthorized_for_action(format!(
                "requested {:?} not subset of else {:?}",
                requested.to_letters(),
                self.else_mask.to_letters()
            )))
        }
    }

    fn pack_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::pack_u64(&mut out, self.else_mask.0 as u64);
        codec::pack_bytes(&mut out, &self.ifs.encode());
        out
    }

    fn to_json_body(&self) -> serde_json::Value {
        serde_json::json!({ "ifs": self.ifs.to_json(), "else": self.else_mask.to_letters() })
    }

    fn unwrap(&self) -> Option<&CaveatSet> {
        Some(&self.ifs)
    }

    fn clone_box(&self) -> Box<dyn Caveat> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/////////////////////////////////////////////// IsUser ///////////////////////////////////////////////

/// Metadata-only attestation: asserts the discharge was issued for a particular user identifier
/// but never itself prohibits anything. Per the open question answered in SPEC_FULL.md §9: it
/// stays legal wherever attestations are legal, and its body is opaque to this crate.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct IsUser {
    pub user_id: String,
}

impl IsUser {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into() }
    }

    fn from_bytes(body: &[u8]) -> Result<Box<dyn Caveat>, Error> {
        let (user_id, rest) = codec::unpack_str(body)?;
        if !rest.is_empty() {
            return Err(Error::bad_token("trailing bytes in is-user body"));
        }
        Ok(Box::new(IsUser { user_id }))
    }

    fn from_json(body: &serde_json::Value) -> Result<Box<dyn Caveat>, Error> {
        let user_id = body
            .as_str()
            .ok_or_else(|| Error::bad_token("is-user body must be a string"))?
            .to_owned();
        Ok(Box::new(IsUser { user_id }))
    }
}

impl Caveat for IsUser {
    fn type_id(&self) -> CaveatType {
        CaveatType(TYPE_IS_USER)
    }

    fn name(&self) -> &'static str {
        "is-user"
    }

    fn is_attestation(&self) -> bool {
        true
    }

    fn prohibits(&self, _access: &dyn Access) -> Result<(), Error> {
        Ok(())
    }

    fn pack_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::pack_str(&mut out, &self.user_id);
        out
    }

    fn to_json_body(&self) -> serde_json::Value {
        serde_json::Value::String(self.user_id.clone())
    }

    fn clone_box(&self) -> Box<dyn Caveat> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/////////////////////////////////////////////// ResourceSet //////////////////////////////////////////

/// The bounded resource-set predicate described in spec.md §4.3 (C3). Not itself registered in
/// the caveat type registry: it is generic over the key type `K`, and a concrete `CaveatType`,
/// name, and `Access::resource(kind)` string belongs to the domain that instantiates it (e.g. an
/// `Apps` caveat wrapping `ResourceSet<u64>`), which is explicitly out of scope here (spec.md
/// §1). Callers wrap this in their own registered [Caveat] implementation; see the test below for
/// the shape such a wrapper takes.
pub trait ResourceKey: Clone + Eq + Ord + Debug {
    /// The wildcard key: its presence in a set means "any resource of this kind", and it is
    /// forbidden to coexist with any other key (spec.md scenario 6).
    fn zero() -> Self;

    fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    /// `true` if `self` (a key stored in the set) matches `candidate` (a key read off the
    /// access). Plain keys match by equality; a `Prefix` key matches everything it prefixes.
    fn matches(&self, candidate: &Self) -> bool;

    fn from_resource_value(value: &ResourceValue) -> Option<Self>;

    fn pack(&self, out: &mut Vec<u8>);
    fn unpack(buf: &[u8]) -> Result<(Self, &[u8]), Error>
    where
        Self: Sized;
}

impl ResourceKey for u64 {
    fn zero() -> Self {
        0
    }

    fn matches(&self, candidate: &Self) -> bool {
        self == candidate
    }

    fn from_resource_value(value: &ResourceValue) -> Option<Self> {
        match value {
            ResourceValue::Id(id) => Some(*id),
            ResourceValue::Path(_) => None,
        }
    }

    fn pack(&self, out: &mut Vec<u8>) {
        codec::pack_u64(out, *self);
    }

    fn unpack(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        codec::unpack_u64(buf)
    }
}

/// A prefix-matched path key, e.g. `"teams/eng/"` matching any path under it. The empty string is
/// this key type's wildcard. `match(other)` is `has_prefix(other, self)`, per spec.md §4.3.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct PrefixKey(pub String);

impl ResourceKey for PrefixKey {
    fn zero() -> Self {
        PrefixKey(String::new())
    }

    fn matches(&self, candidate: &Self) -> bool {
        candidate.0.starts_with(&self.0)
    }

    fn from_resource_value(value: &ResourceValue) -> Option<Self> {
        match value {
            ResourceValue::Path(p) => Some(PrefixKey(p.clone())),
            ResourceValue::Id(_) => None,
        }
    }

    fn pack(&self, out: &mut Vec<u8>) {
        codec::pack_str(out, &self.0);
    }

    fn unpack(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        let (s, rest) = codec::unpack_str(buf)?;
        Ok((PrefixKey(s), rest))
    }
}

#[derive(Clone, Debug)]
pub struct ResourceSet<K: ResourceKey> {
    entries: Vec<(K, ActionMask)>,
}

impl<K: ResourceKey> ResourceSet<K> {
    /// Build a resource set from `(key, mask)` pairs. Rejects a wildcard key coexisting with any
    /// non-wildcard key, per spec.md scenario 6.
    pub fn new(entries: Vec<(K, ActionMask)>) -> Result<Self, Error> {
        let has_zero = entries.iter().any(|(k, _)| k.is_zero());
        let has_nonzero = entries.iter().any(|(k, _)| !k.is_zero());
        if has_zero && has_nonzero {
            return Err(Error::bad_caveat(
                "wildcard key cannot coexist with explicit keys in a resource set",
            ));
        }
        Ok(ResourceSet { entries })
    }

    pub fn entries(&self) -> &[(K, ActionMask)] {
        &self.entries
    }

    /// Evaluate against a single resource kind's value and the requested action, per spec.md
    /// §4.3's `ResourceSet` row. `kind` is the string domain callers pass to
    /// `Access::resource(kind)`.
    pub fn prohibits(&self, access: &dyn Access, kind: &str) -> Result<(), Error> {
        let value = access
            .resource(kind)
            .ok_or_else(|| Error::resource_unspecified(kind.to_owned()))?;
        let candidate = K::from_resource_value(&value)
            .ok_or_else(|| Error::invalid_access(format!("resource {kind:?} has the wrong shape")))?;
        let mask = self
            .entries
            .iter()
            .find(|(k, _)| k.is_zero() || k.matches(&candidate))
            .map(|(_, mask)| *mask)
            .ok_or_else(|| Error::unauthorized_for_resource(format!("{candidate:?}")))?;
        let requested = access
            .action()
            .ok_or_else(|| Error::invalid_access("resource set needs access.action()"))?;
        if requested.is_subset_of(mask) {
            Ok(())
        } else {
            Err(Error::unauthorized_for_action(format!(
                "requested {:?} not subset of {:?}",
                requested.to_letters(),
                mask.to_letters()
            )))
        }
    }

    pub fn pack_body(&self, out: &mut Vec<u8>) {
        let mut packed: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(self.entries.len());
        for (k, mask) in &self.entries {
            let mut key_bytes = Vec::new();
            k.pack(&mut key_bytes);
            let mut mask_bytes = Vec::new();
            codec::pack_u64(&mut mask_bytes, mask.0 as u64);
            packed.push((key_bytes, mask_bytes));
        }
        codec::pack_sorted_map(out, packed);
    }

    pub fn unpack_body(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        let (pairs, rest) = codec::unpack_sorted_map(buf)?;
        let mut entries = Vec::with_capacity(pairs.len());
        for (key_bytes, mask_bytes) in pairs {
            let (key, key_rest) = K::unpack(&key_bytes)?;
            if !key_rest.is_empty() {
                return Err(Error::bad_token("trailing bytes in resource set key"));
            }
            let (mask_bits, mask_rest) = codec::unpack_u64(&mask_bytes)?;
            if !mask_rest.is_empty() {
                return Err(Error::bad_token("trailing bytes in resource set mask"));
            }
            entries.push((key, ActionMask(mask_bits as u32)));
        }
        let set = Self::new(entries)?;
        Ok((set, rest))
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FakeAccess {
        now: u64,
        action: Option<ActionMask>,
        parent: Option<u64>,
        child: Option<u64>,
        app: Option<u64>,
    }

    impl Access for FakeAccess {
        fn now(&self) -> u64 {
            self.now
        }

        fn action(&self) -> Option<ActionMask> {
            self.action
        }

        fn resource(&self, kind: &str) -> Option<ResourceValue> {
            match kind {
                "parent" => self.parent.map(ResourceValue::Id),
                "child" => self.child.map(ResourceValue::Id),
                "app" => self.app.map(ResourceValue::Id),
                _ => None,
            }
        }
    }

    fn access(now: u64, action: Option<ActionMask>) -> FakeAccess {
        FakeAccess { now, action, parent: None, child: None, app: None }
    }

    #[test]
    fn validity_window_scenario() {
        let window = ValidityWindow::new(100, 200);
        assert!(window.prohibits(&access(150, None)).is_ok());
        assert!(window.prohibits(&access(201, None)).is_err());
    }

    #[test]
    fn action_narrowing_scenario() {
        let caveat = Action::new(ActionMask::from_letters("rw").unwrap());
        assert!(caveat.prohibits(&access(0, Some(ActionMask::WRITE))).is_ok());
        assert!(caveat.prohibits(&access(0, Some(ActionMask::CREATE))).is_err());
    }

    /// Demonstrates instantiating the generic `ResourceSet<u64>` helper behind a local,
    /// registered caveat wrapper, the way a domain caller (out of scope here) would.
    #[derive(Clone, Debug)]
    struct Apps(ResourceSet<u64>);

    impl Caveat for Apps {
        fn type_id(&self) -> CaveatType {
            CaveatType(1u64 << 48)
        }

        fn name(&self) -> &'static str {
            "test-apps"
        }

        fn prohibits(&self, access: &dyn Access) -> Result<(), Error> {
            self.0.prohibits(access, "app")
        }

        fn pack_body(&self) -> Vec<u8> {
            let mut out = Vec::new();
            self.0.pack_body(&mut out);
            out
        }

        fn to_json_body(&self) -> serde_json::Value {
            serde_json::Value::Null
        }

        fn clone_box(&self) -> Box<dyn Caveat> {
            Box::new(self.clone())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn resource_set_wildcard_scenario() {
        let wildcard = Apps(ResourceSet::new(vec![(0, ActionMask::ALL)]).unwrap());
        let mut acc = access(0, Some(ActionMask::WRITE));
        acc.app = Some(7);
        assert!(wildcard.prohibits(&acc).is_ok());

        let conflict = ResourceSet::new(vec![
            (0, ActionMask::READ),
            (7, ActionMask::WRITE),
        ]);
        assert!(conflict.is_err());
    }

    #[test]
    fn resource_set_missing_resource_is_unspecified() {
        let set = Apps(ResourceSet::new(vec![(7, ActionMask::ALL)]).unwrap());
        let err = set.prohibits(&access(0, Some(ActionMask::READ))).unwrap_err();
        assert!(err.is_resource_unspecified());
    }

    #[test]
    fn if_present_scenario() {
        let parent = Action::new(ActionMask::from_letters("rwcd").unwrap());
        let mut child_set = CaveatSet::new();
        child_set.push(ChildAction(ActionMask::from_letters("rdC").unwrap()));
        let else_mask = ActionMask::from_letters("rc").unwrap();
        let if_present = IfPresent::new(child_set, else_mask);

        // access{parent:123, action:r} => Ok (else branch, r subset of r|c).
        let mut acc = FakeAccess { now: 0, action: Some(ActionMask::READ), parent: Some(123), child: None, app: None };
        assert!(parent.prohibits(&acc).is_ok());
        assert!(if_present.prohibits(&acc).is_ok());

        // access{parent:123, action:w} => UnauthorizedForAction, from IfPresent's else branch
        // (w is not a subset of r|c); Parent itself still allows w.
        acc.action = Some(ActionMask::WRITE);
        assert!(parent.prohibits(&acc).is_ok());
        assert!(if_present.prohibits(&acc).is_err());

        // access{parent:123, child:234, action:r|d} => Ok.
        acc.child = Some(234);
        acc.action = Some(ActionMask::READ.union(ActionMask::DELETE));
        assert!(parent.prohibits(&acc).is_ok());
        assert!(if_present.prohibits(&acc).is_ok());

        // access{parent:123, child:234, action:C} => UnauthorizedForAction (parent forbids it).
        acc.action = Some(ActionMask::CONTROL);
        assert!(parent.prohibits(&acc).is_err());
    }

    #[derive(Clone, Debug)]
    struct ChildAction(ActionMask);

    impl Caveat for ChildAction {
        fn type_id(&self) -> CaveatType {
            CaveatType((1u64 << 48) + 1)
        }

        fn name(&self) -> &'static str {
            "test-child-action"
        }

        fn prohibits(&self, access: &dyn Access) -> Result<(), Error> {
            if access.resource("child").is_none() {
                return Err(Error::resource_unspecified("child"));
            }
            let requested = access
                .action()
                .ok_or_else(|| Error::invalid_access("needs action"))?;
            if requested.is_subset_of(self.0) {
                Ok(())
            } else {
                Err(Error::unauthorized_for_action("child action exceeded"))
            }
        }

        fn pack_body(&self) -> Vec<u8> {
            Vec::new()
        }

        fn to_json_body(&self) -> serde_json::Value {
            serde_json::Value::Null
        }

        fn clone_box(&self) -> Box<dyn Caveat> {
            Box::new(self.clone())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn is_user_is_unconditionally_ok() {
        let caveat = IsUser::new("u-123");
        assert!(caveat.is_attestation());
        assert!(caveat.prohibits(&access(0, None)).is_ok());
    }
}
