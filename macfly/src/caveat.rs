//! The caveat framework: the [Caveat] trait, the process-wide type registry, and [CaveatSet],
//! the ordered, canonically-encodable container every [crate::macaroon::Macaroon] carries.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Mutex, OnceLock};

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::access::Access;
use crate::codec;
use crate::error::Error;

/////////////////////////////////////////////// CaveatType ///////////////////////////////////////////

/// Which of the three numeric ranges a [CaveatType] falls in, plus the `Unregistered` sentinel.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum CaveatTypeClass {
    /// `< 2^32`. Reserved for this crate's own built-in caveats.
    Reserved,
    /// `2^32..2^48`. Open for any caller to register a caveat type in.
    Global,
    /// `2^48..2^64-1`. Intended for caveat types local to a single deployment.
    Local,
    /// `2^64-1` exactly. Never registrable; used to tag a caveat this process cannot construct.
    Unregistered,
}

const RESERVED_UPPER: u64 = 1u64 << 32;
const GLOBAL_UPPER: u64 = 1u64 << 48;

/// A caveat's numeric type identifier. See [CaveatTypeClass] for the three legal ranges.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct CaveatType(pub u64);

impl CaveatType {
    pub const UNREGISTERED: CaveatType = CaveatType(u64::MAX);

    pub fn class(&self) -> CaveatTypeClass {
        match self.0 {
            u64::MAX => CaveatTypeClass::Unregistered,
            x if x < RESERVED_UPPER => CaveatTypeClass::Reserved,
            x if x < GLOBAL_UPPER => CaveatTypeClass::Global,
            _ => CaveatTypeClass::Local,
        }
    }
}

/////////////////////////////////////////////// Caveat ///////////////////////////////////////////////

/// A typed predicate on an [Access]. Implementors are registered with the process-wide
/// [registry] so that wire bytes and JSON can be decoded back into the concrete type.
pub trait Caveat: Debug + Send + Sync {
    /// This caveat's numeric type, used in the canonical binary form and for registry lookup.
    fn type_id(&self) -> CaveatType;

    /// This caveat's human name, used as the `"type"` field in the JSON form.
    fn name(&self) -> &'static str;

    /// Attestation caveats assert a fact rather than forbidding access; legal only inside a
    /// finalized discharge. Metadata-only caveats (e.g. `IsUser`) are attestations whose
    /// `prohibits` always succeeds.
    fn is_attestation(&self) -> bool {
        false
    }

    /// Evaluate this caveat against `access`. `Ok(())` means the caveat does not prohibit the
    /// access; any `Err` does.
    fn prohibits(&self, access: &dyn Access) -> Result<(), Error>;

    /// The caveat's body in the canonical binary codec (fields packed positionally, no tags).
    fn pack_body(&self) -> Vec<u8>;

    /// The caveat's body for the JSON form (just the `"body"` value; the envelope's `"type"` is
    /// added by [CaveatSet::to_json]).
    fn to_json_body(&self) -> serde_json::Value;

    /// If this caveat wraps a nested [CaveatSet] (currently only [crate::builtin::IfPresent]),
    /// expose it for read-only traversal (key filters, attenuation analysis).
    fn unwrap(&self) -> Option<&CaveatSet> {
        None
    }

    fn clone_box(&self) -> Box<dyn Caveat>;

    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn Caveat> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

////////////////////////////////////////// UnregisteredCaveat ////////////////////////////////////////

/// A caveat whose binary type-id this process does not recognize. Preserves the type id and raw
/// body bytes so the token can still be re-encoded and forwarded unchanged; `prohibits` always
/// fails closed, since this process cannot know what the caveat actually means.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnregisteredCaveat {
    pub type_id: u64,
    pub body: Vec<u8>,
}

impl Caveat for UnregisteredCaveat {
    fn type_id(&self) -> CaveatType {
        CaveatType(self.type_id)
    }

    fn name(&self) -> &'static str {
        "unregistered"
    }

    fn prohibits(&self, _access: &dyn Access) -> Result<(), Error> {
        Err(Error::bad_caveat(format!(
            "unregistered caveat type {}",
            self.type_id
        )))
    }

    fn pack_body(&self) -> Vec<u8> {
        self.body.clone()
    }

    fn to_json_body(&self) -> serde_json::Value {
        serde_json::json!({ "base64": STANDARD.encode(&self.body) })
    }

    fn clone_box(&self) -> Box<dyn Caveat> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A caveat whose JSON `"type"` name this process does not recognize. Keeps the original name
/// and body value verbatim so it can be re-marshaled unchanged (P3); it has no binary type id to
/// encode under, so it cannot be packed to the wire form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnregisteredJsonCaveat {
    pub type_name: String,
    pub body: serde_json::Value,
}

impl Caveat for UnregisteredJsonCaveat {
    fn type_id(&self) -> CaveatType {
        CaveatType::UNREGISTERED
    }

    fn name(&self) -> &'static str {
        "unregistered"
    }

    fn prohibits(&self, _access: &dyn Access) -> Result<(), Error> {
        Err(Error::bad_caveat(format!(
            "unregistered caveat name {:?}",
            self.type_name
        )))
    }

    fn pack_body(&self) -> Vec<u8> {
        Vec::new()
    }

    fn to_json_body(&self) -> serde_json::Value {
        self.body.clone()
    }

    fn clone_box(&self) -> Box<dyn Caveat> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/////////////////////////////////////////////// registry /////////////////////////////////////////////

pub(crate) type FromBytes = fn(&[u8]) -> Result<Box<dyn Caveat>, Error>;
pub(crate) type FromJson = fn(&serde_json::Value) -> Result<Box<dyn Caveat>, Error>;

#[derive(Clone, Copy)]
struct RegistryEntry {
    type_id: u64,
    name: &'static str,
    from_bytes: FromBytes,
    from_json: FromJson,
}

#[derive(Default)]
struct Registry {
    by_type: HashMap<u64, RegistryEntry>,
    by_name: HashMap<&'static str, u64>,
}

impl Registry {
    fn insert(&mut self, entry: RegistryEntry) {
        if self.by_type.contains_key(&entry.type_id) {
            panic!(
                "macfly: caveat type {} registered more than once",
                entry.type_id
            );
        }
        if self.by_name.contains_key(entry.name) {
            panic!(
                "macfly: caveat name {:?} registered more than once",
                entry.name
            );
        }
        self.by_name.insert(entry.name, entry.type_id);
        self.by_type.insert(entry.type_id, entry);
    }

    fn alias(&mut self, alias: &'static str, type_id: u64) {
        if !self.by_type.contains_key(&type_id) {
            panic!("macfly: alias {alias:?} refers to unregistered type {type_id}");
        }
        if self.by_name.contains_key(alias) {
            panic!("macfly: alias {alias:?} collides with an existing name or alias");
        }
        self.by_name.insert(alias, type_id);
    }
}

// A `Mutex`-guarded builder is populated (built-ins first, then any caller registrations) up
// until the first real lookup. That lookup freezes the builder into `FROZEN`, a `OnceLock` that
// every later read goes through lock-free, matching "initialized during process start...read-only
// thereafter...lock-free" (spec.md §5) without needing an `RwLock`.
static BUILDER: Mutex<Option<Registry>> = Mutex::new(None);
static FROZEN: OnceLock<Registry> = OnceLock::new();

fn with_builder<F: FnOnce(&mut Registry)>(f: F) {
    let mut guard = BUILDER.lock().expect("registry builder mutex poisoned");
    ensure_builtins(&mut guard);
    if let Some(registry) = guard.as_mut() {
        f(registry);
    }
}

fn ensure_builtins(guard: &mut Option<Registry>) {
    if guard.is_none() {
        let mut registry = Registry::default();
        crate::builtin::register_all(&mut |type_id, name, from_bytes, from_json| {
            registry.insert(RegistryEntry {
                type_id,
                name,
                from_bytes,
                from_json,
            })
        });
        *guard = Some(registry);
    }
}

/// Register a new caveat type. Must be called before the first caveat is decoded or looked up by
/// name; panics (rather than silently overwriting) on a type-id or name collision, per spec.md
/// §9's "collision detection must be loud" design note.
pub fn register(
    type_id: CaveatType,
    name: &'static str,
    from_bytes: FromBytes,
    from_json: FromJson,
) {
    if FROZEN.get().is_some() {
        panic!("macfly: cannot register caveat type {name:?} after the registry has been read");
    }
    with_builder(|registry| {
        registry.insert(RegistryEntry {
            type_id: type_id.0,
            name,
            from_bytes,
            from_json,
        })
    });
}

/// Register `alias` as an additional JSON name for an already-registered caveat type, so a
/// renamed caveat can still read tokens minted under its old name.
pub fn register_alias(alias: &'static str, type_id: CaveatType) {
    if FROZEN.get().is_some() {
        panic!("macfly: cannot register alias {alias:?} after the registry has been read");
    }
    with_builder(|registry| registry.alias(alias, type_id.0));
}

fn registry() -> &'static Registry {
    FROZEN.get_or_init(|| {
        let mut guard = BUILDER.lock().expect("registry builder mutex poisoned");
        ensure_builtins(&mut guard);
        guard.take().expect("registry builder populated above")
    })
}

fn construct_from_bytes(type_id: u64, body: &[u8]) -> Result<Box<dyn Caveat>, Error> {
    match registry().by_type.get(&type_id) {
        Some(entry) => (entry.from_bytes)(body),
        None => Ok(Box::new(UnregisteredCaveat {
            type_id,
            body: body.to_vec(),
        })),
    }
}

fn construct_from_json(name: &str, body: &serde_json::Value) -> Result<Box<dyn Caveat>, Error> {
    match registry().by_name.get(name) {
        Some(type_id) => {
            let entry = registry()
                .by_type
                .get(type_id)
                .expect("by_name always points at a live by_type entry");
            (entry.from_json)(body)
        }
        None => Ok(Box::new(UnregisteredJsonCaveat {
            type_name: name.to_owned(),
            body: body.clone(),
        })),
    }
}

fn name_for(type_id: CaveatType) -> &'static str {
    registry()
        .by_type
        .get(&type_id.0)
        .map(|e| e.name)
        .unwrap_or("unregistered")
}

/////////////////////////////////////////////// CaveatSet ////////////////////////////////////////////

/// An ordered sequence of caveats, with a canonical binary encoding (a count-prefixed array of
/// `(type_id, length-prefixed body)` pairs) and a JSON encoding (an array of `{"type", "body"}`
/// envelopes).
#[derive(Default)]
pub struct CaveatSet {
    caveats: Vec<Box<dyn Caveat>>,
}

impl Clone for CaveatSet {
    fn clone(&self) -> Self {
        CaveatSet {
            caveats: self.caveats.iter().map(|c| c.clone_box()).collect(),
        }
    }
}

impl Debug for CaveatSet {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_list().entries(self.caveats.iter()).finish()
    }
}

impl CaveatSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, caveat: impl Caveat + 'static) {
        self.caveats.push(Box::new(caveat));
    }

    pub fn push_boxed(&mut self, caveat: Box<dyn Caveat>) {
        self.caveats.push(caveat);
    }

    pub fn extend(&mut self, other: CaveatSet) {
        self.caveats.extend(other.caveats);
    }

    pub fn len(&self) -> usize {
        self.caveats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caveats.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Caveat> {
        self.caveats.iter().map(|c| c.as_ref())
    }

    /// Project onto caveats of a single concrete registered type, in appearance order.
    pub fn get_caveats<T: Caveat + 'static>(&self) -> Vec<&T> {
        self.caveats
            .iter()
            .filter_map(|c| c.as_any().downcast_ref::<T>())
            .collect()
    }

    /// Run every caveat's `prohibits` in order; the first failure is the result. This is the
    /// general-purpose entry point domain callers use after a successful [crate::verify::verify].
    pub fn validate(&self, access: &dyn Access) -> Result<(), Error> {
        for caveat in &self.caveats {
            caveat.prohibits(access)?;
        }
        Ok(())
    }

    /////////////////////////////////////////// binary codec ///////////////////////////////////////

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::pack_u64(&mut out, self.caveats.len() as u64);
        for caveat in &self.caveats {
            codec::pack_u64(&mut out, caveat.type_id().0);
            codec::pack_bytes(&mut out, &caveat.pack_body());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let (count, mut rest) = codec::unpack_u64(buf)?;
        let mut caveats = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (type_id, r) = codec::unpack_u64(rest)?;
            let (body, r) = codec::unpack_bytes(r)?;
            caveats.push(construct_from_bytes(type_id, body)?);
            rest = r;
        }
        if !rest.is_empty() {
            return Err(Error::bad_token("trailing bytes after caveat set"));
        }
        Ok(CaveatSet { caveats })
    }

    //////////////////////////////////////////// JSON codec /////////////////////////////////////////

    pub fn to_json(&self) -> serde_json::Value {
        let items: Vec<serde_json::Value> = self
            .caveats
            .iter()
            .map(|c| {
                let type_field = if c.type_id() == CaveatType::UNREGISTERED {
                    if let Some(u) = c.as_any().downcast_ref::<UnregisteredJsonCaveat>() {
                        serde_json::Value::String(u.type_name.clone())
                    } else {
                        serde_json::Value::from(c.type_id().0)
                    }
                } else if let Some(u) = c.as_any().downcast_ref::<UnregisteredCaveat>() {
                    serde_json::Value::from(u.type_id)
                } else {
                    serde_json::Value::String(name_for(c.type_id()).to_owned())
                };
                serde_json::json!({ "type": type_field, "body": c.to_json_body() })
            })
            .collect();
        serde_json::Value::Array(items)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, Error> {
        let items = value
            .as_array()
            .ok_or_else(|| Error::bad_token("caveat set JSON must be an array"))?;
        let mut caveats = Vec::with_capacity(items.len());
        for item in items {
            let obj = item
                .as_object()
                .ok_or_else(|| Error::bad_token("caveat envelope must be an object"))?;
            let body = obj
                .get("body")
                .ok_or_else(|| Error::bad_token("caveat envelope missing \"body\""))?;
            let type_field = obj
                .get("type")
                .ok_or_else(|| Error::bad_token("caveat envelope missing \"type\""))?;
            let caveat = match type_field {
                serde_json::Value::String(name) => construct_from_json(name, body)?,
                serde_json::Value::Number(n) => {
                    let type_id = n
                        .as_u64()
                        .ok_or_else(|| Error::bad_token("numeric caveat type must be a u64"))?;
                    match registry().by_type.get(&type_id) {
                        Some(entry) => (entry.from_json)(body)?,
                        None => Box::new(UnregisteredJsonCaveat {
                            type_name: type_id.to_string(),
                            body: body.clone(),
                        }),
                    }
                }
                _ => return Err(Error::bad_token("caveat \"type\" must be a string or number")),
            };
            caveats.push(caveat);
        }
        Ok(CaveatSet { caveats })
    }
}

impl FromIterator<Box<dyn Caveat>> for CaveatSet {
    fn from_iter<I: IntoIterator<Item = Box<dyn Caveat>>>(iter: I) -> Self {
        CaveatSet {
            caveats: iter.into_iter().collect(),
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::ValidityWindow;

    #[test]
    fn empty_set_round_trips() {
        let cs = CaveatSet::new();
        let encoded = cs.encode();
        let decoded = CaveatSet::decode(&encoded).unwrap();
        assert_eq!(0, decoded.len());
    }

    #[test]
    fn validity_window_binary_round_trip() {
        let mut cs = CaveatSet::new();
        cs.push(ValidityWindow::new(100, 200));
        let encoded = cs.encode();
        let decoded = CaveatSet::decode(&encoded).unwrap();
        assert_eq!(1, decoded.len());
        let windows = decoded.get_caveats::<ValidityWindow>();
        assert_eq!(1, windows.len());
        assert_eq!((100, 200), (windows[0].not_before, windows[0].not_after));
    }

    #[test]
    fn validity_window_json_round_trip() {
        let mut cs = CaveatSet::new();
        cs.push(ValidityWindow::new(100, 200));
        let json = cs.to_json();
        let decoded = CaveatSet::from_json(&json).unwrap();
        assert_eq!(json, decoded.to_json());
    }

    #[test]
    fn unknown_binary_type_round_trips_as_unregistered() {
        let mut out = Vec::new();
        codec::pack_u64(&mut out, 1);
        codec::pack_u64(&mut out, (1u64 << 40) | 7);
        codec::pack_bytes(&mut out, b"opaque-body");
        let decoded = CaveatSet::decode(&out).unwrap();
        assert_eq!(out, decoded.encode());
        let unregistered = decoded.get_caveats::<UnregisteredCaveat>();
        assert_eq!(1, unregistered.len());
        assert_eq!(b"opaque-body".as_slice(), unregistered[0].body.as_slice());
    }

    #[test]
    fn unknown_json_name_round_trips() {
        let json = serde_json::json!([{ "type": "SomeFutureThing", "body": {"x": 1} }]);
        let decoded = CaveatSet::from_json(&json).unwrap();
        assert_eq!(json, decoded.to_json());
    }

    #[test]
    fn registered_type_has_a_name_in_json() {
        let mut cs = CaveatSet::new();
        cs.push(ValidityWindow::new(1, 2));
        let json = cs.to_json();
        assert_eq!("validity-window", json[0]["type"]);
    }
}
