//! End-to-end coverage of the six literal scenarios: minting, attenuating, third-party discharge,
//! and bundle validation against a small stand-in `Access`.

use std::collections::HashMap;

use macfly::{
    codec, Access, Action, ActionMask, CaveatSet, EncryptionKey, Error, IfPresent, IsUser,
    Macaroon, ResourceSet, ResourceValue, SigningKey, ValidityWindow,
};

#[derive(Debug, Default)]
struct TestAccess {
    now: u64,
    action: Option<ActionMask>,
    parent: Option<u64>,
    child: Option<u64>,
    app: Option<u64>,
}

impl Access for TestAccess {
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

#[test]
fn scenario_1_chain() {
    let key = SigningKey::generate();
    let mut m = Macaroon::new(b"K1".to_vec(), "svc", &key);
    m.add(ValidityWindow::new(100, 200)).unwrap();

    let verified = macfly::verify(&m, &key, &[], &HashMap::new()).unwrap();
    let ok = TestAccess { now: 150, ..Default::default() };
    assert!(verified.validate(&ok).is_ok());

    let expired = TestAccess { now: 201, ..Default::default() };
    let err = verified.validate(&expired).unwrap_err();
    assert!(matches!(err, Error::UnauthorizedForAction { .. }));
}

#[test]
fn scenario_2_action_narrowing() {
    let key = SigningKey::generate();
    let mut m = Macaroon::new(b"K1".to_vec(), "svc", &key);
    m.add(Action::new(ActionMask::from_letters("rw").unwrap())).unwrap();

    let verified = macfly::verify(&m, &key, &[], &HashMap::new()).unwrap();
    let write = TestAccess { action: Some(ActionMask::WRITE), ..Default::default() };
    assert!(verified.validate(&write).is_ok());

    let create = TestAccess { action: Some(ActionMask::CREATE), ..Default::default() };
    assert!(matches!(
        verified.validate(&create).unwrap_err(),
        Error::UnauthorizedForAction { .. }
    ));
}

#[test]
fn scenario_3_third_party_success() {
    let key = SigningKey::generate();
    let tp_key = EncryptionKey::generate();
    let mut m = Macaroon::new(b"K1".to_vec(), "svc", &key);
    let ticket = m.add_3p(&tp_key, "auth", CaveatSet::new()).unwrap();

    // The client hands `ticket` to the 3P; the 3P opens it, evaluates its (empty) inner caveats,
    // appends an attestation, and finalizes the discharge.
    let (inner, mut dm) = macfly::open_ticket(&tp_key, "auth", &ticket).unwrap();
    assert!(inner.is_empty());
    dm.finalize_with([Box::new(IsUser::new("123")) as Box<dyn macfly::Caveat>])
        .unwrap();

    let mut tp_keys = HashMap::new();
    tp_keys.insert("auth".to_owned(), vec![tp_key]);
    let verified = macfly::verify(&m, &key, std::slice::from_ref(&dm), &tp_keys).unwrap();
    let users = verified.get_caveats::<IsUser>();
    assert_eq!(1, users.len());
    assert_eq!("123", users[0].user_id);
}

#[test]
fn scenario_4_third_party_missing_discharge() {
    let key = SigningKey::generate();
    let tp_key = EncryptionKey::generate();
    let mut m = Macaroon::new(b"K1".to_vec(), "svc", &key);
    m.add_3p(&tp_key, "auth", CaveatSet::new()).unwrap();

    let mut tp_keys = HashMap::new();
    tp_keys.insert("auth".to_owned(), vec![tp_key]);
    let err = macfly::verify(&m, &key, &[], &tp_keys).unwrap_err();
    assert!(matches!(err, Error::DischargeMissing { .. }));
}

#[test]
fn scenario_5_if_present_else() {
    // [Parent(r|w|c|d, 123), IfPresent{ifs: [Child(r|d|C, 234)], else: r|c}]
    let key = SigningKey::generate();
    let mut m = Macaroon::new(b"K1".to_vec(), "svc", &key);
    m.add(ParentAction(ActionMask::from_letters("rwcd").unwrap())).unwrap();
    let mut ifs = CaveatSet::new();
    ifs.push(ChildAction(ActionMask::from_letters("rdC").unwrap()));
    m.add(IfPresent::new(ifs, ActionMask::from_letters("rc").unwrap())).unwrap();

    let verified = macfly::verify(&m, &key, &[], &HashMap::new()).unwrap();

    let a1 = TestAccess { parent: Some(123), action: Some(ActionMask::READ), ..Default::default() };
    assert!(verified.validate(&a1).is_ok());

    let a2 = TestAccess { parent: Some(123), action: Some(ActionMask::WRITE), ..Default::default() };
    assert!(matches!(
        verified.validate(&a2).unwrap_err(),
        Error::UnauthorizedForAction { .. }
    ));

    let a3 = TestAccess {
        parent: Some(123),
        child: Some(234),
        action: Some(ActionMask::READ.union(ActionMask::DELETE)),
        ..Default::default()
    };
    assert!(verified.validate(&a3).is_ok());

    let a4 = TestAccess {
        parent: Some(123),
        child: Some(234),
        action: Some(ActionMask::CONTROL),
        ..Default::default()
    };
    assert!(matches!(
        verified.validate(&a4).unwrap_err(),
        Error::UnauthorizedForAction { .. }
    ));
}

#[derive(Clone, Debug)]
struct ParentAction(ActionMask);

impl macfly::Caveat for ParentAction {
    fn type_id(&self) -> macfly::CaveatType {
        macfly::CaveatType((1u64 << 48) + 10)
    }

    fn name(&self) -> &'static str {
        "test-parent-action"
    }

    fn prohibits(&self, access: &dyn Access) -> Result<(), Error> {
        if access.resource("parent").is_none() {
            return Err(Error::resource_unspecified("parent"));
        }
        let requested = access.action().ok_or_else(|| Error::invalid_access("needs action"))?;
        if requested.is_subset_of(self.0) {
            Ok(())
        } else {
            Err(Error::unauthorized_for_action("parent action exceeded"))
        }
    }

    fn pack_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::pack_u64(&mut out, self.0 .0 as u64);
        out
    }

    fn to_json_body(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn clone_box(&self) -> Box<dyn macfly::Caveat> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Clone, Debug)]
struct ChildAction(ActionMask);

impl macfly::Caveat for ChildAction {
    fn type_id(&self) -> macfly::CaveatType {
        macfly::CaveatType((1u64 << 48) + 11)
    }

    fn name(&self) -> &'static str {
        "test-child-action"
    }

    fn prohibits(&self, access: &dyn Access) -> Result<(), Error> {
        if access.resource("child").is_none() {
            return Err(Error::resource_unspecified("child"));
        }
        let requested = access.action().ok_or_else(|| Error::invalid_access("needs action"))?;
        if requested.is_subset_of(self.0) {
            Ok(())
        } else {
            Err(Error::unauthorized_for_action("child action exceeded"))
        }
    }

    fn pack_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        codec::pack_u64(&mut out, self.0 .0 as u64);
        out
    }

    fn to_json_body(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn clone_box(&self) -> Box<dyn macfly::Caveat> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[test]
fn scenario_6_resource_set_wildcard() {
    // Apps({0: "*"}) against {app: 7, action: "w"} => Ok.
    let wildcard = ResourceSet::<u64>::new(vec![(0, ActionMask::ALL)]).unwrap();
    let access = TestAccess { app: Some(7), action: Some(ActionMask::WRITE), ..Default::default() };
    assert!(wildcard.prohibits(&access, "app").is_ok());

    // Apps({0: "r", 7: "w"}) => rejected at construction (BadCaveat): wildcard cannot coexist
    // with explicit keys.
    let conflict = ResourceSet::<u64>::new(vec![
        (0, ActionMask::from_letters("r").unwrap()),
        (7, ActionMask::from_letters("w").unwrap()),
    ]);
    assert!(matches!(conflict.unwrap_err(), Error::BadCaveat { .. }));
}
