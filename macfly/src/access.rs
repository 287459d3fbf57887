//! The access side of a caveat's `prohibits` check.
//!
//! `Access` is capability-typed rather than hierarchy-typed: a caveat declares which pieces of
//! information it needs (`now`, `action`, a named `resource`) and the runtime checks whether the
//! access exposes them, rather than downcasting to a concrete struct. Every method but `now` has
//! a default that reports the capability absent, so a narrow test or domain `Access` only needs
//! to override what its caveats actually read.

use std::fmt::Debug;

use crate::error::Error;

/////////////////////////////////////////////// ActionMask //////////////////////////////////////////

/// The five actions a caveat's mask can grant or an access can request: read, write, create,
/// delete, control. Bit order matches the `r,w,c,d,C` letters used in the JSON form.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default, Hash)]
pub struct ActionMask(pub u32);

impl ActionMask {
    pub const NONE: ActionMask = ActionMask(0);
    pub const READ: ActionMask = ActionMask(1 << 0);
    pub const WRITE: ActionMask = ActionMask(1 << 1);
    pub const CREATE: ActionMask = ActionMask(1 << 2);
    pub const DELETE: ActionMask = ActionMask(1 << 3);
    pub const CONTROL: ActionMask = ActionMask(1 << 4);
    pub const ALL: ActionMask = ActionMask(0b11111);

    /// `true` iff every bit set in `self` is also set in `other`.
    pub fn is_subset_of(&self, other: ActionMask) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn union(self, other: ActionMask) -> ActionMask {
        ActionMask(self.0 | other.0)
    }

    pub fn contains(&self, other: ActionMask) -> bool {
        other.is_subset_of(*self)
    }

    /// Render as the `"rwcdC"` / `"*"` string used by the JSON form.
    pub fn to_letters(self) -> String {
        if self == Self::ALL {
            return "*".to_owned();
        }
        let mut s = String::new();
        if self.0 & Self::READ.0 != 0 {
            s.push('r');
        }
        if self.0 & Self::WRITE.0 != 0 {
            s.push('w');
        }
        if self.0 & Self::CREATE.0 != 0 {
            s.push('c');
        }
        if self.0 & Self::DELETE.0 != 0 {
            s.push('d');
        }
        if self.0 & Self::CONTROL.0 != 0 {
            s.push('C');
        }
        s
    }

    /// Parse the `"rwcdC"` / `"*"` string form.
    pub fn from_letters(s: &str) -> Result<ActionMask, Error> {
        if s == "*" {
            return Ok(Self::ALL);
        }
        let mut mask = 0u32;
        for c in s.chars() {
            mask |= match c {
                'r' => Self::READ.0,
                'w' => Self::WRITE.0,
                'c' => Self::CREATE.0,
                'd' => Self::DELETE.0,
                'C' => Self::CONTROL.0,
                other => {
                    return Err(Error::bad_caveat(format!("unknown action letter {other:?}")))
                }
            };
        }
        Ok(ActionMask(mask))
    }
}

////////////////////////////////////////////// ResourceValue /////////////////////////////////////////

/// A resource the access is attempting to act on, as exposed to a [crate::builtin::ResourceSet]
/// caveat. New resource shapes can be added here as domain callers need them; `Id`/`Path` cover
/// numeric identifiers and slash-separated paths respectively.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ResourceValue {
    Id(u64),
    Path(String),
}

/////////////////////////////////////////////// Access ///////////////////////////////////////////////

/// The capability set a caveat may read from the access being attempted. Implemented once per
/// call site by the caller; consumed read-only during a single authorization check.
pub trait Access: Debug {
    /// Current time, in Unix seconds, as this access should see it.
    fn now(&self) -> u64;

    /// The action bitmask being attempted, if this access has one.
    fn action(&self) -> Option<ActionMask> {
        None
    }

    /// The resource of the named kind (e.g. `"app"`, `"bucket"`) being acted on, if any.
    fn resource(&self, kind: &str) -> Option<ResourceValue> {
        let _ = kind;
        None
    }
}
