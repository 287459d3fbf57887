//! The error-kind tree: leaf caveats return the most specific kind; the verifier surfaces the
//! first fatal kind while collecting others for diagnostics.

use biometrics::Counter;
use zerror::Z;
use zerror_core::ErrorCore;
use zerror_derive::Z;

const OWNER: &str = "oncall@macfly.invalid";

static UNAUTHORIZED_FOR_ACTION: Counter = Counter::new("macfly.error.unauthorized_for_action");
static UNAUTHORIZED_FOR_RESOURCE: Counter = Counter::new("macfly.error.unauthorized_for_resource");
static BAD_CAVEAT: Counter = Counter::new("macfly.error.bad_caveat");
static INVALID_ACCESS: Counter = Counter::new("macfly.error.invalid_access");
static RESOURCE_UNSPECIFIED: Counter = Counter::new("macfly.error.resource_unspecified");
static RESOURCES_MUTUALLY_EXCLUSIVE: Counter =
    Counter::new("macfly.error.resources_mutually_exclusive");
static BAD_TOKEN: Counter = Counter::new("macfly.error.bad_token");
static BAD_SIGNATURE: Counter = Counter::new("macfly.error.bad_signature");
static DISCHARGE_MISSING: Counter = Counter::new("macfly.error.discharge_missing");
static CRYPTO: Counter = Counter::new("macfly.error.crypto");
static BAD_KEY: Counter = Counter::new("macfly.error.bad_key");
static NOT_FOUND: Counter = Counter::new("macfly.error.not_found");
static CYCLE: Counter = Counter::new("macfly.error.cycle");
static NO_AUTHORIZED_TOKEN: Counter = Counter::new("macfly.error.no_authorized_token");

/////////////////////////////////////////////// Error ///////////////////////////////////////////////

/// The error-kind tree of the authorization engine.
#[derive(Z)]
pub enum Error {
    /// A caveat matched but the requested action was not a subset of what it permits.
    UnauthorizedForAction { core: ErrorCore },
    /// A caveat matched but the resource being accessed was not in its allowed set.
    UnauthorizedForResource { core: ErrorCore },
    /// A structurally valid caveat that cannot apply to this access.
    BadCaveat { core: ErrorCore },
    /// The access object lacks a capability or field a caveat needs.
    InvalidAccess { core: ErrorCore },
    /// The access lacks the resource this caveat constrains. Recoverable only inside `IfPresent`.
    ResourceUnspecified { core: ErrorCore },
    /// The access violates a caveat's single-resource invariant.
    ResourcesMutuallyExclusive { core: ErrorCore },
    /// Malformed wire form.
    BadToken { core: ErrorCore },
    /// Tail mismatch: the macaroon was tampered with or the wrong key was used.
    BadSignature { core: ErrorCore },
    /// A required discharge macaroon was not present in the bundle.
    DischargeMissing { core: ErrorCore },
    /// Seal/open/key-derivation failure.
    Crypto { core: ErrorCore },
    /// A key was malformed (wrong length, or otherwise not a usable key).
    BadKey { core: ErrorCore },
    /// Lookup miss in a session store or key resolver.
    NotFound { core: ErrorCore },
    /// A discharge chain revisited a macaroon, which would otherwise loop forever.
    Cycle { core: ErrorCore },
    /// Every permission token in a bundle failed to validate.
    NoAuthorizedToken { core: ErrorCore },
}

impl Error {
    pub fn unauthorized_for_action(why: impl std::fmt::Debug) -> Self {
        Error::UnauthorizedForAction {
            core: ErrorCore::new(OWNER, "action not permitted", &UNAUTHORIZED_FOR_ACTION),
        }
        .with_info("why", why)
    }

    pub fn unauthorized_for_resource(resource: impl std::fmt::Debug) -> Self {
        Error::UnauthorizedForResource {
            core: ErrorCore::new(OWNER, "resource not permitted", &UNAUTHORIZED_FOR_RESOURCE),
        }
        .with_info("resource", resource)
    }

    pub fn bad_caveat(what: impl std::fmt::Debug) -> Self {
        Error::BadCaveat {
            core: ErrorCore::new(OWNER, "caveat cannot apply", &BAD_CAVEAT),
        }
        .with_info("what", what)
    }

    pub fn invalid_access(what: impl std::fmt::Debug) -> Self {
        Error::InvalidAccess {
            core: ErrorCore::new(OWNER, "access missing a required capability", &INVALID_ACCESS),
        }
        .with_info("what", what)
    }

    pub fn resource_unspecified(kind: impl std::fmt::Debug) -> Self {
        Error::ResourceUnspecified {
            core: ErrorCore::new(OWNER, "access has no resource of this kind", &RESOURCE_UNSPECIFIED),
        }
        .with_info("kind", kind)
    }

    pub fn resources_mutually_exclusive(what: impl std::fmt::Debug) -> Self {
        Error::ResourcesMutuallyExclusive {
            core: ErrorCore::new(
                OWNER,
                "access violates a single-resource invariant",
                &RESOURCES_MUTUALLY_EXCLUSIVE,
            ),
        }
        .with_info("what", what)
    }

    pub fn bad_token(what: impl std::fmt::Debug) -> Self {
        Error::BadToken {
            core: ErrorCore::new(OWNER, "malformed wire form", &BAD_TOKEN),
        }
        .with_info("what", what)
    }

    pub fn bad_signature() -> Self {
        Error::BadSignature {
            core: ErrorCore::new(OWNER, "tail mismatch", &BAD_SIGNATURE),
        }
    }

    pub fn discharge_missing(location: impl std::fmt::Debug) -> Self {
        Error::DischargeMissing {
            core: ErrorCore::new(OWNER, "required discharge not in bundle", &DISCHARGE_MISSING),
        }
        .with_info("location", location)
    }

    pub fn crypto(what: impl std::fmt::Debug) -> Self {
        Error::Crypto {
            core: ErrorCore::new(OWNER, "cryptographic operation failed", &CRYPTO),
        }
        .with_info("what", what)
    }

    pub fn bad_key(what: impl std::fmt::Debug) -> Self {
        Error::BadKey {
            core: ErrorCore::new(OWNER, "malformed key", &BAD_KEY),
        }
        .with_info("what", what)
    }

    pub fn not_found(what: impl std::fmt::Debug) -> Self {
        Error::NotFound {
            core: ErrorCore::new(OWNER, "not found", &NOT_FOUND),
        }
        .with_info("what", what)
    }

    pub fn cycle() -> Self {
        Error::Cycle {
            core: ErrorCore::new(OWNER, "discharge chain revisited a macaroon", &CYCLE),
        }
    }

    pub fn no_authorized_token(failures: Vec<String>) -> Self {
        Error::NoAuthorizedToken {
            core: ErrorCore::new(OWNER, "no permission token in the bundle validated", &NO_AUTHORIZED_TOKEN),
        }
        .with_info("failures", failures)
    }

    /// `true` for the one kind that [crate::builtin::IfPresent] may treat as recoverable.
    pub fn is_resource_unspecified(&self) -> bool {
        matches!(self, Error::ResourceUnspecified { .. })
    }
}

impl From<buffertk::Error> for Error {
    fn from(err: buffertk::Error) -> Self {
        Error::bad_token(format!("{err:?}"))
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::bad_token(format!("{err:?}"))
    }
}

zerror::iotoz! {Error}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_form_carries_info() {
        let err = Error::bad_caveat("Mutations requires a present mutation");
        let long = err.long_form();
        assert!(long.contains("caveat cannot apply"));
        assert!(long.contains("Mutations requires a present mutation"));
    }

    #[test]
    fn resource_unspecified_is_detected() {
        assert!(Error::resource_unspecified("Apps").is_resource_unspecified());
        assert!(!Error::bad_signature().is_resource_unspecified());
    }
}
