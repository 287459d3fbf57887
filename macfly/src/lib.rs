#![doc = include_str!("../README.md")]

pub mod access;
pub mod builtin;
pub mod bundle;
pub mod caveat;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod macaroon;
pub mod thirdparty;
pub mod verify;

pub use access::{Access, ActionMask, ResourceValue};
pub use builtin::{
    Action, BindToParentToken, Caveat3P, IfPresent, IsUser, PrefixKey, ResourceKey, ResourceSet,
    ValidityWindow,
};
pub use bundle::{Bundle, CachingVerifier, LocalVerifier, Predicate, Token, TokenKind, Verifier};
pub use caveat::{Caveat, CaveatSet, CaveatType, UnregisteredCaveat, UnregisteredJsonCaveat};
pub use config::{AuthorityConfig, ConfigVerifier};
pub use crypto::{EncryptionKey, SigningKey, Tail};
pub use error::Error;
pub use macaroon::{Macaroon, Nonce};
pub use thirdparty::{
    seal_ticket, open_ticket, DischargeState, InMemorySessionStore, PendingSession, SessionStore,
};
pub use verify::verify;
