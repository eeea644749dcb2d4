#![deny(missing_docs)]
//! Shared wire and state types for the PRISM anonymous messaging core.
//!
//! The central type is [`message::PrismMessage`], a discriminated union of
//! every message exchanged between clients, mixes, and dropbox committees.
//! Messages encode to a canonical CBOR map keyed by small integers; the
//! integer field-index table is fixed by the protocol and must not be
//! renumbered (see [`message`] for the table).
//!
//! The crate also carries the secret-sharing wire records ([`share`]), the
//! server database shared between clients and servers ([`server_db`]), the
//! on-disk state store ([`state`]), and the user-facing cleartext record
//! ([`cleartext`]).

pub mod cleartext;
pub mod epoch;
pub mod message;
pub mod server_db;
pub mod share;
pub mod state;

pub use cleartext::ClearText;
pub use epoch::{EpochCommand, EpochState};
pub use message::{
    Action, CipherKind, DebugMap, HalfKeyKind, HalfKeyMap, LinkAddress, MpcMap, MsgType,
    NeighborInfo, PrismMessage, WireError,
};
pub use server_db::{ServerDb, ServerRecord};
pub use share::{PreproductInfo, SecretSharingKind, SecretSharingMap, Share};
pub use state::StateStore;
