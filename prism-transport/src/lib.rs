#![deny(missing_docs)]
//! The transport layer the PRISM core runs on.
//!
//! The core never talks to sockets directly. It consumes a [`Transport`]
//! that exposes enumerable [`Channel`]s; each channel can create links
//! (this node receives) or load links from a peer-supplied address (this
//! node sends). Incoming messages are dispatched to registered hooks, each
//! a composable [`HookFilter`] plus an unbounded queue; packages no hook
//! wants are parked and replayed against hooks registered later, so message
//! arrival may precede hook installation.
//!
//! Everything is epoch-scoped: [`EpochTransport`] tags created links with
//! its epoch and filters delivery so epoch-N and epoch-N+1 traffic never
//! cross-pollinate.
//!
//! [`memory`] provides the in-process transport used by the integration
//! harness and local deployments.

pub mod enums;
pub mod epoch;
pub mod hooks;
pub mod memory;
pub mod transport;

pub use enums::{
    ChannelStatus, ConnectionStatus, ConnectionType, LinkDirection, LinkType, TransmissionType,
};
pub use epoch::EpochTransport;
pub use hooks::{HookFilter, HookHandle, Package};
pub use transport::{Channel, ChannelDesc, Link, LinkProfile, Transport};
