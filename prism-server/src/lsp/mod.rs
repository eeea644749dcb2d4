//! The link-state routing substrate: LSP database, neighborhood liveness,
//! rate-limited flood queues, and the router that ties them together.

pub mod database;
pub mod neighborhood;
pub mod queue;
pub mod routing;

pub use database::LsDatabase;
pub use neighborhood::{Neighbor, Neighborhood};
pub use queue::{LsQueue, QItem, QKind};
pub use routing::LsRouting;
