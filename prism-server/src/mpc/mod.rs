//! The MPC machinery shared by committee roles: peer bookkeeping, the
//! preproduct pipeline, and the engine running ops across the committee.

pub mod engine;
pub mod fragment;
pub mod peer;
pub mod poll;
pub mod preproduct;

pub use engine::MpcEngine;
pub use fragment::Fragment;
pub use peer::{PeerState, PeerTable};
pub use poll::Poll;
pub use preproduct::{PreproductBatch, PreproductChunk, PreproductStore};
