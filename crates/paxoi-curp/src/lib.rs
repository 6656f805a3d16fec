//! CURP acknowledgement batching.
//!
//! CURP replicas produce two high-rate message streams: per-instance
//! accepts from the leader and accept-acks from witnesses. The
//! [`Batcher`] coalesces whatever both streams have accumulated into a
//! single [`MAAcks`] per arrival cycle, flattening bursty traffic into
//! amortized single-round-trip exchanges.

mod batcher;
mod message;

pub use batcher::Batcher;
pub use message::{MAAcks, MAccept, MAcceptAck};
