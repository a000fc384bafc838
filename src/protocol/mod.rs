//! Redis Serialization Protocol (RESP) replies.
//!
//! Requests arrive already split into argument vectors; only the reply side
//! of the protocol lives here.

mod frame;

pub use frame::Frame;
