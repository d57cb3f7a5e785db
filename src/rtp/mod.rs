//! RTP datagram handling for the ingest path
//!
//! Only what the relay needs: the fixed header (for the version check and
//! sequence number) and loss accounting over the 16-bit sequence space.

mod header;
mod loss;

pub use header::{RtpHeader, payload_of};
pub use loss::PacketLossCounter;
