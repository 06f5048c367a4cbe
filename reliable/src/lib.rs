//! `reliable`: ack bitfields and fragmentation/reassembly for the reliable.io
//! protocol, riding inside `netcode` payloads.
//!
//! An [`Endpoint`] turns raw application buffers into sequenced, optionally
//! fragmented datagrams, tracks which of its own sends have been acked by
//! the peer, and reassembles fragments back into whole buffers on receipt.
//! It has no socket of its own — callers drive it with a transmit callback
//! and feed it bytes already received over their own transport, exactly as
//! `netcode::Server`/`netcode::Client` are driven through
//! [`netcode::Transport`].
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod endpoint;
pub mod error;
pub mod fragment;
pub mod header;
pub(crate) mod sequence_buffer;

pub use endpoint::{Endpoint, EndpointConfig, ReliableStats};
pub use error::{Error, Result};
pub use header::{Header, MAX_FRAGMENT_HEADER_BYTES, MAX_PACKET_HEADER_BYTES};

/// Sequence numbers wrap at 16 bits; the ack bitfield covers this many
/// packets before the acked sequence.
pub const ACK_BITFIELD_SIZE: u32 = 32;
/// Default size for the ack/sent/received-packet sequence buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 256;
/// Default maximum number of fragments a single packet may split into.
/// Capped at 255: the wire fragment count is a single byte.
pub const DEFAULT_MAX_FRAGMENTS: usize = 255;
/// Default payload size, in bytes, above which a packet is fragmented.
pub const DEFAULT_FRAGMENT_ABOVE: usize = 1024;
/// Default per-fragment payload size.
pub const DEFAULT_FRAGMENT_SIZE: usize = 1024;
/// Default time a sent packet may go unacked before it's considered stale
/// and dropped from the send buffer's bookkeeping.
pub const DEFAULT_ACK_TIMEOUT_SEC: f64 = 1.0;
