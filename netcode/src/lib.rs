//! `netcode`: a secure client/server connection protocol for UDP games.
//!
//! This crate implements the authenticated handshake and encrypted datagram
//! framing described by the `netcode.io` protocol: connect tokens minted by
//! a trusted matchmaker, a challenge/response handshake that defeats source
//! address spoofing, per-direction AEAD framing, and replay protection.
//! It does not open sockets itself — callers drive [`server::Server`] and
//! [`client::Client`] with bytes they've already sent/received over their
//! own transport.
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod bytes;
pub mod crypto;
pub mod error;
pub mod packet;
pub mod replay;
pub mod token;
pub mod transport;
pub(crate) mod utils;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;

pub use crypto::{generate_key, try_generate_key, Key};
pub use error::{Error, Result};
pub use transport::Transport;

#[cfg(feature = "client")]
pub use client::{Client, ClientConfig, ClientState};
#[cfg(feature = "server")]
pub use server::{Server, ServerConfig};
pub use token::{ChallengeToken, ConnectToken, ConnectTokenPrivate};

/// Identifies one connected client, stable for the lifetime of its slot.
pub type ClientId = u64;

/// Trailing authentication tag length for every AEAD-encrypted packet.
pub const MAC_BYTES: usize = 16;
/// Size of the scratch buffer callers should pass to [`packet::Packet::write`].
pub const MAX_PKT_BUF_SIZE: usize = 1300;
/// Maximum UDP payload size accepted by the application-facing send/recv API.
pub const MAX_PACKET_SIZE: usize = 1200;
/// Rate at which keep-alive packets are sent while otherwise idle.
pub const PACKET_SEND_RATE_SEC: f64 = 0.1;
/// Key size for both the server's private key and per-direction session keys.
pub const PRIVATE_KEY_BYTES: usize = 32;
/// Size of the opaque application payload carried inside a connect token.
pub const USER_DATA_BYTES: usize = 256;
/// Fixed wire size of a public connect token.
pub const CONNECT_TOKEN_BYTES: usize = 2048;
/// Maximum number of server addresses a single connect token may list.
pub const MAX_SERVERS_PER_CONNECT: usize = 32;
/// Maximum number of client slots a server may be configured with.
pub const MAX_CLIENTS: usize = 256;
/// Default connect-token validity window, in seconds.
pub const TOKEN_EXPIRE_SEC: i32 = 30;
/// Default per-client idle timeout, in seconds, once connected.
pub const CONNECTION_TIMEOUT_SEC: i32 = 15;
/// Number of redundant disconnect packets sent on a programmatic disconnect.
pub const NUM_DISCONNECT_PACKETS: usize = 10;
/// Size of the per-slot and per-client replay window.
pub const REPLAY_BUFFER_SIZE: usize = 256;
/// Size of the per-slot application receive queue.
pub const RECEIVE_QUEUE_SIZE: usize = 256;

/// 13-byte protocol version string embedded in every connect token and used
/// as associated data for every encrypted packet.
pub const VERSION_INFO: &[u8; 13] = b"NETCODE 1.02\0";
