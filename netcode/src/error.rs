use no_std_io2::io;
use thiserror::Error;

use super::ClientId;

/// The result type for all public methods in this crate that can fail.
pub type Result<T> = core::result::Result<T, Error>;

/// An error that can occur in the `netcode` crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("buffer size mismatch, expected {0} but got {1}")]
    SizeMismatch(usize, usize),
    #[error("tried to send a packet to client {0} that doesn't exist")]
    ClientNotFound(ClientId),
    #[error("client_id {0}: a client with this id is already connected")]
    ClientIdInUse(ClientId),
    #[error("client_id {0} tried to connect but the server is full")]
    ServerIsFull(ClientId),
    #[error("max_clients {0} is outside the allowed 1..=256 range")]
    InvalidMaxClients(usize),
    #[cfg(all(feature = "std", not(target_arch = "wasm32")))]
    #[error("clock went backwards: {0}")]
    SystemTime(#[from] std::time::SystemTimeError),
    #[cfg(all(feature = "std", target_arch = "wasm32"))]
    #[error("clock went backwards: {0}")]
    SystemTime(#[from] web_time::SystemTimeError),
    #[error("invalid connect token: {0}")]
    InvalidToken(super::token::InvalidTokenError),
    #[error("invalid packet: {0}")]
    Packet(#[from] super::packet::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}
