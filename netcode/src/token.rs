//! Connect-token envelope: the 2048-byte public token handed from a trusted
//! issuer to the client, its 1024-byte encrypted private section readable
//! only by the server, and the 300-byte challenge token exchanged during the
//! handshake.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use chacha20poly1305::XNonce;
use no_std_io2::io::{self, Cursor};

use super::bytes::Bytes;
use super::crypto::{self, Key};
use super::{ClientId, MAC_BYTES, MAX_SERVERS_PER_CONNECT, USER_DATA_BYTES, VERSION_INFO};

#[derive(thiserror::Error, Debug)]
pub enum InvalidTokenError {
    #[error("server address list has an invalid length")]
    AddressListLength,
    #[error("invalid ip address type tag")]
    InvalidIpAddressType,
    #[error("create timestamp is after expire timestamp")]
    InvalidTimestamp,
    #[error("version info does not match")]
    InvalidVersion,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Crypto(#[from] crypto::Error),
}

/// A fixed-capacity list of up to [`MAX_SERVERS_PER_CONNECT`] server
/// addresses, serialized as a fixed-width region regardless of how many
/// entries are populated (the remainder is zero padding).
#[derive(Debug, Clone, Copy)]
pub struct AddressList {
    addrs: [Option<core::net::SocketAddr>; MAX_SERVERS_PER_CONNECT],
    len: usize,
}

impl PartialEq for AddressList {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}
impl Eq for AddressList {}

/// Bytes used to encode one address slot: type tag, 16 bytes of address
/// data (v4 octets left-padded with zeroes, or v6 hextets), and a port.
const ADDRESS_ENTRY_BYTES: usize = 1 + 16 + 2;

impl AddressList {
    pub fn new<I>(addrs: I) -> core::result::Result<Self, InvalidTokenError>
    where
        I: IntoIterator<Item = core::net::SocketAddr>,
    {
        let mut out = [None; MAX_SERVERS_PER_CONNECT];
        let mut len = 0;
        for addr in addrs {
            if len >= MAX_SERVERS_PER_CONNECT {
                return Err(InvalidTokenError::AddressListLength);
            }
            out[len] = Some(addr);
            len += 1;
        }
        if len == 0 {
            return Err(InvalidTokenError::AddressListLength);
        }
        Ok(Self { addrs: out, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = core::net::SocketAddr> + '_ {
        self.addrs[..self.len].iter().map(|a| a.unwrap())
    }

    pub fn contains(&self, addr: &core::net::SocketAddr) -> bool {
        self.iter().any(|a| a == *addr)
    }
}

impl core::ops::Index<usize> for AddressList {
    type Output = core::net::SocketAddr;
    fn index(&self, index: usize) -> &Self::Output {
        self.addrs[index].as_ref().expect("index out of bounds")
    }
}

impl Bytes for AddressList {
    const SIZE: usize = 4 + MAX_SERVERS_PER_CONNECT * ADDRESS_ENTRY_BYTES;
    type Error = InvalidTokenError;

    fn write_to(&self, writer: &mut impl WriteBytesExt) -> core::result::Result<(), Self::Error> {
        writer.write_u32::<LE>(self.len as u32)?;
        for addr in self.addrs[..self.len].iter().flatten() {
            match addr {
                core::net::SocketAddr::V4(v4) => {
                    writer.write_u8(1)?;
                    writer.write_all(&v4.ip().octets())?;
                    writer.write_all(&[0u8; 12])?;
                    writer.write_u16::<LE>(v4.port())?;
                }
                core::net::SocketAddr::V6(v6) => {
                    writer.write_u8(2)?;
                    writer.write_all(&v6.ip().octets())?;
                    writer.write_u16::<LE>(v6.port())?;
                }
            }
        }
        for _ in self.len..MAX_SERVERS_PER_CONNECT {
            writer.write_all(&[0u8; ADDRESS_ENTRY_BYTES])?;
        }
        Ok(())
    }

    fn read_from(reader: &mut impl ReadBytesExt) -> core::result::Result<Self, Self::Error> {
        let len = reader.read_u32::<LE>()? as usize;
        if len == 0 || len > MAX_SERVERS_PER_CONNECT {
            return Err(InvalidTokenError::AddressListLength);
        }
        let mut addrs = [None; MAX_SERVERS_PER_CONNECT];
        for slot in addrs.iter_mut().take(len) {
            let kind = reader.read_u8()?;
            let addr = match kind {
                1 => {
                    let mut octets = [0u8; 4];
                    reader.read_exact(&mut octets)?;
                    let mut pad = [0u8; 12];
                    reader.read_exact(&mut pad)?;
                    let port = reader.read_u16::<LE>()?;
                    core::net::SocketAddr::from((core::net::Ipv4Addr::from(octets), port))
                }
                2 => {
                    let mut octets = [0u8; 16];
                    reader.read_exact(&mut octets)?;
                    let port = reader.read_u16::<LE>()?;
                    core::net::SocketAddr::from((core::net::Ipv6Addr::from(octets), port))
                }
                _ => return Err(InvalidTokenError::InvalidIpAddressType),
            };
            *slot = Some(addr);
        }
        for _ in len..MAX_SERVERS_PER_CONNECT {
            let mut skip = [0u8; ADDRESS_ENTRY_BYTES];
            reader.read_exact(&mut skip)?;
        }
        Ok(Self { addrs, len })
    }
}

/// The server-private section of a connect token: opaque to the client,
/// decryptable only by the server that holds `private_key`.
#[derive(Debug, Clone)]
pub struct ConnectTokenPrivate {
    pub client_id: ClientId,
    pub timeout_seconds: i32,
    pub server_addresses: AddressList,
    pub client_to_server_key: Key,
    pub server_to_client_key: Key,
    pub user_data: [u8; USER_DATA_BYTES],
}

impl Bytes for ConnectTokenPrivate {
    /// Total size once encrypted, including the trailing 16-byte AEAD tag.
    const SIZE: usize = 1024;
    type Error = InvalidTokenError;

    fn write_to(&self, writer: &mut impl WriteBytesExt) -> core::result::Result<(), Self::Error> {
        writer.write_u64::<LE>(self.client_id)?;
        writer.write_i32::<LE>(self.timeout_seconds)?;
        self.server_addresses.write_to(writer)?;
        writer.write_all(&self.client_to_server_key)?;
        writer.write_all(&self.server_to_client_key)?;
        writer.write_all(&self.user_data)?;
        Ok(())
    }

    fn read_from(reader: &mut impl ReadBytesExt) -> core::result::Result<Self, Self::Error> {
        let client_id = reader.read_u64::<LE>()?;
        let timeout_seconds = reader.read_i32::<LE>()?;
        let server_addresses = AddressList::read_from(reader)?;
        let mut client_to_server_key = [0u8; 32];
        reader.read_exact(&mut client_to_server_key)?;
        let mut server_to_client_key = [0u8; 32];
        reader.read_exact(&mut server_to_client_key)?;
        let mut user_data = [0u8; USER_DATA_BYTES];
        reader.read_exact(&mut user_data)?;
        Ok(Self {
            client_id,
            timeout_seconds,
            server_addresses,
            client_to_server_key,
            server_to_client_key,
            user_data,
        })
    }
}

impl ConnectTokenPrivate {
    const PLAINTEXT_SIZE: usize = Self::SIZE - MAC_BYTES;

    fn aead(protocol_id: u64, expire_timestamp: u64) -> [u8; VERSION_INFO.len() + 16] {
        let mut out = [0u8; VERSION_INFO.len() + 16];
        out[..VERSION_INFO.len()].copy_from_slice(VERSION_INFO);
        out[VERSION_INFO.len()..VERSION_INFO.len() + 8]
            .copy_from_slice(&protocol_id.to_le_bytes());
        out[VERSION_INFO.len() + 8..].copy_from_slice(&expire_timestamp.to_le_bytes());
        out
    }

    pub fn encrypt(
        &self,
        protocol_id: u64,
        expire_timestamp: u64,
        nonce: XNonce,
        key: &Key,
    ) -> core::result::Result<[u8; Self::SIZE], InvalidTokenError> {
        let mut buf = [0u8; Self::SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..Self::PLAINTEXT_SIZE]);
            self.write_to(&mut cursor)?;
        }
        let ad = Self::aead(protocol_id, expire_timestamp);
        crypto::xchacha_encrypt(&mut buf, Some(&ad), nonce, key)?;
        Ok(buf)
    }

    pub fn decrypt(
        mut encrypted: [u8; Self::SIZE],
        protocol_id: u64,
        expire_timestamp: u64,
        nonce: XNonce,
        key: &Key,
    ) -> core::result::Result<Self, InvalidTokenError> {
        let ad = Self::aead(protocol_id, expire_timestamp);
        crypto::xchacha_decrypt(&mut encrypted, Some(&ad), nonce, key)?;
        let mut cursor = Cursor::new(&encrypted[..Self::PLAINTEXT_SIZE]);
        Self::read_from(&mut cursor)
    }
}

/// The small server-keyed token echoed back by the client during the
/// challenge/response handshake.
#[derive(Debug, Clone)]
pub struct ChallengeToken {
    pub client_id: ClientId,
    pub user_data: [u8; USER_DATA_BYTES],
}

impl Bytes for ChallengeToken {
    /// Total size once encrypted, including the trailing 16-byte AEAD tag.
    const SIZE: usize = 300;
    type Error = InvalidTokenError;

    fn write_to(&self, writer: &mut impl WriteBytesExt) -> core::result::Result<(), Self::Error> {
        writer.write_u64::<LE>(self.client_id)?;
        writer.write_all(&self.user_data)?;
        Ok(())
    }

    fn read_from(reader: &mut impl ReadBytesExt) -> core::result::Result<Self, Self::Error> {
        let client_id = reader.read_u64::<LE>()?;
        let mut user_data = [0u8; USER_DATA_BYTES];
        reader.read_exact(&mut user_data)?;
        Ok(Self {
            client_id,
            user_data,
        })
    }
}

impl ChallengeToken {
    const PLAINTEXT_SIZE: usize = Self::SIZE - MAC_BYTES;

    pub fn encrypt(
        &self,
        sequence: u64,
        key: &Key,
    ) -> core::result::Result<[u8; Self::SIZE], InvalidTokenError> {
        let mut buf = [0u8; Self::SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..Self::PLAINTEXT_SIZE]);
            self.write_to(&mut cursor)?;
        }
        crypto::chacha_encrypt(&mut buf, None, sequence, key)?;
        Ok(buf)
    }

    pub fn decrypt(
        mut encrypted: [u8; Self::SIZE],
        sequence: u64,
        key: &Key,
    ) -> core::result::Result<Self, InvalidTokenError> {
        crypto::chacha_decrypt(&mut encrypted, None, sequence, key)?;
        let mut cursor = Cursor::new(&encrypted[..Self::PLAINTEXT_SIZE]);
        Self::read_from(&mut cursor)
    }
}

/// The 2048-byte envelope handed from a trusted token issuer to the client.
#[derive(Debug, Clone)]
pub struct ConnectToken {
    pub version_info: [u8; VERSION_INFO.len()],
    pub protocol_id: u64,
    pub create_timestamp: u64,
    pub expire_timestamp: u64,
    pub nonce: XNonce,
    pub private_data: [u8; ConnectTokenPrivate::SIZE],
    pub timeout_seconds: i32,
    pub server_addresses: AddressList,
    pub client_to_server_key: Key,
    pub server_to_client_key: Key,
}

impl Bytes for ConnectToken {
    const SIZE: usize = 2048;
    type Error = InvalidTokenError;

    fn write_to(&self, writer: &mut impl WriteBytesExt) -> core::result::Result<(), Self::Error> {
        writer.write_all(&self.version_info)?;
        writer.write_u64::<LE>(self.protocol_id)?;
        writer.write_u64::<LE>(self.create_timestamp)?;
        writer.write_u64::<LE>(self.expire_timestamp)?;
        writer.write_all(self.nonce.as_slice())?;
        writer.write_all(&self.private_data)?;
        writer.write_i32::<LE>(self.timeout_seconds)?;
        self.server_addresses.write_to(writer)?;
        writer.write_all(&self.client_to_server_key)?;
        writer.write_all(&self.server_to_client_key)?;
        Ok(())
    }

    fn read_from(reader: &mut impl ReadBytesExt) -> core::result::Result<Self, Self::Error> {
        let mut version_info = [0u8; VERSION_INFO.len()];
        reader.read_exact(&mut version_info)?;
        if version_info != *VERSION_INFO {
            return Err(InvalidTokenError::InvalidVersion);
        }
        let protocol_id = reader.read_u64::<LE>()?;
        let create_timestamp = reader.read_u64::<LE>()?;
        let expire_timestamp = reader.read_u64::<LE>()?;
        if create_timestamp > expire_timestamp {
            return Err(InvalidTokenError::InvalidTimestamp);
        }
        let mut nonce_bytes = [0u8; 24];
        reader.read_exact(&mut nonce_bytes)?;
        let nonce = XNonce::from(nonce_bytes);
        let mut private_data = [0u8; ConnectTokenPrivate::SIZE];
        reader.read_exact(&mut private_data)?;
        let timeout_seconds = reader.read_i32::<LE>()?;
        let server_addresses = AddressList::read_from(reader)?;
        let mut client_to_server_key = [0u8; 32];
        reader.read_exact(&mut client_to_server_key)?;
        let mut server_to_client_key = [0u8; 32];
        reader.read_exact(&mut server_to_client_key)?;
        Ok(Self {
            version_info,
            protocol_id,
            create_timestamp,
            expire_timestamp,
            nonce,
            private_data,
            timeout_seconds,
            server_addresses,
            client_to_server_key,
            server_to_client_key,
        })
    }
}

impl ConnectToken {
    /// Start building a token for `client_id`, valid for the given server
    /// addresses and encrypted with `private_key`.
    pub fn build<I>(
        server_addresses: I,
        protocol_id: u64,
        client_id: ClientId,
        private_key: Key,
    ) -> ConnectTokenBuilder
    where
        I: IntoIterator<Item = core::net::SocketAddr>,
    {
        ConnectTokenBuilder {
            protocol_id,
            client_id,
            expire_seconds: super::TOKEN_EXPIRE_SEC,
            private_key,
            timeout_seconds: super::CONNECTION_TIMEOUT_SEC,
            public_server_addresses: server_addresses.into_iter().collect(),
            user_data: [0u8; USER_DATA_BYTES],
        }
    }

    pub fn try_into_bytes(&self) -> core::result::Result<[u8; Self::SIZE], InvalidTokenError> {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        self.write_to(&mut cursor)?;
        Ok(buf)
    }

    pub fn try_from_bytes(buf: &[u8]) -> core::result::Result<Self, InvalidTokenError> {
        let mut cursor = Cursor::new(buf);
        Self::read_from(&mut cursor)
    }
}

/// Fluent builder for [`ConnectToken`], mirroring the fields a matchmaker
/// would set when minting a token for a newly matched client.
pub struct ConnectTokenBuilder {
    protocol_id: u64,
    client_id: ClientId,
    expire_seconds: i32,
    private_key: Key,
    timeout_seconds: i32,
    public_server_addresses: alloc::vec::Vec<core::net::SocketAddr>,
    user_data: [u8; USER_DATA_BYTES],
}

impl ConnectTokenBuilder {
    /// Token validity window, in seconds from generation. Negative means the
    /// token never expires.
    pub fn expire_seconds(mut self, expire_seconds: i32) -> Self {
        self.expire_seconds = expire_seconds;
        self
    }

    /// Per-client idle timeout once connected. Negative disables timeouts.
    pub fn timeout_seconds(mut self, timeout_seconds: i32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Opaque application payload carried inside the encrypted private
    /// section and surfaced back to the server on connect.
    pub fn user_data(mut self, user_data: [u8; USER_DATA_BYTES]) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn generate(self) -> core::result::Result<ConnectToken, InvalidTokenError> {
        let server_addresses = AddressList::new(self.public_server_addresses)?;
        let now = super::utils::now();
        let create_timestamp = now;
        let expire_timestamp = if self.expire_seconds < 0 {
            u64::MAX
        } else {
            now + self.expire_seconds as u64
        };
        let client_to_server_key = crypto::generate_key();
        let server_to_client_key = crypto::generate_key();
        let private = ConnectTokenPrivate {
            client_id: self.client_id,
            timeout_seconds: self.timeout_seconds,
            server_addresses,
            client_to_server_key,
            server_to_client_key,
            user_data: self.user_data,
        };
        let nonce = XNonce::from(crypto::generate_xnonce());
        let private_data =
            private.encrypt(self.protocol_id, expire_timestamp, nonce, &self.private_key)?;
        Ok(ConnectToken {
            version_info: *VERSION_INFO,
            protocol_id: self.protocol_id,
            create_timestamp,
            expire_timestamp,
            nonce,
            private_data,
            timeout_seconds: self.timeout_seconds,
            server_addresses,
            client_to_server_key,
            server_to_client_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> core::net::SocketAddr {
        core::net::SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn encrypt_decrypt_private_token() {
        let key = crypto::generate_key();
        let private = ConnectTokenPrivate {
            client_id: 0x1,
            timeout_seconds: 15,
            server_addresses: AddressList::new([addr(40000)]).unwrap(),
            client_to_server_key: crypto::generate_key(),
            server_to_client_key: crypto::generate_key(),
            user_data: [7u8; USER_DATA_BYTES],
        };
        let nonce = XNonce::from(crypto::generate_xnonce());
        let encrypted = private.encrypt(0x1122, 1_000_000, nonce, &key).unwrap();
        let decrypted =
            ConnectTokenPrivate::decrypt(encrypted, 0x1122, 1_000_000, nonce, &key).unwrap();
        assert_eq!(decrypted.client_id, private.client_id);
        assert_eq!(decrypted.user_data, private.user_data);
    }

    #[test]
    fn encrypt_decrypt_challenge_token() {
        let key = crypto::generate_key();
        let token = ChallengeToken {
            client_id: 42,
            user_data: [9u8; USER_DATA_BYTES],
        };
        let encrypted = token.encrypt(7, &key).unwrap();
        let decrypted = ChallengeToken::decrypt(encrypted, 7, &key).unwrap();
        assert_eq!(decrypted.client_id, 42);
        assert_eq!(decrypted.user_data, token.user_data);
    }

    #[test]
    fn connect_token_builder_round_trip() {
        let key = crypto::generate_key();
        let token = ConnectToken::build([addr(40000), addr(40001)], 0x1122, 7, key)
            .timeout_seconds(15)
            .generate()
            .unwrap();
        let bytes = token.try_into_bytes().unwrap();
        assert_eq!(bytes.len(), ConnectToken::SIZE);
        let read_back = ConnectToken::try_from_bytes(&bytes).unwrap();
        assert_eq!(read_back.protocol_id, 0x1122);
        assert_eq!(read_back.server_addresses.len(), 2);
        let private = ConnectTokenPrivate::decrypt(
            read_back.private_data,
            read_back.protocol_id,
            read_back.expire_timestamp,
            read_back.nonce,
            &key,
        )
        .unwrap();
        assert_eq!(private.client_id, 7);
        assert_eq!(
            private.client_to_server_key,
            read_back.client_to_server_key
        );
    }

    #[test]
    fn rejects_bad_version_info() {
        let key = crypto::generate_key();
        let mut token = ConnectToken::build([addr(40000)], 1, 1, key)
            .generate()
            .unwrap();
        token.version_info[0] = b'X';
        let bytes = token.try_into_bytes().unwrap();
        assert!(matches!(
            ConnectToken::try_from_bytes(&bytes),
            Err(InvalidTokenError::InvalidVersion)
        ));
    }
}
