//! AEAD wrappers used by the codec and the connect-token private section.

use no_std_io2::io;

use super::{MAC_BYTES, PRIVATE_KEY_BYTES};
use chacha20poly1305::{
    AeadInPlace, ChaCha20Poly1305, KeyInit, Tag, XChaCha20Poly1305, XNonce,
    aead::{OsRng, rand_core::RngCore},
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("buffer size mismatch")]
    BufferSizeMismatch,
    #[cfg(feature = "std")]
    #[error("failed to encrypt or decrypt: {0}")]
    Failed(#[from] chacha20poly1305::aead::Error),
    #[error("failed to generate key: {0}")]
    GenerateKey(chacha20poly1305::aead::rand_core::Error),
}

/// A 32-byte array used as a key for encrypting and decrypting packets and connect tokens.
pub type Key = [u8; PRIVATE_KEY_BYTES];
pub type Result<T> = core::result::Result<T, Error>;

/// Generates a random key.
///
/// Panics if the underlying RNG fails (highly unlikely). For a
/// non-panicking version, see [`try_generate_key`].
pub fn generate_key() -> Key {
    let mut key: Key = [0; PRIVATE_KEY_BYTES];
    OsRng.fill_bytes(&mut key);
    key
}

/// The fallible version of [`generate_key`].
pub fn try_generate_key() -> Result<Key> {
    let mut key: Key = [0; PRIVATE_KEY_BYTES];
    OsRng.try_fill_bytes(&mut key).map_err(Error::GenerateKey)?;
    Ok(key)
}

/// Generates a random 24-byte nonce for the connect-token private section.
pub fn generate_xnonce() -> [u8; 24] {
    let mut nonce = [0u8; 24];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn write_nonce(buf: &mut [u8], nonce: u64) -> Result<()> {
    use byteorder::WriteBytesExt;
    io::Cursor::new(buf).write_u64::<byteorder::LittleEndian>(nonce)?;
    Ok(())
}

/// Encrypts `buf` in place with ChaCha20-Poly1305, appending the 16-byte tag
/// into the trailing `MAC_BYTES` of the buffer. `nonce` is the per-direction
/// sequence number; the wire nonce is four zero bytes followed by the
/// little-endian sequence.
pub fn chacha_encrypt(
    buf: &mut [u8],
    associated_data: Option<&[u8]>,
    nonce: u64,
    key: &Key,
) -> Result<()> {
    let size = buf.len();
    if size < MAC_BYTES {
        return Err(Error::BufferSizeMismatch);
    }
    let mut final_nonce = [0u8; 12];
    write_nonce(&mut final_nonce[4..], nonce)?;
    let mac = ChaCha20Poly1305::new(key.into()).encrypt_in_place_detached(
        &final_nonce.into(),
        associated_data.unwrap_or_default(),
        &mut buf[..size - MAC_BYTES],
    );
    #[cfg(feature = "std")]
    let mac = mac?;
    #[cfg(not(feature = "std"))]
    let mac = mac.expect("could not encrypt packet");
    buf[size - MAC_BYTES..].copy_from_slice(mac.as_ref());
    Ok(())
}

/// Decrypts `buf` in place, validating the trailing 16-byte tag.
pub fn chacha_decrypt(
    buf: &mut [u8],
    associated_data: Option<&[u8]>,
    nonce: u64,
    key: &Key,
) -> Result<()> {
    if buf.len() < MAC_BYTES {
        return Err(Error::BufferSizeMismatch);
    }
    let mut final_nonce = [0u8; 12];
    write_nonce(&mut final_nonce[4..], nonce)?;
    let (buf, mac) = buf.split_at_mut(buf.len() - MAC_BYTES);
    let res = ChaCha20Poly1305::new(key.into()).decrypt_in_place_detached(
        &final_nonce.into(),
        associated_data.unwrap_or_default(),
        buf,
        Tag::from_slice(mac),
    );
    #[cfg(feature = "std")]
    res?;
    #[cfg(not(feature = "std"))]
    res.expect("could not decrypt packet");
    Ok(())
}

/// Encrypts `buf` in place with XChaCha20-Poly1305 (24-byte nonce); used only
/// for the connect-token private section.
pub fn xchacha_encrypt(
    buf: &mut [u8],
    associated_data: Option<&[u8]>,
    nonce: XNonce,
    key: &Key,
) -> Result<()> {
    let size = buf.len();
    if size < MAC_BYTES {
        return Err(Error::BufferSizeMismatch);
    }
    let mac = XChaCha20Poly1305::new(key.into()).encrypt_in_place_detached(
        &nonce,
        associated_data.unwrap_or_default(),
        &mut buf[..size - MAC_BYTES],
    );
    #[cfg(feature = "std")]
    let mac = mac?;
    #[cfg(not(feature = "std"))]
    let mac = mac.expect("could not encrypt connect token");
    buf[size - MAC_BYTES..].copy_from_slice(mac.as_ref());
    Ok(())
}

pub fn xchacha_decrypt(
    buf: &mut [u8],
    associated_data: Option<&[u8]>,
    nonce: XNonce,
    key: &Key,
) -> Result<()> {
    if buf.len() < MAC_BYTES {
        return Err(Error::BufferSizeMismatch);
    }
    let (buf, mac) = buf.split_at_mut(buf.len() - MAC_BYTES);
    let res = XChaCha20Poly1305::new(key.into()).decrypt_in_place_detached(
        &nonce,
        associated_data.unwrap_or_default(),
        buf,
        Tag::from_slice(mac),
    );
    #[cfg(feature = "std")]
    res?;
    #[cfg(not(feature = "std"))]
    res.expect("could not decrypt connect token");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buf_too_small() {
        let mut buf = [0; 0];
        let key = generate_key();
        assert!(chacha_encrypt(&mut buf, None, 0, &key).is_err());
    }

    #[test]
    fn encrypt_decrypt_zero_sized_payload() {
        let mut buf = [0u8; MAC_BYTES];
        let key = generate_key();
        chacha_encrypt(&mut buf, None, 7, &key).unwrap();
        assert_ne!(buf, [0u8; MAC_BYTES]);
        chacha_decrypt(&mut buf, None, 7, &key).unwrap();
    }

    #[test]
    fn decrypt_rejects_tampered_associated_data() {
        let mut buf = [1u8; MAC_BYTES + 4];
        let key = generate_key();
        chacha_encrypt(&mut buf, Some(b"abc"), 1, &key).unwrap();
        assert!(chacha_decrypt(&mut buf, Some(b"xyz"), 1, &key).is_err());
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let mut buf = [1u8; MAC_BYTES + 4];
        let key = generate_key();
        chacha_encrypt(&mut buf, None, 1, &key).unwrap();
        let other = generate_key();
        assert!(chacha_decrypt(&mut buf, None, 1, &other).is_err());
    }
}
