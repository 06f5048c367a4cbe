//! Packet framing: a 9-byte header for whole packets (sequence, ack,
//! ack-bitfield) or a 5-byte header for fragments (sequence, fragment id,
//! fragment count). Acks only ride on whole packets — a fragmented message's
//! sequence is acked once as a unit, after reassembly completes.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use no_std_io2::io::Cursor;

use crate::error::{Error, Result};

const TAG_PACKET: u8 = 0;
const TAG_FRAGMENT: u8 = 1;

/// `1 (tag) + 2 (sequence) + 2 (ack) + 4 (ack bitfield)`.
pub const MAX_PACKET_HEADER_BYTES: usize = 9;
/// `1 (tag) + 2 (sequence) + 1 (fragment id) + 1 (fragment count)`.
pub const MAX_FRAGMENT_HEADER_BYTES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Packet {
        sequence: u16,
        ack: u16,
        ack_bits: u32,
    },
    Fragment {
        sequence: u16,
        fragment_id: u8,
        fragment_count: u8,
    },
}

impl Header {
    pub fn sequence(&self) -> u16 {
        match self {
            Header::Packet { sequence, .. } => *sequence,
            Header::Fragment { sequence, .. } => *sequence,
        }
    }

    pub fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<()> {
        match self {
            Header::Packet {
                sequence,
                ack,
                ack_bits,
            } => {
                writer.write_u8(TAG_PACKET)?;
                writer.write_u16::<LE>(*sequence)?;
                writer.write_u16::<LE>(*ack)?;
                writer.write_u32::<LE>(*ack_bits)?;
            }
            Header::Fragment {
                sequence,
                fragment_id,
                fragment_count,
            } => {
                writer.write_u8(TAG_FRAGMENT)?;
                writer.write_u16::<LE>(*sequence)?;
                writer.write_u8(*fragment_id)?;
                writer.write_u8(*fragment_count)?;
            }
        }
        Ok(())
    }

    pub fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self> {
        let tag = reader.read_u8()?;
        match tag {
            TAG_PACKET => {
                let sequence = reader.read_u16::<LE>()?;
                let ack = reader.read_u16::<LE>()?;
                let ack_bits = reader.read_u32::<LE>()?;
                Ok(Header::Packet {
                    sequence,
                    ack,
                    ack_bits,
                })
            }
            TAG_FRAGMENT => {
                let sequence = reader.read_u16::<LE>()?;
                let fragment_id = reader.read_u8()?;
                let fragment_count = reader.read_u8()?;
                Ok(Header::Fragment {
                    sequence,
                    fragment_id,
                    fragment_count,
                })
            }
            _ => Err(Error::InvalidHeader),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Header::Packet { .. } => MAX_PACKET_HEADER_BYTES,
            Header::Fragment { .. } => MAX_FRAGMENT_HEADER_BYTES,
        }
    }

    /// Writes this header at the start of `out`, returning the header
    /// length. `out` must be at least [`Header::encoded_len`] bytes, or the
    /// underlying cursor write fails with [`Error::Io`].
    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        let mut cursor = Cursor::new(&mut out[..len]);
        self.write_to(&mut cursor)?;
        Ok(len)
    }
}

/// Builds the 32-bit bitfield for a [`Header::Packet`] covering the
/// [`crate::ACK_BITFIELD_SIZE`] sequences below `ack`, given a predicate
/// telling whether a given sequence was received.
pub fn build_ack_bitfield(ack: u16, mut received: impl FnMut(u16) -> bool) -> u32 {
    let mut bits = 0u32;
    for i in 0..crate::ACK_BITFIELD_SIZE {
        let sequence = ack.wrapping_sub(1 + i as u16);
        if received(sequence) {
            bits |= 1 << i;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_header_round_trips() {
        let header = Header::Packet {
            sequence: 42,
            ack: 41,
            ack_bits: 0xABCD_1234,
        };
        let mut buf = [0u8; MAX_PACKET_HEADER_BYTES];
        let len = header.encode(&mut buf).unwrap();
        assert_eq!(len, MAX_PACKET_HEADER_BYTES);
        let mut cursor = Cursor::new(&buf[..]);
        assert_eq!(Header::read_from(&mut cursor).unwrap(), header);
    }

    #[test]
    fn fragment_header_round_trips() {
        let header = Header::Fragment {
            sequence: 7,
            fragment_id: 2,
            fragment_count: 5,
        };
        let mut buf = [0u8; MAX_FRAGMENT_HEADER_BYTES];
        let len = header.encode(&mut buf).unwrap();
        assert_eq!(len, MAX_FRAGMENT_HEADER_BYTES);
        let mut cursor = Cursor::new(&buf[..]);
        assert_eq!(Header::read_from(&mut cursor).unwrap(), header);
    }

    #[test]
    fn ack_bitfield_marks_received_sequences() {
        let received = [9u16, 10, 12];
        let bits = build_ack_bitfield(13, |s| received.contains(&s));
        // 13-1=12 -> bit 0; 13-3=10 -> bit 2; 13-4=9 -> bit 3
        assert_eq!(bits & 0b1, 1);
        assert_eq!((bits >> 2) & 0b1, 1);
        assert_eq!((bits >> 3) & 0b1, 1);
        assert_eq!((bits >> 1) & 0b1, 0);
    }
}
