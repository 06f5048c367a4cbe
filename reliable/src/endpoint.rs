//! The reliable endpoint: turns outgoing buffers into sequenced, optionally
//! fragmented packets; turns incoming packets back into buffers and ack
//! notifications.

use alloc::boxed::Box;
use alloc::vec::Vec;

use no_std_io2::io::Cursor;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::fragment::ReassemblyBuffer;
use crate::header::{self, Header, MAX_FRAGMENT_HEADER_BYTES, MAX_PACKET_HEADER_BYTES};
use crate::sequence_buffer::SequenceBuffer;
use crate::{
    ACK_BITFIELD_SIZE, DEFAULT_ACK_TIMEOUT_SEC, DEFAULT_BUFFER_SIZE, DEFAULT_FRAGMENT_ABOVE,
    DEFAULT_FRAGMENT_SIZE, DEFAULT_MAX_FRAGMENTS,
};

/// Counters for observability, mirroring reliable.io's seven-counter layout:
/// invalid-fragment and packet-too-large-to-send share a slot upstream, kept
/// here as one field since nothing downstream needs to tell them apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReliableStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_acked: u64,
    pub packets_stale: u64,
    pub invalid_packets: u64,
    pub invalid_fragments_or_too_large_to_send: u64,
    pub packets_too_large_to_receive: u64,
}

struct SentPacketData {
    time_sent: f64,
    acked: bool,
    size: usize,
}

struct ReceivedPacketData {
    size: usize,
}

/// Tunables for one [`Endpoint`], mirroring `reliable_config_t`.
pub struct EndpointConfig {
    pub max_packet_size: usize,
    pub fragment_above: usize,
    pub max_fragments: usize,
    pub fragment_size: usize,
    pub ack_buffer_size: usize,
    pub sent_packets_buffer_size: usize,
    pub received_packets_buffer_size: usize,
    pub fragment_reassembly_buffer_size: usize,
    pub ack_timeout_seconds: f64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_packet_size: netcode::MAX_PACKET_SIZE,
            fragment_above: DEFAULT_FRAGMENT_ABOVE,
            max_fragments: DEFAULT_MAX_FRAGMENTS,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            ack_buffer_size: DEFAULT_BUFFER_SIZE,
            sent_packets_buffer_size: DEFAULT_BUFFER_SIZE,
            received_packets_buffer_size: DEFAULT_BUFFER_SIZE,
            fragment_reassembly_buffer_size: DEFAULT_BUFFER_SIZE,
            ack_timeout_seconds: DEFAULT_ACK_TIMEOUT_SEC,
        }
    }
}

/// One reliable endpoint: owns its own send/receive sequence space. Two
/// endpoints exchanging packets each run one of these; neither knows about
/// the other's internal state.
pub struct Endpoint {
    config: EndpointConfig,
    sequence: u16,
    /// Highest sequence received from the peer, carried as the `ack` field
    /// of our own outgoing packet headers. `None` until the first packet
    /// arrives, in which case we have nothing to acknowledge yet.
    last_received_sequence: Option<u16>,
    sent_buffer: SequenceBuffer<SentPacketData>,
    received_buffer: SequenceBuffer<ReceivedPacketData>,
    reassembly: ReassemblyBuffer,
    acks: Vec<u16>,
    time: f64,
    stats: ReliableStats,
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            sent_buffer: SequenceBuffer::new(config.sent_packets_buffer_size),
            received_buffer: SequenceBuffer::new(config.received_packets_buffer_size),
            reassembly: ReassemblyBuffer::new(config.fragment_reassembly_buffer_size),
            acks: Vec::with_capacity(config.ack_buffer_size),
            sequence: 0,
            last_received_sequence: None,
            time: 0.0,
            stats: ReliableStats::default(),
            config,
        }
    }

    pub fn stats(&self) -> ReliableStats {
        self.stats
    }

    /// The sequence number the next call to [`Endpoint::send_packet`] will use.
    pub fn next_packet_sequence(&self) -> u16 {
        self.sequence
    }

    /// Encodes `payload` into one or more wire packets (fragmenting above
    /// `fragment_above`), calling `transmit` once per wire packet with its
    /// destination-agnostic bytes. Returns the sequence number assigned to
    /// the whole message.
    pub fn send_packet(
        &mut self,
        payload: &[u8],
        mut transmit: impl FnMut(&[u8]),
    ) -> Result<u16> {
        if payload.len() > self.config.max_packet_size {
            self.stats.invalid_fragments_or_too_large_to_send += 1;
            return Err(Error::PacketTooLarge(payload.len(), self.config.max_packet_size));
        }

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        self.sent_buffer.insert(
            sequence,
            SentPacketData {
                time_sent: self.time,
                acked: false,
                size: payload.len(),
            },
        );

        if payload.len() <= self.config.fragment_above {
            let header = self.ack_header_for(sequence);
            let mut buf = alloc::vec![0u8; MAX_PACKET_HEADER_BYTES + payload.len()];
            let len = header.encode(&mut buf)?;
            buf[len..].copy_from_slice(payload);
            transmit(&buf);
        } else {
            let fragment_count = payload.len().div_ceil(self.config.fragment_size);
            if fragment_count > self.config.max_fragments || fragment_count > u8::MAX as usize {
                self.stats.invalid_fragments_or_too_large_to_send += 1;
                return Err(Error::PacketTooLarge(payload.len(), self.config.max_packet_size));
            }
            for (fragment_id, chunk) in payload.chunks(self.config.fragment_size).enumerate() {
                let header = Header::Fragment {
                    sequence,
                    fragment_id: fragment_id as u8,
                    fragment_count: fragment_count as u8,
                };
                let mut buf = alloc::vec![0u8; MAX_FRAGMENT_HEADER_BYTES + chunk.len()];
                let len = header.encode(&mut buf)?;
                buf[len..].copy_from_slice(chunk);
                transmit(&buf);
            }
        }
        self.stats.packets_sent += 1;
        Ok(sequence)
    }

    fn ack_header_for(&self, sequence: u16) -> Header {
        // Before anything has arrived there is nothing truthful to ack; use a
        // sentinel sequence the peer can't plausibly have sent yet rather
        // than 0, which would falsely acknowledge the peer's own first packet.
        let ack = self.last_received_sequence.unwrap_or(u16::MAX);
        let received = &self.received_buffer;
        let ack_bits = header::build_ack_bitfield(ack, |s| received.exists(s));
        Header::Packet {
            sequence,
            ack,
            ack_bits,
        }
    }

    /// Decodes one wire packet. Returns the reassembled application payload
    /// once a whole message (fragmented or not) has fully arrived.
    pub fn receive_packet(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut cursor = Cursor::new(data);
        let header = match Header::read_from(&mut cursor) {
            Ok(h) => h,
            Err(e) => {
                self.stats.invalid_packets += 1;
                trace!(?e, "dropping malformed reliable header");
                return Ok(None);
            }
        };

        match header {
            Header::Packet {
                sequence,
                ack,
                ack_bits,
            } => {
                let body = &data[MAX_PACKET_HEADER_BYTES..];
                if body.len() > self.config.max_packet_size {
                    self.stats.packets_too_large_to_receive += 1;
                    return Ok(None);
                }
                self.received_buffer
                    .insert(sequence, ReceivedPacketData { size: body.len() });
                self.note_received(sequence);
                self.stats.packets_received += 1;
                self.apply_acks(ack, ack_bits);
                Ok(Some(body.to_vec()))
            }
            Header::Fragment {
                sequence,
                fragment_id,
                fragment_count,
            } => {
                let body = &data[MAX_FRAGMENT_HEADER_BYTES..];
                match self.reassembly.receive_fragment(
                    sequence,
                    fragment_id,
                    fragment_count,
                    self.config.fragment_size,
                    body,
                ) {
                    Ok(Some(whole)) => {
                        self.received_buffer
                            .insert(sequence, ReceivedPacketData { size: whole.len() });
                        self.note_received(sequence);
                        self.stats.packets_received += 1;
                        Ok(Some(whole))
                    }
                    Ok(None) => Ok(None),
                    Err(e) => {
                        self.stats.invalid_fragments_or_too_large_to_send += 1;
                        debug!(?e, "dropping malformed fragment");
                        Ok(None)
                    }
                }
            }
        }
    }

    fn note_received(&mut self, sequence: u16) {
        let is_newer = match self.last_received_sequence {
            None => true,
            Some(latest) => sequence.wrapping_sub(latest) as i16 > 0,
        };
        if is_newer {
            self.last_received_sequence = Some(sequence);
        }
    }

    fn apply_acks(&mut self, ack: u16, ack_bits: u32) {
        if self.mark_acked(ack) {
            self.acks.push(ack);
        }
        for i in 0..ACK_BITFIELD_SIZE {
            if ack_bits & (1 << i) != 0 {
                let sequence = ack.wrapping_sub(1 + i as u16);
                if self.mark_acked(sequence) {
                    self.acks.push(sequence);
                }
            }
        }
    }

    fn mark_acked(&mut self, sequence: u16) -> bool {
        if let Some(entry) = self.sent_buffer.get_mut(sequence) {
            if !entry.acked {
                entry.acked = true;
                self.stats.packets_acked += 1;
                return true;
            }
        }
        false
    }

    /// The sequences newly acked since the last [`Endpoint::clear_acks`].
    pub fn get_acks(&self) -> &[u16] {
        &self.acks
    }

    pub fn clear_acks(&mut self) {
        self.acks.clear();
    }

    /// Advances endpoint time, ages out sent-packet bookkeeping that has
    /// gone unacked past `ack_timeout_seconds`.
    pub fn update(&mut self, time: f64) {
        self.time = time;
        let timeout = self.config.ack_timeout_seconds;
        let stale: Box<[u16]> = self
            .sent_buffer
            .iter()
            .filter(|(_, entry)| !entry.acked && self.time - entry.time_sent > timeout)
            .map(|(seq, _)| seq)
            .collect();
        for sequence in stale.iter() {
            self.sent_buffer.remove(*sequence);
            self.stats.packets_stale += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_round_trips_without_fragmenting() {
        let mut sender = Endpoint::new(EndpointConfig::default());
        let mut receiver = Endpoint::new(EndpointConfig::default());
        let mut wire = Vec::new();
        sender.send_packet(b"hello", |pkt| wire = pkt.to_vec()).unwrap();
        let payload = receiver.receive_packet(&wire).unwrap().unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(sender.stats().packets_sent, 1);
        assert_eq!(receiver.stats().packets_received, 1);
    }

    #[test]
    fn large_payload_fragments_and_reassembles() {
        let config = EndpointConfig {
            fragment_above: 16,
            fragment_size: 8,
            ..EndpointConfig::default()
        };
        let mut sender = Endpoint::new(config);
        let mut receiver = Endpoint::new(EndpointConfig {
            fragment_above: 16,
            fragment_size: 8,
            ..EndpointConfig::default()
        });
        let payload: Vec<u8> = (0..40u8).collect();
        let mut fragments = Vec::new();
        sender
            .send_packet(&payload, |pkt| fragments.push(pkt.to_vec()))
            .unwrap();
        assert_eq!(fragments.len(), 5);

        let mut reassembled = None;
        for fragment in &fragments {
            if let Some(whole) = receiver.receive_packet(fragment).unwrap() {
                reassembled = Some(whole);
            }
        }
        assert_eq!(reassembled, Some(payload));
    }

    #[test]
    fn acks_surface_after_receiving_a_later_packet() {
        let mut sender = Endpoint::new(EndpointConfig::default());
        let mut receiver = Endpoint::new(EndpointConfig::default());

        let mut wire_a = Vec::new();
        sender.send_packet(b"a", |pkt| wire_a = pkt.to_vec()).unwrap();
        receiver.receive_packet(&wire_a).unwrap();

        let mut wire_b = Vec::new();
        receiver.send_packet(b"ack-carrier", |pkt| wire_b = pkt.to_vec()).unwrap();
        sender.receive_packet(&wire_b).unwrap();

        assert_eq!(sender.get_acks(), &[0]);
        sender.clear_acks();
        assert!(sender.get_acks().is_empty());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut endpoint = Endpoint::new(EndpointConfig {
            max_packet_size: 8,
            ..EndpointConfig::default()
        });
        let err = endpoint.send_packet(&[0u8; 9], |_| {}).unwrap_err();
        assert!(matches!(err, Error::PacketTooLarge(9, 8)));
    }

    #[test]
    fn stale_unacked_packets_are_aged_out() {
        let mut endpoint = Endpoint::new(EndpointConfig {
            ack_timeout_seconds: 1.0,
            ..EndpointConfig::default()
        });
        endpoint.send_packet(b"x", |_| {}).unwrap();
        endpoint.update(5.0);
        assert_eq!(endpoint.stats().packets_stale, 1);
    }
}
