//! Fragment reassembly: buffers partial messages keyed by their whole-message
//! sequence number, completing once every fragment slot is filled.

use alloc::vec;
use alloc::vec::Vec;

use tracing::debug;

use crate::error::{Error, Result};
use crate::sequence_buffer::SequenceBuffer;

struct Reassembly {
    fragment_count: u8,
    received: Vec<bool>,
    num_received: u8,
    fragment_size: usize,
    data: Vec<u8>,
}

impl Reassembly {
    fn new(fragment_count: u8, fragment_size: usize) -> Self {
        Self {
            fragment_count,
            received: vec![false; fragment_count as usize],
            num_received: 0,
            fragment_size,
            data: vec![0u8; fragment_count as usize * fragment_size],
        }
    }

    fn is_complete(&self) -> bool {
        self.num_received == self.fragment_count
    }
}

/// Fixed-capacity table of in-progress reassemblies, one slot per
/// in-flight whole-message sequence. When a new message's sequence collides
/// with a still-incomplete slot, the older partial reassembly is dropped
/// (§4.7: "reassembly buffer full → drop oldest partial").
pub(crate) struct ReassemblyBuffer {
    buffer: SequenceBuffer<Reassembly>,
}

impl ReassemblyBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buffer: SequenceBuffer::new(capacity),
        }
    }

    /// Feeds one fragment in. Returns the whole reassembled buffer once the
    /// last fragment for `sequence` arrives.
    pub(crate) fn receive_fragment(
        &mut self,
        sequence: u16,
        fragment_id: u8,
        fragment_count: u8,
        fragment_size: usize,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if fragment_count == 0 || fragment_id >= fragment_count {
            return Err(Error::FragmentIndexOutOfRange(fragment_id, fragment_count));
        }

        // A sequence number reusing a still-incomplete slot (stale partial,
        // or a fragment count that doesn't match what's in progress) starts
        // a fresh reassembly, dropping whatever was there.
        let needs_fresh = match self.buffer.get(sequence) {
            Some(entry) => entry.fragment_count != fragment_count,
            None => true,
        };
        if needs_fresh {
            let evicted = self
                .buffer
                .insert(sequence, Reassembly::new(fragment_count, fragment_size));
            if let Some((old_sequence, old)) = evicted {
                if old_sequence != sequence && !old.is_complete() {
                    debug!(%old_sequence, new_sequence = %sequence, "{}", Error::ReassemblyBufferFull);
                }
            }
        }
        let entry = self.buffer.get_mut(sequence).expect("just inserted above");
        Self::apply_fragment(entry, fragment_id, payload)
    }

    fn apply_fragment(entry: &mut Reassembly, fragment_id: u8, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        let idx = fragment_id as usize;
        if entry.received[idx] {
            return Ok(None);
        }
        let start = idx * entry.fragment_size;
        let is_last = fragment_id + 1 == entry.fragment_count;
        let end = if is_last {
            start + payload.len()
        } else {
            start + entry.fragment_size
        };
        if end > entry.data.len() {
            entry.data.resize(end, 0);
        }
        entry.data[start..start + payload.len()].copy_from_slice(payload);
        entry.received[idx] = true;
        entry.num_received += 1;

        if entry.is_complete() {
            let last_len = start + payload.len();
            let total_len = if is_last {
                last_len
            } else {
                entry.data.len()
            };
            let mut data = core::mem::take(&mut entry.data);
            data.truncate(total_len);
            return Ok(Some(data));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_in_order_fragments() {
        let mut buf = ReassemblyBuffer::new(4);
        assert!(buf
            .receive_fragment(1, 0, 2, 4, &[1, 2, 3, 4])
            .unwrap()
            .is_none());
        let whole = buf.receive_fragment(1, 1, 2, 4, &[5, 6]).unwrap().unwrap();
        assert_eq!(whole, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn reassembles_out_of_order_fragments() {
        let mut buf = ReassemblyBuffer::new(4);
        assert!(buf.receive_fragment(2, 2, 3, 2, &[9]).unwrap().is_none());
        assert!(buf.receive_fragment(2, 0, 3, 2, &[1, 2]).unwrap().is_none());
        let whole = buf.receive_fragment(2, 1, 3, 2, &[3, 4]).unwrap().unwrap();
        assert_eq!(whole, vec![1, 2, 3, 4, 9]);
    }

    #[test]
    fn rejects_out_of_range_fragment_id() {
        let mut buf = ReassemblyBuffer::new(4);
        let err = buf.receive_fragment(1, 5, 3, 4, &[0]).unwrap_err();
        assert!(matches!(err, Error::FragmentIndexOutOfRange(5, 3)));
    }

    #[test]
    fn colliding_sequence_drops_oldest_partial() {
        let mut buf = ReassemblyBuffer::new(2);
        // sequence 5 and 7 both map to slot 1 (capacity 2).
        assert!(buf.receive_fragment(5, 0, 2, 4, &[1, 2, 3, 4]).unwrap().is_none());
        assert!(buf.receive_fragment(7, 0, 2, 4, &[9, 9, 9, 9]).unwrap().is_none());
        // sequence 5's partial was evicted; completing it now starts fresh
        // instead of finishing the original message.
        let whole = buf.receive_fragment(5, 1, 2, 4, &[5, 6]).unwrap();
        assert!(whole.is_none());
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let mut buf = ReassemblyBuffer::new(4);
        buf.receive_fragment(1, 0, 2, 4, &[1, 2, 3, 4]).unwrap();
        assert!(buf
            .receive_fragment(1, 0, 2, 4, &[9, 9, 9, 9])
            .unwrap()
            .is_none());
        let whole = buf.receive_fragment(1, 1, 2, 4, &[5, 6]).unwrap().unwrap();
        assert_eq!(whole, vec![1, 2, 3, 4, 5, 6]);
    }
}
