//! Per-direction sliding-window duplicate/replay detection over 64-bit
//! sequence numbers.
//!
//! There is no upstream `replay.rs` to port from; the shape is read off the
//! call sites in the packet codec and server/client state machines (`new`,
//! `already_received`, `advance`) and the algorithm in the specification.

const REPLAY_BUFFER_SIZE: usize = 256;
const NEVER_RECEIVED: u64 = u64::MAX;

/// A 256-entry sliding window guaranteeing at-most-once delivery of sequence
/// numbers on one encrypted direction.
#[derive(Debug, Clone)]
pub struct ReplayProtection {
    most_recent_sequence: u64,
    received_packet: [u64; REPLAY_BUFFER_SIZE],
}

impl Default for ReplayProtection {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayProtection {
    pub fn new() -> Self {
        Self {
            most_recent_sequence: 0,
            received_packet: [NEVER_RECEIVED; REPLAY_BUFFER_SIZE],
        }
    }

    /// Returns true if `sequence` is outside the window or was already seen.
    pub fn already_received(&self, sequence: u64) -> bool {
        if sequence + REPLAY_BUFFER_SIZE as u64 <= self.most_recent_sequence {
            return true;
        }
        let entry = self.received_packet[(sequence % REPLAY_BUFFER_SIZE as u64) as usize];
        entry != NEVER_RECEIVED && entry >= sequence
    }

    /// Records `sequence` as received, advancing the window if it's a new high.
    pub fn advance_sequence(&mut self, sequence: u64) {
        if sequence > self.most_recent_sequence {
            self.most_recent_sequence = sequence;
        }
        self.received_packet[(sequence % REPLAY_BUFFER_SIZE as u64) as usize] = sequence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_packets_never_flagged() {
        let shield = ReplayProtection::new();
        for s in 0..10 {
            assert!(!shield.already_received(s));
        }
    }

    #[test]
    fn duplicates_flagged_after_advance() {
        let mut shield = ReplayProtection::new();
        shield.advance_sequence(100);
        assert!(shield.already_received(100));
    }

    #[test]
    fn sequences_outside_window_flagged() {
        let mut shield = ReplayProtection::new();
        shield.advance_sequence(1000);
        assert!(shield.already_received(1000 - REPLAY_BUFFER_SIZE as u64));
        assert!(shield.already_received(0));
    }

    #[test]
    fn large_forward_jump_accepted() {
        let mut shield = ReplayProtection::new();
        shield.advance_sequence(5);
        assert!(!shield.already_received(100_000));
        shield.advance_sequence(100_000);
        assert!(shield.already_received(100_000));
    }

    #[test]
    fn below_window_after_jump_flagged() {
        let mut shield = ReplayProtection::new();
        shield.advance_sequence(100_000);
        assert!(shield.already_received(100_000 - REPLAY_BUFFER_SIZE as u64));
        assert!(!shield.already_received(100_000 - REPLAY_BUFFER_SIZE as u64 + 1));
    }

    #[test]
    fn boundary_offsets_from_most_recent() {
        let mut shield = ReplayProtection::new();
        let most_recent = 10_000u64;
        shield.advance_sequence(most_recent);
        let offsets: [i64; 8] = [-257, -256, -1, 0, 1, 255, 256, 1024];
        let expected_flagged = [true, true, false, true, false, false, false, false];
        for (offset, expected) in offsets.iter().zip(expected_flagged) {
            let sequence = (most_recent as i64 + offset) as u64;
            assert_eq!(
                shield.already_received(sequence),
                expected,
                "offset {offset} from most_recent"
            );
        }
    }

    #[test]
    fn exact_duplicate_flagged() {
        let mut shield = ReplayProtection::new();
        shield.advance_sequence(42);
        assert!(shield.already_received(42));
        shield.advance_sequence(43);
        assert!(shield.already_received(42));
    }
}
