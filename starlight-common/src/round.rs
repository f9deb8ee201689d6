use serde::{Deserialize, Serialize};

/// A channel's monotone payment-round counter. Starts at `0` before the
/// channel is funded; the first settled payment round is `1`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Round(u64);

impl Round {
    pub const ZERO: Round = Round(0);

    pub fn get(self) -> u64 {
        self.0
    }

    /// Strictly increments the round, per the `roundNumber` invariant in
    /// the spec (§3): it never decreases and never skips.
    pub fn next(self) -> Self {
        Round(self.0.checked_add(1).expect("round number overflowed u64"))
    }
}

/// A per-channel, per-direction outbound message sequence number. Starts at
/// `1` for the first message sent in a given direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MsgSeq(u64);

impl MsgSeq {
    pub const FIRST: MsgSeq = MsgSeq(1);

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        MsgSeq(self.0.checked_add(1).expect("message sequence overflowed u64"))
    }
}

impl Default for MsgSeq {
    fn default() -> Self {
        Self::FIRST
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_strictly_increases() {
        let r0 = Round::ZERO;
        let r1 = r0.next();
        let r2 = r1.next();
        assert!(r1 > r0);
        assert!(r2 > r1);
    }

    #[test]
    fn msg_seq_starts_at_one_and_has_no_gaps() {
        let mut seq = MsgSeq::FIRST;
        assert_eq!(seq.get(), 1);
        for expected in 2..10 {
            seq = seq.next();
            assert_eq!(seq.get(), expected);
        }
    }
}
