//! Sequence-gap loss accounting

/// Running count of datagrams inferred missing from gaps in the 16-bit RTP
/// sequence number.
///
/// Gaps are measured with wraparound-aware distance. A jump of `n > 1`
/// counts `n - 1` lost; duplicates and late (out-of-order) arrivals never
/// reduce the total and do not move the reference point.
#[derive(Debug, Default, Clone)]
pub struct PacketLossCounter {
    last_seq: Option<u16>,
    lost: u64,
}

impl PacketLossCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq`, returning how many datagrams this arrival revealed as lost.
    pub fn observe(&mut self, seq: u16) -> u64 {
        let Some(last) = self.last_seq else {
            self.last_seq = Some(seq);
            return 0;
        };

        let distance = seq.wrapping_sub(last) as i16;
        if distance <= 0 {
            return 0;
        }
        self.last_seq = Some(seq);
        let missing = (distance - 1) as u64;
        self.lost += missing;
        missing
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn last_sequence(&self) -> Option<u16> {
        self.last_seq
    }

    /// Forget the reference point; the next datagram starts a new run.
    pub fn reset(&mut self) {
        self.last_seq = None;
    }
}
