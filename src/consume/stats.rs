use std::sync::atomic::{AtomicU64, Ordering};

/// Things the consumption loop counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConsumeCounter {
    /// Blobs written to callers.
    FramesEmitted = 0,
    /// Presents resolved without enough history to report.
    PresentsSkipped = 1,
    /// Cursor lapped by the producer.
    Overruns = 2,
    /// Polls that ran out of look-ahead.
    LookaheadStalls = 3,
}

const COUNTER_COUNT: usize = 4;

impl ConsumeCounter {
    fn from_index(i: usize) -> Option<Self> {
        match i {
            0 => Some(Self::FramesEmitted),
            1 => Some(Self::PresentsSkipped),
            2 => Some(Self::Overruns),
            3 => Some(Self::LookaheadStalls),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FramesEmitted => "frames_emitted",
            Self::PresentsSkipped => "presents_skipped",
            Self::Overruns => "overruns",
            Self::LookaheadStalls => "lookahead_stalls",
        }
    }
}

/// Lock-free consumption counters.
///
/// `snapshot()` atomically reads and resets all counters, so periodic
/// reporting never contends with the poll loop.
pub struct ConsumeStats {
    counts: [AtomicU64; COUNTER_COUNT],
}

impl ConsumeStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self, c: ConsumeCounter) {
        self.record_n(c, 1);
    }

    pub fn record_n(&self, c: ConsumeCounter, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(counter) = self.counts.get(c as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(ConsumeCounter, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(c) = ConsumeCounter::from_index(i) {
                    result.push((c, v));
                }
            }
        }

        result
    }
}

impl Default for ConsumeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConsumeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("ConsumeStats");
        for (i, counter) in self.counts.iter().enumerate() {
            if let Some(c) = ConsumeCounter::from_index(i) {
                d.field(c.as_str(), &counter.load(Ordering::Relaxed));
            }
        }
        d.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = ConsumeStats::new();
        stats.record(ConsumeCounter::Overruns);
        stats.record(ConsumeCounter::Overruns);
        stats.record_n(ConsumeCounter::FramesEmitted, 64);

        let snap = stats.snapshot();
        assert_eq!(snap.len(), 2);

        let overruns = snap
            .iter()
            .find(|(c, _)| *c == ConsumeCounter::Overruns)
            .map(|(_, v)| *v);
        assert_eq!(overruns, Some(2));

        let frames = snap
            .iter()
            .find(|(c, _)| *c == ConsumeCounter::FramesEmitted)
            .map(|(_, v)| *v);
        assert_eq!(frames, Some(64));
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = ConsumeStats::new();
        stats.record(ConsumeCounter::LookaheadStalls);

        assert_eq!(stats.snapshot().len(), 1);
        assert!(stats.snapshot().is_empty());
    }

    #[test]
    fn test_record_zero_is_ignored() {
        let stats = ConsumeStats::new();
        stats.record_n(ConsumeCounter::PresentsSkipped, 0);
        assert!(stats.snapshot().is_empty());
    }
}
