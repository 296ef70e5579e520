/**
Card signalling profile. `Slow` inserts a settle delay on every half-bit
edge and is only used while bringing the card up.
*/
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Timing {
    Slow,
    Fast,
}

/**
Paces the Disk II bit cell off a free running nanosecond clock.

A timer interrupt that is masked latches at most one pending request, so
cells missed while the foreground was busy with the card are dropped
rather than replayed.
*/
#[derive(Copy, Clone, Debug)]
pub struct TickPacer {
    next: u64,
    period: u64,
}

impl TickPacer {
    pub fn new(now: u64, period_ns: u32) -> Self {
        return TickPacer {
            next: now + period_ns as u64,
            period: period_ns as u64,
        };
    }

    pub fn due(&mut self, now: u64) -> bool {
        if now < self.next {
            return false;
        }

        self.next += self.period;
        if self.next <= now {
            self.next = now + self.period;
        }

        return true;
    }
}

#[cfg(test)]
mod test_timing {
    use super::TickPacer;

    #[test]
    pub fn test_pacer_fires_once_per_cell() {
        let mut pacer = TickPacer::new(0, 4_000);
        assert!(!pacer.due(3_999));
        assert!(pacer.due(4_000));
        assert!(!pacer.due(4_001));
        assert!(pacer.due(8_000));
    }

    #[test]
    pub fn test_pacer_drops_missed_cells() {
        let mut pacer = TickPacer::new(0, 4_000);
        assert!(pacer.due(100_000));
        assert!(!pacer.due(100_001));
        assert!(!pacer.due(103_999));
        assert!(pacer.due(104_000));
    }
}
