//! Simulated time.

/// Discrete simulated clock with nanosecond precision. Only the event loop
/// advances it, and never backwards.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now_ns: u64,
}

impl SimClock {
    pub fn new() -> Self {
        Self { now_ns: 0 }
    }

    pub fn now(&self) -> u64 {
        self.now_ns
    }

    pub fn now_ms(&self) -> u64 {
        ns_to_ms(self.now_ns)
    }

    /// Moves the clock to `time_ns`; earlier times leave it unchanged.
    pub fn advance_to(&mut self, time_ns: u64) {
        debug_assert!(time_ns >= self.now_ns, "simulated time went backwards");
        self.now_ns = self.now_ns.max(time_ns);
    }
}

pub const fn ms_to_ns(ms: u64) -> u64 {
    ms.saturating_mul(1_000_000)
}

pub const fn ns_to_ms(ns: u64) -> u64 {
    ns / 1_000_000
}

/// Nanoseconds as fractional milliseconds, for reports.
pub fn ns_to_ms_f64(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_monotonically() {
        let mut clock = SimClock::new();
        clock.advance_to(ms_to_ns(5));
        assert_eq!(clock.now_ms(), 5);
        clock.advance_to(ms_to_ns(7));
        assert_eq!(clock.now(), 7_000_000);
    }

    #[test]
    fn conversions() {
        assert_eq!(ms_to_ns(3), 3_000_000);
        assert_eq!(ns_to_ms(3_999_999), 3);
        assert_eq!(ns_to_ms_f64(1_500_000), 1.5);
    }
}
