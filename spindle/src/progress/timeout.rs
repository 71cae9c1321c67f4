use std::time::Duration;

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);

/// Poll timeout of the progress loop: zero while completions keep coming,
/// doubling from 1ms up to the ceiling while idle.
#[derive(Debug, Clone)]
pub(crate) struct AdaptiveTimeout {
    current: Duration,
    max: Duration,
}

impl AdaptiveTimeout {
    pub(crate) fn new(max: Duration) -> Self {
        Self {
            current: Duration::ZERO,
            max,
        }
    }

    pub(crate) fn current(&self) -> Duration {
        self.current
    }

    /// New work was submitted, poll without blocking next time.
    pub(crate) fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    /// Feeds the number of completions the last iteration fired.
    pub(crate) fn observe(&mut self, fired: usize) {
        if fired > 0 {
            self.reset();
            return;
        }

        self.current = if self.current.is_zero() {
            INITIAL_BACKOFF
        } else {
            self.current.saturating_mul(2)
        }
        .min(self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_burst_drops_to_zero() {
        let mut timeout = AdaptiveTimeout::new(Duration::from_millis(100));
        for _ in 0..5 {
            timeout.observe(0);
        }
        assert!(timeout.current() > Duration::ZERO);

        timeout.observe(3);
        assert_eq!(timeout.current(), Duration::ZERO);
        timeout.observe(1);
        assert_eq!(timeout.current(), Duration::ZERO);
    }

    #[rstest]
    #[case::round(Duration::from_millis(64))]
    #[case::uneven(Duration::from_millis(100))]
    #[case::sub_millisecond(Duration::from_micros(300))]
    fn test_idle_grows_to_exact_ceiling(#[case] max: Duration) {
        let mut timeout = AdaptiveTimeout::new(max);
        let mut previous = timeout.current();

        for _ in 0..64 {
            timeout.observe(0);
            assert!(timeout.current() >= previous);
            assert!(timeout.current() <= max);
            previous = timeout.current();
        }
        assert_eq!(timeout.current(), max);
    }

    #[test]
    fn test_zero_ceiling_always_polls() {
        let mut timeout = AdaptiveTimeout::new(Duration::ZERO);
        timeout.observe(0);
        timeout.observe(0);
        assert_eq!(timeout.current(), Duration::ZERO);
    }

    #[test]
    fn test_reset_after_idle() {
        let mut timeout = AdaptiveTimeout::new(Duration::from_millis(10));
        timeout.observe(0);
        timeout.observe(0);
        timeout.reset();
        assert_eq!(timeout.current(), Duration::ZERO);
        timeout.observe(0);
        assert_eq!(timeout.current(), INITIAL_BACKOFF);
    }
}
