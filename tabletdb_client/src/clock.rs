//! Hybrid time values propagated by tablet servers.

use std::{
    fmt::Display,
    sync::atomic::{AtomicU64, Ordering},
};

/// A hybrid logical clock reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HybridTime(u64);

impl HybridTime {
    pub const MIN: Self = Self(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for HybridTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The read time a tablet server picked for a read that did not carry one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadHybridTime {
    pub read: HybridTime,
    pub global_limit: HybridTime,
}

/// The consistent read point of a session, advanced after successful flushes.
pub trait ConsistentReadPoint: std::fmt::Debug + Send + Sync {
    fn update_clock(&self, propagated: HybridTime);
}

/// Client wide tracking of the latest hybrid time observed in any response.
pub trait HybridClock: std::fmt::Debug + Send + Sync {
    fn update_latest_observed(&self, observed: HybridTime);
}

/// A [`HybridClock`] that keeps the maximum observed time.
#[derive(Debug, Default)]
pub struct LatestObservedHybridTime(AtomicU64);

impl LatestObservedHybridTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> HybridTime {
        HybridTime(self.0.load(Ordering::Acquire))
    }
}

impl HybridClock for LatestObservedHybridTime {
    fn update_latest_observed(&self, observed: HybridTime) {
        self.0.fetch_max(observed.0, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_observed_never_goes_backwards() {
        let clock = LatestObservedHybridTime::new();
        assert_eq!(clock.get(), HybridTime::MIN);

        clock.update_latest_observed(HybridTime::new(10));
        clock.update_latest_observed(HybridTime::new(4));
        assert_eq!(clock.get(), HybridTime::new(10));

        clock.update_latest_observed(HybridTime::new(11));
        assert_eq!(clock.get().get(), 11);
    }
}
