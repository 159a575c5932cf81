//! Pacing of the noise chatter that follows the real payload, so the round
//! carrying the attestation is not the last thing on the wire.

use std::time::Duration;

use rand::{Rng, RngCore};

use crate::config::TimingConfig;

pub trait DelaySource {
    fn next_gap(&mut self, rng: &mut dyn RngCore) -> Duration;
}

/// Gaps drawn uniformly from an inclusive millisecond window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterWindow {
    floor_ms: u64,
    ceil_ms: u64,
}

impl JitterWindow {
    pub fn new(floor: Duration, ceil: Duration) -> Result<Self, &'static str> {
        let floor_ms = u64::try_from(floor.as_millis()).map_err(|_| "noise floor out of range")?;
        let ceil_ms = u64::try_from(ceil.as_millis()).map_err(|_| "noise ceiling out of range")?;
        match (floor_ms, ceil_ms) {
            (0, _) => Err("noise floor must be at least 1ms"),
            (f, c) if c < f => Err("noise ceiling below floor"),
            _ => Ok(Self { floor_ms, ceil_ms }),
        }
    }

    pub fn from_timing(timing: &TimingConfig) -> Result<Self, &'static str> {
        let (floor, ceil) = timing.noise_delay_bounds();
        Self::new(floor, ceil)
    }
}

impl DelaySource for JitterWindow {
    fn next_gap(&mut self, rng: &mut dyn RngCore) -> Duration {
        Duration::from_millis(rng.gen_range(self.floor_ms..=self.ceil_ms))
    }
}

/// A fixed number of gaps drawn from a delay source.
pub struct NoiseSchedule<D: DelaySource> {
    source: D,
    remaining: u32,
}

impl<D: DelaySource> NoiseSchedule<D> {
    pub fn new(source: D, messages: u32) -> Self {
        Self {
            source,
            remaining: messages,
        }
    }

    pub fn next_delay(&mut self, rng: &mut dyn RngCore) -> Option<Duration> {
        self.remaining = self.remaining.checked_sub(1)?;
        Some(self.source.next_gap(rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn window_bounds_are_checked() {
        assert!(JitterWindow::new(Duration::ZERO, Duration::from_millis(1)).is_err());
        assert!(JitterWindow::new(Duration::from_millis(5), Duration::from_millis(1)).is_err());
        assert!(JitterWindow::from_timing(&TimingConfig::default()).is_ok());
    }

    #[test]
    fn gaps_stay_inside_the_window() {
        let mut window = JitterWindow::new(Duration::from_millis(150), Duration::from_millis(900)).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..200 {
            let gap = window.next_gap(&mut rng);
            assert!(gap >= Duration::from_millis(150) && gap <= Duration::from_millis(900));
        }
    }

    #[test]
    fn schedule_runs_out() {
        let window = JitterWindow::new(Duration::from_millis(1), Duration::from_millis(1)).unwrap();
        let mut schedule = NoiseSchedule::new(window, 3);
        let mut rng = StdRng::seed_from_u64(1);
        let gaps: Vec<_> = std::iter::from_fn(|| schedule.next_delay(&mut rng)).collect();
        assert_eq!(gaps, vec![Duration::from_millis(1); 3]);
    }
}
