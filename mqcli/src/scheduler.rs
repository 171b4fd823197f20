use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Repeat delay expressed as whole seconds plus microseconds.
/// Microseconds beyond one million carry into seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatDelay {
    pub secs: u64,
    pub micros: u64,
}

impl RepeatDelay {
    pub fn new(secs: u64, micros: u64) -> Self {
        Self { secs: secs + micros / 1_000_000, micros: micros % 1_000_000 }
    }

    #[inline]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.secs) + Duration::from_micros(self.micros)
    }
}

impl FromStr for RepeatDelay {
    type Err = ClientError;

    /// Fractional seconds, as given on the command line: "2", "0.25".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClientError::Config(format!("invalid repeat delay '{}'", s));
        let (secs, frac) = match s.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (s, ""),
        };
        let secs: u64 = if secs.is_empty() { 0 } else { secs.parse().map_err(|_| invalid())? };
        if !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let mut digits = String::from(&frac[..frac.len().min(6)]);
        while digits.len() < 6 {
            digits.push('0');
        }
        let micros: u64 = digits.parse().map_err(|_| invalid())?;
        Ok(RepeatDelay::new(secs, micros))
    }
}

/// Re-issues an identical publish after the configured delay, until
/// `repeat_count` publishes have been acknowledged. Armed by the
/// publish-acknowledgment handler, polled by the event pump.
#[derive(Debug)]
pub struct RepeatScheduler {
    repeat_count: u32,
    delay: Duration,
    acked: u32,
    ready: bool,
    next_fire: Instant,
}

impl RepeatScheduler {
    pub fn new(repeat_count: u32, delay: RepeatDelay) -> Self {
        Self {
            repeat_count,
            delay: delay.duration(),
            acked: 0,
            ready: false,
            next_fire: Instant::now(),
        }
    }

    /// Every outgoing publish consumes a pending repeat.
    #[inline]
    pub fn note_publish(&mut self) {
        self.ready = false;
    }

    /// Called when a publish is acknowledged. Arms the next repeat and
    /// returns true while the publish count remains below the target.
    pub fn on_acked(&mut self) -> bool {
        self.acked += 1;
        if self.acked < self.repeat_count {
            self.ready = true;
            self.next_fire = Instant::now() + self.delay;
            true
        } else {
            false
        }
    }

    /// True when an armed repeat has passed its fire time.
    #[inline]
    pub fn due(&self) -> bool {
        self.ready && Instant::now() > self.next_fire
    }

    /// How long the event pump may block between polls: roughly half the
    /// configured delay, so a repeat fires close to on-time without
    /// busy-spinning.
    pub fn tick(&self) -> Duration {
        if self.repeat_count > 1 {
            (self.delay / 2).clamp(Duration::from_millis(10), Duration::from_millis(1000))
        } else {
            Duration::from_millis(1000)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_micro_overflow_carries() {
        let d = RepeatDelay::new(1, 2_500_000);
        assert_eq!(d.secs, 3);
        assert_eq!(d.micros, 500_000);
        assert_eq!(d.duration(), Duration::from_micros(3_500_000));
    }

    #[test]
    fn delay_parses_fractional_seconds() {
        assert_eq!("2".parse::<RepeatDelay>().expect(""), RepeatDelay::new(2, 0));
        assert_eq!("0.25".parse::<RepeatDelay>().expect(""), RepeatDelay::new(0, 250_000));
        assert_eq!("1.5".parse::<RepeatDelay>().expect(""), RepeatDelay::new(1, 500_000));
        assert_eq!(".5".parse::<RepeatDelay>().expect(""), RepeatDelay::new(0, 500_000));
        assert!("abc".parse::<RepeatDelay>().is_err());
        assert!("1.x".parse::<RepeatDelay>().is_err());
    }

    #[test]
    fn never_arms_below_two() {
        for count in [0, 1] {
            let mut s = RepeatScheduler::new(count, RepeatDelay::new(0, 0));
            s.note_publish();
            assert!(!s.on_acked());
            assert!(!s.due());
        }
    }

    #[test]
    fn exact_count_with_min_gap() {
        let delay = Duration::from_millis(20);
        let mut s = RepeatScheduler::new(3, RepeatDelay::new(0, 20_000));
        let mut publishes = Vec::new();

        // first publish and its acknowledgment
        s.note_publish();
        publishes.push(Instant::now());
        let mut armed = s.on_acked();

        while armed {
            while !s.due() {
                std::thread::sleep(Duration::from_millis(1));
            }
            s.note_publish();
            publishes.push(Instant::now());
            armed = s.on_acked();
        }

        assert_eq!(publishes.len(), 3);
        for pair in publishes.windows(2) {
            assert!(pair[1] - pair[0] >= delay);
        }
        assert!(!s.due());
    }

    #[test]
    fn publish_consumes_armed_repeat() {
        let mut s = RepeatScheduler::new(5, RepeatDelay::new(0, 0));
        s.note_publish();
        assert!(s.on_acked());
        std::thread::sleep(Duration::from_millis(2));
        assert!(s.due());
        s.note_publish();
        assert!(!s.due());
    }

    #[test]
    fn tick_is_half_the_delay() {
        let s = RepeatScheduler::new(3, RepeatDelay::new(0, 100_000));
        assert_eq!(s.tick(), Duration::from_millis(50));
        // clamped on both ends
        let s = RepeatScheduler::new(3, RepeatDelay::new(0, 1_000));
        assert_eq!(s.tick(), Duration::from_millis(10));
        let s = RepeatScheduler::new(3, RepeatDelay::new(30, 0));
        assert_eq!(s.tick(), Duration::from_millis(1000));
        let s = RepeatScheduler::new(1, RepeatDelay::new(0, 100_000));
        assert_eq!(s.tick(), Duration::from_millis(1000));
    }
}
