//! Wrapping microsecond time base shared by the pulse ISR and the main cycle.

use core::time::Duration;

/// 32-bit microsecond timestamp that wraps roughly every 71.6 minutes.
///
/// The ISR and the main cycle both read the system timer truncated to 32 bits,
/// so ordering is only meaningful through [`Micros::since`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Micros(pub u32);

impl Micros {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Wrap-aware elapsed time from `earlier` to `self`.
    pub fn since(self, earlier: Micros) -> Duration {
        Duration::from_micros(self.0.wrapping_sub(earlier.0) as u64)
    }

    pub fn wrapping_add(self, delta: Duration) -> Micros {
        Micros(self.0.wrapping_add(duration_to_micros(delta)))
    }

    pub fn wrapping_sub(self, delta: Duration) -> Micros {
        Micros(self.0.wrapping_sub(duration_to_micros(delta)))
    }
}

/// Saturating conversion, durations beyond the wrap period clamp to `u32::MAX`.
pub fn duration_to_micros(d: Duration) -> u32 {
    u32::try_from(d.as_micros()).unwrap_or(u32::MAX)
}

/// Source of "now" for every time based decision.
pub trait Clock {
    fn now(&self) -> Micros;
}

/// A delay started at a known instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub start: Micros,
    pub delay: Duration,
}

impl Deadline {
    pub fn after(start: Micros, delay: Duration) -> Self {
        Self { start, delay }
    }

    pub fn expired(&self, now: Micros) -> bool {
        now.since(self.start) >= self.delay
    }

    pub fn remaining(&self, now: Micros) -> Duration {
        self.delay.saturating_sub(now.since(self.start))
    }
}

/// Reads the ESP high resolution timer. Safe to call from ISR context.
#[cfg(target_os = "espidf")]
#[derive(Debug, Clone, Copy, Default)]
pub struct EspClock;

#[cfg(target_os = "espidf")]
impl EspClock {
    pub fn now_raw() -> Micros {
        // SAFETY: esp_timer_get_time has no preconditions and is ISR safe
        let us = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        Micros(us as u32)
    }
}

#[cfg(target_os = "espidf")]
impl Clock for EspClock {
    fn now(&self) -> Micros {
        Self::now_raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_handles_counter_wrap() {
        let before = Micros(u32::MAX - 499);
        let after = Micros(500);
        assert_eq!(after.since(before), Duration::from_micros(1000));
    }

    #[test]
    fn deadline_expires_across_wrap() {
        let start = Micros(u32::MAX - 1_000);
        let deadline = Deadline::after(start, Duration::from_millis(2));
        assert!(!deadline.expired(start.wrapping_add(Duration::from_millis(1))));
        assert!(deadline.expired(start.wrapping_add(Duration::from_millis(2))));
        assert_eq!(
            deadline.remaining(start.wrapping_add(Duration::from_micros(500))),
            Duration::from_micros(1_500)
        );
    }

    #[test]
    fn oversized_duration_saturates() {
        assert_eq!(duration_to_micros(Duration::from_secs(10_000)), u32::MAX);
    }
}
