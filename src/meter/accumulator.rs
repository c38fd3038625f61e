//! Pulse-to-volume accumulation and windowed flow rate.

use super::capture::PulseEvent;
use super::config::MeterConfig;
use crate::clock::{Deadline, Micros};
use crate::storage::{self, KeyValueStore, StorageError, METER_KEY};
use core::time::Duration;
use heapless::Deque;
use serde::{Deserialize, Serialize};

/// Recent pulse timestamps kept for the flow window.
pub const FLOW_RING_SIZE: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct MeterState {
    /// Volume restored from the last checkpoint
    pub baseline_liters: f64,
    /// Pulses accepted since boot
    pub pulses: u64,
    pub last_pulse: Option<Micros>,
    pub liters_per_pulse: f64,
}

impl MeterState {
    pub fn cumulative_liters(&self) -> f64 {
        self.baseline_liters + self.pulses as f64 * self.liters_per_pulse
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowSample {
    pub liters_per_minute: f64,
    pub window_start: Micros,
    pub window_end: Micros,
}

/// Durable form of [`MeterState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterCheckpoint {
    pub cumulative_liters: f64,
    pub liters_per_pulse: f64,
}

pub struct FlowAccumulator {
    config: MeterConfig,
    state: MeterState,
    recent: Deque<Micros, FLOW_RING_SIZE>,
    ring_evictions: u32,
    /// Newest timestamp pushed out of a full ring; while it is inside the
    /// window the ring no longer holds every in-window pulse.
    last_evicted: Option<Micros>,
    origin: Micros,
    window_filled: bool,
    last_checkpoint: Option<(Micros, f64)>,
    failed_checkpoint: Option<Micros>,
}

impl FlowAccumulator {
    /// Start a fresh meter at zero liters. `now` anchors the first flow window.
    pub fn new(config: MeterConfig, now: Micros) -> Self {
        let liters_per_pulse = config.liters_per_pulse;
        Self {
            config,
            state: MeterState {
                baseline_liters: 0.0,
                pulses: 0,
                last_pulse: None,
                liters_per_pulse,
            },
            recent: Deque::new(),
            ring_evictions: 0,
            last_evicted: None,
            origin: now,
            window_filled: false,
            last_checkpoint: None,
            failed_checkpoint: None,
        }
    }

    /// Start from the stored checkpoint, or from zero when none exists.
    ///
    /// A read failure is returned so the caller can log it; measurement still
    /// proceeds from zero in that case.
    pub fn restore<S: KeyValueStore>(
        config: MeterConfig,
        now: Micros,
        store: &mut S,
    ) -> (Self, Result<(), StorageError>) {
        let mut accumulator = Self::new(config, now);
        let result = match storage::load_json::<_, MeterCheckpoint>(store, METER_KEY) {
            Ok(Some(checkpoint)) => {
                if checkpoint.cumulative_liters.is_finite() && checkpoint.cumulative_liters >= 0.0 {
                    log::info!(
                        "Meter: Restored {:.3} L from checkpoint",
                        checkpoint.cumulative_liters
                    );
                    accumulator.state.baseline_liters = checkpoint.cumulative_liters;
                    accumulator.last_checkpoint = Some((now, checkpoint.cumulative_liters));
                } else {
                    log::warn!("Meter: Ignoring invalid checkpoint {:?}", checkpoint);
                }
                Ok(())
            }
            Ok(None) => {
                log::info!("Meter: No checkpoint stored, starting at 0 L");
                Ok(())
            }
            Err(e) => Err(e),
        };
        (accumulator, result)
    }

    /// The only mutator of [`MeterState`].
    pub fn record_pulse(&mut self, event: PulseEvent) {
        self.state.pulses += 1;
        self.state.last_pulse = Some(event.timestamp);

        if self.recent.is_full() {
            self.last_evicted = self.recent.pop_front();
            self.ring_evictions = self.ring_evictions.saturating_add(1);
        }
        let _ = self.recent.push_back(event.timestamp);
    }

    pub fn sample(&mut self, now: Micros) -> FlowSample {
        let window = self.config.flow_window;
        if !self.window_filled && now.since(self.origin) >= window {
            self.window_filled = true;
        }
        let span = if self.window_filled {
            window
        } else {
            now.since(self.origin)
        };

        // Drop timestamps that fell out of the window while the counter still
        // orders them correctly, so a wrap can never make them look recent.
        while let Some(oldest) = self.recent.front() {
            if now.since(*oldest) > span {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if let Some(evicted) = self.last_evicted {
            if now.since(evicted) > span {
                self.last_evicted = None;
            }
        }

        let window_start = now.wrapping_sub(span);
        let idle = match self.state.last_pulse {
            None => true,
            Some(last) => now.since(last) > self.config.stale_after,
        };

        let liters_per_minute = if idle || span.is_zero() || self.recent.is_empty() {
            0.0
        } else {
            let liters = self.recent.len() as f64 * self.state.liters_per_pulse;
            // Ring overflowed inside the window: measure over the stretch it
            // still covers, everything after the last evicted pulse.
            let covered = match self.last_evicted {
                Some(evicted) => now.since(evicted),
                None => span,
            };
            liters / (covered.as_secs_f64() / 60.0)
        };

        FlowSample {
            liters_per_minute,
            window_start,
            window_end: now,
        }
    }

    pub fn cumulative_liters(&self) -> f64 {
        self.state.cumulative_liters()
    }

    pub fn state(&self) -> &MeterState {
        &self.state
    }

    pub fn ring_evictions(&self) -> u32 {
        self.ring_evictions
    }

    /// True when the interval elapsed since the last checkpoint and the volume moved.
    /// A failed attempt holds further attempts off for one interval as well.
    pub fn checkpoint_due(&self, now: Micros) -> bool {
        if let Some(failed_at) = self.failed_checkpoint {
            if !Deadline::after(failed_at, self.config.checkpoint_interval).expired(now) {
                return false;
            }
        }
        match self.last_checkpoint {
            None => self.state.pulses > 0,
            Some((at, liters)) => {
                liters != self.cumulative_liters()
                    && Deadline::after(at, self.config.checkpoint_interval).expired(now)
            }
        }
    }

    /// Write the current volume. On failure the previous checkpoint stays
    /// authoritative and the attempt is retried one checkpoint interval later.
    pub fn checkpoint<S: KeyValueStore>(
        &mut self,
        now: Micros,
        store: &mut S,
    ) -> Result<(), StorageError> {
        let checkpoint = MeterCheckpoint {
            cumulative_liters: self.cumulative_liters(),
            liters_per_pulse: self.state.liters_per_pulse,
        };
        if let Err(e) = storage::store_json(store, METER_KEY, &checkpoint) {
            self.failed_checkpoint = Some(now);
            return Err(e);
        }
        self.failed_checkpoint = None;
        self.last_checkpoint = Some((now, checkpoint.cumulative_liters));
        log::info!(
            "Meter: Checkpoint {:.3} L ({} pulses since boot)",
            checkpoint.cumulative_liters,
            self.state.pulses
        );
        Ok(())
    }

    pub fn flow_window(&self) -> Duration {
        self.config.flow_window
    }

    pub fn checkpoint_interval(&self) -> Duration {
        self.config.checkpoint_interval
    }
}
