//! Pulse capture: debounced edge timestamps handed from the GPIO ISR to the main cycle.
//!
//! The ISR side ([`PulseCapture`]) owns the producer half of a lock-free
//! single-producer/single-consumer queue and a few atomic counters. It never
//! allocates, locks or blocks. The main cycle drains the consumer half
//! through [`PulseDrain`].

use crate::clock::{duration_to_micros, Micros};
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;
use heapless::spsc::{Consumer, Producer, Queue};
use std::sync::Arc;

/// Queue slots between ISR and main cycle (one slot is reserved by the queue).
pub const PULSE_QUEUE_SIZE: usize = 64;

pub type PulseQueue = Queue<PulseEvent, PULSE_QUEUE_SIZE>;

/// One validated meter pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseEvent {
    pub timestamp: Micros,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOutcome {
    Accepted,
    /// Inside the dead-time of the previous edge
    Bounce,
    /// Debounced, but the handoff queue was full
    Overflow,
}

/// Diagnostic counters shared between the ISR and the main cycle.
#[derive(Debug, Default)]
pub struct CaptureCounters {
    accepted: AtomicU32,
    rejected: AtomicU32,
    overflowed: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureStats {
    pub accepted: u32,
    pub rejected: u32,
    pub overflowed: u32,
}

impl CaptureCounters {
    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
        }
    }
}

/// ISR half. Move it into the edge interrupt closure.
pub struct PulseCapture<'q> {
    producer: Producer<'q, PulseEvent, PULSE_QUEUE_SIZE>,
    dead_time_us: u32,
    last_edge: Option<Micros>,
    counters: Arc<CaptureCounters>,
}

/// Main cycle half.
pub struct PulseDrain<'q> {
    consumer: Consumer<'q, PulseEvent, PULSE_QUEUE_SIZE>,
    counters: Arc<CaptureCounters>,
}

/// Split a pulse queue into its ISR and main cycle halves.
pub fn pulse_channel(queue: &mut PulseQueue, debounce: Duration) -> (PulseCapture<'_>, PulseDrain<'_>) {
    let (producer, consumer) = queue.split();
    let counters = Arc::new(CaptureCounters::default());

    (
        PulseCapture {
            producer,
            dead_time_us: duration_to_micros(debounce),
            last_edge: None,
            counters: Arc::clone(&counters),
        },
        PulseDrain { consumer, counters },
    )
}

impl PulseCapture<'_> {
    /// Handle one raw edge. O(1), callable from interrupt context.
    ///
    /// The dead-time is measured from the previous raw edge, so a burst of
    /// bounces yields exactly one pulse no matter how long it lasts.
    pub fn on_edge(&mut self, timestamp: Micros) -> EdgeOutcome {
        let previous = self.last_edge.replace(timestamp);
        if let Some(previous) = previous {
            if timestamp.raw().wrapping_sub(previous.raw()) < self.dead_time_us {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return EdgeOutcome::Bounce;
            }
        }

        match self.producer.enqueue(PulseEvent { timestamp }) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                EdgeOutcome::Accepted
            }
            Err(_) => {
                self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
                EdgeOutcome::Overflow
            }
        }
    }
}

impl PulseDrain<'_> {
    /// Take every pending pulse, oldest first.
    pub fn drain(&mut self, mut sink: impl FnMut(PulseEvent)) -> usize {
        let mut drained = 0;
        while let Some(event) = self.consumer.dequeue() {
            sink(event);
            drained += 1;
        }
        drained
    }

    pub fn pending(&self) -> usize {
        self.consumer.len()
    }

    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }
}
