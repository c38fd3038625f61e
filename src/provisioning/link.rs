//! Station link state fed from driver events.

use std::sync::{Arc, Mutex};

/// The driver events the station link cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationEvent {
    Started,
    Stopped,
    Disconnected,
}

#[derive(Debug, Default)]
struct LinkFlags {
    armed: bool,
    dropped: bool,
}

/// Shared between the driver's event callback and the radio.
///
/// A disconnect only counts once the current attempt's `Started` event has
/// been seen. Driver events are delivered in order, so a disconnect left over
/// from the previous attempt always lands before that point and is ignored.
#[derive(Debug, Clone, Default)]
pub struct StationLink {
    flags: Arc<Mutex<LinkFlags>>,
}

impl StationLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the event loop.
    pub fn on_event(&self, event: StationEvent) {
        if let Ok(mut flags) = self.flags.lock() {
            match event {
                StationEvent::Started => {
                    flags.armed = true;
                    flags.dropped = false;
                }
                StationEvent::Stopped => flags.armed = false,
                StationEvent::Disconnected if flags.armed => flags.dropped = true,
                StationEvent::Disconnected => {}
            }
        }
    }

    /// Forget the current attempt before the driver is restarted.
    pub fn begin_attempt(&self) {
        if let Ok(mut flags) = self.flags.lock() {
            flags.armed = false;
            flags.dropped = false;
        }
    }

    pub fn dropped(&self) -> bool {
        self.flags.lock().map(|flags| flags.dropped).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_disconnect_from_previous_attempt_is_ignored() {
        let link = StationLink::new();
        link.on_event(StationEvent::Started);

        // restart: the old session's disconnect is delivered after the reset
        link.begin_attempt();
        link.on_event(StationEvent::Disconnected);
        link.on_event(StationEvent::Stopped);
        assert!(!link.dropped());

        link.on_event(StationEvent::Started);
        assert!(!link.dropped());
    }

    #[test]
    fn disconnect_during_attempt_counts() {
        let link = StationLink::new();
        let events = link.clone();
        link.begin_attempt();
        events.on_event(StationEvent::Started);
        events.on_event(StationEvent::Disconnected);
        assert!(link.dropped());

        // a fresh start clears the previous outcome
        link.begin_attempt();
        assert!(!link.dropped());
        events.on_event(StationEvent::Started);
        assert!(!link.dropped());
    }
}
