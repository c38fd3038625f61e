use core::time::Duration;

/// Calibration and timing parameters for the pulse meter.
#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Volume represented by one meter pulse (liters)
    pub liters_per_pulse: f64,

    /// Edges closer than this to the previous edge are contact bounce.
    /// Must stay below the fastest real pulse period of the meter.
    pub debounce: Duration,

    /// Trailing window used for the flow rate
    pub flow_window: Duration,

    /// No pulse for this long means the meter is idle (flow reported as zero)
    pub stale_after: Duration,

    /// Minimum spacing between cumulative volume checkpoints
    pub checkpoint_interval: Duration,
}

impl MeterConfig {
    pub fn with_liters_per_pulse(mut self, liters_per_pulse: f64) -> Self {
        self.liters_per_pulse = liters_per_pulse;
        self
    }

    pub fn with_flow_window(mut self, window: Duration) -> Self {
        self.flow_window = window;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            liters_per_pulse: 1.0,
            debounce: Duration::from_millis(50),
            flow_window: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
            checkpoint_interval: Duration::from_secs(300),
        }
    }
}
