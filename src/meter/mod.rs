pub mod accumulator;
pub mod capture;
pub mod config;

pub use accumulator::{FlowAccumulator, FlowSample, MeterCheckpoint, MeterState, FLOW_RING_SIZE};
pub use capture::{
    pulse_channel, CaptureStats, EdgeOutcome, PulseCapture, PulseDrain, PulseEvent, PulseQueue,
    PULSE_QUEUE_SIZE,
};
pub use config::MeterConfig;
