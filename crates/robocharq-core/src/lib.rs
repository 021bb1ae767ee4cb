//! Timing core: serial sensor link, race clock state machine, display sampling.

pub mod error;
pub mod frame;
pub mod sensor_link;
pub mod race_clock;
pub mod display;

pub use error::{Error, Result};
pub use frame::{SensorBits, SensorFrame};
pub use sensor_link::{Edge, EdgeCallbacks, EdgeSink, LinkConfig, LinkEvent, SensorLink, StatusPort};
pub use race_clock::{ClockSample, ClockState, RaceClock, ResumeMode};
pub use display::{format_elapsed, DisplayFrame, DisplayLoop, Tone};
