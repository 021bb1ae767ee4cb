use std::time::Duration;

use crate::race_clock::{ClockSample, ClockState, RaceClock};

/// Default sampling cadence, close to a 60 Hz refresh.
pub const DEFAULT_REFRESH: Duration = Duration::from_millis(16);

/// Presentation color class for the time label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Neutral,
    Active,
    Warning,
}

impl Tone {
    pub fn for_state(state: ClockState) -> Self {
        match state {
            ClockState::Running => Self::Active,
            ClockState::Paused => Self::Warning,
            ClockState::Idle | ClockState::Terminated => Self::Neutral,
        }
    }

    pub fn rgb(&self) -> (u8, u8, u8) {
        match self {
            Self::Neutral => (0xFF, 0xFF, 0xFF),
            Self::Active => (0x00, 0xFF, 0x00),
            Self::Warning => (0xFF, 0xA5, 0x00),
        }
    }
}

/// Formats as `MM:SS,cc`. Centiseconds are truncated, not rounded.
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    let minutes = millis / 60_000;
    let seconds = (millis % 60_000) / 1000;
    let centis = (millis % 1000) / 10;
    format!("{minutes:02}:{seconds:02},{centis:02}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    pub text: String,
    pub tone: Tone,
    pub state: ClockState,
}

impl From<ClockSample> for DisplayFrame {
    fn from(sample: ClockSample) -> Self {
        Self {
            text: format_elapsed(sample.elapsed),
            tone: Tone::for_state(sample.state),
            state: sample.state,
        }
    }
}

/// Fixed-cadence reader of the race clock.
///
/// The loop itself is driven by the caller's timer (a UI timer in the app), at
/// the interval returned by [`DisplayLoop::refresh`]. Sampling only reads.
#[derive(Debug, Clone)]
pub struct DisplayLoop {
    clock: RaceClock,
    refresh: Duration,
}

impl DisplayLoop {
    pub fn new(clock: RaceClock, refresh: Duration) -> Self {
        Self { clock, refresh }
    }

    pub fn refresh(&self) -> Duration {
        self.refresh
    }

    pub fn sample(&self) -> DisplayFrame {
        self.clock.sample().into()
    }
}
