//! Stopwatch state machine shared by the sensor link, the keyboard and the display.
//!
//! Elapsed time is never stored as a running counter. Readers compute it from
//! the timing record under the same lock the transitions take, so a read can
//! not observe a half-applied transition. A background thread owned by the
//! clock publishes samples at a bounded tick while running and sleeps on a
//! condvar otherwise.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::sensor_link::{Edge, EdgeSink};

/// Default interval between published samples while running.
pub const TICK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Idle,
    Running,
    Paused,
    Terminated,
}

/// What `resume` does with time accumulated before a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMode {
    /// Start counting from zero again.
    #[default]
    Restart,
    /// Continue from the frozen value.
    Continue,
}

impl FromStr for ResumeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "restart" => Ok(Self::Restart),
            "continue" => Ok(Self::Continue),
            other => Err(Error::Configuration(format!("unknown resume mode '{other}'"))),
        }
    }
}

/// Consistent view of the clock at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub state: ClockState,
    pub elapsed: Duration,
}

struct Timing {
    state: ClockState,
    epoch: Instant,
    carried: Duration,
    frozen: Duration,
    published: Duration,
    ticks: u64,
}

impl Timing {
    fn new(now: Instant) -> Self {
        Self {
            state: ClockState::Idle,
            epoch: now,
            carried: Duration::ZERO,
            frozen: Duration::ZERO,
            published: Duration::ZERO,
            ticks: 0,
        }
    }

    fn elapsed_at(&self, now: Instant) -> Duration {
        match self.state {
            ClockState::Idle => Duration::ZERO,
            ClockState::Running => self.carried + now.saturating_duration_since(self.epoch),
            ClockState::Paused | ClockState::Terminated => self.frozen,
        }
    }

    fn ensure_live(&self, op: &'static str) -> Result<()> {
        if self.state == ClockState::Terminated {
            return Err(Error::State {
                op,
                state: self.state,
            });
        }
        Ok(())
    }
}

struct Shared {
    timing: Mutex<Timing>,
    wake: Condvar,
    resume_mode: ResumeMode,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Terminates the clock once the last handle is gone.
struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        if shut_down(&self.shared).is_ok() {
            debug!("race clock dropped without terminate");
        }
    }
}

/// Handle to the race clock. Clones share the same clock.
#[derive(Clone)]
pub struct RaceClock {
    owner: Arc<Owner>,
}

impl RaceClock {
    /// Creates an idle clock and starts its timekeeping thread.
    pub fn start() -> Self {
        Self::with_options(ResumeMode::default(), TICK_INTERVAL)
    }

    pub fn with_options(resume_mode: ResumeMode, tick: Duration) -> Self {
        let shared = Arc::new(Shared {
            timing: Mutex::new(Timing::new(Instant::now())),
            wake: Condvar::new(),
            resume_mode,
            worker: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || timekeeping_loop(&worker_shared, tick));
        *shared.worker.lock() = Some(handle);

        debug!("race clock started (resume={resume_mode:?}, tick={tick:?})");
        Self {
            owner: Arc::new(Owner { shared }),
        }
    }

    fn shared(&self) -> &Shared {
        &self.owner.shared
    }

    pub fn state(&self) -> ClockState {
        self.shared().timing.lock().state
    }

    pub fn elapsed(&self) -> Duration {
        self.sample().elapsed
    }

    /// State and elapsed time read under a single lock.
    pub fn sample(&self) -> ClockSample {
        let timing = self.shared().timing.lock();
        ClockSample {
            state: timing.state,
            elapsed: timing.elapsed_at(Instant::now()),
        }
    }

    /// Last value written by the timekeeping thread and how many it has written.
    pub fn published(&self) -> (Duration, u64) {
        let timing = self.shared().timing.lock();
        (timing.published, timing.ticks)
    }

    pub fn reset(&self) -> Result<()> {
        let mut timing = self.shared().timing.lock();
        timing.ensure_live("reset")?;
        apply_reset(&mut timing, Instant::now());
        self.shared().wake.notify_all();
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut timing = self.shared().timing.lock();
        timing.ensure_live("resume")?;
        apply_resume(&mut timing, Instant::now(), self.shared().resume_mode);
        self.shared().wake.notify_all();
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let mut timing = self.shared().timing.lock();
        timing.ensure_live("pause")?;
        apply_pause(&mut timing, Instant::now());
        self.shared().wake.notify_all();
        Ok(())
    }

    /// Moves to the final state and waits for the timekeeping thread to exit.
    pub fn terminate(&self) -> Result<()> {
        shut_down(self.shared())?;
        info!("race clock terminated");
        Ok(())
    }

    /// Start sensor: only an idle clock starts running.
    pub fn start_edge(&self) -> bool {
        let mut timing = self.shared().timing.lock();
        if timing.state != ClockState::Idle {
            return false;
        }
        apply_resume(&mut timing, Instant::now(), self.shared().resume_mode);
        self.shared().wake.notify_all();
        true
    }

    /// Finish sensor: only a running clock is paused.
    pub fn finish_edge(&self) -> bool {
        let mut timing = self.shared().timing.lock();
        if timing.state != ClockState::Running {
            return false;
        }
        apply_pause(&mut timing, Instant::now());
        self.shared().wake.notify_all();
        true
    }

    /// Manual pause/resume: pauses a running clock, resumes anything else.
    pub fn toggle(&self) -> Result<ClockState> {
        let mut timing = self.shared().timing.lock();
        timing.ensure_live("toggle")?;
        let now = Instant::now();
        if timing.state == ClockState::Running {
            apply_pause(&mut timing, now);
        } else {
            apply_resume(&mut timing, now, self.shared().resume_mode);
        }
        self.shared().wake.notify_all();
        Ok(timing.state)
    }
}

impl fmt::Debug for RaceClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaceClock").field("sample", &self.sample()).finish()
    }
}

impl EdgeSink for RaceClock {
    fn on_edge(&self, edge: Edge) {
        let acted = match edge {
            Edge::Start => self.start_edge(),
            Edge::Finish => self.finish_edge(),
        };
        if acted {
            info!("{edge:?} sensor -> {:?}", self.state());
        }
    }
}

fn apply_reset(timing: &mut Timing, now: Instant) {
    timing.state = ClockState::Idle;
    timing.epoch = now;
    timing.carried = Duration::ZERO;
    timing.frozen = Duration::ZERO;
    debug!("clock reset");
}

fn apply_resume(timing: &mut Timing, now: Instant, mode: ResumeMode) {
    timing.carried = match (mode, timing.state) {
        (ResumeMode::Continue, ClockState::Paused) => timing.frozen,
        (_, ClockState::Running) => timing.carried,
        _ => Duration::ZERO,
    };
    if timing.state != ClockState::Running {
        timing.epoch = now;
    }
    timing.state = ClockState::Running;
    debug!("clock running (carried {:?})", timing.carried);
}

fn apply_pause(timing: &mut Timing, now: Instant) {
    timing.frozen = timing.elapsed_at(now);
    timing.state = ClockState::Paused;
    debug!("clock paused at {:?}", timing.frozen);
}

fn shut_down(shared: &Shared) -> Result<()> {
    {
        let mut timing = shared.timing.lock();
        timing.ensure_live("terminate")?;
        timing.frozen = timing.elapsed_at(Instant::now());
        timing.state = ClockState::Terminated;
        shared.wake.notify_all();
    }

    if let Some(handle) = shared.worker.lock().take() {
        let _ = handle.join();
    }
    Ok(())
}

fn timekeeping_loop(shared: &Shared, tick: Duration) {
    let mut timing = shared.timing.lock();
    loop {
        match timing.state {
            ClockState::Idle => {
                timing.epoch = Instant::now();
                shared.wake.wait(&mut timing);
            }
            ClockState::Running => {
                timing.published = timing.elapsed_at(Instant::now());
                timing.ticks += 1;
                shared.wake.wait_for(&mut timing, tick);
            }
            ClockState::Paused => {
                shared.wake.wait(&mut timing);
            }
            ClockState::Terminated => break,
        }
    }
    debug!("timekeeping loop exited after {} ticks", timing.ticks);
}
