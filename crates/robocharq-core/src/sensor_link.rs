use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::frame::{SensorBits, SensorFrame};

/// Upper bound for one read burst. Only its last byte is decoded.
pub const READ_CEILING: usize = 100;

/// Sleep between availability checks while the port is quiet.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Read timeout handed to the driver; bounds how long `close` can wait.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Start,
    Finish,
}

/// Consumer of sensor edges. Called on the poll thread.
pub trait EdgeSink: Send + 'static {
    fn on_edge(&self, edge: Edge);
}

impl EdgeSink for Sender<Edge> {
    fn on_edge(&self, edge: Edge) {
        let _ = self.send(edge);
    }
}

type Callback = Box<dyn Fn() + Send>;

/// Pair of optional closures, one per sensor.
#[derive(Default)]
pub struct EdgeCallbacks {
    on_start: Option<Callback>,
    on_finish: Option<Callback>,
}

impl EdgeCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl Fn() + Send + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_finish(mut self, f: impl Fn() + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }
}

impl EdgeSink for EdgeCallbacks {
    fn on_edge(&self, edge: Edge) {
        let callback = match edge {
            Edge::Start => &self.on_start,
            Edge::Finish => &self.on_finish,
        };
        if let Some(f) = callback {
            f();
        }
    }
}

/// Byte source the poll loop reads status bursts from.
pub trait StatusPort: Send + 'static {
    /// Bytes waiting in the input buffer. Must not block.
    fn available(&mut self) -> io::Result<u32>;
    fn read_burst(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Drops whatever is still buffered after a read.
    fn discard_backlog(&mut self) -> io::Result<()>;
}

impl StatusPort for Box<dyn SerialPort> {
    fn available(&mut self) -> io::Result<u32> {
        Ok(self.bytes_to_read()?)
    }

    fn read_burst(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn discard_backlog(&mut self) -> io::Result<()> {
        Ok(self.clear(ClearBuffer::Input)?)
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub bits: SensorBits,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 9600,
            bits: SensorBits::default(),
        }
    }
}

#[derive(Debug)]
pub enum LinkEvent {
    Failed(Error),
    Closed,
}

/// Serial connection to the sensor board plus the thread polling it.
pub struct SensorLink {
    port_name: String,
    closed: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    rx_evt: Receiver<LinkEvent>,
}

impl SensorLink {
    pub fn list_ports() -> Vec<String> {
        serialport::available_ports()
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.port_name)
            .collect()
    }

    /// Opens the port with 8N1 framing and starts polling it.
    pub fn open(cfg: LinkConfig, sink: impl EdgeSink) -> Result<Self> {
        let port = serialport::new(&cfg.port_name, cfg.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| Error::connection(&cfg.port_name, e))?;

        info!("opened {} @ {} baud", cfg.port_name, cfg.baud_rate);
        Ok(Self::spawn(cfg.port_name, port, cfg.bits, sink))
    }

    /// Starts polling an already open source.
    pub fn spawn(
        port_name: impl Into<String>,
        port: impl StatusPort,
        bits: SensorBits,
        sink: impl EdgeSink,
    ) -> Self {
        let port_name = port_name.into();
        let closed = Arc::new(AtomicBool::new(false));
        let (tx_evt, rx_evt) = unbounded::<LinkEvent>();

        let worker_closed = Arc::clone(&closed);
        let worker_name = port_name.clone();
        let worker = std::thread::spawn(move || {
            if let Err(e) = poll_loop(port, bits, &sink, &worker_closed) {
                error!("sensor link {worker_name} failed: {e}");
                let _ = tx_evt.send(LinkEvent::Failed(Error::connection(&worker_name, e)));
            }
            let _ = tx_evt.send(LinkEvent::Closed);
            debug!("sensor link {worker_name} poll loop exited");
        });

        Self {
            port_name,
            closed,
            worker: Mutex::new(Some(worker)),
            rx_evt,
        }
    }

    pub fn is_open(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the poll loop and releases the port.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("sensor link {} poll thread panicked", self.port_name);
            }
            info!("closed {}", self.port_name);
        }
    }

    pub fn events(&self) -> &Receiver<LinkEvent> {
        &self.rx_evt
    }
}

impl Drop for SensorLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn poll_loop<P: StatusPort, S: EdgeSink>(
    mut port: P,
    bits: SensorBits,
    sink: &S,
    closed: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; READ_CEILING];
    while !closed.load(Ordering::Acquire) {
        if port.available()? == 0 {
            std::thread::sleep(IDLE_POLL);
            continue;
        }

        let n = match port.read_burst(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(e),
        };
        let backlog = port.available()?;
        port.discard_backlog()?;

        let Some(frame) = SensorFrame::decode(&buf[..n], bits) else {
            continue;
        };
        trace!(
            "burst {} (dropped {backlog}) -> status {:08b}",
            hex::encode(&buf[..n]),
            frame.status
        );

        if frame.start_asserted {
            sink.on_edge(Edge::Start);
        }
        if frame.finish_asserted {
            sink.on_edge(Edge::Finish);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::RecvTimeoutError;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// In-memory port fed through a shared queue.
    #[derive(Clone, Default)]
    struct MemoryPort {
        input: Arc<Mutex<VecDeque<u8>>>,
        fail: Arc<AtomicBool>,
    }

    impl MemoryPort {
        fn feed(&self, bytes: &[u8]) {
            self.input.lock().extend(bytes);
        }
    }

    impl StatusPort for MemoryPort {
        fn available(&mut self) -> io::Result<u32> {
            if self.fail.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
            }
            Ok(self.input.lock().len() as u32)
        }

        fn read_burst(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut input = self.input.lock();
            let n = input.len().min(buf.len());
            for (slot, byte) in buf.iter_mut().zip(input.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn discard_backlog(&mut self) -> io::Result<()> {
            self.input.lock().clear();
            Ok(())
        }
    }

    fn bits(start: u8, finish: u8) -> SensorBits {
        SensorBits::new(start, finish).unwrap()
    }

    #[test]
    fn start_bit_low_fires_only_on_start() {
        let port = MemoryPort::default();
        let (tx, rx) = unbounded();
        let starts = Arc::new(AtomicBool::new(false));
        let finishes = Arc::new(AtomicBool::new(false));
        let callbacks = {
            let starts = Arc::clone(&starts);
            let finishes = Arc::clone(&finishes);
            EdgeCallbacks::new()
                .on_start(move || {
                    starts.store(true, Ordering::Release);
                    let _ = tx.send(Edge::Start);
                })
                .on_finish(move || finishes.store(true, Ordering::Release))
        };
        let link = SensorLink::spawn("mem", port.clone(), bits(3, 5), callbacks);

        port.feed(&[0b1111_0111]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(Edge::Start));
        std::thread::sleep(Duration::from_millis(20));
        link.close();

        assert!(starts.load(Ordering::Acquire));
        assert!(!finishes.load(Ordering::Acquire));
    }

    #[test]
    fn both_edges_in_one_burst() {
        let port = MemoryPort::default();
        let (tx, rx) = unbounded();
        let link = SensorLink::spawn("mem", port.clone(), bits(0, 1), tx);

        port.feed(&[0b1111_1100]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(Edge::Start));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(Edge::Finish));
        link.close();
    }

    #[test]
    fn idle_lines_emit_nothing() {
        let port = MemoryPort::default();
        let (tx, rx) = unbounded();
        let link = SensorLink::spawn("mem", port.clone(), bits(0, 1), tx);

        port.feed(&[0xFF, 0xFF]);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout)
        );
        link.close();
    }

    #[test]
    fn stale_bytes_before_the_last_are_ignored() {
        let port = MemoryPort::default();
        let (tx, rx) = unbounded();
        port.feed(&[0x00, 0x00, 0x00, 0xFF]);
        let link = SensorLink::spawn("mem", port.clone(), bits(0, 1), tx);

        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout)
        );
        assert!(port.input.lock().is_empty());
        link.close();
    }

    #[test]
    fn backlog_beyond_one_read_is_discarded() {
        let port = MemoryPort::default();
        let (tx, rx) = unbounded();
        let mut burst = vec![0x00; READ_CEILING - 1];
        burst.push(0xFF);
        burst.extend([0x00; 20]);
        port.feed(&burst);
        let link = SensorLink::spawn("mem", port.clone(), bits(0, 1), tx);

        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout)
        );
        assert!(port.input.lock().is_empty());
        link.close();
    }

    #[test]
    fn drives_the_race_clock() {
        use crate::race_clock::{ClockState, RaceClock};

        let port = MemoryPort::default();
        let clock = RaceClock::start();
        let link = SensorLink::spawn("mem", port.clone(), bits(0, 1), clock.clone());

        port.feed(&[0b1111_1110]);
        let deadline = Instant::now() + Duration::from_secs(1);
        while clock.state() != ClockState::Running && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(clock.state(), ClockState::Running);

        port.feed(&[0b1111_1101]);
        let deadline = Instant::now() + Duration::from_secs(1);
        while clock.state() != ClockState::Paused && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(clock.state(), ClockState::Paused);

        link.close();
        clock.terminate().unwrap();
    }

    #[test]
    fn port_failure_is_reported_as_connection_error() {
        let port = MemoryPort::default();
        let (tx, _rx) = unbounded();
        let link = SensorLink::spawn("ttyTEST", port.clone(), bits(0, 1), tx);

        port.fail.store(true, Ordering::Release);
        match link.events().recv_timeout(Duration::from_secs(1)) {
            Ok(LinkEvent::Failed(e)) => {
                assert!(e.is_connection());
                assert!(e.to_string().contains("ttyTEST"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            link.events().recv_timeout(Duration::from_secs(1)),
            Ok(LinkEvent::Closed)
        ));
        link.close();
        assert!(!link.is_open());
    }

    #[test]
    fn close_stops_the_loop_promptly() {
        let port = MemoryPort::default();
        let (tx, _rx) = unbounded();
        let link = SensorLink::spawn("mem", port, bits(0, 1), tx);
        assert!(link.is_open());

        let started = Instant::now();
        link.close();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!link.is_open());
        assert!(matches!(link.events().try_recv(), Ok(LinkEvent::Closed)));

        link.close();
    }

    #[test]
    fn opening_a_missing_port_fails() {
        let cfg = LinkConfig {
            port_name: "/dev/robocharq-does-not-exist".into(),
            ..Default::default()
        };
        let (tx, _rx) = unbounded();
        match SensorLink::open(cfg, tx) {
            Err(e) => assert!(e.is_connection()),
            Ok(_) => panic!("port should not open"),
        }
    }
}
