use super::{
    decode_at, parse_line, CommunicatorState, Error, Listener, Reading, Result, Transport,
    TransportError,
};
use async_broadcast::{broadcast, Receiver, RecvError, Sender};
use async_io::Timer;
use futures_lite::future;
use log::{debug, error, info, warn};
use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Floor applied to every poll interval so an idle worker never spins.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

const WORKER_NAME: &str = "communicator";
const DEFAULT_BAUD_RATE: u32 = 9600;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicatorConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Upper bound for a single line read.
    pub timeout: Duration,
    /// Minimum delay between successive transport reads.
    pub poll_interval: Duration,
}

impl CommunicatorConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

struct Shared {
    state: AtomicU8,
    poll_interval_us: AtomicU64,
    wake: Sender<()>,
    worker_thread: OnceLock<ThreadId>,
}

impl Shared {
    fn state(&self) -> CommunicatorState {
        CommunicatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: CommunicatorState, to: CommunicatorState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditional move to `Stopped`; returns the state it replaced.
    fn stop(&self) -> CommunicatorState {
        CommunicatorState::from_u8(
            self.state
                .swap(CommunicatorState::Stopped as u8, Ordering::AcqRel),
        )
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us.load(Ordering::Relaxed))
    }

    fn set_poll_interval(&self, interval: Duration) {
        let micros = interval.max(MIN_POLL_INTERVAL).as_micros();
        self.poll_interval_us
            .store(u64::try_from(micros).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn wake(&self) {
        // A full channel already holds a pending wake.
        let _ = self.wake.try_broadcast(());
    }

    fn on_worker_thread(&self) -> bool {
        self.worker_thread.get() == Some(&thread::current().id())
    }
}

enum WorkerSlot<T> {
    Unstarted {
        transport: T,
        listener: Option<Arc<dyn Listener>>,
        wake: Receiver<()>,
    },
    Running(JoinHandle<()>),
    Finished,
}

/// Polls a line-oriented device on a dedicated worker thread and hands each
/// decoded [`Reading`] to an optional [`Listener`].
///
/// The transport is opened by the worker on its first iteration and closed by
/// the worker when it observes [`CommunicatorState::Stopped`]. Dropping the
/// communicator finishes it.
pub struct Communicator<T: Transport + 'static> {
    config: CommunicatorConfig,
    shared: Arc<Shared>,
    worker: Mutex<WorkerSlot<T>>,
}

impl<T: Transport + 'static> Communicator<T> {
    pub fn new(
        transport: T,
        config: CommunicatorConfig,
        listener: Option<Arc<dyn Listener>>,
    ) -> Self {
        let (mut wake, wake_receiver) = broadcast(1);
        wake.set_overflow(true);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(CommunicatorState::Idle as u8),
            poll_interval_us: AtomicU64::new(0),
            wake,
            worker_thread: OnceLock::new(),
        });
        shared.set_poll_interval(config.poll_interval);
        Self {
            config,
            shared,
            worker: Mutex::new(WorkerSlot::Unstarted {
                transport,
                listener,
                wake: wake_receiver,
            }),
        }
    }

    pub fn state(&self) -> CommunicatorState {
        self.shared.state()
    }

    pub fn poll_interval(&self) -> Duration {
        self.shared.poll_interval()
    }

    /// Takes effect from the next sleep. Clamped to [`MIN_POLL_INTERVAL`].
    pub fn set_poll_interval(&self, interval: Duration) {
        self.shared.set_poll_interval(interval);
    }

    /// Spawns the worker on first use and resumes a paused communicator.
    /// A no-op while already reading.
    pub fn start(&self) -> Result<()> {
        loop {
            match self.shared.state() {
                CommunicatorState::Stopped => {
                    return Err(invalid_state("start", CommunicatorState::Stopped))
                }
                CommunicatorState::Reading => return Ok(()),
                CommunicatorState::Idle => return self.spawn(),
                CommunicatorState::Paused => {
                    if self
                        .shared
                        .transition(CommunicatorState::Paused, CommunicatorState::Reading)
                    {
                        info!("Communicator on {} resumed", self.config.port);
                        self.shared.wake();
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stops consuming the transport at the next loop boundary, so at most one
    /// more line may be read. A no-op unless reading.
    pub fn pause(&self) -> Result<()> {
        if self
            .shared
            .transition(CommunicatorState::Reading, CommunicatorState::Paused)
        {
            info!("Communicator on {} paused", self.config.port);
            self.shared.wake();
            return Ok(());
        }
        match self.shared.state() {
            CommunicatorState::Stopped => Err(invalid_state("pause", CommunicatorState::Stopped)),
            _ => Ok(()),
        }
    }

    /// Terminal. Waits for the worker to close the transport, except when
    /// called from the worker itself (for example inside a listener), in
    /// which case the worker closes it once the callback returns.
    pub fn finish(&self) {
        if self.shared.stop() != CommunicatorState::Stopped {
            info!("Communicator on {} finishing", self.config.port);
            self.shared.wake();
        }
        if self.shared.on_worker_thread() {
            return;
        }
        let mut worker = self.lock_worker();
        if let WorkerSlot::Running(handle) = mem::replace(&mut *worker, WorkerSlot::Finished) {
            if handle.join().is_err() {
                error!("Communicator worker on {} panicked", self.config.port);
            }
        }
    }

    fn spawn(&self) -> Result<()> {
        let mut worker = self.lock_worker();
        let (transport, listener, wake) = match mem::replace(&mut *worker, WorkerSlot::Finished) {
            WorkerSlot::Unstarted {
                transport,
                listener,
                wake,
            } => (transport, listener, wake),
            other => {
                *worker = other;
                return match self.shared.state() {
                    CommunicatorState::Stopped => {
                        Err(invalid_state("start", CommunicatorState::Stopped))
                    }
                    _ => Ok(()),
                };
            }
        };
        if !self
            .shared
            .transition(CommunicatorState::Idle, CommunicatorState::Reading)
        {
            // finish() won the race
            return Err(invalid_state("start", self.shared.state()));
        }

        let poll_loop = PollLoop {
            transport,
            listener,
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            wake,
            opened: false,
            first_reading: None,
            last_reading: None,
        };
        let spawned = thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || smol::block_on(poll_loop.run()));
        match spawned {
            Ok(handle) => {
                info!("Communicator on {} started", self.config.port);
                *worker = WorkerSlot::Running(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.stop();
                Err(Error::Spawn(err))
            }
        }
    }

    fn lock_worker(&self) -> MutexGuard<'_, WorkerSlot<T>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport + 'static> Drop for Communicator<T> {
    fn drop(&mut self) {
        self.finish();
    }
}

fn invalid_state(operation: &'static str, state: CommunicatorState) -> Error {
    Error::InvalidState { operation, state }
}

struct PollLoop<T> {
    transport: T,
    listener: Option<Arc<dyn Listener>>,
    config: CommunicatorConfig,
    shared: Arc<Shared>,
    wake: Receiver<()>,
    opened: bool,
    first_reading: Option<Instant>,
    last_reading: Option<Instant>,
}

impl<T: Transport> PollLoop<T> {
    async fn run(mut self) {
        let _ = self.shared.worker_thread.set(thread::current().id());
        loop {
            let state = self.shared.state();
            match state {
                CommunicatorState::Stopped => break,
                CommunicatorState::Reading => {
                    if let Err(err) = self.poll_once() {
                        report(&err);
                    }
                }
                CommunicatorState::Idle | CommunicatorState::Paused => {}
            }
            self.sleep(state).await;
        }
        self.shutdown();
    }

    fn poll_once(&mut self) -> Result<()> {
        if !self.opened {
            self.transport.open(
                &self.config.port,
                self.config.baud_rate,
                self.config.timeout,
            )?;
            self.opened = true;
            debug!("Transport for {} opened", self.config.port);
        }
        let line = self.transport.read_line()?;
        let raw = parse_line(&line)?;
        let reading = self.stamp(raw);
        self.dispatch(reading)
    }

    /// Bookkeeping happens before dispatch so a failing listener cannot skew
    /// the next elapsed time.
    fn stamp(&mut self, raw: f64) -> Reading {
        let now = Instant::now();
        let elapsed = self
            .last_reading
            .map_or(Duration::ZERO, |last| now.duration_since(last));
        let first = *self.first_reading.get_or_insert(now);
        self.last_reading = Some(now);
        decode_at(raw, elapsed, now.duration_since(first))
    }

    fn dispatch(&self, reading: Reading) -> Result<()> {
        let Some(listener) = &self.listener else {
            return Ok(());
        };
        match panic::catch_unwind(AssertUnwindSafe(|| listener.callback(reading))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Error::Listener(format!("{err:#}"))),
            Err(payload) => Err(Error::Listener(panic_message(payload.as_ref()))),
        }
    }

    /// Waits out the poll interval, returning early only if the state moves
    /// away from `observed`.
    async fn sleep(&mut self, observed: CommunicatorState) {
        let deadline = Instant::now() + self.shared.poll_interval();
        let shared = &self.shared;
        let wake = &mut self.wake;
        while Instant::now() < deadline && shared.state() == observed {
            future::or(
                async {
                    Timer::at(deadline).await;
                },
                async {
                    if let Err(RecvError::Closed) = wake.recv().await {
                        future::pending::<()>().await;
                    }
                },
            )
            .await;
        }
    }

    fn shutdown(mut self) {
        if !self.opened {
            return;
        }
        match self.transport.close() {
            Ok(()) => info!("Communicator on {} closed", self.config.port),
            Err(err) => warn!("Failed to close {}: {err}", self.config.port),
        }
    }
}

fn report(err: &Error) {
    match err {
        Error::Transport(TransportError::Timeout) => debug!("{err}"),
        _ => warn!("{err}"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause");
    format!("panicked: {message}")
}
