//! The driver seam and the main cycle loop.
//!
//! A driver owns the hardware (or its stand-in) and paces the engine:
//! `wait` blocks until the next period is due, `read`/`write` move data
//! between hardware and the port buffers, and `null_cycle` burns a period
//! when the graph cannot run. The engine interprets `wait` results here
//! and routes live periods into the cycle executor.

use crate::engine::{Engine, EngineError};
use crate::executor::{self, CycleState};
use crate::ClientId;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("driver failed: {0}")]
    Failed(String),
}

/// Outcome of one `wait`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriverWait {
    /// A period of `nframes` is due; `delayed_usecs` is how late the
    /// wake-up was.
    Cycle { nframes: u32, delayed_usecs: f32 },
    /// The driver hit an xrun and restarted itself; broadcast and carry on.
    XRun,
    /// The driver restarted for an internal reason; skip this period.
    Restarted,
    /// The driver is beyond recovery; the cycle loop must exit.
    Fatal,
}

/// Contract between the engine and a hardware adapter.
pub trait Driver: Send {
    /// Register the driver's client-side resources (ports, buffer size,
    /// sample rate). Called once, before the loop starts.
    fn attach(&mut self, engine: &Engine, client: ClientId) -> Result<(), DriverError>;

    /// Undo `attach`.
    fn detach(&mut self, engine: &Engine) -> Result<(), DriverError>;

    fn start(&mut self) -> Result<(), DriverError>;

    fn stop(&mut self) -> Result<(), DriverError>;

    /// Block until the next period boundary.
    fn wait(&mut self) -> DriverWait;

    fn read(&mut self, nframes: u32) -> Result<(), DriverError>;

    fn write(&mut self, nframes: u32) -> Result<(), DriverError>;

    /// Consume one period without running the graph.
    fn null_cycle(&mut self, nframes: u32) -> Result<(), DriverError>;

    /// Nominal period length in microseconds.
    fn period_usecs(&self) -> u64;

    /// Microsecond stamp of the most recent `wait` return.
    fn last_wait_usecs(&self) -> u64;
}

/// Put the calling thread under SCHED_FIFO at `priority` and lock its
/// memory down.
pub(crate) fn become_real_time(priority: i32) -> Result<(), EngineError> {
    // SAFETY: plain libc calls on the current thread.
    unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority;
        let rc = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        if rc != 0 {
            return Err(EngineError::Scheduling(std::io::Error::from_raw_os_error(rc)));
        }
        if libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) != 0 {
            return Err(EngineError::Scheduling(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// The main cycle loop. Blocks until the driver turns fatal, too many
/// consecutive over-budget cycles force an exit, or a driver read/write
/// fails. Always stops and detaches the driver on the way out.
pub fn run(engine: &Arc<Engine>, mut driver: Box<dyn Driver>) -> Result<(), EngineError> {
    if engine.is_realtime() {
        crate::watchdog::spawn(engine.clone());
        if let Err(e) = become_real_time(engine.config().clamped_rtpriority()) {
            tracing::warn!(error = %e, "cannot acquire realtime scheduling, continuing without");
            engine.clear_realtime();
        }
    }

    engine.mark_alive();

    if let Err(e) = driver.start() {
        tracing::error!(error = %e, "cannot start driver");
        return Err(EngineError::Driver(e.to_string()));
    }

    let mut state = CycleState::new();
    let mut result = Ok(());

    loop {
        match driver.wait() {
            DriverWait::XRun => {
                // driver already restarted itself
                engine.broadcast_xrun();
                continue;
            }
            DriverWait::Restarted => continue,
            DriverWait::Fatal => {
                tracing::error!("driver wait failed, exiting cycle loop");
                result = Err(EngineError::Driver("driver wait failed".into()));
                break;
            }
            DriverWait::Cycle {
                nframes,
                delayed_usecs,
            } => {
                if executor::run_cycle(engine, driver.as_mut(), &mut state, nframes, delayed_usecs)
                    .is_err()
                {
                    tracing::error!("cycle execution failure, exiting");
                    result = Err(EngineError::Driver("cycle execution failure".into()));
                    break;
                }
            }
        }
    }

    if let Err(e) = driver.stop() {
        tracing::error!(error = %e, "cannot stop driver during shutdown");
    }
    if let Err(e) = driver.detach(engine) {
        tracing::error!(error = %e, "cannot detach driver during shutdown");
    }

    result
}

/// A hardware-free driver that paces the graph with a sleep. Useful for
/// running the engine without a sound card; its client registers one
/// physical capture and one physical playback port.
pub struct DummyDriver {
    period_frames: u32,
    sample_rate: u32,
    last_wait: u64,
    ports: Vec<crate::PortId>,
}

impl DummyDriver {
    pub fn new(period_frames: u32, sample_rate: u32) -> Self {
        Self {
            period_frames,
            sample_rate,
            last_wait: 0,
            ports: Vec::new(),
        }
    }

    /// Factory entry point; `args` is `"<period_frames>,<sample_rate>"`,
    /// empty for the 1024-frame 48 kHz default.
    pub fn from_args(args: &str) -> Result<Box<dyn Driver>, crate::factory::FactoryError> {
        let mut period = 1024u32;
        let mut rate = 48_000u32;
        if !args.is_empty() {
            let mut parts = args.split(',');
            let bad = |what: &str| {
                crate::factory::FactoryError::Init("dummy".into(), format!("bad {what}: {args}"))
            };
            period = parts
                .next()
                .and_then(|p| p.trim().parse().ok())
                .ok_or_else(|| bad("period"))?;
            rate = parts
                .next()
                .and_then(|p| p.trim().parse().ok())
                .ok_or_else(|| bad("rate"))?;
        }
        Ok(Box::new(DummyDriver::new(period, rate)))
    }
}

impl Driver for DummyDriver {
    fn attach(&mut self, engine: &Engine, client: ClientId) -> Result<(), DriverError> {
        engine
            .set_buffer_size(self.period_frames)
            .map_err(|e| DriverError::Failed(e.to_string()))?;
        engine.set_sample_rate(self.sample_rate);

        use crate::control::{
            PORT_IS_INPUT, PORT_IS_OUTPUT, PORT_IS_PHYSICAL, PORT_IS_TERMINAL,
        };
        let audio = crate::buffer::AUDIO_PORT_TYPE;
        let capture = engine
            .port_register(
                client,
                "system:capture_1",
                audio,
                PORT_IS_OUTPUT | PORT_IS_PHYSICAL | PORT_IS_TERMINAL,
            )
            .map_err(|e| DriverError::Failed(e.to_string()))?;
        let playback = engine
            .port_register(
                client,
                "system:playback_1",
                audio,
                PORT_IS_INPUT | PORT_IS_PHYSICAL | PORT_IS_TERMINAL,
            )
            .map_err(|e| DriverError::Failed(e.to_string()))?;
        self.ports = vec![capture, playback];
        engine
            .client_activate(client)
            .map_err(|e| DriverError::Failed(e.to_string()))?;
        Ok(())
    }

    fn detach(&mut self, _engine: &Engine) -> Result<(), DriverError> {
        self.ports.clear();
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn wait(&mut self) -> DriverWait {
        std::thread::sleep(std::time::Duration::from_micros(self.period_usecs()));
        self.last_wait = crate::clock::now_usecs();
        DriverWait::Cycle {
            nframes: self.period_frames,
            delayed_usecs: 0.0,
        }
    }

    fn read(&mut self, _nframes: u32) -> Result<(), DriverError> {
        Ok(())
    }

    fn write(&mut self, _nframes: u32) -> Result<(), DriverError> {
        Ok(())
    }

    fn null_cycle(&mut self, _nframes: u32) -> Result<(), DriverError> {
        Ok(())
    }

    fn period_usecs(&self) -> u64 {
        self.period_frames as u64 * 1_000_000 / self.sample_rate as u64
    }

    fn last_wait_usecs(&self) -> u64 {
        self.last_wait
    }
}
