//! The per-period cycle executor.
//!
//! One call to [`run_cycle`] is one driver period: gate on excessive
//! wake-up delay, advance the frame clock, try the graph lock (or burn
//! the period with a null cycle), pull data in, walk the sorted clients
//! (inline for in-process clients, the byte/poll FIFO protocol for
//! external subgraphs), push data out, then post-process: rotate the
//! time records, settle timeouts, sweep failed clients, and fold the
//! cycle cost into the load estimate.

use crate::client::{ClientState, PortBufferRef, PortBuffers};
use crate::clock::{now_usecs, TimeInfo};
use crate::control::{EngineControlHeader, PORT_IS_INPUT, PORT_IS_OUTPUT, STATE_NOT_TRIGGERED};
use crate::driver::Driver;
use crate::engine::Engine;
use crate::graph::GraphState;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::{BorrowedFd, FromRawFd};
use std::sync::atomic::Ordering;

/// Scale applied to the spare-time estimate before comparing against the
/// observed wake-up delay.
const WORK_SCALE: f32 = 1.0;

/// Consecutive over-budget cycles tolerated before the loop gives up.
const MAX_CONSECUTIVE_DELAYS: u32 = 10;

/// Length of the cycle-cost window.
const ROLLING_COUNT: usize = 32;

/// How often (in wall time) the window is folded into the load estimate.
const ROLLING_INTERVAL_MS: u64 = 1000;

/// The cycle loop must exit; the process terminates via driver cleanup.
#[derive(Debug)]
pub struct CycleFatal;

/// Per-loop state owned by the cycle thread.
pub struct CycleState {
    consecutive_delays: u32,
}

impl CycleState {
    pub fn new() -> Self {
        Self {
            consecutive_delays: 0,
        }
    }
}

impl Default for CycleState {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling window of cycle costs feeding the spare-time estimate and the
/// shared CPU-load figure.
pub struct RollingStats {
    window: [u64; ROLLING_COUNT],
    index: usize,
    count: u64,
    interval: u64,
    pub(crate) spare_usecs: f32,
}

impl RollingStats {
    pub fn new() -> Self {
        Self {
            window: [0; ROLLING_COUNT],
            index: 0,
            count: 0,
            interval: ROLLING_INTERVAL_MS,
            spare_usecs: 0.0,
        }
    }

    /// Forget history; recompute how many cycles make up one interval at
    /// the given period.
    pub fn reset(&mut self, period_usecs: u64) {
        self.window = [0; ROLLING_COUNT];
        self.index = 0;
        self.count = 0;
        self.spare_usecs = 0.0;
        self.interval = if period_usecs > 0 {
            (ROLLING_INTERVAL_MS * 1000) / period_usecs
        } else {
            ROLLING_INTERVAL_MS
        }
        .max(1);
    }

    /// Record one cycle's cost; every `interval` cycles, refresh the
    /// spare-time estimate and fold it into the shared load figure.
    pub fn record(&mut self, cycle_usecs: u64, period_usecs: u64, header: &EngineControlHeader) {
        self.window[self.index] = cycle_usecs;
        self.index = (self.index + 1) % ROLLING_COUNT;
        self.count += 1;

        if self.count % self.interval != 0 {
            return;
        }

        let max_usecs = *self.window.iter().max().unwrap_or(&0) as f32;
        let period = period_usecs as f32;
        self.spare_usecs = if max_usecs < period {
            period - max_usecs
        } else {
            0.0
        };

        if period > 0.0 {
            let load = (1.0 - self.spare_usecs / period) * 50.0 + header.cpu_load() * 0.5;
            header.set_cpu_load(load);
            tracing::debug!(load, max_usecs, spare = self.spare_usecs, "cpu load");
        }
    }
}

impl Default for RollingStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute one period.
pub fn run_cycle(
    engine: &Engine,
    driver: &mut dyn Driver,
    state: &mut CycleState,
    nframes: u32,
    delayed_usecs: f32,
) -> Result<(), CycleFatal> {
    engine.mark_alive();

    let spare = engine.rolling.lock().unwrap().spare_usecs;
    if engine.is_realtime() && spare > 0.0 && WORK_SCALE * spare <= delayed_usecs {
        tracing::warn!(
            delayed_usecs,
            spare_usecs = spare,
            "wake-up delay exceeds estimated spare time, restarting driver"
        );
        state.consecutive_delays += 1;
        if state.consecutive_delays > MAX_CONSECUTIVE_DELAYS {
            tracing::error!("too many consecutive interrupt delays, engine pausing");
            return Err(CycleFatal);
        }
        if driver.stop().is_err() {
            tracing::error!("cannot stop current driver");
            return Err(CycleFatal);
        }
        engine.broadcast_xrun();
        if driver.start().is_err() {
            tracing::error!("cannot restart current driver after delay");
            return Err(CycleFatal);
        }
        return Ok(());
    }
    state.consecutive_delays = 0;

    let header = engine.control().header();
    let wait_stamp = driver.last_wait_usecs();
    header.frame_timer.advance(nframes, wait_stamp);
    {
        let mut t = header.current_time.get();
        t.usecs = wait_stamp;
        header.current_time.set(t);
    }

    let Some(mut graph) = engine.try_graph() else {
        // the graph is being mutated; throw the period away
        let _ = driver.null_cycle(nframes);
        return Ok(());
    };

    if driver.read(nframes).is_err() {
        tracing::error!("driver read failed");
        return Err(CycleFatal);
    }

    let failed = process_graph(engine, &mut graph, nframes);

    let mut restart = false;
    if failed {
        let _ = driver.stop();
        restart = true;
    } else if driver.write(nframes).is_err() {
        tracing::error!("driver write failed");
        return Err(CycleFatal);
    }

    post_process(engine, &mut graph, wait_stamp);
    drop(graph);

    if restart {
        let _ = driver.start();
    }
    Ok(())
}

/// Walk the sorted clients once. Returns true when the cycle failed.
fn process_graph(engine: &Engine, graph: &mut GraphState, nframes: u32) -> bool {
    for client in &graph.clients {
        let ctl = client.control();
        ctl.state.store(STATE_NOT_TRIGGERED, Ordering::Relaxed);
        ctl.nframes.store(nframes, Ordering::Relaxed);
        ctl.timed_out.store(0, Ordering::Relaxed);
    }

    let mut process_errors: u32 = 0;
    let mut idx = 0;
    while process_errors == 0 && idx < graph.clients.len() {
        let client = &graph.clients[idx];
        if !client.is_active() || client.is_dead() {
            idx += 1;
        } else if client.is_internal() {
            idx = process_internal(engine, graph, idx, nframes, &mut process_errors);
        } else {
            idx = process_external(engine, graph, idx, &mut process_errors);
        }
    }

    process_errors > 0
}

/// Resolve the buffer table for one in-process client.
fn collect_port_buffers(engine: &Engine, graph: &GraphState, idx: usize) -> PortBuffers {
    let control = engine.control();
    let mut refs = Vec::with_capacity(graph.clients[idx].ports.len());

    for &port in &graph.clients[idx].ports {
        let shared = control.port(port);
        let type_id = shared.type_id.load(Ordering::Relaxed) as usize;
        let pool = &engine.pools()[type_id];
        let len = pool.one_buffer();
        let flags = shared.flags.load(Ordering::Relaxed);

        let (buffer, sources) = if flags & PORT_IS_OUTPUT != 0 {
            let offset = shared.offset.load(Ordering::Relaxed);
            (
                pool.slot_ptr(offset).unwrap_or(std::ptr::null_mut()),
                Vec::new(),
            )
        } else if flags & PORT_IS_INPUT != 0 {
            let sources: Vec<*const u8> = graph.port_private[port as usize]
                .connections
                .iter()
                .filter(|c| c.destination == port)
                .filter_map(|c| {
                    let offset = control.port(c.source).offset.load(Ordering::Relaxed);
                    pool.slot_ptr(offset).map(|p| p as *const u8)
                })
                .collect();
            let buffer = match sources.first() {
                Some(&first) => first as *mut u8,
                // unconnected inputs read silence (primary type only)
                None => pool
                    .silent_offset()
                    .and_then(|off| pool.slot_ptr(off))
                    .unwrap_or(std::ptr::null_mut()),
            };
            (buffer, sources)
        } else {
            (std::ptr::null_mut(), Vec::new())
        };

        refs.push(PortBufferRef {
            port,
            flags,
            buffer,
            len,
            sources,
        });
    }

    PortBuffers::new(refs)
}

/// Run one in-process client inline. Returns the next list index.
fn process_internal(
    engine: &Engine,
    graph: &mut GraphState,
    idx: usize,
    nframes: u32,
    process_errors: &mut u32,
) -> usize {
    let ctl = graph.clients[idx].control();
    engine
        .current_client_pid
        .store(ctl.pid.load(Ordering::Relaxed), Ordering::Relaxed);

    let Some(mut plugin) = graph.clients[idx].plugin.take() else {
        graph.clients[idx].set_state(ClientState::Finished);
        return idx + 1;
    };

    graph.clients[idx].set_state(ClientState::Running);
    let buffers = collect_port_buffers(engine, graph, idx);
    let result = plugin.process(nframes, &buffers);
    graph.clients[idx].plugin = Some(plugin);

    match result {
        Ok(()) => {
            graph.clients[idx].set_state(ClientState::Finished);
            idx + 1
        }
        Err(_) => {
            tracing::error!(client = %graph.clients[idx].name(), "in-process client failed");
            *process_errors += 1;
            graph.clients.len()
        }
    }
}

/// Kick one external subgraph and wait for its tail. Returns the index of
/// the next in-process client (every external client in the run completes
/// before the terminator byte arrives).
fn process_external(engine: &Engine, graph: &mut GraphState, idx: usize, process_errors: &mut u32) -> usize {
    let end = graph.clients.len();
    let (start_fd, wait_fd, pid) = {
        let client = &graph.clients[idx];
        let ctl = client.control();
        // state first: a race exists if we set it after the write
        client.set_state(ClientState::Triggered);
        ctl.signalled_at.store(now_usecs(), Ordering::Release);
        ctl.awake_at.store(0, Ordering::Release);
        ctl.finished_at.store(0, Ordering::Release);
        (
            client.subgraph_start_fd,
            client.subgraph_wait_fd,
            ctl.pid.load(Ordering::Relaxed),
        )
    };
    engine.current_client_pid.store(pid, Ordering::Relaxed);

    // one byte starts the chain
    let wrote = start_fd >= 0 && {
        // SAFETY: the fd belongs to the FIFO pool, which stays alive and
        // open for the duration of the graph lock; ManuallyDrop keeps the
        // borrowed handle from closing it.
        let mut fifo =
            std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(start_fd) });
        std::io::Write::write(&mut *fifo, &[0u8])
            .map(|n| n == 1)
            .unwrap_or(false)
    };
    if !wrote {
        tracing::error!(
            client = %graph.clients[idx].name(),
            start_fd,
            "cannot initiate graph processing"
        );
        *process_errors += 1;
        return end;
    }

    let timeout_ms: i32 = if engine.is_realtime() {
        ((engine.period_usecs.load(Ordering::Relaxed) / 1000) as i32).max(1)
    } else {
        engine.config().client_timeout_msecs as i32
    };

    // SAFETY: as above; the pool owns wait_fd for the lock's duration.
    let borrowed = unsafe { BorrowedFd::borrow_raw(wait_fd) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);

    let status = match poll(&mut fds, timeout) {
        Err(e) => {
            tracing::error!(error = %e, "poll on subgraph processing failed");
            -1
        }
        Ok(_) => {
            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            // the readable check wins: a client that acks and then
            // immediately closes its pipe end has still completed
            if revents.contains(PollFlags::POLLIN) {
                0
            } else if revents.intersects(!PollFlags::POLLIN) {
                tracing::error!(
                    client = %graph.clients[idx].name(),
                    "subgraph lost its client"
                );
                -2
            } else {
                1
            }
        }
    };

    if status != 0 {
        let client = &graph.clients[idx];
        let ctl = client.control();
        tracing::warn!(
            client = %client.name(),
            wait_fd,
            status,
            signalled_at = ctl.signalled_at.load(Ordering::Relaxed),
            awake_at = ctl.awake_at.load(Ordering::Relaxed),
            finished_at = ctl.finished_at.load(Ordering::Relaxed),
            "subgraph did not complete"
        );

        // a timeout only counts against the client if it actually woke;
        // the scheduler may simply never have run it
        if ctl.awake_at.load(Ordering::Acquire) > 0 {
            ctl.timed_out.fetch_add(1, Ordering::AcqRel);
        }
        *process_errors += 1;
        return end;
    }

    let mut byte = [0u8; 1];
    // SAFETY: as for the start fd above.
    let mut fifo = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(wait_fd) });
    if !matches!(std::io::Read::read(&mut *fifo, &mut byte), Ok(1)) {
        tracing::error!(
            client = %graph.clients[idx].name(),
            "cannot clean up byte from graph wait fd"
        );
        graph.clients[idx].error += 1;
        return end;
    }

    // the whole run has completed; resume at the next in-process client
    let mut next = idx + 1;
    while next < end && !graph.clients[next].is_internal() {
        next += 1;
    }
    next
}

/// Settle the period: rotate the time records, account for lingering
/// clients, sweep failures, and update the load estimate.
fn post_process(engine: &Engine, graph: &mut GraphState, cycle_start_usecs: u64) {
    let header = engine.control().header();

    // the timebase client owns the pending record between cycles; usecs
    // and frame rate stay ours
    let rotated = TimeInfo::rotated_from(header.pending_time.get(), header.current_time.get());
    header.current_time.set(rotated);
    header.pending_time.set(rotated);

    let mut need_remove = false;
    for client in graph.clients.iter_mut() {
        let ctl = client.control();

        if !client.is_internal() {
            let awake = ctl.awake_at.load(Ordering::Acquire);
            let lingering = matches!(
                client.state(),
                ClientState::Triggered | ClientState::Running
            );
            if awake > 0 && lingering {
                ctl.timed_out.fetch_add(1, Ordering::AcqRel);
            }

            // the two timeout sites feed one verdict: a faulting cycle is a
            // faulting cycle, and two in a row condemn the client
            if ctl.timed_out.load(Ordering::Acquire) > 0 {
                client.consecutive_timeouts += 1;
                if client.consecutive_timeouts >= 2 {
                    tracing::error!(
                        client = %client.name(),
                        awake_at = awake,
                        state = ?client.state(),
                        "client timed out twice in a row"
                    );
                    client.error += 1;
                }
            } else {
                client.consecutive_timeouts = 0;
            }
        }

        if client.error > 0 {
            need_remove = true;
        }
    }

    if need_remove {
        engine.remove_failed_clients_locked(graph);
    }

    engine.rolling.lock().unwrap().record(
        now_usecs().saturating_sub(cycle_start_usecs),
        engine.period_usecs.load(Ordering::Relaxed),
        header,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientType, InProcessClient, ProcessError};
    use crate::control::PORT_IS_OUTPUT;
    use crate::engine::ClientSetup;
    use crate::testing::{test_engine, DriverCall, ScriptedDriver};
    use crate::ClientId;
    use std::sync::atomic::AtomicU32;
    use std::sync::{Arc, Mutex};

    struct Source {
        out: Arc<AtomicU32>,
        value: f32,
    }

    impl InProcessClient for Source {
        fn process(&mut self, _nframes: u32, buffers: &PortBuffers) -> Result<(), ProcessError> {
            let port = self.out.load(Ordering::Relaxed);
            if let Some(buf) = buffers.audio_out(port) {
                buf.fill(self.value);
            }
            Ok(())
        }
    }

    struct Passthrough {
        input: Arc<AtomicU32>,
        out: Arc<AtomicU32>,
    }

    impl InProcessClient for Passthrough {
        fn process(&mut self, _nframes: u32, buffers: &PortBuffers) -> Result<(), ProcessError> {
            let inp = self.input.load(Ordering::Relaxed);
            let out = self.out.load(Ordering::Relaxed);
            let first = buffers.audio_in(inp).map(|b| b.to_vec());
            if let (Some(src), Some(dst)) = (first, buffers.audio_out(out)) {
                dst.copy_from_slice(&src);
            }
            Ok(())
        }
    }

    struct Sink {
        input: Arc<AtomicU32>,
        seen: Arc<Mutex<Vec<f32>>>,
    }

    impl InProcessClient for Sink {
        fn process(&mut self, _nframes: u32, buffers: &PortBuffers) -> Result<(), ProcessError> {
            let port = self.input.load(Ordering::Relaxed);
            if let Some(buf) = buffers.audio_in(port) {
                self.seen.lock().unwrap().push(buf[0]);
            }
            Ok(())
        }
    }

    fn cycle(engine: &Arc<crate::engine::Engine>, driver: &mut ScriptedDriver, nframes: u32) {
        let mut state = CycleState::new();
        run_cycle(engine, driver, &mut state, nframes, 0.0).unwrap();
    }

    #[test]
    fn test_linear_chain_executes_in_order_and_reads_silence_after_disconnect() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(256).unwrap();

        let x_out = Arc::new(AtomicU32::new(0));
        let y_in = Arc::new(AtomicU32::new(0));
        let y_out = Arc::new(AtomicU32::new(0));
        let z_in = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let x = engine
            .add_in_process_client(
                "x",
                Box::new(Source {
                    out: x_out.clone(),
                    value: 0.5,
                }),
            )
            .unwrap();
        let y = engine
            .add_in_process_client(
                "y",
                Box::new(Passthrough {
                    input: y_in.clone(),
                    out: y_out.clone(),
                }),
            )
            .unwrap();
        let z = engine
            .add_in_process_client(
                "z",
                Box::new(Sink {
                    input: z_in.clone(),
                    seen: seen.clone(),
                }),
            )
            .unwrap();

        let audio = crate::buffer::AUDIO_PORT_TYPE;
        x_out.store(
            engine.port_register(x, "x:out", audio, PORT_IS_OUTPUT).unwrap(),
            Ordering::Relaxed,
        );
        y_in.store(
            engine.port_register(y, "y:in", audio, PORT_IS_INPUT).unwrap(),
            Ordering::Relaxed,
        );
        y_out.store(
            engine.port_register(y, "y:out", audio, PORT_IS_OUTPUT).unwrap(),
            Ordering::Relaxed,
        );
        z_in.store(
            engine.port_register(z, "z:in", audio, PORT_IS_INPUT).unwrap(),
            Ordering::Relaxed,
        );

        for id in [x, y, z] {
            engine.client_activate(id).unwrap();
        }
        engine.connect_ports("x:out", "y:in").unwrap();
        engine.connect_ports("y:out", "z:in").unwrap();

        // execution order follows the feed chain
        {
            let graph = engine.graph();
            let ox = graph.client_index_by_id(x).unwrap();
            let oy = graph.client_index_by_id(y).unwrap();
            let oz = graph.client_index_by_id(z).unwrap();
            assert!(ox < oy && oy < oz);
            assert!(graph.client_by_id(z).unwrap().fed_by.contains(&x));
        }

        let mut driver = ScriptedDriver::new(256, 48_000);
        cycle(&engine, &mut driver, 256);

        // all three finished, and the value propagated through y into z
        {
            let graph = engine.graph();
            for id in [x, y, z] {
                assert_eq!(graph.client_by_id(id).unwrap().state(), ClientState::Finished);
            }
        }
        assert_eq!(seen.lock().unwrap().as_slice(), &[0.5]);

        // cut y:out -> z:in; z keeps running but reads the silent buffer
        engine.disconnect_ports("y:out", "z:in").unwrap();
        {
            let graph = engine.graph();
            assert!(!graph.client_by_id(z).unwrap().fed_by.contains(&x));
            assert!(!graph.client_by_id(z).unwrap().fed_by.contains(&y));
        }

        cycle(&engine, &mut driver, 256);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[0.5, 0.0]);

        engine.shutdown();
    }

    #[test]
    fn test_frame_clock_advances_per_cycle() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(128).unwrap();
        let mut driver = ScriptedDriver::new(128, 48_000);

        cycle(&engine, &mut driver, 128);
        cycle(&engine, &mut driver, 128);
        let (frames, _stamp) = engine.control().header().frame_timer.read();
        assert_eq!(frames, 256);
        engine.shutdown();
    }

    #[test]
    fn test_locked_graph_burns_a_null_cycle() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(64).unwrap();
        let mut driver = ScriptedDriver::new(64, 48_000);

        let graph = engine.graph();
        let mut state = CycleState::new();
        run_cycle(&engine, &mut driver, &mut state, 64, 0.0).unwrap();
        drop(graph);

        let calls = driver.calls();
        assert!(calls.contains(&DriverCall::NullCycle(64)));
        assert!(!calls.contains(&DriverCall::Read(64)));
        engine.shutdown();
    }

    #[test]
    fn test_failing_client_aborts_cycle_and_skips_write() {
        struct Faulty;
        impl InProcessClient for Faulty {
            fn process(&mut self, _n: u32, _b: &PortBuffers) -> Result<(), ProcessError> {
                Err(ProcessError)
            }
        }

        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(64).unwrap();
        let id = engine.add_in_process_client("faulty", Box::new(Faulty)).unwrap();
        engine.client_activate(id).unwrap();

        let mut driver = ScriptedDriver::new(64, 48_000);
        cycle(&engine, &mut driver, 64);

        let calls = driver.calls();
        assert!(calls.contains(&DriverCall::Read(64)));
        assert!(!calls.contains(&DriverCall::Write(64)));
        // stopped for the abort, restarted afterwards
        assert!(calls.contains(&DriverCall::Stop));
        assert!(calls.contains(&DriverCall::Start));
        engine.shutdown();
    }

    fn install_fake_external(engine: &Arc<crate::engine::Engine>, name: &str) -> ClientId {
        let result = engine
            .setup_client(ClientSetup {
                client_type: ClientType::External,
                name: name.to_string(),
                pid: std::process::id() as i32,
                factory: String::new(),
                args: String::new(),
                request_stream: None,
                plugin: None,
            })
            .unwrap();
        engine.client_activate(result.client_id).unwrap();
        result.client_id
    }

    /// One cycle's worth of a client that wakes but never finishes: read
    /// the go byte off the subgraph FIFO, stamp the control block the way
    /// the client library would, then stall without acknowledging.
    fn spawn_stuck_client(
        shm_dir: std::path::PathBuf,
        fifo_path: std::path::PathBuf,
        name: &str,
    ) -> std::thread::JoinHandle<()> {
        let shm_name = format!("/jack-c-{name}");
        std::thread::spawn(move || {
            use std::io::Read;
            let seg = crate::shm::SharedSegment::attach(&shm_dir, &shm_name).unwrap();
            let ctl = unsafe { &*(seg.as_ptr() as *const crate::control::ClientControl) };
            let mut fifo = std::fs::File::open(&fifo_path).unwrap();
            let mut byte = [0u8; 1];
            fifo.read_exact(&mut byte).unwrap();
            ctl.awake_at.store(now_usecs(), Ordering::Release);
            ctl.state
                .store(crate::control::STATE_RUNNING, Ordering::Release);
            // ...and never write the terminator byte
        })
    }

    #[test]
    fn test_external_timeout_two_cycles_then_zombie_then_removal() {
        let (_dirs, engine) = test_engine(|mut cfg| {
            cfg.client_timeout_msecs = 200;
            cfg
        });
        engine.set_buffer_size(64).unwrap();
        let id = install_fake_external(&engine, "stuck");

        let shm_dir = engine.config().shm_dir.clone();
        let fifo0 = {
            let graph = engine.graph();
            graph.fifos.path_for(0)
        };

        let mut driver = ScriptedDriver::new(64, 48_000);

        // cycle 1: the client wakes inside the period but blocks past the
        // deadline; the timeout counts but does not condemn it yet
        let stuck = spawn_stuck_client(shm_dir.clone(), fifo0.clone(), "stuck");
        {
            let mut state = CycleState::new();
            run_cycle(&engine, &mut driver, &mut state, 64, 0.0).unwrap();
        }
        stuck.join().unwrap();

        {
            let graph = engine.graph();
            let client = graph.client_by_id(id).unwrap();
            assert!(client.control().timed_out.load(Ordering::Relaxed) > 0);
            assert_eq!(client.error, 0);
            assert!(!client.is_dead());
            assert_eq!(client.consecutive_timeouts, 1);
        }

        // cycle 2: second consecutive timeout condemns and zombifies
        let stuck = spawn_stuck_client(shm_dir, fifo0, "stuck");
        {
            let mut state = CycleState::new();
            run_cycle(&engine, &mut driver, &mut state, 64, 0.0).unwrap();
        }
        stuck.join().unwrap();

        {
            let graph = engine.graph();
            let client = graph.client_by_id(id).unwrap();
            assert!(client.is_dead(), "second timeout should zombify");
            assert!(!client.is_active());
            assert_eq!(client.error, 0, "zombification clears the error count");
        }

        // socket failure on top of zombie state: removed entirely
        {
            let mut graph = engine.graph();
            graph.client_by_id_mut(id).unwrap().error = crate::client::ERROR_WITH_SOCKETS;
        }
        {
            let mut state = CycleState::new();
            run_cycle(&engine, &mut driver, &mut state, 64, 0.0).unwrap();
        }
        assert!(engine.graph().client_by_id(id).is_none());

        engine.shutdown();
    }

    #[test]
    fn test_delay_gate_restarts_ten_times_then_exits() {
        let (_dirs, engine) = test_engine(|mut cfg| {
            cfg.realtime = true;
            cfg
        });
        engine.set_buffer_size(64).unwrap();
        engine.rolling.lock().unwrap().spare_usecs = 100.0;

        let mut driver = ScriptedDriver::new(64, 48_000);
        let mut state = CycleState::new();

        for i in 1..=MAX_CONSECUTIVE_DELAYS {
            let res = run_cycle(&engine, &mut driver, &mut state, 64, 200.0);
            assert!(res.is_ok(), "restart {i} should not be fatal");
        }
        let calls = driver.calls();
        let stops = calls.iter().filter(|c| **c == DriverCall::Stop).count();
        let starts = calls.iter().filter(|c| **c == DriverCall::Start).count();
        assert_eq!(stops, 10);
        assert_eq!(starts, 10);

        // the 11th consecutive over-budget cycle exits the loop
        let res = run_cycle(&engine, &mut driver, &mut state, 64, 200.0);
        assert!(res.is_err());

        // and a clean cycle resets the counter
        let mut state = CycleState::new();
        assert!(run_cycle(&engine, &mut driver, &mut state, 64, 0.0).is_ok());
        engine.shutdown();
    }

    #[test]
    fn test_rolling_stats_compute_spare_time() {
        let mut stats = RollingStats::new();
        stats.reset(1000);
        assert_eq!(stats.interval, 1000);

        let dir = tempfile::tempdir().unwrap();
        let ctl = crate::control::ControlSegment::create(dir.path(), "/jack-engine", 1).unwrap();

        // exactly one interval's worth of 400-usec cycles
        for _ in 0..1000 {
            stats.record(400, 1000, ctl.header());
        }
        assert_eq!(stats.spare_usecs, 600.0);
        assert!(ctl.header().cpu_load() > 0.0);
    }

    #[test]
    fn test_unconnected_input_resolves_to_silent_buffer() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(64).unwrap();

        let in_port = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = engine
            .add_in_process_client(
                "lonely",
                Box::new(Sink {
                    input: in_port.clone(),
                    seen: seen.clone(),
                }),
            )
            .unwrap();
        in_port.store(
            engine
                .port_register(id, "lonely:in", crate::buffer::AUDIO_PORT_TYPE, PORT_IS_INPUT)
                .unwrap(),
            Ordering::Relaxed,
        );
        engine.client_activate(id).unwrap();

        let mut driver = ScriptedDriver::new(64, 48_000);
        cycle(&engine, &mut driver, 64);
        assert_eq!(seen.lock().unwrap().as_slice(), &[0.0]);
        engine.shutdown();
    }

    #[test]
    fn test_watchdog_flag_set_by_cycle() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(64).unwrap();
        engine.watchdog_check.store(false, Ordering::Release);

        let mut driver = ScriptedDriver::new(64, 48_000);
        cycle(&engine, &mut driver, 64);
        assert!(engine.watchdog_check.load(Ordering::Acquire));
        engine.shutdown();
    }
}
