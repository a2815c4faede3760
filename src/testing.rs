//! Test harness: a scripted driver and a mock external client that
//! speaks the real socket, shared-memory, and FIFO protocol from a
//! thread.

use crate::control::{from_fixed, to_fixed, ClientControl, TYPE_EXTERNAL};
use crate::driver::{Driver, DriverError, DriverWait};
use crate::engine::Engine;
use crate::event::{acknowledge, read_event, Event, EventType};
use crate::shm::SharedSegment;
use crate::wire::{
    read_record, write_record, AckConnectRecord, AckConnectResult, ClientConnectRecord,
    ClientConnectResult, PortTypeRecord, RequestRecord, PROTOCOL_VERSION,
};
use crate::{ClientId, PortId};
use bytemuck::Zeroable;
use std::collections::VecDeque;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// What the engine asked a [`ScriptedDriver`] to do, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCall {
    Attach,
    Detach,
    Start,
    Stop,
    Read(u32),
    Write(u32),
    NullCycle(u32),
}

/// A deterministic driver for tests: it answers `wait` from a script
/// (falling back to `Fatal` when the script runs dry, which ends the
/// cycle loop) and records every call the engine makes.
pub struct ScriptedDriver {
    period_frames: u32,
    sample_rate: u32,
    script: VecDeque<DriverWait>,
    calls: Arc<Mutex<Vec<DriverCall>>>,
}

impl ScriptedDriver {
    pub fn new(period_frames: u32, sample_rate: u32) -> Self {
        Self {
            period_frames,
            sample_rate,
            script: VecDeque::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue one `wait` outcome.
    pub fn script_wait(&mut self, wait: DriverWait) {
        self.script.push_back(wait);
    }

    /// Queue `n` ordinary periods.
    pub fn script_cycles(&mut self, n: usize) {
        for _ in 0..n {
            self.script.push_back(DriverWait::Cycle {
                nframes: self.period_frames,
                delayed_usecs: 0.0,
            });
        }
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    /// A handle that stays valid after the driver is boxed away.
    pub fn calls_handle(&self) -> Arc<Mutex<Vec<DriverCall>>> {
        self.calls.clone()
    }

    fn log(&self, call: DriverCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Driver for ScriptedDriver {
    fn attach(&mut self, engine: &Engine, _client: ClientId) -> Result<(), DriverError> {
        self.log(DriverCall::Attach);
        engine
            .set_buffer_size(self.period_frames)
            .map_err(|e| DriverError::Failed(e.to_string()))?;
        engine.set_sample_rate(self.sample_rate);
        Ok(())
    }

    fn detach(&mut self, _engine: &Engine) -> Result<(), DriverError> {
        self.log(DriverCall::Detach);
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.log(DriverCall::Start);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.log(DriverCall::Stop);
        Ok(())
    }

    fn wait(&mut self) -> DriverWait {
        self.script.pop_front().unwrap_or(DriverWait::Fatal)
    }

    fn read(&mut self, nframes: u32) -> Result<(), DriverError> {
        self.log(DriverCall::Read(nframes));
        Ok(())
    }

    fn write(&mut self, nframes: u32) -> Result<(), DriverError> {
        self.log(DriverCall::Write(nframes));
        Ok(())
    }

    fn null_cycle(&mut self, nframes: u32) -> Result<(), DriverError> {
        self.log(DriverCall::NullCycle(nframes));
        Ok(())
    }

    fn period_usecs(&self) -> u64 {
        self.period_frames as u64 * 1_000_000 / self.sample_rate as u64
    }

    fn last_wait_usecs(&self) -> u64 {
        crate::clock::now_usecs()
    }
}

/// A stand-in for a real external client process: connects over the real
/// sockets, attaches the shared control block, installs an event channel,
/// and answers every event with a zero status byte from a pump thread.
pub struct MockExternalClient {
    pub client_id: ClientId,
    pub name: String,
    /// Port types streamed during the handshake.
    pub port_types: Vec<PortTypeRecord>,
    pub fifo_prefix: String,
    request: UnixStream,
    event_shutdown: UnixStream,
    control_seg: SharedSegment,
    events: Arc<Mutex<Vec<Event>>>,
    pump: Option<JoinHandle<()>>,
}

impl MockExternalClient {
    pub fn connect(engine: &Arc<Engine>, name: &str) -> std::io::Result<Self> {
        let (socket_path, ack_path) = engine.socket_paths();

        let mut request = UnixStream::connect(socket_path)?;
        let mut rec = ClientConnectRecord::zeroed();
        rec.client_type = TYPE_EXTERNAL;
        rec.protocol = PROTOCOL_VERSION;
        rec.load = 1;
        rec.pid = std::process::id() as i32;
        rec.name = to_fixed(name);
        write_record(&mut request, &rec)?;

        let res: ClientConnectResult = read_record(&mut request)?;
        if res.status != 0 {
            return Err(std::io::Error::other(format!(
                "connect refused with status {}",
                res.status
            )));
        }

        let mut port_types = Vec::new();
        for _ in 0..res.n_port_types {
            port_types.push(read_record::<PortTypeRecord>(&mut request)?);
        }

        let control_seg = SharedSegment::attach(
            &engine.config().shm_dir,
            from_fixed(&res.client_shm_name),
        )
        .map_err(std::io::Error::other)?;
        // SAFETY: the engine created this segment with the control layout.
        let client_id = unsafe { &*(control_seg.as_ptr() as *const ClientControl) }
            .id
            .load(Ordering::Acquire);

        let mut event_stream = UnixStream::connect(ack_path)?;
        write_record(&mut event_stream, &AckConnectRecord { client_id })?;
        let ack: AckConnectResult = read_record(&mut event_stream)?;
        if ack.status != 0 {
            return Err(std::io::Error::other("ack connection refused"));
        }

        let events = Arc::new(Mutex::new(Vec::new()));
        let event_shutdown = event_stream.try_clone()?;
        let pump_events = events.clone();
        let pump = std::thread::spawn(move || loop {
            match read_event(&mut event_stream) {
                Ok(Some(event)) => {
                    pump_events.lock().unwrap().push(event);
                    if acknowledge(&mut event_stream, 0).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    if acknowledge(&mut event_stream, 0).is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        });

        Ok(Self {
            client_id,
            name: name.to_string(),
            port_types,
            fifo_prefix: from_fixed(&res.fifo_prefix).to_string(),
            request,
            event_shutdown,
            control_seg,
            events,
            pump: Some(pump),
        })
    }

    /// Ask the engine to unload a named client; returns the reply status.
    pub fn unload(engine: &Arc<Engine>, name: &str) -> std::io::Result<i32> {
        let (socket_path, _) = engine.socket_paths();
        let mut stream = UnixStream::connect(socket_path)?;
        let mut rec = ClientConnectRecord::zeroed();
        rec.client_type = TYPE_EXTERNAL;
        rec.protocol = PROTOCOL_VERSION;
        rec.load = 0;
        rec.name = to_fixed(name);
        write_record(&mut stream, &rec)?;
        let res: ClientConnectResult = read_record(&mut stream)?;
        Ok(res.status)
    }

    pub fn control(&self) -> &ClientControl {
        // SAFETY: as in `connect`.
        unsafe { &*(self.control_seg.as_ptr() as *const ClientControl) }
    }

    fn roundtrip(&mut self, record: RequestRecord) -> std::io::Result<RequestRecord> {
        write_record(&mut self.request, &record)?;
        read_record(&mut self.request)
    }

    pub fn register_port(
        &mut self,
        name: &str,
        type_name: &str,
        flags: u32,
    ) -> std::io::Result<PortId> {
        let mut rec = RequestRecord::zeroed();
        rec.rtype = crate::request::RequestType::RegisterPort.as_u32();
        rec.client_id = self.client_id;
        rec.flags = flags;
        rec.name = to_fixed(name);
        rec.port_type = to_fixed(type_name);
        let reply = self.roundtrip(rec)?;
        if reply.status != 0 {
            return Err(std::io::Error::other(format!(
                "register refused: {}",
                reply.status
            )));
        }
        Ok(reply.port_id)
    }

    pub fn activate(&mut self) -> std::io::Result<()> {
        let mut rec = RequestRecord::zeroed();
        rec.rtype = crate::request::RequestType::ActivateClient.as_u32();
        rec.client_id = self.client_id;
        let reply = self.roundtrip(rec)?;
        if reply.status != 0 {
            return Err(std::io::Error::other("activate refused"));
        }
        Ok(())
    }

    pub fn deactivate(&mut self) -> std::io::Result<()> {
        let mut rec = RequestRecord::zeroed();
        rec.rtype = crate::request::RequestType::DeactivateClient.as_u32();
        rec.client_id = self.client_id;
        let reply = self.roundtrip(rec)?;
        if reply.status != 0 {
            return Err(std::io::Error::other("deactivate refused"));
        }
        Ok(())
    }

    /// Returns the reply status; connection failures surface as errors,
    /// refusals as negative statuses.
    pub fn connect_ports(&mut self, source: &str, destination: &str) -> i32 {
        let mut rec = RequestRecord::zeroed();
        rec.rtype = crate::request::RequestType::ConnectPorts.as_u32();
        rec.client_id = self.client_id;
        rec.source = to_fixed(source);
        rec.destination = to_fixed(destination);
        match self.roundtrip(rec) {
            Ok(reply) => reply.status,
            Err(_) => i32::MIN,
        }
    }

    pub fn get_port_connections(&mut self, port: PortId) -> std::io::Result<Vec<PortId>> {
        let mut rec = RequestRecord::zeroed();
        rec.rtype = crate::request::RequestType::GetPortConnections.as_u32();
        rec.client_id = self.client_id;
        rec.port_id = port;
        write_record(&mut self.request, &rec)?;
        let reply: RequestRecord = read_record(&mut self.request)?;
        if reply.status != 0 {
            return Err(std::io::Error::other("connection query refused"));
        }
        let mut peers = Vec::with_capacity(reply.nports as usize);
        for _ in 0..reply.nports {
            let mut bytes = [0u8; 4];
            std::io::Read::read_exact(&mut self.request, &mut bytes)?;
            peers.push(PortId::from_le_bytes(bytes));
        }
        Ok(peers)
    }

    /// Snapshot of every event the pump has acknowledged so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Block (bounded) until an event of the given type has arrived.
    pub fn wait_for_event(&self, etype: EventType) {
        for _ in 0..400 {
            if self.events().iter().any(|e| e.etype == etype) {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("timed out waiting for {etype:?} event");
    }
}

impl Drop for MockExternalClient {
    fn drop(&mut self) {
        let _ = self.event_shutdown.shutdown(Shutdown::Both);
        let _ = self.request.shutdown(Shutdown::Both);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

/// Keeps the per-test directories alive for the engine's lifetime.
#[cfg(test)]
pub struct TestDirs {
    pub server: tempfile::TempDir,
    pub shm: tempfile::TempDir,
}

/// A fresh engine over temporary directories, with the config run through
/// `adjust` first.
#[cfg(test)]
pub fn test_engine(
    adjust: impl FnOnce(crate::config::EngineConfig) -> crate::config::EngineConfig,
) -> (TestDirs, Arc<Engine>) {
    let server = tempfile::tempdir().unwrap();
    let shm = tempfile::tempdir().unwrap();
    let mut cfg = crate::config::EngineConfig::default();
    cfg.server_dir = server.path().to_path_buf();
    cfg.shm_dir = shm.path().to_path_buf();
    let cfg = adjust(cfg);
    let engine = Engine::new(cfg).unwrap();
    (TestDirs { server, shm }, engine)
}
