//! Client records and the in-process client contract.

use crate::control::{
    ClientControl, ClientControlHandle, STATE_FINISHED, STATE_NOT_TRIGGERED, STATE_RUNNING,
    STATE_TRIGGERED, TYPE_DRIVER, TYPE_EXTERNAL, TYPE_IN_PROCESS,
};
use crate::shm::ShmError;
use crate::{ClientId, PortId};
use ahash::AHashSet;
use enum_as_inner::EnumAsInner;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::Ordering;

/// Error-counter watermark separating recoverable faults from socket
/// failures. A client at or above it is removed outright; below it, it is
/// zombified and given the chance to notice and disconnect.
pub const ERROR_WITH_SOCKETS: u32 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumAsInner)]
pub enum ClientType {
    /// Runs in its own process, scheduled through the FIFO protocol.
    External,
    /// A registered factory product invoked inline on the cycle thread.
    InProcess,
    /// The hardware adapter's client; sorts first when cycles must break.
    Driver,
}

impl ClientType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            TYPE_EXTERNAL => Some(ClientType::External),
            TYPE_IN_PROCESS => Some(ClientType::InProcess),
            TYPE_DRIVER => Some(ClientType::Driver),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            ClientType::External => TYPE_EXTERNAL,
            ClientType::InProcess => TYPE_IN_PROCESS,
            ClientType::Driver => TYPE_DRIVER,
        }
    }
}

/// Per-cycle execution state, mirrored in the shared control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumAsInner)]
pub enum ClientState {
    NotTriggered,
    Triggered,
    Running,
    Finished,
}

impl ClientState {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            STATE_TRIGGERED => ClientState::Triggered,
            STATE_RUNNING => ClientState::Running,
            STATE_FINISHED => ClientState::Finished,
            _ => ClientState::NotTriggered,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            ClientState::NotTriggered => STATE_NOT_TRIGGERED,
            ClientState::Triggered => STATE_TRIGGERED,
            ClientState::Running => STATE_RUNNING,
            ClientState::Finished => STATE_FINISHED,
        }
    }
}

/// Returned by an in-process client whose cycle failed; the executor
/// aborts the period and lets post-process decide the client's fate.
#[derive(Debug, thiserror::Error)]
#[error("process callback failed")]
pub struct ProcessError;

/// Buffer resolution for one port, handed to in-process clients each
/// cycle.
///
/// Output ports point at their own slot; input ports point at their
/// source's slot, or the silent buffer when unconnected. Inputs with
/// fan-in list every source in `sources`; mixdown runs on the client
/// side, so a mixdown-capable client sums them itself.
pub struct PortBufferRef {
    pub port: PortId,
    pub flags: u32,
    pub buffer: *mut u8,
    pub len: usize,
    pub sources: Vec<*const u8>,
}

/// The per-cycle buffer table for one in-process client.
///
/// Pointers stay valid for the duration of the process callback: the
/// cycle thread holds the graph lock, under which no segment is resized
/// and no connection changes.
pub struct PortBuffers {
    refs: Vec<PortBufferRef>,
}

impl PortBuffers {
    pub(crate) fn new(refs: Vec<PortBufferRef>) -> Self {
        Self { refs }
    }

    pub fn get(&self, port: PortId) -> Option<&PortBufferRef> {
        self.refs.iter().find(|r| r.port == port)
    }

    /// Mutable audio view of an output port's buffer. The caller must not
    /// hold two views of the same port at once.
    pub fn audio_out(&self, port: PortId) -> Option<&mut [f32]> {
        let r = self.get(port)?;
        if r.buffer.is_null() || r.len == 0 {
            return None;
        }
        // SAFETY: the slot belongs exclusively to this output port for
        // the duration of the callback; see the type-level note.
        Some(unsafe { std::slice::from_raw_parts_mut(r.buffer as *mut f32, r.len / 4) })
    }

    /// Audio view of an input port's resolved buffer.
    pub fn audio_in(&self, port: PortId) -> Option<&[f32]> {
        let r = self.get(port)?;
        if r.buffer.is_null() || r.len == 0 {
            return None;
        }
        // SAFETY: upstream writers finished before this client was
        // scheduled; the mapping outlives the callback.
        Some(unsafe { std::slice::from_raw_parts(r.buffer as *const f32, r.len / 4) })
    }
}

/// Contract for in-process clients and drivers' client halves.
///
/// All hooks default to no-ops; a pure-sink client only overrides
/// [`InProcessClient::process`]. Hooks run on the thread that triggered
/// the event: `process` on the cycle thread, the rest under the graph
/// lock on whichever thread mutated the graph.
pub trait InProcessClient: Send {
    fn process(&mut self, _nframes: u32, _buffers: &PortBuffers) -> Result<(), ProcessError> {
        Ok(())
    }

    fn buffer_size_changed(&mut self, _nframes: u32) {}

    fn sample_rate_changed(&mut self, _nframes: u32) {}

    fn port_registration(&mut self, _port: PortId, _registered: bool) {}

    fn port_connection(&mut self, _own: PortId, _other: PortId, _connected: bool) {}

    fn graph_reordered(&mut self, _execution_order: u32) {}

    fn xrun(&mut self) {}

    fn new_port_type(&mut self, _shm_name: &str, _size: u64) {}
}

/// Engine-side record of one live client.
///
/// The record owns the control-block handle and the engine's half of the
/// client's channels; subgraph fds borrow from the FIFO pool and are plain
/// values here.
pub struct ClientRecord {
    control: ClientControlHandle,
    client_type: ClientType,
    /// Ports owned by this client.
    pub ports: Vec<PortId>,
    /// Clients whose output reaches this one, transitively. Rebuilt on
    /// every structural mutation.
    pub fed_by: AHashSet<ClientId>,
    pub execution_order: u32,
    /// FIFO the engine writes to start this client's subgraph; -1 unless
    /// this client heads one.
    pub subgraph_start_fd: i32,
    /// FIFO the engine waits on for the subgraph to conclude; -1 for
    /// continuation clients.
    pub subgraph_wait_fd: i32,
    /// Raw fd of the request channel, for identification in logs and the
    /// poll set. The server thread owns the stream itself.
    pub request_fd: i32,
    /// Event channel, installed by the ack handshake.
    pub event_stream: Option<UnixStream>,
    /// Token in the server poll set, external clients only.
    pub poll_token: Option<usize>,
    /// Fault accumulator; see [`ERROR_WITH_SOCKETS`].
    pub error: u32,
    /// Engine-side run of back-to-back faulting cycles; the shared
    /// `timed_out` counter is per-cycle, this one persists across them.
    pub consecutive_timeouts: u32,
    /// The in-process implementation, when this client runs inline.
    pub plugin: Option<Box<dyn InProcessClient>>,
}

impl ClientRecord {
    /// Create the record for an external client, allocating its shared
    /// control block (`/jack-c-<name>`).
    pub fn new_external(
        shm_dir: &Path,
        id: ClientId,
        name: &str,
        pid: i32,
    ) -> Result<Self, ShmError> {
        let control = ClientControlHandle::shared(shm_dir, &format!("/jack-c-{name}"))?;
        control.control().init(id, TYPE_EXTERNAL, name, pid);
        Ok(Self::with_control(control, ClientType::External))
    }

    /// Create the record for an in-process or driver client; the control
    /// block is a private allocation with the shared layout.
    pub fn new_local(client_type: ClientType, id: ClientId, name: &str) -> Self {
        let control = ClientControlHandle::local();
        control
            .control()
            .init(id, client_type.as_u32(), name, std::process::id() as i32);
        Self::with_control(control, client_type)
    }

    fn with_control(control: ClientControlHandle, client_type: ClientType) -> Self {
        Self {
            control,
            client_type,
            ports: Vec::new(),
            fed_by: AHashSet::new(),
            execution_order: u32::MAX,
            subgraph_start_fd: -1,
            subgraph_wait_fd: -1,
            request_fd: -1,
            event_stream: None,
            poll_token: None,
            error: 0,
            consecutive_timeouts: 0,
            plugin: None,
        }
    }

    pub fn control(&self) -> &ClientControl {
        self.control.control()
    }

    pub fn id(&self) -> ClientId {
        self.control().id.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> String {
        self.control().name_string()
    }

    pub fn client_type(&self) -> ClientType {
        self.client_type
    }

    /// Driver and in-process clients execute inline and break subgraphs.
    pub fn is_internal(&self) -> bool {
        !matches!(self.client_type, ClientType::External)
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u32(self.control().state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ClientState) {
        self.control().state.store(state.as_u32(), Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.control().is_active()
    }

    pub fn is_dead(&self) -> bool {
        self.control().is_dead()
    }

    /// Tear down the control block's backing segment (external clients).
    pub fn destroy_control(&self) {
        self.control.destroy();
    }

    pub fn control_shm_name(&self) -> Option<&str> {
        self.control.shm_name()
    }
}
