//! Bit-exact layouts of the shared control blocks.
//!
//! The engine control segment is a singleton mapped by the engine and every
//! client; per-client control blocks are mapped by the engine and the one
//! external client they describe. Both sides must agree on these layouts
//! exactly, so everything here is `#[repr(C)]`, and every field that can
//! change while the other side is looking is an atomic or a volatile cell.

use crate::clock::{FrameTimer, TimeInfo};
use crate::shm::{SharedSegment, ShmError};
use crate::{ClientId, PortId};
use std::cell::UnsafeCell;
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

pub const CLIENT_NAME_SIZE: usize = 64;
pub const PORT_NAME_SIZE: usize = 128;
pub const TYPE_NAME_SIZE: usize = 32;
pub const SHM_NAME_SIZE: usize = 64;

/// Maximum number of port types the control block can describe. The
/// built-in table is fixed at startup; this is layout capacity, not a
/// registration limit.
pub const MAX_PORT_TYPES: usize = 4;

/// Encode a string into a fixed, NUL-padded field. Truncates at `N - 1`.
pub fn to_fixed<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let n = s.len().min(N - 1);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}

/// Decode a NUL-padded fixed field back into a string slice.
pub fn from_fixed(field: &[u8]) -> &str {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

/// A field of a shared layout accessed with volatile copies.
///
/// Used for fields that are written whole under an engine-side lock and
/// read racily by clients (names, time records). Tearing is tolerated the
/// same way the sample buffers tolerate it; the surrounding protocol
/// orders the writes that matter.
#[repr(transparent)]
pub struct SharedCell<T: Copy>(UnsafeCell<T>);

// SAFETY: all access is by volatile whole-value copy.
unsafe impl<T: Copy> Sync for SharedCell<T> {}

impl<T: Copy> SharedCell<T> {
    pub fn get(&self) -> T {
        // SAFETY: the cell lives in a mapping valid for &self's lifetime.
        unsafe { std::ptr::read_volatile(self.0.get()) }
    }

    pub fn set(&self, value: T) {
        // SAFETY: as above.
        unsafe { std::ptr::write_volatile(self.0.get(), value) }
    }
}

/// Per-type descriptor in the engine control block.
#[repr(C)]
pub struct PortTypeShared {
    pub type_id: AtomicU32,
    /// Fixed buffer size in bytes; consulted when `scale_factor` < 0.
    pub buffer_size: AtomicU32,
    /// One buffer is `scale_factor × period_frames × size_of::<f32>()`
    /// when non-negative.
    pub scale_factor: AtomicI32,
    /// Non-zero when the type defines a mixdown, i.e. permits fan-in.
    pub has_mixdown: AtomicU32,
    /// Current size of the type's buffer segment in bytes.
    pub seg_size: AtomicU64,
    pub type_name: SharedCell<[u8; TYPE_NAME_SIZE]>,
    pub shm_name: SharedCell<[u8; SHM_NAME_SIZE]>,
}

impl PortTypeShared {
    /// Bytes of one buffer slot for a period of `period_frames`.
    pub fn one_buffer_size(&self, period_frames: u32) -> usize {
        let scale = self.scale_factor.load(Ordering::Relaxed);
        if scale < 0 {
            self.buffer_size.load(Ordering::Relaxed) as usize
        } else {
            scale as usize * period_frames as usize * std::mem::size_of::<f32>()
        }
    }
}

/// Port flag: the port accepts input.
pub const PORT_IS_INPUT: u32 = 1 << 0;
/// Port flag: the port produces output.
pub const PORT_IS_OUTPUT: u32 = 1 << 1;
/// Port flag: data originates or terminates at this port (latency DFS
/// bottoms out here).
pub const PORT_IS_TERMINAL: u32 = 1 << 2;
/// Port flag: the port corresponds to hardware.
pub const PORT_IS_PHYSICAL: u32 = 1 << 3;

/// One slot of the dense shared port table.
#[repr(C)]
pub struct PortShared {
    pub id: AtomicU32,
    pub type_id: AtomicU32,
    pub client_id: AtomicU32,
    pub flags: AtomicU32,
    /// Allocation bit, guarded by the engine's port lock.
    pub in_use: AtomicU32,
    /// Non-zero while the port refuses connection changes.
    pub locked: AtomicU32,
    pub monitor_requests: AtomicU32,
    /// Latency this port itself contributes, in frames.
    pub latency: AtomicU32,
    /// Longest latency chain from this port toward a terminal.
    pub total_latency: AtomicU32,
    /// Byte offset of this port's buffer in its type's segment. Zero for
    /// input ports, which resolve buffers through their connections.
    pub offset: AtomicU64,
    pub name: SharedCell<[u8; PORT_NAME_SIZE]>,
}

impl PortShared {
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire) != 0
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Relaxed) & flag != 0
    }

    pub fn name_matches(&self, name: &str) -> bool {
        let field = self.name.get();
        from_fixed(&field) == name
    }
}

/// Header of the engine control segment; the dense [`PortShared`] table
/// follows immediately after.
#[repr(C)]
pub struct EngineControlHeader {
    pub frame_timer: FrameTimer,
    pub current_time: SharedCell<TimeInfo>,
    pub pending_time: SharedCell<TimeInfo>,
    /// Cleared on engine shutdown so attached clients stop trusting the
    /// segment.
    pub engine_ok: AtomicU32,
    pub real_time: AtomicU32,
    pub client_priority: AtomicI32,
    pub buffer_size: AtomicU32,
    pub port_max: AtomicU32,
    pub n_port_types: AtomicU32,
    /// Rolling engine load estimate, stored as `f32` bits.
    cpu_load_bits: AtomicU32,
    _reserved: AtomicU32,
    pub port_types: [PortTypeShared; MAX_PORT_TYPES],
}

impl EngineControlHeader {
    pub fn cpu_load(&self) -> f32 {
        f32::from_bits(self.cpu_load_bits.load(Ordering::Relaxed))
    }

    pub fn set_cpu_load(&self, load: f32) {
        self.cpu_load_bits.store(load.to_bits(), Ordering::Relaxed);
    }
}

/// Execution states a client's control block moves through each cycle.
pub const STATE_NOT_TRIGGERED: u32 = 0;
pub const STATE_TRIGGERED: u32 = 1;
pub const STATE_RUNNING: u32 = 2;
pub const STATE_FINISHED: u32 = 3;

/// Client type discriminants as stored in shared blocks and handshakes.
pub const TYPE_EXTERNAL: u32 = 0;
pub const TYPE_IN_PROCESS: u32 = 1;
pub const TYPE_DRIVER: u32 = 2;

/// Per-client control block. For external clients this lives in the
/// `/jack-c-<name>` segment; for in-process and driver clients it is a
/// private heap allocation with the same layout.
#[repr(C)]
pub struct ClientControl {
    pub id: AtomicU32,
    pub client_type: AtomicU32,
    /// One of the `STATE_*` values. The engine resets it each cycle; the
    /// client advances it as it wakes and finishes.
    pub state: AtomicU32,
    pub active: AtomicU32,
    pub dead: AtomicU32,
    /// Consecutive faulting cycles; two in a row marks the client errored.
    pub timed_out: AtomicU32,
    /// Period size for the cycle in flight.
    pub nframes: AtomicU32,
    pub pid: AtomicI32,
    /// When the engine signalled the client's subgraph.
    pub signalled_at: AtomicU64,
    /// When the client woke inside the period; zero means the scheduler
    /// never ran it, which the engine forgives.
    pub awake_at: AtomicU64,
    /// When the client finished its callback.
    pub finished_at: AtomicU64,
    pub name: SharedCell<[u8; CLIENT_NAME_SIZE]>,
}

impl ClientControl {
    pub(crate) fn init(&self, id: ClientId, client_type: u32, name: &str, pid: i32) {
        self.id.store(id, Ordering::Relaxed);
        self.client_type.store(client_type, Ordering::Relaxed);
        self.state.store(STATE_NOT_TRIGGERED, Ordering::Relaxed);
        self.active.store(0, Ordering::Relaxed);
        self.dead.store(0, Ordering::Relaxed);
        self.timed_out.store(0, Ordering::Relaxed);
        self.pid.store(pid, Ordering::Relaxed);
        self.name.set(to_fixed(name));
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire) != 0
    }

    pub fn name_string(&self) -> String {
        let field = self.name.get();
        from_fixed(&field).to_string()
    }
}

/// The engine control segment: header plus dense port table.
pub struct ControlSegment {
    seg: SharedSegment,
    port_max: usize,
}

impl ControlSegment {
    pub fn required_size(port_max: u32) -> usize {
        std::mem::size_of::<EngineControlHeader>()
            + port_max as usize * std::mem::size_of::<PortShared>()
    }

    pub fn create(dir: &Path, name: &str, port_max: u32) -> Result<Self, ShmError> {
        let seg = SharedSegment::create(dir, name, Self::required_size(port_max))?;
        let this = Self {
            seg,
            port_max: port_max as usize,
        };
        let header = this.header();
        header.port_max.store(port_max, Ordering::Relaxed);
        header.current_time.set(TimeInfo::zeroed());
        header.pending_time.set(TimeInfo::zeroed());
        for (i, port) in this.ports().iter().enumerate() {
            port.id.store(i as PortId, Ordering::Relaxed);
        }
        Ok(this)
    }

    pub fn header(&self) -> &EngineControlHeader {
        // SAFETY: the segment is at least `required_size` bytes and the
        // header sits at offset 0 of a page-aligned mapping.
        unsafe { &*(self.seg.as_ptr() as *const EngineControlHeader) }
    }

    pub fn ports(&self) -> &[PortShared] {
        // SAFETY: the table begins right after the header and holds
        // exactly `port_max` slots by construction.
        unsafe {
            let base = self
                .seg
                .as_ptr()
                .add(std::mem::size_of::<EngineControlHeader>());
            std::slice::from_raw_parts(base as *const PortShared, self.port_max)
        }
    }

    pub fn port(&self, id: PortId) -> &PortShared {
        &self.ports()[id as usize]
    }

    pub fn port_max(&self) -> u32 {
        self.port_max as u32
    }

    pub fn shm_name(&self) -> &str {
        self.seg.name()
    }

    pub fn size(&self) -> usize {
        self.seg.len()
    }

    pub fn destroy(&self) {
        self.seg.destroy();
    }
}

/// Engine-side handle to a client control block.
pub enum ClientControlHandle {
    /// External client: block lives in its own named segment.
    Shared(SharedSegment),
    /// In-process or driver client: same layout, private allocation.
    Local(Box<ClientControl>),
}

impl ClientControlHandle {
    pub fn local() -> Self {
        // SAFETY: ClientControl is all atomics and volatile cells, for
        // which zeroes are valid initial values.
        ClientControlHandle::Local(unsafe { Box::new(std::mem::zeroed()) })
    }

    pub fn shared(dir: &Path, name: &str) -> Result<Self, ShmError> {
        let seg = SharedSegment::create(dir, name, std::mem::size_of::<ClientControl>())?;
        Ok(ClientControlHandle::Shared(seg))
    }

    pub fn control(&self) -> &ClientControl {
        match self {
            // SAFETY: the segment was created with the control layout and
            // zero-filled, which is a valid ClientControl.
            ClientControlHandle::Shared(seg) => unsafe {
                &*(seg.as_ptr() as *const ClientControl)
            },
            ClientControlHandle::Local(control) => control,
        }
    }

    pub fn shm_name(&self) -> Option<&str> {
        match self {
            ClientControlHandle::Shared(seg) => Some(seg.name()),
            ClientControlHandle::Local(_) => None,
        }
    }

    pub fn destroy(&self) {
        if let ClientControlHandle::Shared(seg) = self {
            seg.destroy();
        }
    }
}
