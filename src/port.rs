//! Port table primitives.
//!
//! The shared side of every port lives in the engine control segment
//! ([`crate::control::PortShared`]); this module adds the engine-private
//! side (connection lists) and the allocation/lookup helpers over the
//! dense table.

use crate::control::ControlSegment;
use crate::PortId;
use std::sync::atomic::Ordering;

/// A directed edge from an output port to an input port of the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub source: PortId,
    pub destination: PortId,
}

/// Engine-private state parallel to the shared port table. Guarded by the
/// graph lock.
#[derive(Default)]
pub struct PortPrivate {
    /// Every connection this port participates in, as either endpoint.
    pub connections: Vec<Connection>,
    /// The buffer slot an output port holds, returned to its type's pool
    /// on release.
    pub buffer_offset: Option<u64>,
}

/// Claim the first free slot. Caller holds the port lock.
pub(crate) fn allocate_id(control: &ControlSegment) -> Option<PortId> {
    for (i, port) in control.ports().iter().enumerate() {
        if port.in_use.load(Ordering::Relaxed) == 0 {
            port.in_use.store(1, Ordering::Release);
            return Some(i as PortId);
        }
    }
    None
}

/// Linear name lookup over in-use slots.
///
/// The `in_use` read is deliberately unguarded. A slot is claimed before
/// its name is rewritten, so a lookup racing a registration can miss the
/// new port for a moment; the request protocol orders the cases that
/// matter.
pub(crate) fn find_by_name(control: &ControlSegment, name: &str) -> Option<PortId> {
    control
        .ports()
        .iter()
        .position(|port| port.is_in_use() && port.name_matches(name))
        .map(|i| i as PortId)
}
