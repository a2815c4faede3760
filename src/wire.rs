//! Fixed-layout records exchanged over the request, event, and handshake
//! channels.
//!
//! Every record is a `#[repr(C)]` plain-old-data struct written and read
//! whole; both ends of a channel must agree on the layout, so field order
//! is chosen to leave no padding (widest fields first, byte arrays last).

use crate::control::{CLIENT_NAME_SIZE, PORT_NAME_SIZE, SHM_NAME_SIZE, TYPE_NAME_SIZE};
use bytemuck::{Pod, Zeroable};
use std::io::{Read, Write};

/// Bumped whenever any record layout changes.
pub const PROTOCOL_VERSION: u32 = 3;

/// Request envelope: one record per request, one back per reply (except
/// connection queries, which stream their payload and suppress the
/// generic reply).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RequestRecord {
    /// Discriminant from [`crate::request::RequestType`].
    pub rtype: u32,
    /// Zero on success, a negative reason code otherwise.
    pub status: i32,
    pub client_id: u32,
    pub port_id: u32,
    pub flags: u32,
    /// Connection count, filled by the connection queries.
    pub nports: u32,
    pub port_type: [u8; TYPE_NAME_SIZE],
    pub name: [u8; PORT_NAME_SIZE],
    pub source: [u8; PORT_NAME_SIZE],
    pub destination: [u8; PORT_NAME_SIZE],
}

/// Event envelope written to external clients, acknowledged with a single
/// status byte.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EventRecord {
    /// Discriminant from [`crate::event::EventType`].
    pub etype: u32,
    /// Port id, self id, or execution order depending on the event.
    pub x: u32,
    /// Peer port id for connection events.
    pub y: u32,
    /// New period or sample-rate value for size/rate changes.
    pub nframes: u32,
    /// Segment size for `NewPortType`.
    pub size: u64,
    pub shm_name: [u8; SHM_NAME_SIZE],
}

/// First record on a fresh request-socket connection.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ClientConnectRecord {
    /// One of the `control::TYPE_*` discriminants.
    pub client_type: u32,
    pub protocol: u32,
    /// Non-zero to load; zero asks the engine to unload `name` instead.
    pub load: u32,
    pub pid: i32,
    pub name: [u8; CLIENT_NAME_SIZE],
    /// Factory table key for in-process clients.
    pub factory: [u8; CLIENT_NAME_SIZE],
    /// Opaque argument string handed to the factory.
    pub args: [u8; CLIENT_NAME_SIZE],
}

/// Reply to [`ClientConnectRecord`]. On success the client attaches the
/// named control segments and, if external, reads `n_port_types`
/// [`PortTypeRecord`]s from the same socket.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ClientConnectResult {
    pub control_size: u64,
    pub status: i32,
    pub protocol: u32,
    pub realtime: u32,
    pub realtime_priority: i32,
    pub n_port_types: u32,
    _pad: u32,
    pub client_shm_name: [u8; SHM_NAME_SIZE],
    pub control_shm_name: [u8; SHM_NAME_SIZE],
    pub fifo_prefix: [u8; 128],
}

/// First record on a fresh event-ack connection: names the client the
/// socket belongs to.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AckConnectRecord {
    pub client_id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AckConnectResult {
    pub status: i32,
}

/// Port-type description streamed to external clients after the connect
/// reply and re-broadcast inside `NewPortType` events.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PortTypeRecord {
    pub seg_size: u64,
    pub type_id: u32,
    pub buffer_size: u32,
    pub scale_factor: i32,
    pub has_mixdown: u32,
    pub type_name: [u8; TYPE_NAME_SIZE],
    pub shm_name: [u8; SHM_NAME_SIZE],
}

/// Read one record, blocking until it arrives whole.
pub fn read_record<T: Pod>(reader: &mut impl Read) -> std::io::Result<T> {
    let mut record = T::zeroed();
    reader.read_exact(bytemuck::bytes_of_mut(&mut record))?;
    Ok(record)
}

/// Write one record whole.
pub fn write_record<T: Pod>(writer: &mut impl Write, record: &T) -> std::io::Result<()> {
    writer.write_all(bytemuck::bytes_of(record))
}
