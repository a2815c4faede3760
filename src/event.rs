//! Engine-to-client notifications.
//!
//! Delivery is reliable and synchronous: in-process clients are dispatched
//! by direct call, external clients get one record on their event channel
//! and must answer with a single status byte. Any write/read failure or
//! non-zero status counts against the client, which post-process turns
//! into zombification. All delivery happens under the graph lock.

use crate::client::ClientRecord;
use crate::control::{from_fixed, to_fixed};
use crate::wire::{read_record, write_record, EventRecord};
use crate::PortId;
use enum_as_inner::EnumAsInner;
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumAsInner)]
pub enum EventType {
    PortRegistered,
    PortUnregistered,
    PortConnected,
    PortDisconnected,
    BufferSizeChange,
    SampleRateChange,
    GraphReordered,
    XRun,
    NewPortType,
}

impl EventType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        use EventType::*;
        Some(match raw {
            0 => PortRegistered,
            1 => PortUnregistered,
            2 => PortConnected,
            3 => PortDisconnected,
            4 => BufferSizeChange,
            5 => SampleRateChange,
            6 => GraphReordered,
            7 => XRun,
            8 => NewPortType,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// One notification, ready for either dispatch path.
#[derive(Debug, Clone)]
pub struct Event {
    pub etype: EventType,
    pub x: u32,
    pub y: u32,
    pub nframes: u32,
    pub size: u64,
    pub shm_name: String,
}

impl Event {
    fn new(etype: EventType) -> Self {
        Self {
            etype,
            x: 0,
            y: 0,
            nframes: 0,
            size: 0,
            shm_name: String::new(),
        }
    }

    pub fn port_registration(port: PortId, registered: bool) -> Self {
        let etype = if registered {
            EventType::PortRegistered
        } else {
            EventType::PortUnregistered
        };
        Self {
            x: port,
            ..Self::new(etype)
        }
    }

    /// Connection notification from the perspective of `self_port`.
    pub fn port_connection(self_port: PortId, other_port: PortId, connected: bool) -> Self {
        let etype = if connected {
            EventType::PortConnected
        } else {
            EventType::PortDisconnected
        };
        Self {
            x: self_port,
            y: other_port,
            ..Self::new(etype)
        }
    }

    pub fn buffer_size_change(nframes: u32) -> Self {
        Self {
            nframes,
            ..Self::new(EventType::BufferSizeChange)
        }
    }

    pub fn sample_rate_change(nframes: u32) -> Self {
        Self {
            nframes,
            ..Self::new(EventType::SampleRateChange)
        }
    }

    pub fn graph_reordered(execution_order: u32) -> Self {
        Self {
            x: execution_order,
            ..Self::new(EventType::GraphReordered)
        }
    }

    pub fn xrun() -> Self {
        Self::new(EventType::XRun)
    }

    pub fn new_port_type(shm_name: &str, size: u64) -> Self {
        Self {
            size,
            shm_name: shm_name.to_string(),
            ..Self::new(EventType::NewPortType)
        }
    }

    pub fn to_record(&self) -> EventRecord {
        EventRecord {
            etype: self.etype.as_u32(),
            x: self.x,
            y: self.y,
            nframes: self.nframes,
            size: self.size,
            shm_name: to_fixed(&self.shm_name),
        }
    }

    pub fn from_record(record: &EventRecord) -> Option<Self> {
        Some(Self {
            etype: EventType::from_u32(record.etype)?,
            x: record.x,
            y: record.y,
            nframes: record.nframes,
            size: record.size,
            shm_name: from_fixed(&record.shm_name).to_string(),
        })
    }
}

/// Deliver one event to one client. Caller holds the graph lock.
///
/// Dead clients are skipped silently; they are past caring and their
/// channels may already be gone.
pub(crate) fn deliver(client: &mut ClientRecord, event: &Event) {
    if client.is_dead() {
        return;
    }

    if client.is_internal() {
        if let Some(plugin) = client.plugin.as_mut() {
            match event.etype {
                EventType::PortRegistered => plugin.port_registration(event.x, true),
                EventType::PortUnregistered => plugin.port_registration(event.x, false),
                EventType::PortConnected => plugin.port_connection(event.x, event.y, true),
                EventType::PortDisconnected => plugin.port_connection(event.x, event.y, false),
                EventType::BufferSizeChange => plugin.buffer_size_changed(event.nframes),
                EventType::SampleRateChange => plugin.sample_rate_changed(event.nframes),
                EventType::GraphReordered => plugin.graph_reordered(event.x),
                EventType::XRun => plugin.xrun(),
                EventType::NewPortType => plugin.new_port_type(&event.shm_name, event.size),
            }
        }
        return;
    }

    let Some(stream) = client.event_stream.as_mut() else {
        // event channel not yet installed; nothing to tell
        return;
    };

    let record = event.to_record();
    if let Err(e) = write_record(stream, &record) {
        tracing::error!(client = %client.name(), error = %e, "cannot send event");
        client.error += 1;
        return;
    }

    let mut status = [0u8; 1];
    if let Err(e) = stream.read_exact(&mut status) {
        tracing::error!(client = %client.name(), error = %e, "cannot read event response");
        client.error += 1;
        return;
    }

    if status[0] != 0 {
        tracing::error!(
            client = %client.name(),
            event = ?event.etype,
            status = status[0],
            "bad status for event handling"
        );
        client.error += 1;
    }
}

/// The single-byte acknowledgment an external client sends per event.
pub fn acknowledge(stream: &mut impl Write, status: u8) -> std::io::Result<()> {
    stream.write_all(&[status])
}

/// Client-side helper: read the next event record off an event channel.
pub fn read_event(stream: &mut impl Read) -> std::io::Result<Option<Event>> {
    let record: EventRecord = read_record(stream)?;
    Ok(Event::from_record(&record))
}
