//! Request-plane vocabulary: operation discriminants and failure codes.
//!
//! Every graph-mutating operation arrives as one [`crate::wire::RequestRecord`]
//! and leaves as the same record with `status` filled in: zero for
//! success, a distinct negative reason code otherwise. The connection
//! remains usable after a failure.

use enum_as_inner::EnumAsInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumAsInner)]
pub enum RequestType {
    RegisterPort,
    UnRegisterPort,
    ConnectPorts,
    /// Wipe every connection of one port.
    DisconnectPort,
    /// Remove one source→destination edge.
    DisconnectPorts,
    ActivateClient,
    DeactivateClient,
    SetTimeBaseClient,
    SetClientCapabilities,
    GetPortConnections,
    GetPortNConnections,
}

impl RequestType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        use RequestType::*;
        Some(match raw {
            0 => RegisterPort,
            1 => UnRegisterPort,
            2 => ConnectPorts,
            3 => DisconnectPort,
            4 => DisconnectPorts,
            5 => ActivateClient,
            6 => DeactivateClient,
            7 => SetTimeBaseClient,
            8 => SetClientCapabilities,
            9 => GetPortConnections,
            10 => GetPortNConnections,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Why a request was refused. Each variant maps to a stable negative
/// status in the reply envelope.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("port {0:?} does not exist")]
    PortDoesNotExist(String),

    #[error("ports are not of the same data type")]
    PortTypeMismatch,

    #[error("port {0:?} is locked against connection changes")]
    PortLocked(String),

    #[error("destination port {0:?} is not an input port")]
    NotAnInputPort(String),

    #[error("source port {0:?} is not an output port")]
    NotAnOutputPort(String),

    #[error("destination already connected and its type has no mixdown")]
    DuplicateConnection,

    #[error("client {0:?} is not active")]
    ClientNotActive(String),

    #[error("client {0} not found")]
    ClientNotFound(String),

    #[error("no free port slots")]
    NoFreePortSlot,

    #[error("unknown port type {0:?}")]
    UnknownPortType(String),

    #[error("client {0} does not own the port")]
    OwnerMismatch(u32),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot load client: {0}")]
    InternalLoadFailure(String),
}

impl RequestError {
    /// The negative status this failure puts in the reply envelope.
    pub fn status(&self) -> i32 {
        use RequestError::*;
        match self {
            PortDoesNotExist(_) => -1,
            PortTypeMismatch => -2,
            PortLocked(_) => -3,
            NotAnInputPort(_) => -4,
            NotAnOutputPort(_) => -5,
            DuplicateConnection => -6,
            ClientNotActive(_) => -7,
            ClientNotFound(_) => -8,
            NoFreePortSlot => -9,
            UnknownPortType(_) => -10,
            OwnerMismatch(_) => -11,
            Io(_) => -12,
            InternalLoadFailure(_) => -13,
        }
    }
}

/// Collapse a handler result into a reply status.
pub(crate) fn status_of(result: &Result<(), RequestError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.status(),
    }
}
