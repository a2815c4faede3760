//! The connection server: a dedicated thread polling the two listening
//! sockets and every external client's request channel.
//!
//! New request-socket connections carry a handshake record that either
//! loads a client (external or in-process) or unloads one by name. New
//! event-ack connections are matched to an existing client by id and
//! installed as its event channel. Registered request channels are
//! dispatched to the request plane; errors and hangups mark the client
//! with a socket-class error for the next post-process sweep.

use crate::client::ClientType;
use crate::control::{from_fixed, to_fixed};
use crate::engine::{ClientSetup, Engine};
use crate::wire::{
    read_record, write_record, AckConnectRecord, AckConnectResult, ClientConnectRecord,
    ClientConnectResult, PortTypeRecord, RequestRecord, PROTOCOL_VERSION,
};
use crate::ClientId;
use bytemuck::Zeroable;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) const TOKEN_LISTENER: Token = Token(0);
pub(crate) const TOKEN_ACK_LISTENER: Token = Token(1);
pub(crate) const TOKEN_WAKER: Token = Token(2);
const TOKEN_BASE: usize = 3;

/// One registered request channel.
pub(crate) struct PollEntry {
    pub client_id: ClientId,
    pub stream: UnixStream,
}

/// The poll-set registry shared between the server thread and the engine
/// (which must deregister channels when it removes clients).
pub(crate) struct PollShared {
    registry: mio::Registry,
    tokens: Slab<PollEntry>,
}

impl PollShared {
    pub(crate) fn new(registry: mio::Registry) -> Self {
        Self {
            registry,
            tokens: Slab::new(),
        }
    }

    /// Register a client's request channel; returns its slab token.
    pub(crate) fn register_client(
        &mut self,
        client_id: ClientId,
        stream: UnixStream,
    ) -> std::io::Result<usize> {
        stream.set_nonblocking(false)?;
        let entry = self.tokens.vacant_entry();
        let token = entry.key();
        self.registry.register(
            &mut SourceFd(&stream.as_raw_fd()),
            Token(token + TOKEN_BASE),
            Interest::READABLE,
        )?;
        entry.insert(PollEntry { client_id, stream });
        Ok(token)
    }

    pub(crate) fn deregister(&mut self, token: usize) {
        if self.tokens.contains(token) {
            let entry = self.tokens.remove(token);
            let _ = self
                .registry
                .deregister(&mut SourceFd(&entry.stream.as_raw_fd()));
        }
    }

    /// A duplicate handle for record i/o outside the registry lock.
    fn clone_entry(&self, token: usize) -> Option<(ClientId, UnixStream, i32)> {
        let entry = self.tokens.get(token)?;
        let stream = entry.stream.try_clone().ok()?;
        Some((entry.client_id, stream, entry.stream.as_raw_fd()))
    }
}

pub(crate) fn spawn(
    engine: Arc<Engine>,
    poll: Poll,
    listener: UnixListener,
    ack_listener: UnixListener,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("timbre-server".into())
        .spawn(move || serve(engine, poll, listener, ack_listener))
        .expect("cannot spawn server thread")
}

fn serve(engine: Arc<Engine>, mut poll: Poll, listener: UnixListener, ack_listener: UnixListener) {
    if poll
        .registry()
        .register(
            &mut SourceFd(&listener.as_raw_fd()),
            TOKEN_LISTENER,
            Interest::READABLE,
        )
        .is_err()
        || poll
            .registry()
            .register(
                &mut SourceFd(&ack_listener.as_raw_fd()),
                TOKEN_ACK_LISTENER,
                Interest::READABLE,
            )
            .is_err()
    {
        tracing::error!("cannot register listening sockets");
        return;
    }

    let mut events = Events::with_capacity(64);
    while !engine.is_shutting_down() {
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_secs(10))) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %e, "server poll failed");
            break;
        }

        for event in events.iter() {
            match event.token() {
                TOKEN_WAKER => {}
                TOKEN_LISTENER => accept_request_connections(&engine, &listener),
                TOKEN_ACK_LISTENER => accept_ack_connections(&engine, &ack_listener),
                Token(raw) => {
                    let token = raw - TOKEN_BASE;
                    let entry = engine.poll_shared.lock().unwrap().clone_entry(token);
                    let Some((client_id, mut stream, fd)) = entry else {
                        continue;
                    };
                    if event.is_error() || event.is_read_closed() {
                        engine.handle_client_socket_error(fd);
                    } else if event.is_readable()
                        && handle_client_request(&engine, client_id, &mut stream).is_err()
                    {
                        tracing::error!(client_id, "could not handle external client request");
                        engine.handle_client_socket_error(fd);
                    }
                }
            }
        }
    }
    tracing::debug!("server thread exiting");
}

fn accept_request_connections(engine: &Arc<Engine>, listener: &UnixListener) {
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = handle_new_client(engine, stream) {
                    tracing::error!(error = %e, "cannot complete new client connection");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::error!(error = %e, "cannot accept new connection");
                return;
            }
        }
    }
}

fn accept_ack_connections(engine: &Arc<Engine>, listener: &UnixListener) {
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = handle_ack_connection(engine, stream) {
                    tracing::error!(error = %e, "cannot complete client ACK connection");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::error!(error = %e, "cannot accept new ACK connection");
                return;
            }
        }
    }
}

/// Handshake on a fresh request-socket connection.
fn handle_new_client(engine: &Arc<Engine>, mut stream: UnixStream) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    let req: ClientConnectRecord = read_record(&mut stream)?;
    let name = from_fixed(&req.name).to_string();

    if req.load == 0 {
        let status = match engine.unload_client(&name) {
            Ok(()) => 0,
            Err(e) => e.status(),
        };
        let mut res = ClientConnectResult::zeroed();
        res.status = status;
        res.protocol = PROTOCOL_VERSION;
        return write_record(&mut stream, &res);
    }

    let client_type = match ClientType::from_u32(req.client_type) {
        Some(ClientType::Driver) | None => {
            tracing::error!(raw = req.client_type, "refusing connect request type");
            let mut res = ClientConnectResult::zeroed();
            res.status = -1;
            res.protocol = PROTOCOL_VERSION;
            return write_record(&mut stream, &res);
        }
        Some(t) => t,
    };

    if req.protocol != PROTOCOL_VERSION {
        tracing::error!(
            theirs = req.protocol,
            ours = PROTOCOL_VERSION,
            "protocol version mismatch"
        );
        let mut res = ClientConnectResult::zeroed();
        res.status = -1;
        res.protocol = PROTOCOL_VERSION;
        return write_record(&mut stream, &res);
    }

    // the engine keeps its own handle on external request channels
    let server_stream = if client_type.is_external() {
        Some(stream.try_clone()?)
    } else {
        None
    };

    let setup = ClientSetup {
        client_type,
        name,
        pid: req.pid,
        factory: from_fixed(&req.factory).to_string(),
        args: from_fixed(&req.args).to_string(),
        request_stream: server_stream,
        plugin: None,
    };

    let mut res = ClientConnectResult::zeroed();
    res.protocol = PROTOCOL_VERSION;
    match engine.setup_client(setup) {
        Ok(result) => {
            let header = engine.control().header();
            res.status = 0;
            res.realtime = header.real_time.load(Ordering::Relaxed);
            res.realtime_priority = header.client_priority.load(Ordering::Relaxed);
            res.n_port_types = header.n_port_types.load(Ordering::Relaxed);
            res.control_size = engine.control().size() as u64;
            res.client_shm_name = to_fixed(&result.client_shm_name);
            res.control_shm_name = to_fixed(engine.control().shm_name());
            res.fifo_prefix = to_fixed(&engine.fifo_prefix().display().to_string());
            write_record(&mut stream, &res)?;

            // external clients learn every known port type up front
            if client_type.is_external() {
                for i in 0..res.n_port_types as usize {
                    let record = port_type_record(engine, i);
                    write_record(&mut stream, &record)?;
                }
            }
            Ok(())
        }
        Err(e) => {
            res.status = e.status();
            write_record(&mut stream, &res)
        }
    }
}

fn port_type_record(engine: &Arc<Engine>, index: usize) -> PortTypeRecord {
    let shared = &engine.control().header().port_types[index];
    PortTypeRecord {
        seg_size: shared.seg_size.load(Ordering::Relaxed),
        type_id: shared.type_id.load(Ordering::Relaxed),
        buffer_size: shared.buffer_size.load(Ordering::Relaxed),
        scale_factor: shared.scale_factor.load(Ordering::Relaxed),
        has_mixdown: shared.has_mixdown.load(Ordering::Relaxed),
        type_name: shared.type_name.get(),
        shm_name: shared.shm_name.get(),
    }
}

/// Match a fresh event-ack connection to its client and install the
/// socket as the event channel.
fn handle_ack_connection(engine: &Arc<Engine>, mut stream: UnixStream) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    let req: AckConnectRecord = read_record(&mut stream)?;

    let mut graph = engine.graph();
    let Some(client) = graph.client_by_id_mut(req.client_id) else {
        tracing::error!(client_id = req.client_id, "unknown client in ACK connection");
        let res = AckConnectResult { status: -1 };
        write_record(&mut stream, &res)?;
        return Err(std::io::Error::other("unknown client id"));
    };

    let res = AckConnectResult { status: 0 };
    write_record(&mut stream, &res)?;
    client.event_stream = Some(stream);
    Ok(())
}

/// One request record in, one reply out (unless the handler streamed its
/// own payload).
fn handle_client_request(
    engine: &Arc<Engine>,
    client_id: ClientId,
    stream: &mut UnixStream,
) -> std::io::Result<()> {
    let mut record: RequestRecord = read_record(stream).map_err(|e| {
        tracing::error!(client_id, error = %e, "cannot read request from client");
        e
    })?;

    let suppressed = engine.do_request(&mut record, Some(stream));
    if !suppressed {
        write_record(stream, &record)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_engine, MockExternalClient};

    #[test]
    fn test_external_client_handshake_and_requests() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(128).unwrap();

        let mut alpha = MockExternalClient::connect(&engine, "alpha").unwrap();
        assert!(alpha.client_id >= 1);
        assert_eq!(alpha.port_types.len(), crate::buffer::BUILTIN_PORT_TYPES.len());

        // the engine now knows the client under its name
        assert!(engine.graph().client_by_name("alpha").is_some());

        let out = alpha
            .register_port("alpha:out", crate::buffer::AUDIO_PORT_TYPE, crate::control::PORT_IS_OUTPUT)
            .unwrap();
        let inp = alpha
            .register_port("alpha:in", crate::buffer::AUDIO_PORT_TYPE, crate::control::PORT_IS_INPUT)
            .unwrap();
        assert_ne!(out, inp);

        alpha.activate().unwrap();
        assert_eq!(alpha.connect_ports("alpha:out", "alpha:in"), 0);

        // activation plus the self-connection produced events on the
        // event channel: reorders and a connection notification
        alpha.wait_for_event(crate::event::EventType::PortConnected);

        let peers = alpha.get_port_connections(out).unwrap();
        assert_eq!(peers, vec![inp]);

        engine.shutdown();
    }

    #[test]
    fn test_duplicate_name_refused() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        let _alpha = MockExternalClient::connect(&engine, "twin").unwrap();
        let err = MockExternalClient::connect(&engine, "twin");
        assert!(err.is_err());
        engine.shutdown();
    }

    #[test]
    fn test_unload_by_name() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        let alpha = MockExternalClient::connect(&engine, "ephemeral").unwrap();
        assert!(engine.graph().client_by_name("ephemeral").is_some());
        drop(alpha);

        let status = MockExternalClient::unload(&engine, "ephemeral").unwrap();
        assert_eq!(status, 0);
        assert!(engine.graph().client_by_name("ephemeral").is_none());

        let status = MockExternalClient::unload(&engine, "ephemeral").unwrap();
        assert!(status < 0);
        engine.shutdown();
    }
}
