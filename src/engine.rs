//! The engine: construction, the request plane, and graph mutation.
//!
//! One `Engine` owns the shared control segment, the per-type buffer
//! pools, and the graph state. Requests arrive either over a client's
//! request channel (dispatched by the server thread through
//! [`Engine::do_request`]) or as direct method calls from in-process
//! clients; a single request lock serializes them all.

use crate::buffer::{BufferPool, BUILTIN_PORT_TYPES};
use crate::client::{ClientRecord, ClientType};
use crate::config::EngineConfig;
use crate::control::{
    from_fixed, to_fixed, ControlSegment, PORT_IS_INPUT, PORT_IS_OUTPUT,
};
use crate::event::{self, Event};
use crate::executor::RollingStats;
use crate::fifo::FifoPool;
use crate::graph::{self, GraphState};
use crate::port::{self, Connection};
use crate::request::{RequestError, RequestType};
use crate::server::{self, PollShared};
use crate::shm::{self, ShmError};
use crate::wire::{write_record, RequestRecord};
use crate::{ClientId, PortId};
use crossbeam_utils::CachePadded;
use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("shared memory: {0}")]
    Shm(#[from] ShmError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("driver: {0}")]
    Driver(String),
    #[error("cannot acquire scheduling: {0}")]
    Scheduling(std::io::Error),
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Parameters for installing one client, however it arrived.
pub(crate) struct ClientSetup {
    pub client_type: ClientType,
    pub name: String,
    pub pid: i32,
    pub factory: String,
    pub args: String,
    /// Server-side handle on the request channel, external clients only.
    pub request_stream: Option<UnixStream>,
    /// Pre-built implementation, bypassing the factory table.
    pub plugin: Option<Box<dyn crate::client::InProcessClient>>,
}

pub(crate) struct ClientSetupResult {
    pub client_id: ClientId,
    pub client_shm_name: String,
}

pub struct Engine {
    cfg: EngineConfig,
    control: ControlSegment,
    pools: Vec<BufferPool>,
    graph: Mutex<GraphState>,
    request_lock: Mutex<()>,
    port_lock: Mutex<()>,
    pub(crate) rolling: Mutex<RollingStats>,
    /// Set by the cycle thread every period; cleared and checked by the
    /// watchdog.
    pub(crate) watchdog_check: CachePadded<AtomicBool>,
    /// Pid of the client currently being executed, for watchdog escalation.
    pub(crate) current_client_pid: AtomicI32,
    pub(crate) period_usecs: AtomicU64,
    next_client_id: AtomicU32,
    shutting_down: AtomicBool,
    socket_path: PathBuf,
    ack_socket_path: PathBuf,
    fifo_prefix: PathBuf,
    pub(crate) poll_shared: Mutex<PollShared>,
    waker: mio::Waker,
    server_thread: Mutex<Option<JoinHandle<()>>>,
}

fn bind_lowest(dir: &std::path::Path, prefix: &str) -> std::io::Result<(UnixListener, PathBuf)> {
    for i in 0..999u32 {
        let path = dir.join(format!("{prefix}{i}"));
        if !path.exists() {
            let listener = UnixListener::bind(&path)?;
            listener.set_nonblocking(true)?;
            return Ok((listener, path));
        }
    }
    Err(std::io::Error::other(
        "all possible server socket names in use",
    ))
}

impl Engine {
    /// Bring up the engine: clean the rendezvous directory, create the
    /// control segment and buffer pools, bind the listening sockets, and
    /// start the server thread.
    pub fn new(cfg: EngineConfig) -> Result<Arc<Engine>, EngineError> {
        std::fs::create_dir_all(&cfg.server_dir)?;
        std::fs::create_dir_all(&cfg.shm_dir)?;
        shm::cleanup_server_dir(&cfg.server_dir);

        let control = ControlSegment::create(&cfg.shm_dir, "/jack-engine", cfg.port_max)?;
        let header = control.header();
        header
            .real_time
            .store(cfg.realtime as u32, Ordering::Relaxed);
        header
            .client_priority
            .store(cfg.clamped_rtpriority() - 1, Ordering::Relaxed);
        header.buffer_size.store(0, Ordering::Relaxed);

        let mut pools = Vec::with_capacity(BUILTIN_PORT_TYPES.len());
        for (i, builtin) in BUILTIN_PORT_TYPES.iter().enumerate() {
            let shared = &header.port_types[i];
            shared.type_id.store(i as u32, Ordering::Relaxed);
            shared
                .scale_factor
                .store(builtin.scale_factor, Ordering::Relaxed);
            shared
                .buffer_size
                .store(builtin.buffer_size, Ordering::Relaxed);
            shared
                .has_mixdown
                .store(builtin.has_mixdown as u32, Ordering::Relaxed);
            shared.seg_size.store(0, Ordering::Relaxed);
            shared.type_name.set(to_fixed(builtin.name));
            shared
                .shm_name
                .set(to_fixed(&format!("/jck-[{}]", builtin.name)));
            pools.push(BufferPool::new(i as u32, builtin.name));
        }
        header
            .n_port_types
            .store(BUILTIN_PORT_TYPES.len() as u32, Ordering::Relaxed);

        let (listener, socket_path) = bind_lowest(&cfg.server_dir, "jack_")?;
        let (ack_listener, ack_socket_path) = bind_lowest(&cfg.server_dir, "jack_ack_")?;

        let fifo_prefix = cfg
            .server_dir
            .join(format!("jack-ack-fifo-{}", std::process::id()));
        let mut fifos = FifoPool::new(fifo_prefix.clone());
        fifos.get(0)?;

        let poll = mio::Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), server::TOKEN_WAKER)?;
        let registry = poll.registry().try_clone()?;

        let engine = Arc::new(Engine {
            graph: Mutex::new(GraphState::new(cfg.port_max, fifos)),
            rolling: Mutex::new(RollingStats::new()),
            watchdog_check: CachePadded::new(AtomicBool::new(false)),
            current_client_pid: AtomicI32::new(0),
            period_usecs: AtomicU64::new(0),
            next_client_id: AtomicU32::new(1),
            shutting_down: AtomicBool::new(false),
            socket_path,
            ack_socket_path,
            fifo_prefix,
            poll_shared: Mutex::new(PollShared::new(registry)),
            waker,
            server_thread: Mutex::new(None),
            request_lock: Mutex::new(()),
            port_lock: Mutex::new(()),
            control,
            pools,
            cfg,
        });

        engine
            .control
            .header()
            .engine_ok
            .store(1, Ordering::Release);

        let handle = server::spawn(engine.clone(), poll, listener, ack_listener);
        *engine.server_thread.lock().unwrap() = Some(handle);

        tracing::info!(
            socket = %engine.socket_path.display(),
            ack_socket = %engine.ack_socket_path.display(),
            port_max = engine.cfg.port_max,
            realtime = engine.cfg.realtime,
            "engine up"
        );

        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn control(&self) -> &ControlSegment {
        &self.control
    }

    pub fn pools(&self) -> &[BufferPool] {
        &self.pools
    }

    pub fn socket_paths(&self) -> (&PathBuf, &PathBuf) {
        (&self.socket_path, &self.ack_socket_path)
    }

    pub fn fifo_prefix(&self) -> &PathBuf {
        &self.fifo_prefix
    }

    pub fn is_realtime(&self) -> bool {
        self.control.header().real_time.load(Ordering::Relaxed) != 0
    }

    pub(crate) fn clear_realtime(&self) {
        self.control.header().real_time.store(0, Ordering::Relaxed);
    }

    pub(crate) fn mark_alive(&self) {
        self.watchdog_check.store(true, Ordering::Release);
    }

    pub(crate) fn graph(&self) -> MutexGuard<'_, GraphState> {
        self.graph.lock().unwrap()
    }

    pub(crate) fn try_graph(&self) -> Option<MutexGuard<'_, GraphState>> {
        self.graph.try_lock().ok()
    }

    pub(crate) fn reset_rolling(&self) {
        self.rolling
            .lock()
            .unwrap()
            .reset(self.period_usecs.load(Ordering::Relaxed));
    }

    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.control
            .header()
            .engine_ok
            .store(0, Ordering::Release);
        let _ = self.waker.wake();
        if let Some(handle) = self.server_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        let mut graph = self.graph();
        graph.fifos.unlink_all();
        for idx in (0..graph.clients.len()).rev() {
            self.remove_client_locked(&mut graph, idx);
        }
        drop(graph);

        for pool in &self.pools {
            pool.destroy();
        }
        self.control.destroy();
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.ack_socket_path);
        tracing::info!("engine down");
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    // ----- client lifecycle ------------------------------------------------

    /// Install one client. For in-process clients the registered factory
    /// runs after the record is in place, so the constructor can register
    /// ports immediately.
    pub(crate) fn setup_client(
        self: &Arc<Self>,
        setup: ClientSetup,
    ) -> Result<ClientSetupResult, RequestError> {
        if self.graph().client_by_name(&setup.name).is_some() {
            tracing::error!(name = %setup.name, "cannot create new client; name exists");
            return Err(RequestError::InternalLoadFailure(format!(
                "client {:?} already exists",
                setup.name
            )));
        }

        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let mut record = match setup.client_type {
            ClientType::External => {
                ClientRecord::new_external(&self.cfg.shm_dir, id, &setup.name, setup.pid)
                    .map_err(|e| RequestError::InternalLoadFailure(e.to_string()))?
            }
            client_type => ClientRecord::new_local(client_type, id, &setup.name),
        };
        let client_shm_name = record.control_shm_name().unwrap_or_default().to_string();

        if let Some(stream) = setup.request_stream {
            record.request_fd = {
                use std::os::fd::AsRawFd;
                stream.as_raw_fd()
            };
            let token = self
                .poll_shared
                .lock()
                .unwrap()
                .register_client(id, stream)
                .map_err(|e| RequestError::InternalLoadFailure(e.to_string()))?;
            record.poll_token = Some(token);
        }

        tracing::debug!(
            name = %setup.name,
            id,
            client_type = ?setup.client_type,
            "new client"
        );

        record.plugin = setup.plugin;
        self.graph().clients.push(record);
        self.reset_rolling();

        if setup.client_type.is_in_process() && !setup.factory.is_empty() {
            match crate::factory::make_in_process(&setup.factory, self, id, &setup.args) {
                Ok(plugin) => {
                    if let Some(rec) = self.graph().client_by_id_mut(id) {
                        rec.plugin = Some(plugin);
                    }
                }
                Err(e) => {
                    tracing::error!(factory = %setup.factory, error = %e, "cannot load client");
                    let mut graph = self.graph();
                    if let Some(idx) = graph.client_index_by_id(id) {
                        self.remove_client_locked(&mut graph, idx);
                    }
                    return Err(RequestError::InternalLoadFailure(e.to_string()));
                }
            }
        }

        Ok(ClientSetupResult {
            client_id: id,
            client_shm_name,
        })
    }

    /// Install an in-process client from a pre-built implementation.
    /// Embedding hosts use this to add clients without going through the
    /// factory table.
    pub fn add_in_process_client(
        self: &Arc<Self>,
        name: &str,
        plugin: Box<dyn crate::client::InProcessClient>,
    ) -> Result<ClientId, RequestError> {
        self.setup_client(ClientSetup {
            client_type: ClientType::InProcess,
            name: name.to_string(),
            pid: std::process::id() as i32,
            factory: String::new(),
            args: String::new(),
            request_stream: None,
            plugin: Some(plugin),
        })
        .map(|r| r.client_id)
    }

    /// Install an in-process client from a registered factory. This is the
    /// same path a socket connect request takes, minus the socket.
    pub fn load_in_process(
        self: &Arc<Self>,
        name: &str,
        factory: &str,
        args: &str,
    ) -> Result<ClientId, RequestError> {
        self.setup_client(ClientSetup {
            client_type: ClientType::InProcess,
            name: name.to_string(),
            pid: std::process::id() as i32,
            factory: factory.to_string(),
            args: args.to_string(),
            request_stream: None,
            plugin: None,
        })
        .map(|r| r.client_id)
    }

    /// Remove a named client, the `load = false` handshake path.
    pub fn unload_client(&self, name: &str) -> Result<(), RequestError> {
        let mut graph = self.graph();
        let idx = graph
            .clients
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| RequestError::ClientNotFound(name.to_string()))?;
        tracing::debug!(name, "unloading client");
        self.remove_client_locked(&mut graph, idx);
        graph::sort_graph(&self.control, &mut graph);
        Ok(())
    }

    /// Install the driver's client half and let the driver register its
    /// resources.
    pub fn attach_driver(
        self: &Arc<Self>,
        name: &str,
        driver: &mut dyn crate::driver::Driver,
    ) -> Result<ClientId, EngineError> {
        let result = self.setup_client(ClientSetup {
            client_type: ClientType::Driver,
            name: name.to_string(),
            pid: std::process::id() as i32,
            factory: String::new(),
            args: String::new(),
            request_stream: None,
            plugin: None,
        })?;

        driver
            .attach(self, result.client_id)
            .map_err(|e| EngineError::Driver(e.to_string()))?;

        self.period_usecs
            .store(driver.period_usecs(), Ordering::Relaxed);
        self.reset_rolling();
        Ok(result.client_id)
    }

    /// Reset the shared transport records when the timebase client goes
    /// away. Engine-owned fields survive.
    fn reset_transport(&self) {
        let header = self.control.header();
        for cell in [&header.current_time, &header.pending_time] {
            let mut t = cell.get();
            t.frame = 0;
            t.transport_state = crate::clock::TRANSPORT_STOPPED;
            t.valid = crate::clock::VALID_TRANSPORT_STATE | crate::clock::VALID_TRANSPORT_POSITION;
            cell.set(t);
        }
    }

    /// Mark a client dead, strip its connections and ports, and
    /// deactivate it. Bookkeeping survives until its sockets fail too.
    /// Caller holds the graph lock.
    pub(crate) fn zombify_client_locked(&self, graph: &mut GraphState, idx: usize) {
        let id = graph.clients[idx].id();
        tracing::info!(client = %graph.clients[idx].name(), "zombifying client");

        graph.clients[idx]
            .control()
            .dead
            .store(1, Ordering::Release);

        if graph.timebase == Some(id) {
            graph.timebase = None;
            self.reset_transport();
        }

        self.client_disconnect_locked(graph, idx);
        self.do_deactivate_locked(graph, idx, false);
    }

    /// Drop all of a client's connections and ports. Caller holds the
    /// graph lock.
    fn client_disconnect_locked(&self, graph: &mut GraphState, idx: usize) {
        let ports: Vec<PortId> = graph.clients[idx].ports.clone();
        for port in &ports {
            self.port_clear_connections_locked(graph, *port);
            self.port_release(graph, *port);
        }
        let client = &mut graph.clients[idx];
        client.ports.clear();
        client.fed_by.clear();
    }

    fn do_deactivate_locked(&self, graph: &mut GraphState, idx: usize, sort: bool) {
        graph.clients[idx]
            .control()
            .active
            .store(0, Ordering::Release);
        if !graph.clients[idx].is_internal() && graph.external_client_cnt > 0 {
            graph.external_client_cnt -= 1;
        }
        if sort {
            graph::sort_graph(&self.control, graph);
        }
    }

    /// Remove a client outright: close its channels, drop it from the
    /// poll set, free its shared memory, and forget it. Caller holds the
    /// graph lock.
    pub(crate) fn remove_client_locked(&self, graph: &mut GraphState, idx: usize) {
        if !graph.clients[idx].is_dead() {
            self.zombify_client_locked(graph, idx);
        }

        let client = &mut graph.clients[idx];
        tracing::info!(client = %client.name(), "removing client");

        if let Some(token) = client.poll_token.take() {
            self.poll_shared.lock().unwrap().deregister(token);
        }
        client.event_stream = None;
        client.destroy_control();

        graph.clients.remove(idx);
    }

    /// Post-process sweep: zombify recoverable failures, remove socket
    /// failures, and resort if anything changed. Caller holds the graph
    /// lock.
    pub(crate) fn remove_failed_clients_locked(&self, graph: &mut GraphState) {
        let mut need_sort = false;
        let mut idx = 0;
        while idx < graph.clients.len() {
            let client = &graph.clients[idx];
            if client.error == 0 {
                idx += 1;
                continue;
            }
            need_sort = true;
            if client.error >= crate::client::ERROR_WITH_SOCKETS {
                tracing::warn!(
                    client = %client.name(),
                    errors = client.error,
                    "removing failed client"
                );
                self.remove_client_locked(graph, idx);
            } else {
                tracing::warn!(
                    client = %client.name(),
                    errors = client.error,
                    "zombifying failed client"
                );
                self.zombify_client_locked(graph, idx);
                graph.clients[idx].error = 0;
                idx += 1;
            }
        }

        if need_sort {
            graph::sort_graph(&self.control, graph);
        }
        self.reset_rolling();
    }

    /// Request-channel error or hangup observed by the server thread.
    /// The client is marked with a socket-class error; the next
    /// post-process pass removes it.
    pub(crate) fn handle_client_socket_error(&self, fd: i32) {
        let mut graph = self.graph();
        for client in graph.clients.iter_mut() {
            if client.is_internal() || client.request_fd != fd {
                continue;
            }
            tracing::warn!(client = %client.name(), fd, "request channel failed");
            if client.error < crate::client::ERROR_WITH_SOCKETS {
                client.error += crate::client::ERROR_WITH_SOCKETS;
            }
            return;
        }
    }

    // ----- events ----------------------------------------------------------

    /// Deliver one event to every live client, under the graph lock.
    pub fn deliver_event_to_all(&self, ev: &Event) {
        let mut graph = self.graph();
        for client in graph.clients.iter_mut() {
            event::deliver(client, ev);
        }
    }

    pub fn broadcast_xrun(&self) {
        self.deliver_event_to_all(&Event::xrun());
    }

    fn send_connection_notification(
        &self,
        graph: &mut GraphState,
        owner: ClientId,
        self_port: PortId,
        other_port: PortId,
        connected: bool,
    ) {
        if let Some(client) = graph.client_by_id_mut(owner) {
            if client.is_active() {
                event::deliver(client, &Event::port_connection(self_port, other_port, connected));
            }
        } else {
            tracing::error!(owner, "no such client during connection notification");
        }
    }

    /// Port registration notifications go to active clients only.
    fn port_registration_notify(&self, graph: &mut GraphState, port: PortId, registered: bool) {
        let ev = Event::port_registration(port, registered);
        for client in graph.clients.iter_mut() {
            if client.is_active() {
                event::deliver(client, &ev);
            }
        }
    }

    // ----- buffer size and sample rate -------------------------------------

    /// Resize every port type's segment for a new period size, re-reserve
    /// the silent buffer, and tell everyone, segment first
    /// (`NewPortType`), then the size itself (`BufferSizeChange`).
    pub fn set_buffer_size(&self, nframes: u32) -> Result<(), EngineError> {
        let header = self.control.header();
        header.buffer_size.store(nframes, Ordering::Relaxed);
        tracing::debug!(nframes, "buffer size change");

        let n_types = header.n_port_types.load(Ordering::Relaxed) as usize;
        for (i, pool) in self.pools.iter().enumerate().take(n_types) {
            let one_buffer = header.port_types[i].one_buffer_size(nframes);
            let size = pool.resize(&self.cfg.shm_dir, self.cfg.port_max, one_buffer)?;
            header.port_types[i].seg_size.store(size, Ordering::Relaxed);
            self.deliver_event_to_all(&Event::new_port_type(pool.shm_name(), size));
        }

        // slot 0 of the primary audio type is everyone's silence
        self.pools[0].reserve_silent();

        self.deliver_event_to_all(&Event::buffer_size_change(nframes));
        Ok(())
    }

    pub fn set_sample_rate(&self, nframes: u32) {
        let header = self.control.header();
        for cell in [&header.current_time, &header.pending_time] {
            let mut t = cell.get();
            t.frame_rate = nframes;
            cell.set(t);
        }
        self.deliver_event_to_all(&Event::sample_rate_change(nframes));
    }

    // ----- the request plane -----------------------------------------------

    pub fn port_register(
        &self,
        client_id: ClientId,
        name: &str,
        type_name: &str,
        flags: u32,
    ) -> Result<PortId, RequestError> {
        let _serial = self.request_lock.lock().unwrap();
        self.port_register_inner(client_id, name, type_name, flags)
    }

    fn port_type_id(&self, type_name: &str) -> Option<u32> {
        let header = self.control.header();
        let n = header.n_port_types.load(Ordering::Relaxed) as usize;
        (0..n).find(|&i| {
            let field = header.port_types[i].type_name.get();
            from_fixed(&field) == type_name
        })
        .map(|i| i as u32)
    }

    fn port_register_inner(
        &self,
        client_id: ClientId,
        name: &str,
        type_name: &str,
        flags: u32,
    ) -> Result<PortId, RequestError> {
        let type_id = self
            .port_type_id(type_name)
            .ok_or_else(|| RequestError::UnknownPortType(type_name.to_string()))?;

        if self.graph().client_by_id(client_id).is_none() {
            return Err(RequestError::ClientNotFound(client_id.to_string()));
        }

        let port_id = {
            let _plock = self.port_lock.lock().unwrap();
            port::allocate_id(&self.control).ok_or(RequestError::NoFreePortSlot)?
        };

        let shared = self.control.port(port_id);
        shared.name.set(to_fixed(name));
        shared.type_id.store(type_id, Ordering::Relaxed);
        shared.client_id.store(client_id, Ordering::Relaxed);
        shared.flags.store(flags, Ordering::Relaxed);
        shared.latency.store(0, Ordering::Relaxed);
        shared.total_latency.store(0, Ordering::Relaxed);
        shared.monitor_requests.store(0, Ordering::Relaxed);
        shared.locked.store(0, Ordering::Relaxed);

        let mut graph = self.graph();

        // output ports own a slot; inputs resolve through connections
        if flags & PORT_IS_OUTPUT != 0 {
            match self.pools[type_id as usize].acquire() {
                Some(offset) => {
                    shared.offset.store(offset, Ordering::Relaxed);
                    graph.port_private[port_id as usize].buffer_offset = Some(offset);
                }
                None => {
                    drop(graph);
                    tracing::error!(port = name, "all port buffers in use");
                    let _plock = self.port_lock.lock().unwrap();
                    shared.in_use.store(0, Ordering::Release);
                    return Err(RequestError::NoFreePortSlot);
                }
            }
        } else {
            shared.offset.store(0, Ordering::Relaxed);
        }

        match graph.client_by_id_mut(client_id) {
            Some(client) => client.ports.push(port_id),
            None => {
                // client vanished between the check and here
                self.port_release(&mut graph, port_id);
                return Err(RequestError::ClientNotFound(client_id.to_string()));
            }
        }
        self.port_registration_notify(&mut graph, port_id, true);

        tracing::debug!(
            port = name,
            id = port_id,
            offset = shared.offset.load(Ordering::Relaxed),
            "registered port"
        );
        Ok(port_id)
    }

    pub fn port_unregister(&self, client_id: ClientId, port_id: PortId) -> Result<(), RequestError> {
        let _serial = self.request_lock.lock().unwrap();
        self.port_unregister_inner(client_id, port_id)
    }

    fn port_unregister_inner(&self, client_id: ClientId, port_id: PortId) -> Result<(), RequestError> {
        if port_id >= self.control.port_max() || !self.control.port(port_id).is_in_use() {
            return Err(RequestError::PortDoesNotExist(format!("port #{port_id}")));
        }

        let shared = self.control.port(port_id);
        if shared.client_id.load(Ordering::Relaxed) != client_id {
            return Err(RequestError::OwnerMismatch(client_id));
        }

        let mut graph = self.graph();
        if graph.client_by_id(client_id).is_none() {
            return Err(RequestError::ClientNotFound(client_id.to_string()));
        }

        let had_connections = !graph.port_private[port_id as usize].connections.is_empty();
        self.port_clear_connections_locked(&mut graph, port_id);
        self.port_release(&mut graph, port_id);

        if let Some(client) = graph.client_by_id_mut(client_id) {
            client.ports.retain(|p| *p != port_id);
        }
        self.port_registration_notify(&mut graph, port_id, false);

        if had_connections {
            graph::sort_graph(&self.control, &mut graph);
        }
        Ok(())
    }

    /// Return a port's slot and clear its allocation bit. Caller holds
    /// the graph lock.
    fn port_release(&self, graph: &mut GraphState, port_id: PortId) {
        if let Some(offset) = graph.port_private[port_id as usize].buffer_offset.take() {
            let type_id = self.control.port(port_id).type_id.load(Ordering::Relaxed);
            self.pools[type_id as usize].release(offset);
        }
        self.port_release_shared_only(port_id);
    }

    fn port_release_shared_only(&self, port_id: PortId) {
        let _plock = self.port_lock.lock().unwrap();
        self.control.port(port_id).in_use.store(0, Ordering::Release);
    }

    pub fn connect_ports(&self, source: &str, destination: &str) -> Result<(), RequestError> {
        let _serial = self.request_lock.lock().unwrap();
        self.connect_ports_inner(source, destination)
    }

    fn connect_ports_inner(&self, source: &str, destination: &str) -> Result<(), RequestError> {
        let src = port::find_by_name(&self.control, source)
            .ok_or_else(|| RequestError::PortDoesNotExist(source.to_string()))?;
        let dst = port::find_by_name(&self.control, destination)
            .ok_or_else(|| RequestError::PortDoesNotExist(destination.to_string()))?;

        let sport = self.control.port(src);
        let dport = self.control.port(dst);

        if !dport.has_flag(PORT_IS_INPUT) {
            return Err(RequestError::NotAnInputPort(destination.to_string()));
        }
        if !sport.has_flag(PORT_IS_OUTPUT) {
            return Err(RequestError::NotAnOutputPort(source.to_string()));
        }
        if sport.locked.load(Ordering::Relaxed) != 0 {
            return Err(RequestError::PortLocked(source.to_string()));
        }
        if dport.locked.load(Ordering::Relaxed) != 0 {
            return Err(RequestError::PortLocked(destination.to_string()));
        }

        let type_id = sport.type_id.load(Ordering::Relaxed);
        if type_id != dport.type_id.load(Ordering::Relaxed) {
            return Err(RequestError::PortTypeMismatch);
        }

        let src_owner = sport.client_id.load(Ordering::Relaxed);
        let dst_owner = dport.client_id.load(Ordering::Relaxed);

        let mut graph = self.graph();
        for owner in [src_owner, dst_owner] {
            let client = graph
                .client_by_id(owner)
                .ok_or_else(|| RequestError::ClientNotFound(owner.to_string()))?;
            if !client.is_active() {
                return Err(RequestError::ClientNotActive(client.name()));
            }
        }

        let has_mixdown = self.control.header().port_types[type_id as usize]
            .has_mixdown
            .load(Ordering::Relaxed)
            != 0;
        if !graph.port_private[dst as usize].connections.is_empty() && !has_mixdown {
            return Err(RequestError::DuplicateConnection);
        }

        tracing::debug!(source, destination, "connect");
        let conn = Connection {
            source: src,
            destination: dst,
        };
        graph.port_private[src as usize].connections.push(conn);
        graph.port_private[dst as usize].connections.push(conn);

        graph::sort_graph(&self.control, &mut graph);

        self.send_connection_notification(&mut graph, src_owner, src, dst, true);
        self.send_connection_notification(&mut graph, dst_owner, dst, src, true);
        Ok(())
    }

    pub fn disconnect_ports(&self, source: &str, destination: &str) -> Result<(), RequestError> {
        let _serial = self.request_lock.lock().unwrap();
        let src = port::find_by_name(&self.control, source)
            .ok_or_else(|| RequestError::PortDoesNotExist(source.to_string()))?;
        let dst = port::find_by_name(&self.control, destination)
            .ok_or_else(|| RequestError::PortDoesNotExist(destination.to_string()))?;
        let mut graph = self.graph();
        self.disconnect_internal_locked(&mut graph, src, dst, true)
    }

    /// Remove one edge. Caller holds the graph lock.
    fn disconnect_internal_locked(
        &self,
        graph: &mut GraphState,
        src: PortId,
        dst: PortId,
        sort: bool,
    ) -> Result<(), RequestError> {
        let found = graph.port_private[src as usize]
            .connections
            .iter()
            .any(|c| c.source == src && c.destination == dst);
        if !found {
            return Err(RequestError::PortDoesNotExist(format!(
                "connection #{src} -> #{dst}"
            )));
        }

        tracing::debug!(src, dst, "disconnect");
        graph.port_private[src as usize]
            .connections
            .retain(|c| !(c.source == src && c.destination == dst));
        graph.port_private[dst as usize]
            .connections
            .retain(|c| !(c.source == src && c.destination == dst));

        // last outbound connection gone: stop input monitoring too
        if graph.port_private[src as usize].connections.is_empty() {
            self.control
                .port(src)
                .monitor_requests
                .store(0, Ordering::Relaxed);
        }

        let src_owner = self.control.port(src).client_id.load(Ordering::Relaxed);
        let dst_owner = self.control.port(dst).client_id.load(Ordering::Relaxed);
        self.send_connection_notification(graph, src_owner, src, dst, false);
        self.send_connection_notification(graph, dst_owner, dst, src, false);

        if sort {
            graph::sort_graph(&self.control, graph);
        }
        Ok(())
    }

    /// Wipe a port's connections. Caller holds the graph lock.
    fn port_clear_connections_locked(&self, graph: &mut GraphState, port: PortId) {
        while let Some(conn) = graph.port_private[port as usize].connections.first().copied() {
            let _ = self.disconnect_internal_locked(graph, conn.source, conn.destination, false);
        }
    }

    /// Disconnect everything attached to one port, atomically.
    pub fn disconnect_port(&self, port_id: PortId) -> Result<(), RequestError> {
        let _serial = self.request_lock.lock().unwrap();
        if port_id >= self.control.port_max() {
            return Err(RequestError::PortDoesNotExist(format!("port #{port_id}")));
        }
        let mut graph = self.graph();
        self.port_clear_connections_locked(&mut graph, port_id);
        graph::sort_graph(&self.control, &mut graph);
        Ok(())
    }

    pub fn client_activate(&self, id: ClientId) -> Result<(), RequestError> {
        let _serial = self.request_lock.lock().unwrap();
        let mut graph = self.graph();
        let idx = graph
            .client_index_by_id(id)
            .ok_or_else(|| RequestError::ClientNotFound(id.to_string()))?;
        graph.clients[idx]
            .control()
            .active
            .store(1, Ordering::Release);

        // make sure the FIFO is built and ready before the client needs it
        graph.external_client_cnt += 1;
        let next = graph.external_client_cnt;
        if let Err(e) = graph.fifos.get(next) {
            tracing::error!(fifo = next, error = %e, "cannot pre-create fifo");
        }

        graph::sort_graph(&self.control, &mut graph);
        Ok(())
    }

    pub fn client_deactivate(&self, id: ClientId) -> Result<(), RequestError> {
        let _serial = self.request_lock.lock().unwrap();
        let mut graph = self.graph();
        let idx = graph
            .client_index_by_id(id)
            .ok_or_else(|| RequestError::ClientNotFound(id.to_string()))?;

        if graph.timebase == Some(id) {
            graph.timebase = None;
            self.reset_transport();
        }

        let ports: Vec<PortId> = graph.clients[idx].ports.clone();
        for port in ports {
            self.port_clear_connections_locked(&mut graph, port);
        }

        self.do_deactivate_locked(&mut graph, idx, true);
        Ok(())
    }

    pub fn set_timebase(&self, id: ClientId) -> Result<(), RequestError> {
        let _serial = self.request_lock.lock().unwrap();
        let mut graph = self.graph();
        if graph.client_by_id(id).is_none() {
            return Err(RequestError::ClientNotFound(id.to_string()));
        }
        graph.timebase = Some(id);
        Ok(())
    }

    /// Accepted for protocol compatibility; this substrate has no
    /// capability set to transfer, so there is nothing to grant.
    pub fn set_client_capabilities(&self, id: ClientId) -> Result<(), RequestError> {
        let _serial = self.request_lock.lock().unwrap();
        let graph = self.graph();
        if graph.client_by_id(id).is_none() {
            return Err(RequestError::ClientNotFound(id.to_string()));
        }
        tracing::debug!(client = id, "capability request acknowledged, nothing to grant");
        Ok(())
    }

    /// Ports connected to `port_id`, as seen from that port.
    pub fn port_connections(&self, port_id: PortId) -> Result<Vec<PortId>, RequestError> {
        if port_id >= self.control.port_max() {
            return Err(RequestError::PortDoesNotExist(format!("port #{port_id}")));
        }
        let graph = self.graph();
        Ok(graph.port_private[port_id as usize]
            .connections
            .iter()
            .map(|c| {
                if c.source == port_id {
                    c.destination
                } else {
                    c.source
                }
            })
            .collect())
    }

    /// Wire dispatch for one request record. Returns `true` when the
    /// reply has already been written (connection queries stream their
    /// payload inline).
    pub(crate) fn do_request(
        &self,
        record: &mut RequestRecord,
        mut reply: Option<&mut UnixStream>,
    ) -> bool {
        let Some(rtype) = RequestType::from_u32(record.rtype) else {
            tracing::warn!(rtype = record.rtype, "unknown request type");
            return false;
        };
        tracing::debug!(rtype = ?rtype, "request");

        let mut suppressed = false;
        record.status = match rtype {
            RequestType::RegisterPort => {
                let name = from_fixed(&record.name).to_string();
                let type_name = from_fixed(&record.port_type).to_string();
                match self.port_register(record.client_id, &name, &type_name, record.flags) {
                    Ok(port_id) => {
                        record.port_id = port_id;
                        0
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "register port failed");
                        e.status()
                    }
                }
            }
            RequestType::UnRegisterPort => {
                self.reply_status(self.port_unregister(record.client_id, record.port_id))
            }
            RequestType::ConnectPorts => {
                let source = from_fixed(&record.source).to_string();
                let destination = from_fixed(&record.destination).to_string();
                self.reply_status(self.connect_ports(&source, &destination))
            }
            RequestType::DisconnectPort => self.reply_status(self.disconnect_port(record.port_id)),
            RequestType::DisconnectPorts => {
                let source = from_fixed(&record.source).to_string();
                let destination = from_fixed(&record.destination).to_string();
                self.reply_status(self.disconnect_ports(&source, &destination))
            }
            RequestType::ActivateClient => self.reply_status(self.client_activate(record.client_id)),
            RequestType::DeactivateClient => {
                self.reply_status(self.client_deactivate(record.client_id))
            }
            RequestType::SetTimeBaseClient => self.reply_status(self.set_timebase(record.client_id)),
            RequestType::SetClientCapabilities => {
                self.reply_status(self.set_client_capabilities(record.client_id))
            }
            RequestType::GetPortConnections | RequestType::GetPortNConnections => {
                match self.port_connections(record.port_id) {
                    Ok(peers) => {
                        record.nports = peers.len() as u32;
                        record.status = 0;
                        if let Some(stream) = reply.as_deref_mut() {
                            suppressed = true;
                            if let Err(e) = self.write_connection_reply(stream, record, &peers, rtype)
                            {
                                tracing::error!(error = %e, "cannot write connections to client");
                            }
                        }
                        0
                    }
                    Err(e) => e.status(),
                }
            }
        };

        tracing::debug!(status = record.status, "request done");
        suppressed
    }

    fn reply_status(&self, result: Result<(), RequestError>) -> i32 {
        if let Err(e) = &result {
            tracing::error!(error = %e, "request failed");
        }
        crate::request::status_of(&result)
    }

    fn write_connection_reply(
        &self,
        stream: &mut UnixStream,
        record: &RequestRecord,
        peers: &[PortId],
        rtype: RequestType,
    ) -> std::io::Result<()> {
        write_record(stream, record)?;
        if rtype == RequestType::GetPortConnections {
            for peer in peers {
                stream.write_all(&peer.to_le_bytes())?;
            }
        }
        Ok(())
    }

    // ----- diagnostics -----------------------------------------------------

    /// Log the whole graph: clients, their ports, and every connection.
    pub fn dump_configuration(&self) {
        let graph = self.graph();
        tracing::info!(clients = graph.clients.len(), "-- configuration dump --");
        for client in &graph.clients {
            tracing::info!(
                client = %client.name(),
                client_type = ?client.client_type(),
                fed_by = client.fed_by.len(),
                start_fd = client.subgraph_start_fd,
                wait_fd = client.subgraph_wait_fd,
                order = client.execution_order,
                "client"
            );
            for &port in &client.ports {
                let shared = self.control.port(port);
                let name_field = shared.name.get();
                tracing::info!(port = from_fixed(&name_field), id = port, "  port");
                for conn in &graph.port_private[port as usize].connections {
                    let peer = if conn.source == port {
                        conn.destination
                    } else {
                        conn.source
                    };
                    let peer_field = self.control.port(peer).name.get();
                    let arrow = if conn.source == port { "->" } else { "<-" };
                    tracing::info!(peer = from_fixed(&peer_field), arrow, "    connection");
                }
            }
        }
        tracing::info!("-- dump ends --");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AUDIO_PORT_TYPE, EVENT_PORT_TYPE};
    use crate::client::InProcessClient;
    use crate::control::PORT_IS_INPUT;
    use crate::testing::test_engine;

    struct Noop;
    impl InProcessClient for Noop {}

    fn add_client(engine: &Arc<Engine>, name: &str) -> ClientId {
        engine.add_in_process_client(name, Box::new(Noop)).unwrap()
    }

    #[test]
    fn test_fan_in_needs_a_mixdown() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(64).unwrap();

        let a = add_client(&engine, "a");
        let b = add_client(&engine, "b");
        let c = add_client(&engine, "c");
        engine.port_register(a, "a:ev_out", EVENT_PORT_TYPE, PORT_IS_OUTPUT).unwrap();
        engine.port_register(b, "b:ev_out", EVENT_PORT_TYPE, PORT_IS_OUTPUT).unwrap();
        let c_in = engine
            .port_register(c, "c:ev_in", EVENT_PORT_TYPE, PORT_IS_INPUT)
            .unwrap();
        for id in [a, b, c] {
            engine.client_activate(id).unwrap();
        }

        // first connection wins; the event type has no mixdown
        engine.connect_ports("a:ev_out", "c:ev_in").unwrap();
        let err = engine.connect_ports("b:ev_out", "c:ev_in").unwrap_err();
        assert!(matches!(err, RequestError::DuplicateConnection));
        assert_eq!(engine.port_connections(c_in).unwrap().len(), 1);

        // the audio type mixes down, so fan-in is legal there
        engine.port_register(a, "a:out", AUDIO_PORT_TYPE, PORT_IS_OUTPUT).unwrap();
        engine.port_register(b, "b:out", AUDIO_PORT_TYPE, PORT_IS_OUTPUT).unwrap();
        let c_audio = engine
            .port_register(c, "c:in", AUDIO_PORT_TYPE, PORT_IS_INPUT)
            .unwrap();
        engine.connect_ports("a:out", "c:in").unwrap();
        engine.connect_ports("b:out", "c:in").unwrap();
        assert_eq!(engine.port_connections(c_audio).unwrap().len(), 2);

        engine.shutdown();
    }

    #[test]
    fn test_feedback_with_driver_sorts_driver_first() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(64).unwrap();

        let d = engine
            .setup_client(ClientSetup {
                client_type: ClientType::Driver,
                name: "card".into(),
                pid: std::process::id() as i32,
                factory: String::new(),
                args: String::new(),
                request_stream: None,
                plugin: None,
            })
            .unwrap()
            .client_id;
        let e = add_client(&engine, "effect");

        engine.port_register(d, "card:out", AUDIO_PORT_TYPE, PORT_IS_OUTPUT).unwrap();
        engine.port_register(d, "card:in", AUDIO_PORT_TYPE, PORT_IS_INPUT).unwrap();
        engine.port_register(e, "effect:out", AUDIO_PORT_TYPE, PORT_IS_OUTPUT).unwrap();
        engine.port_register(e, "effect:in", AUDIO_PORT_TYPE, PORT_IS_INPUT).unwrap();
        engine.client_activate(d).unwrap();
        engine.client_activate(e).unwrap();

        engine.connect_ports("card:out", "effect:in").unwrap();
        // close the loop by hand
        engine.connect_ports("effect:out", "card:in").unwrap();

        let graph = engine.graph();
        let drec = graph.client_by_id(d).unwrap();
        let erec = graph.client_by_id(e).unwrap();
        assert!(drec.fed_by.contains(&e));
        assert!(erec.fed_by.contains(&d));
        assert!(
            graph.client_index_by_id(d).unwrap() < graph.client_index_by_id(e).unwrap(),
            "the driver breaks the loop by executing first"
        );
        drop(graph);
        engine.shutdown();
    }

    #[test]
    fn test_register_unregister_round_trip() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(128).unwrap();
        let a = add_client(&engine, "a");

        let free_before = engine.pools()[0].free_list();
        let port = engine
            .port_register(a, "a:out", AUDIO_PORT_TYPE, PORT_IS_OUTPUT)
            .unwrap();
        assert!(engine.control().port(port).is_in_use());
        assert_eq!(engine.pools()[0].free_slots(), free_before.len() - 1);

        engine.port_unregister(a, port).unwrap();
        assert!(!engine.control().port(port).is_in_use());
        // released to the head, so the free list is exactly as before
        assert_eq!(engine.pools()[0].free_list(), free_before);
        assert!(engine.graph().client_by_id(a).unwrap().ports.is_empty());

        engine.shutdown();
    }

    #[test]
    fn test_unregister_owner_checks() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(64).unwrap();
        let a = add_client(&engine, "a");
        let b = add_client(&engine, "b");
        let port = engine
            .port_register(a, "a:out", AUDIO_PORT_TYPE, PORT_IS_OUTPUT)
            .unwrap();

        let err = engine.port_unregister(b, port).unwrap_err();
        assert!(matches!(err, RequestError::OwnerMismatch(owner) if owner == b));

        let err = engine.port_unregister(a, 99).unwrap_err();
        assert!(matches!(err, RequestError::PortDoesNotExist(_)));
        engine.shutdown();
    }

    #[test]
    fn test_connect_disconnect_round_trip() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(64).unwrap();
        let a = add_client(&engine, "a");
        let b = add_client(&engine, "b");
        engine.port_register(a, "a:out", AUDIO_PORT_TYPE, PORT_IS_OUTPUT).unwrap();
        let b_in = engine
            .port_register(b, "b:in", AUDIO_PORT_TYPE, PORT_IS_INPUT)
            .unwrap();
        engine.client_activate(a).unwrap();
        engine.client_activate(b).unwrap();

        let orders_before: Vec<u32> = {
            let graph = engine.graph();
            graph.clients.iter().map(|c| c.execution_order).collect()
        };

        engine.connect_ports("a:out", "b:in").unwrap();
        assert!(engine.graph().client_by_id(b).unwrap().fed_by.contains(&a));

        engine.disconnect_ports("a:out", "b:in").unwrap();
        let graph = engine.graph();
        assert!(graph.client_by_id(b).unwrap().fed_by.is_empty());
        assert!(graph.port_private[b_in as usize].connections.is_empty());
        let orders_after: Vec<u32> = graph.clients.iter().map(|c| c.execution_order).collect();
        assert_eq!(orders_before, orders_after);
        assert_eq!(
            engine.control().port(b_in).total_latency.load(Ordering::Relaxed),
            0
        );
        drop(graph);
        engine.shutdown();
    }

    #[test]
    fn test_activate_deactivate_round_trip() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(64).unwrap();

        let id = engine
            .setup_client(ClientSetup {
                client_type: ClientType::External,
                name: "ext".into(),
                pid: 1,
                factory: String::new(),
                args: String::new(),
                request_stream: None,
                plugin: None,
            })
            .unwrap()
            .client_id;

        assert_eq!(engine.graph().external_client_cnt, 0);
        engine.client_activate(id).unwrap();
        {
            let graph = engine.graph();
            assert_eq!(graph.external_client_cnt, 1);
            let rec = graph.client_by_id(id).unwrap();
            assert!(rec.subgraph_start_fd >= 0);
            assert!(rec.subgraph_wait_fd >= 0);
        }

        engine.client_deactivate(id).unwrap();
        let graph = engine.graph();
        assert_eq!(graph.external_client_cnt, 0);
        let rec = graph.client_by_id(id).unwrap();
        assert!(!rec.is_active());
        assert_eq!(rec.subgraph_start_fd, -1);
        assert_eq!(rec.subgraph_wait_fd, -1);
        drop(graph);
        engine.shutdown();
    }

    #[test]
    fn test_deactivate_clears_timebase_and_connections() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(64).unwrap();
        let a = add_client(&engine, "a");
        let b = add_client(&engine, "b");
        engine.port_register(a, "a:out", AUDIO_PORT_TYPE, PORT_IS_OUTPUT).unwrap();
        let b_in = engine
            .port_register(b, "b:in", AUDIO_PORT_TYPE, PORT_IS_INPUT)
            .unwrap();
        engine.client_activate(a).unwrap();
        engine.client_activate(b).unwrap();
        engine.connect_ports("a:out", "b:in").unwrap();
        engine.set_timebase(a).unwrap();

        engine.client_deactivate(a).unwrap();
        let graph = engine.graph();
        assert_eq!(graph.timebase, None);
        assert!(graph.port_private[b_in as usize].connections.is_empty());
        // the port itself survives deactivation
        assert!(engine.control().port(b_in).is_in_use());
        drop(graph);
        engine.shutdown();
    }

    #[test]
    fn test_buffer_size_change_rebuilds_pools_and_notifies() {
        struct CountingClient {
            buffer_changes: Arc<Mutex<Vec<u32>>>,
            new_types: Arc<Mutex<Vec<(String, u64)>>>,
        }
        impl InProcessClient for CountingClient {
            fn buffer_size_changed(&mut self, nframes: u32) {
                self.buffer_changes.lock().unwrap().push(nframes);
            }
            fn new_port_type(&mut self, shm_name: &str, size: u64) {
                self.new_types.lock().unwrap().push((shm_name.to_string(), size));
            }
        }

        let (_dirs, engine) = test_engine(|mut cfg| {
            cfg.port_max = 8;
            cfg
        });
        let buffer_changes = Arc::new(Mutex::new(Vec::new()));
        let new_types = Arc::new(Mutex::new(Vec::new()));
        engine
            .add_in_process_client(
                "watcher",
                Box::new(CountingClient {
                    buffer_changes: buffer_changes.clone(),
                    new_types: new_types.clone(),
                }),
            )
            .unwrap();

        engine.set_buffer_size(256).unwrap();
        buffer_changes.lock().unwrap().clear();
        new_types.lock().unwrap().clear();

        engine.set_buffer_size(512).unwrap();

        // audio: 8 ports x 512 frames x 4 bytes
        assert_eq!(engine.pools()[0].segment_size(), 8 * 512 * 4);
        // silent buffer re-reserved at the lowest slot and zero-filled
        assert_eq!(engine.pools()[0].silent_offset(), Some(0));
        let silent = engine.pools()[0].slot_ptr(0).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(silent, 512 * 4) };
        assert!(bytes.iter().all(|b| *b == 0));
        // free list rebuilt in ascending offset order, minus the silent slot
        let free = engine.pools()[0].free_list();
        assert_eq!(free.first(), Some(&(512 * 4)));
        assert!(free.windows(2).all(|w| w[0] < w[1]));

        // one BufferSizeChange, one NewPortType per type
        assert_eq!(buffer_changes.lock().unwrap().as_slice(), &[512]);
        assert_eq!(
            new_types.lock().unwrap().len(),
            crate::buffer::BUILTIN_PORT_TYPES.len()
        );

        engine.shutdown();
    }

    #[test]
    fn test_request_error_paths() {
        let (_dirs, engine) = test_engine(|mut cfg| {
            cfg.port_max = 2;
            cfg
        });
        engine.set_buffer_size(64).unwrap();
        let a = add_client(&engine, "a");

        let err = engine
            .port_register(a, "a:x", "no such type", PORT_IS_INPUT)
            .unwrap_err();
        assert!(matches!(err, RequestError::UnknownPortType(_)));

        let err = engine.connect_ports("ghost:out", "ghost:in").unwrap_err();
        assert!(matches!(err, RequestError::PortDoesNotExist(_)));

        let err = engine.client_activate(999).unwrap_err();
        assert!(matches!(err, RequestError::ClientNotFound(_)));

        engine.port_register(a, "a:1", AUDIO_PORT_TYPE, PORT_IS_INPUT).unwrap();
        engine.port_register(a, "a:2", AUDIO_PORT_TYPE, PORT_IS_INPUT).unwrap();
        let err = engine
            .port_register(a, "a:3", AUDIO_PORT_TYPE, PORT_IS_INPUT)
            .unwrap_err();
        assert!(matches!(err, RequestError::NoFreePortSlot));

        engine.shutdown();
    }

    #[test]
    fn test_connect_requires_active_owners() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(64).unwrap();
        let a = add_client(&engine, "a");
        let b = add_client(&engine, "b");
        engine.port_register(a, "a:out", AUDIO_PORT_TYPE, PORT_IS_OUTPUT).unwrap();
        engine.port_register(b, "b:in", AUDIO_PORT_TYPE, PORT_IS_INPUT).unwrap();
        engine.client_activate(a).unwrap();
        // b stays inactive

        let err = engine.connect_ports("a:out", "b:in").unwrap_err();
        assert!(matches!(err, RequestError::ClientNotActive(name) if name == "b"));
        engine.shutdown();
    }

    #[test]
    fn test_wire_dispatch_register_and_connect() {
        let (_dirs, engine) = test_engine(|cfg| cfg);
        engine.set_buffer_size(64).unwrap();
        let a = add_client(&engine, "alpha");
        let b = add_client(&engine, "beta");
        engine.client_activate(a).unwrap();
        engine.client_activate(b).unwrap();

        let mut rec = RequestRecord {
            rtype: RequestType::RegisterPort.as_u32(),
            client_id: a,
            flags: crate::control::PORT_IS_OUTPUT,
            port_type: to_fixed(AUDIO_PORT_TYPE),
            name: to_fixed("alpha:out"),
            ..bytemuck::Zeroable::zeroed()
        };
        assert!(!engine.do_request(&mut rec, None));
        assert_eq!(rec.status, 0);

        let mut rec2 = RequestRecord {
            rtype: RequestType::RegisterPort.as_u32(),
            client_id: b,
            flags: crate::control::PORT_IS_INPUT,
            port_type: to_fixed(AUDIO_PORT_TYPE),
            name: to_fixed("beta:in"),
            ..bytemuck::Zeroable::zeroed()
        };
        engine.do_request(&mut rec2, None);

        let mut conn = RequestRecord {
            rtype: RequestType::ConnectPorts.as_u32(),
            source: to_fixed("alpha:out"),
            destination: to_fixed("beta:in"),
            ..bytemuck::Zeroable::zeroed()
        };
        engine.do_request(&mut conn, None);
        assert_eq!(conn.status, 0);

        let mut query = RequestRecord {
            rtype: RequestType::GetPortNConnections.as_u32(),
            port_id: rec2.port_id,
            ..bytemuck::Zeroable::zeroed()
        };
        engine.do_request(&mut query, None);
        assert_eq!(query.nports, 1);

        engine.shutdown();
    }
}
