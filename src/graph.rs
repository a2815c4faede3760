//! Graph state and the topological machinery: direct feeds, transitive
//! `fed_by` closure, the stable client sort, subgraph chain assignment,
//! and total-latency recomputation.
//!
//! Everything here runs under the graph lock.

use crate::client::ClientRecord;
use crate::control::{ControlSegment, PORT_IS_OUTPUT, PORT_IS_TERMINAL};
use crate::event::{self, Event};
use crate::fifo::FifoPool;
use crate::port::PortPrivate;
use crate::{ClientId, PortId};
use std::sync::atomic::Ordering;

/// Everything the graph lock protects: the sorted client list, the
/// engine-private port table, the FIFO pool, and the timebase assignment.
pub struct GraphState {
    /// Topologically sorted: a feeder always precedes the clients it
    /// feeds, with feedback loops broken in the driver's favor.
    pub clients: Vec<ClientRecord>,
    pub port_private: Vec<PortPrivate>,
    pub fifos: FifoPool,
    pub timebase: Option<ClientId>,
    pub external_client_cnt: u32,
}

impl GraphState {
    pub fn new(port_max: u32, fifos: FifoPool) -> Self {
        let mut port_private = Vec::with_capacity(port_max as usize);
        port_private.resize_with(port_max as usize, PortPrivate::default);
        Self {
            clients: Vec::new(),
            port_private,
            fifos,
            timebase: None,
            external_client_cnt: 0,
        }
    }

    pub fn client_index_by_id(&self, id: ClientId) -> Option<usize> {
        self.clients.iter().position(|c| c.id() == id)
    }

    pub fn client_by_id(&self, id: ClientId) -> Option<&ClientRecord> {
        self.clients.iter().find(|c| c.id() == id)
    }

    pub fn client_by_id_mut(&mut self, id: ClientId) -> Option<&mut ClientRecord> {
        self.clients.iter_mut().find(|c| c.id() == id)
    }

    pub fn client_by_name(&self, name: &str) -> Option<&ClientRecord> {
        self.clients.iter().find(|c| c.name() == name)
    }
}

/// Does `might` own an output port connected to an input port of `target`?
fn direct_feeds(
    control: &ControlSegment,
    graph: &GraphState,
    might: &ClientRecord,
    target_id: ClientId,
) -> bool {
    let might_id = might.id();
    for &port in &might.ports {
        for conn in &graph.port_private[port as usize].connections {
            let src_owner = control.port(conn.source).client_id.load(Ordering::Relaxed);
            let dst_owner = control
                .port(conn.destination)
                .client_id
                .load(Ordering::Relaxed);
            if src_owner == might_id && dst_owner == target_id {
                return true;
            }
        }
    }
    false
}

/// Rebuild every client's direct `fed_by` set from the connection lists.
fn rebuild_direct_fed_by(control: &ControlSegment, graph: &mut GraphState) {
    let n = graph.clients.len();
    let mut sets = Vec::with_capacity(n);
    for i in 0..n {
        let target_id = graph.clients[i].id();
        let mut fed_by = ahash::AHashSet::new();
        for j in 0..n {
            if direct_feeds(control, graph, &graph.clients[j], target_id) {
                fed_by.insert(graph.clients[j].id());
            }
        }
        sets.push(fed_by);
    }
    for (client, fed_by) in graph.clients.iter_mut().zip(sets) {
        client.fed_by = fed_by;
    }
}

/// Extend one client's `fed_by` set to the transitive closure.
///
/// A node already present in the root's set is never re-entered, which
/// both terminates the walk and leaves feedback loops implicitly broken.
fn trace_terminal(graph: &mut GraphState, root: usize) {
    let root_id = graph.clients[root].id();
    let mut work: Vec<ClientId> = graph.clients[root].fed_by.iter().copied().collect();

    while let Some(id) = work.pop() {
        let feeders: Vec<ClientId> = match graph.client_by_id(id) {
            Some(client) => client.fed_by.iter().copied().collect(),
            None => continue,
        };
        let root_set = &mut graph.clients[root].fed_by;
        for feeder in feeders {
            if feeder != root_id && root_set.insert(feeder) {
                work.push(feeder);
            }
        }
    }
}

/// Ordering key for the client sort.
///
/// The pairwise rule (A before B whenever `A ∈ fed_by(B) ∧ B ∉ fed_by(A)`)
/// is realized as a total key: the transitive closure makes a feeder's
/// set a strict subset of its dependent's, so closure size orders any
/// related pair. Mutually-feeding clients share a closure size; the driver
/// wins the tie, and client id keeps the rest stable.
fn sort_key(client: &ClientRecord) -> (usize, bool, ClientId) {
    (
        client.fed_by.len(),
        !client.client_type().is_driver(),
        client.id(),
    )
}

/// Assign execution order and subgraph FIFOs along the sorted list, and
/// tell every active client where it landed.
///
/// In-process clients terminate the in-flight subgraph: the subgraph head
/// keeps the `start_fd` the engine kicks and receives the `wait_fd` the
/// engine blocks on; continuation clients chain through the numbered
/// FIFOs themselves. FIFO `order + 1` is pre-created before the reorder
/// event goes out so clients never race to open it.
fn rechain(graph: &mut GraphState) {
    let GraphState { clients, fifos, .. } = graph;

    fifos.clear();

    let mut n: u32 = 0;
    let mut subgraph_head: Option<usize> = None;

    let get_fifo = |fifos: &mut FifoPool, which: u32| -> i32 {
        match fifos.get(which) {
            Ok(fd) => fd,
            Err(e) => {
                tracing::error!(fifo = which, error = %e, "cannot create subgraph fifo");
                -1
            }
        }
    };

    for idx in 0..clients.len() {
        if !clients[idx].is_active() {
            clients[idx].subgraph_start_fd = -1;
            clients[idx].subgraph_wait_fd = -1;
            continue;
        }

        clients[idx].execution_order = n;

        if clients[idx].is_internal() {
            if let Some(head) = subgraph_head.take() {
                clients[head].subgraph_wait_fd = get_fifo(fifos, n);
                tracing::debug!(
                    client = %clients[head].name(),
                    wait_fd = clients[head].subgraph_wait_fd,
                    order = n,
                    "subgraph terminated"
                );
                n += 1;
            }
            clients[idx].subgraph_start_fd = -1;
            clients[idx].subgraph_wait_fd = -1;
            let order = clients[idx].execution_order;
            event::deliver(&mut clients[idx], &Event::graph_reordered(order));
        } else {
            if subgraph_head.is_none() {
                subgraph_head = Some(idx);
                clients[idx].subgraph_start_fd = get_fifo(fifos, n);
                tracing::debug!(
                    client = %clients[idx].name(),
                    start_fd = clients[idx].subgraph_start_fd,
                    order = n,
                    "subgraph started"
                );
            } else {
                clients[idx].subgraph_start_fd = -1;
                clients[idx].subgraph_wait_fd = -1;
            }

            let order = clients[idx].execution_order;
            get_fifo(fifos, order + 1);
            event::deliver(&mut clients[idx], &Event::graph_reordered(order));
            n += 1;
        }
    }

    if let Some(head) = subgraph_head {
        clients[head].subgraph_wait_fd = get_fifo(fifos, n);
        tracing::debug!(
            client = %clients[head].name(),
            wait_fd = clients[head].subgraph_wait_fd,
            "last subgraph terminated"
        );
    }
}

/// Longest latency chain from `port` toward a terminal, walking with the
/// direction of the port's role. Depth-bounded: the graph may legally
/// contain cycles, and eight hops of latency accumulation is where we
/// stop pretending the number means anything.
fn port_total_latency(
    control: &ControlSegment,
    graph: &GraphState,
    port: PortId,
    hop_count: u32,
    toward_source: bool,
) -> u32 {
    let latency = control.port(port).latency.load(Ordering::Relaxed);

    if hop_count > 8 {
        return latency;
    }

    let mut max_peer = 0u32;
    for conn in &graph.port_private[port as usize].connections {
        if (toward_source && conn.source == port) || (!toward_source && conn.destination == port) {
            continue;
        }
        let peer = if conn.destination == port {
            conn.source
        } else {
            conn.destination
        };

        let peer_latency = if control.port(peer).has_flag(PORT_IS_TERMINAL) {
            control.port(peer).latency.load(Ordering::Relaxed)
        } else {
            port_total_latency(control, graph, peer, hop_count + 1, toward_source)
        };
        max_peer = max_peer.max(peer_latency);
    }

    latency + max_peer
}

/// Recompute `total_latency` for every in-use port. Outputs accumulate
/// toward sinks, inputs toward sources.
pub(crate) fn compute_all_total_latencies(control: &ControlSegment, graph: &GraphState) {
    for id in 0..control.port_max() {
        let shared = control.port(id);
        if !shared.is_in_use() {
            continue;
        }
        let toward_source = !shared.has_flag(PORT_IS_OUTPUT);
        let total = port_total_latency(control, graph, id, 0, toward_source);
        shared.total_latency.store(total, Ordering::Relaxed);
    }
}

/// Full resort: rebuild feeds, close them transitively, sort, recompute
/// latencies, and re-chain the subgraphs. Caller holds the graph lock.
pub(crate) fn sort_graph(control: &ControlSegment, graph: &mut GraphState) {
    rebuild_direct_fed_by(control, graph);
    for i in 0..graph.clients.len() {
        trace_terminal(graph, i);
    }
    graph.clients.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    compute_all_total_latencies(control, graph);
    rechain(graph);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::ClientType;
    use crate::control::{to_fixed, PORT_IS_INPUT};
    use crate::port::Connection;
    use tempfile::TempDir;

    pub(crate) struct Fixture {
        pub _dir: TempDir,
        pub control: ControlSegment,
        pub graph: GraphState,
        next_id: ClientId,
    }

    impl Fixture {
        pub(crate) fn new(port_max: u32) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let control = ControlSegment::create(dir.path(), "/jack-engine", port_max).unwrap();
            let fifos = FifoPool::new(dir.path().join("jack-ack-fifo-t"));
            Self {
                _dir: dir,
                control,
                graph: GraphState::new(port_max, fifos),
                next_id: 1,
            }
        }

        pub(crate) fn add_client(&mut self, name: &str, client_type: ClientType) -> ClientId {
            let id = self.next_id;
            self.next_id += 1;
            let rec = ClientRecord::new_local(client_type, id, name);
            rec.control().active.store(1, Ordering::Release);
            self.graph.clients.push(rec);
            id
        }

        pub(crate) fn add_port(&mut self, owner: ClientId, name: &str, flags: u32) -> PortId {
            let id = crate::port::allocate_id(&self.control).unwrap();
            let shared = self.control.port(id);
            shared.client_id.store(owner, Ordering::Relaxed);
            shared.flags.store(flags, Ordering::Relaxed);
            shared.name.set(to_fixed(name));
            self.graph
                .client_by_id_mut(owner)
                .unwrap()
                .ports
                .push(id);
            id
        }

        pub(crate) fn connect(&mut self, source: PortId, destination: PortId) {
            let conn = Connection {
                source,
                destination,
            };
            self.graph.port_private[source as usize].connections.push(conn);
            self.graph.port_private[destination as usize]
                .connections
                .push(conn);
        }

        pub(crate) fn order_of(&self, id: ClientId) -> usize {
            self.graph.client_index_by_id(id).unwrap()
        }
    }

    fn wire_chain(fx: &mut Fixture, upstream: ClientId, downstream: ClientId, tag: &str) {
        let out = fx.add_port(upstream, &format!("{tag}:out"), PORT_IS_OUTPUT);
        let inp = fx.add_port(downstream, &format!("{tag}:in"), PORT_IS_INPUT);
        fx.connect(out, inp);
    }

    #[test]
    fn test_linear_chain_sorts_in_feed_order() {
        let mut fx = Fixture::new(16);
        // insert in reverse to prove the sort does the work
        let z = fx.add_client("z", ClientType::InProcess);
        let y = fx.add_client("y", ClientType::InProcess);
        let x = fx.add_client("x", ClientType::InProcess);
        wire_chain(&mut fx, x, y, "xy");
        wire_chain(&mut fx, y, z, "yz");

        sort_graph(&fx.control, &mut fx.graph);

        assert!(fx.order_of(x) < fx.order_of(y));
        assert!(fx.order_of(y) < fx.order_of(z));

        // transitive closure reaches x from z
        let z_rec = fx.graph.client_by_id(z).unwrap();
        assert!(z_rec.fed_by.contains(&x));
        assert!(z_rec.fed_by.contains(&y));
        let x_rec = fx.graph.client_by_id(x).unwrap();
        assert!(x_rec.fed_by.is_empty());
    }

    #[test]
    fn test_feedback_loop_puts_driver_first() {
        let mut fx = Fixture::new(16);
        let e = fx.add_client("effect", ClientType::InProcess);
        let d = fx.add_client("driver", ClientType::Driver);
        wire_chain(&mut fx, d, e, "de");
        wire_chain(&mut fx, e, d, "ed");

        sort_graph(&fx.control, &mut fx.graph);

        // both see each other, no runaway recursion
        assert!(fx.graph.client_by_id(d).unwrap().fed_by.contains(&e));
        assert!(fx.graph.client_by_id(e).unwrap().fed_by.contains(&d));
        assert!(fx.order_of(d) < fx.order_of(e));
    }

    #[test]
    fn test_mutual_feed_without_driver_breaks_by_id() {
        let mut fx = Fixture::new(16);
        let b = fx.add_client("b", ClientType::InProcess);
        let a = fx.add_client("a", ClientType::InProcess);
        wire_chain(&mut fx, a, b, "ab");
        wire_chain(&mut fx, b, a, "ba");

        sort_graph(&fx.control, &mut fx.graph);
        // ids: b == 1, a == 2; tie broken by id
        assert!(fx.order_of(b) < fx.order_of(a));
    }

    #[test]
    fn test_rechain_assigns_subgraph_fds() {
        let mut fx = Fixture::new(16);
        let ext1 = fx.add_client("ext1", ClientType::External);
        let ext2 = fx.add_client("ext2", ClientType::External);
        let mid = fx.add_client("mid", ClientType::InProcess);
        let ext3 = fx.add_client("ext3", ClientType::External);
        wire_chain(&mut fx, ext1, ext2, "a");
        wire_chain(&mut fx, ext2, mid, "b");
        wire_chain(&mut fx, mid, ext3, "c");

        sort_graph(&fx.control, &mut fx.graph);

        let c1 = fx.graph.client_by_id(ext1).unwrap();
        let c2 = fx.graph.client_by_id(ext2).unwrap();
        let c3 = fx.graph.client_by_id(ext3).unwrap();
        let cm = fx.graph.client_by_id(mid).unwrap();

        // first run: ext1 heads it, ext2 continues it
        assert!(c1.subgraph_start_fd >= 0);
        assert!(c1.subgraph_wait_fd >= 0);
        assert_eq!(c2.subgraph_start_fd, -1);
        assert_eq!(c2.subgraph_wait_fd, -1);

        // in-process client breaks the chain
        assert_eq!(cm.subgraph_start_fd, -1);

        // second run after the break
        assert!(c3.subgraph_start_fd >= 0);
        assert!(c3.subgraph_wait_fd >= 0);

        assert_eq!(c1.execution_order, 0);
        assert_eq!(c2.execution_order, 1);
        assert_eq!(cm.execution_order, 2);
        // the slot between mid and ext3 went to the terminating fifo
        assert_eq!(c3.execution_order, 3);
    }

    #[test]
    fn test_inactive_clients_skipped_by_rechain() {
        let mut fx = Fixture::new(8);
        let a = fx.add_client("a", ClientType::External);
        let b = fx.add_client("b", ClientType::External);
        fx.graph
            .client_by_id(b)
            .unwrap()
            .control()
            .active
            .store(0, Ordering::Release);

        sort_graph(&fx.control, &mut fx.graph);

        assert_eq!(fx.graph.client_by_id(a).unwrap().execution_order, 0);
        assert_eq!(fx.graph.client_by_id(b).unwrap().execution_order, u32::MAX);
    }

    #[test]
    fn test_total_latency_along_chain() {
        let mut fx = Fixture::new(16);
        let a = fx.add_client("a", ClientType::InProcess);
        let b = fx.add_client("b", ClientType::InProcess);
        let c = fx.add_client("c", ClientType::InProcess);

        let a_out = fx.add_port(a, "a:out", PORT_IS_OUTPUT | PORT_IS_TERMINAL);
        let b_in = fx.add_port(b, "b:in", PORT_IS_INPUT);
        let b_out = fx.add_port(b, "b:out", PORT_IS_OUTPUT);
        let c_in = fx.add_port(c, "c:in", PORT_IS_INPUT | PORT_IS_TERMINAL);
        fx.connect(a_out, b_in);
        fx.connect(b_out, c_in);

        fx.control.port(a_out).latency.store(64, Ordering::Relaxed);
        fx.control.port(b_in).latency.store(10, Ordering::Relaxed);
        fx.control.port(b_out).latency.store(10, Ordering::Relaxed);
        fx.control.port(c_in).latency.store(32, Ordering::Relaxed);

        compute_all_total_latencies(&fx.control, &fx.graph);

        // input accumulates toward sources: own 10 + terminal source 64
        assert_eq!(
            fx.control.port(b_in).total_latency.load(Ordering::Relaxed),
            74
        );
        // output accumulates toward sinks: own 10 + terminal sink 32
        assert_eq!(
            fx.control.port(b_out).total_latency.load(Ordering::Relaxed),
            42
        );
        // the walk follows connections only, so a:out sees b:in and stops
        assert_eq!(
            fx.control.port(a_out).total_latency.load(Ordering::Relaxed),
            74
        );
    }

    #[test]
    fn test_latency_bounded_on_cycles() {
        let mut fx = Fixture::new(8);
        let a = fx.add_client("a", ClientType::InProcess);
        let b = fx.add_client("b", ClientType::InProcess);
        let a_out = fx.add_port(a, "a:out", PORT_IS_OUTPUT);
        let a_in = fx.add_port(a, "a:in", PORT_IS_INPUT);
        let b_out = fx.add_port(b, "b:out", PORT_IS_OUTPUT);
        let b_in = fx.add_port(b, "b:in", PORT_IS_INPUT);
        fx.connect(a_out, b_in);
        fx.connect(b_out, a_in);
        for p in [a_out, a_in, b_out, b_in] {
            fx.control.port(p).latency.store(1, Ordering::Relaxed);
        }

        // must terminate; the depth bound caps the accumulation
        compute_all_total_latencies(&fx.control, &fx.graph);
        let total = fx.control.port(a_out).total_latency.load(Ordering::Relaxed);
        assert!(total >= 1 && total <= 16);
    }
}
