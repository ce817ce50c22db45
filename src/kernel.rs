//! The node kernel ("OTT", §4.6): wires the routing and flow tables,
//! the control and flow transports, the player/source registries, and
//! the connection doctor into one running node. Everything above this
//! module is a pure data structure; this is where threads live.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::NodeConfig;
use crate::doctor::Icu;
use crate::events::Event;
use crate::flow::FlowKey;
use crate::id::NodeId;
use crate::node::{Node, RoutingOutcome};
use crate::registry::source::SourceError;
use crate::registry::{ChunkSink, PlayerId, PlayerRegistry, SourceRegistry};
use crate::routing::Cost;
use crate::transport::{FlowHeader, FlowTransport};
use crate::wire::control::ControlConn;
use crate::wire::{Authentication, Message, WireError};

/// Every neighbour announces its own cost-0 vector; one control hop
/// always adds this much (§4.1's `link_cost` parameter).
const LINK_COST: Cost = 1;
const FLOW_PROCESSOR_POOL: usize = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnectionState {
    Handshaking,
    Connected,
    TimedOut,
}

struct ConnectionRecord {
    conn: Arc<ControlConn>,
    control_addr: SocketAddr,
    flow_addr: SocketAddr,
    name: Option<String>,
    state: ConnectionState,
}

#[derive(Debug)]
pub enum KernelError {
    Io(std::io::Error),
    WireError(WireError),
    HandshakeFailed,
    SelfConnect,
    Source(SourceError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::Io(e) => write!(f, "i/o error: {}", e),
            KernelError::WireError(e) => write!(f, "{}", e),
            KernelError::HandshakeFailed => write!(f, "handshake failed"),
            KernelError::SelfConnect => write!(f, "cannot connect to own control address"),
            KernelError::Source(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<std::io::Error> for KernelError {
    fn from(e: std::io::Error) -> KernelError {
        KernelError::Io(e)
    }
}

impl From<WireError> for KernelError {
    fn from(e: WireError) -> KernelError {
        KernelError::WireError(e)
    }
}

impl From<SourceError> for KernelError {
    fn from(e: SourceError) -> KernelError {
        KernelError::Source(e)
    }
}

pub struct Kernel {
    pub self_id: NodeId,
    pub name: Option<String>,
    control_addr: SocketAddr,
    flow_addr: SocketAddr,
    max_malformed_frames: u32,
    doctor_period: Duration,
    initial_health: u32,
    backoff_curve: crate::scale::ScalingCurve,

    node: Node,
    connections: RwLock<HashMap<NodeId, ConnectionRecord>>,
    icu: Icu,
    flow_transport: FlowTransport,
    players: PlayerRegistry,
    sources: SourceRegistry,

    pub flow_event: Event,
    pub overlay_event: Event,

    stop: AtomicBool,
}

impl Kernel {
    /// Binds the control listener and flow transport and returns the
    /// kernel without starting any background workers; call `start` to
    /// launch the accept loop, flow-processor pool, and doctor.
    pub fn bind(config: &NodeConfig) -> Result<Arc<Kernel>, KernelError> {
        let self_id = NodeId::generate();
        let flow_transport = FlowTransport::bind(config.flow_addr, config.queue_size)?;
        let kernel = Kernel {
            self_id,
            name: config.name.clone(),
            control_addr: config.control_addr,
            flow_addr: config.flow_addr,
            max_malformed_frames: config.max_malformed_frames,
            doctor_period: config.doctor_period(),
            initial_health: config.max_reconnect_attempts,
            backoff_curve: config.backoff_curve,
            node: Node::new(self_id),
            connections: RwLock::new(HashMap::new()),
            icu: Icu::new(),
            flow_transport,
            players: PlayerRegistry::new(),
            sources: SourceRegistry::new(),
            flow_event: Event::new(),
            overlay_event: Event::new(),
            stop: AtomicBool::new(false),
        };
        Ok(Arc::new(kernel))
    }

    /// Starts the accept loop, the flow-processor pool, and the
    /// connection doctor. Returns the listener's bound address.
    pub fn start(self: &Arc<Kernel>) -> Result<SocketAddr, KernelError> {
        let listener = TcpListener::bind(self.control_addr)?;
        let bound = listener.local_addr()?;

        {
            let kernel = self.clone();
            thread::spawn(move || kernel.accept_loop(listener));
        }
        for _ in 0..FLOW_PROCESSOR_POOL {
            let kernel = self.clone();
            thread::spawn(move || kernel.flow_processor_loop());
        }
        {
            let kernel = self.clone();
            thread::spawn(move || kernel.doctor_loop());
        }

        Ok(bound)
    }

    /// Broadcasts `stop`; background workers notice at their next
    /// suspension point and exit. Best-effort: in-flight work is not
    /// cancelled mid-iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.flow_transport.stop();
        self.icu.notify(); // wakes any supervisor asleep on an empty ICU
        let conns = self.connections.read();
        for rec in conns.values() {
            rec.conn.shutdown();
        }
    }

    fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    // ---- operator surface (§4.6 supplement) -------------------------

    /// Dials `addr`, runs the handshake as initiator, and on success
    /// installs the connection and spawns its control-loop worker.
    /// Fires `overlay_event` on success.
    pub fn connect(self: &Arc<Kernel>, addr: SocketAddr) -> Result<NodeId, KernelError> {
        if addr == self.control_addr {
            return Err(KernelError::SelfConnect);
        }
        let stream = TcpStream::connect(addr)?;
        let conn = Arc::new(ControlConn::new(stream)?);
        let auth = self.handshake(&conn)?;
        self.install_connection(auth.node_id, conn.clone(), addr, auth.flow_addr, auth.name.clone());
        self.seed_neighbour(auth.node_id);
        self.welcome(auth.node_id, &conn);
        {
            let kernel = self.clone();
            let id = auth.node_id;
            thread::spawn(move || kernel.control_loop(id, conn));
        }
        self.overlay_event.fire();
        Ok(auth.node_id)
    }

    /// Operator-initiated teardown: closes the connection and tells
    /// routing the neighbour is gone, but does **not** place it in the
    /// ICU (§4.6 state machine: `CONNECTED --operator disconnect--> absent`).
    pub fn disconnect(&self, neighbour: NodeId) {
        let removed = self.connections.write().remove(&neighbour);
        if let Some(rec) = removed {
            rec.conn.shutdown();
        }
        self.node.remove_neighbour(neighbour);
        self.overlay_event.fire();
    }

    /// Removes `neighbour` unconditionally, from either the connections
    /// map or the ICU.
    pub fn forget_neighbour(&self, neighbour: NodeId) {
        let removed = self.connections.write().remove(&neighbour);
        if let Some(rec) = removed {
            rec.conn.shutdown();
        }
        self.icu.discard(&neighbour);
        self.node.remove_neighbour(neighbour);
        self.overlay_event.fire();
    }

    /// Registers `source` as a local supply, opens its chunk producer,
    /// and spawns the dedicated streaming worker. Idempotent: yielding
    /// the same source twice returns the same key without a second
    /// worker (§8 boundary behaviour).
    pub fn yield_flow(self: &Arc<Kernel>, source: &str) -> Result<FlowKey, KernelError> {
        let key = FlowKey {
            flow_id: source.to_string(),
            origin: self.self_id,
        };
        if !self.sources.register(source) {
            return Ok(key);
        }
        let producer = self.sources.open(source)?;
        self.node.announcement(key.clone());
        self.broadcast_all(&Message::FlowAnnounce(key.clone()));

        {
            let kernel = self.clone();
            let key = key.clone();
            thread::spawn(move || kernel.streaming_loop(key, producer));
        }
        self.flow_event.fire();
        Ok(key)
    }

    /// Withdraws `key` locally. Only the flow's origin floods the
    /// withdrawal to neighbours; a non-origin caller just clears its own
    /// local bookkeeping and leaves the origin (and everyone else)
    /// untouched.
    pub fn withdraw_flow(&self, key: &FlowKey) {
        let is_origin = key.origin == self.self_id;
        if is_origin {
            self.sources.unregister(&key.flow_id);
        }
        if self.node.flows.remove(key).is_some() {
            self.players.cancel_flow(key);
            if is_origin {
                self.broadcast_all(&Message::FlowWithdraw(key.clone()));
            }
            self.flow_event.fire();
        }
    }

    /// `(connected, in-icu)` neighbour ids.
    pub fn get_neighbours(&self) -> (Vec<NodeId>, Vec<NodeId>) {
        let conns = self.connections.read();
        let active = conns
            .iter()
            .filter(|(_, rec)| rec.state == ConnectionState::Connected)
            .map(|(id, _)| *id)
            .collect();
        let inactive = conns
            .iter()
            .filter(|(_, rec)| rec.state == ConnectionState::TimedOut)
            .map(|(id, _)| *id)
            .collect();
        (active, inactive)
    }

    pub fn get_available_flows(&self) -> HashMap<String, crate::flow::FlowState> {
        self.node.flows.available_flows()
    }

    /// Resolves (and if needed requests) the cheapest known origin of
    /// `flow_id`, registers a player for it, and returns its id. `None`
    /// if the flow is entirely unknown (§7: unknown entity -> null).
    pub fn new_player(self: &Arc<Kernel>, flow_id: &str, sink: Box<dyn ChunkSink>) -> Option<PlayerId> {
        let (hop, key) = self.node.flow_request(flow_id, None)?;
        if let Some(hop) = hop {
            self.send_to(hop, &Message::FlowRequest(key.clone(), self.self_id));
        }
        let id = self.players.new_player(key, sink);
        self.flow_event.fire();
        Some(id)
    }

    pub fn remove_player(&self, id: PlayerId) {
        self.players.remove_player(id);
    }

    // ---- handshake (§4.6) -------------------------------------------

    fn handshake(&self, conn: &ControlConn) -> Result<Authentication, KernelError> {
        conn.send(&Message::Authentication(self.own_authentication()))?;
        let mut malformed = 0;
        loop {
            match conn.recv()? {
                Some(Message::Authentication(auth)) => return Ok(auth),
                Some(_other) => {
                    let _ = conn.send(&Message::AuthenticationRequired);
                    malformed += 1;
                    if malformed >= self.max_malformed_frames {
                        return Err(KernelError::HandshakeFailed);
                    }
                }
                None => return Err(KernelError::HandshakeFailed),
            }
        }
    }

    fn own_authentication(&self) -> Authentication {
        Authentication {
            node_id: self.self_id,
            flow_addr: self.flow_addr,
            name: self.name.clone(),
        }
    }

    fn install_connection(
        &self,
        neighbour: NodeId,
        conn: Arc<ControlConn>,
        control_addr: SocketAddr,
        flow_addr: SocketAddr,
        name: Option<String>,
    ) {
        self.connections.write().insert(
            neighbour,
            ConnectionRecord {
                conn,
                control_addr,
                flow_addr,
                name,
                state: ConnectionState::Connected,
            },
        );
        self.icu.discard(&neighbour);
    }

    /// A direct neighbour is reachable at `LINK_COST` the moment the
    /// control connection is up, without waiting for its first
    /// `DISTANCE_VECTOR` — seeds that route and re-gossips the resulting
    /// change (§3, `Node::new_neighbour`).
    fn seed_neighbour(&self, neighbour: NodeId) {
        if let Some(outcome) = self.node.new_neighbour(neighbour, LINK_COST) {
            self.apply_routing_outcome(Some(neighbour), outcome);
        }
    }

    fn welcome(&self, neighbour: NodeId, conn: &ControlConn) {
        let vector = self.node.routing.gen_distance_vector(neighbour);
        if !vector.is_empty() {
            let _ = conn.send(&Message::DistanceVector(vector));
        }
        let flows = self.node.flows.all_keys();
        if !flows.is_empty() {
            let _ = conn.send(&Message::FlowCollection(flows));
        }
    }

    // ---- accept loop --------------------------------------------------

    fn accept_loop(self: Arc<Kernel>, listener: TcpListener) {
        // Non-blocking with a short poll so `stop` is observed promptly
        // instead of leaving this thread parked in `accept` forever.
        if let Err(e) = listener.set_nonblocking(true) {
            warn!("failed to set listener non-blocking: {}", e);
        }
        loop {
            if self.is_stopping() {
                return;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted control connection from {}", peer);
                    let _ = stream.set_nonblocking(false);
                    let kernel = self.clone();
                    thread::spawn(move || kernel.accept_one(stream));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(200));
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    thread::sleep(Duration::from_millis(200));
                }
            }
        }
    }

    fn accept_one(self: Arc<Kernel>, stream: TcpStream) {
        let conn = match ControlConn::new(stream) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                warn!("failed to wrap accepted stream: {}", e);
                return;
            }
        };
        let auth = match self.handshake(&conn) {
            Ok(auth) => auth,
            Err(e) => {
                debug!("handshake failed: {}", e);
                return;
            }
        };
        self.install_connection(auth.node_id, conn.clone(), conn.peer_addr(), auth.flow_addr, auth.name.clone());
        self.seed_neighbour(auth.node_id);
        self.welcome(auth.node_id, &conn);
        self.overlay_event.fire();
        self.control_loop(auth.node_id, conn);
    }

    // ---- control loop per connection (§4.6) --------------------------

    fn control_loop(self: Arc<Kernel>, neighbour: NodeId, conn: Arc<ControlConn>) {
        loop {
            match conn.recv() {
                Ok(Some(msg)) => self.dispatch(neighbour, msg),
                Ok(None) => {
                    debug!("control connection to {} closed", neighbour);
                    self.on_connection_lost(neighbour);
                    return;
                }
                Err(e) => {
                    warn!("control read error from {}: {}", neighbour, e);
                    self.on_connection_lost(neighbour);
                    return;
                }
            }
        }
    }

    /// `CONNECTED --recv error / EOF--> TIMED_OUT`: parks the neighbour
    /// in the ICU and tells routing the neighbour is gone.
    fn on_connection_lost(&self, neighbour: NodeId) {
        if self.is_stopping() {
            self.connections.write().remove(&neighbour);
            return;
        }
        let removed = {
            let mut conns = self.connections.write();
            conns.get_mut(&neighbour).map(|rec| {
                rec.state = ConnectionState::TimedOut;
                (rec.control_addr, rec.flow_addr, rec.name.clone())
            })
        };
        if let Some((control_addr, flow_addr, name)) = removed {
            self.icu.park(neighbour, control_addr, flow_addr, name, self.initial_health);
        }
        self.node.remove_neighbour(neighbour);
        self.overlay_event.fire();
    }

    fn dispatch(&self, neighbour: NodeId, msg: Message) {
        match msg {
            Message::DistanceVector(vector) => self.on_distance_vector(neighbour, vector),
            Message::FlowCollection(keys) => self.on_flow_collection(neighbour, keys),
            Message::FlowAnnounce(key) => self.on_flow_announce(neighbour, key),
            Message::FlowRequest(key, destination) => self.on_flow_request(neighbour, key, destination),
            Message::FlowCancel(key, destination) => self.on_flow_cancel(neighbour, key, destination),
            Message::FlowWithdraw(key) => self.on_flow_withdraw(neighbour, key),
            Message::AuthenticationRequired => {
                self.send_to(neighbour, &Message::Authentication(self.own_authentication()));
            }
            Message::Authentication(_) | Message::PingRequest | Message::PingResponse => {
                trace!("ignoring unexpected post-handshake frame from {}", neighbour);
            }
        }
    }

    fn on_distance_vector(&self, neighbour: NodeId, vector: HashMap<NodeId, Cost>) {
        if let Some(outcome) = self.node.receive_distance_vector(neighbour, LINK_COST, &vector) {
            self.apply_routing_outcome(Some(neighbour), outcome);
        }
    }

    /// Shared by `on_distance_vector` and the initial seeding of a
    /// freshly connected neighbour (§4.6: "apply; on change, re-gossip
    /// to other neighbours, and to the source neighbour send back a
    /// `FLOW_COLLECTION` if the change requires flow recovery").
    fn apply_routing_outcome(&self, source: Option<NodeId>, outcome: RoutingOutcome) {
        let others: Vec<NodeId> = {
            let conns = self.connections.read();
            conns
                .iter()
                .filter(|(id, rec)| Some(**id) != source && rec.state == ConnectionState::Connected)
                .map(|(id, _)| *id)
                .collect()
        };
        for other in others {
            let projected = self.node.routing.gen_distance_vector(other);
            if !projected.is_empty() {
                self.send_to(other, &Message::DistanceVector(projected));
            }
        }

        if !outcome.losses.is_empty() {
            for key in &outcome.losses {
                if let Some(Some(hop)) = self.node.flow_recovery(key) {
                    self.send_to(hop, &Message::FlowRequest(key.clone(), self.self_id));
                }
            }
            if let Some(source) = source {
                let flows = self.node.flows.all_keys();
                if !flows.is_empty() {
                    self.send_to(source, &Message::FlowCollection(flows));
                }
            }
        }
    }

    fn on_flow_collection(&self, neighbour: NodeId, keys: HashSet<FlowKey>) {
        let inserted = self.node.flows.merge_collection(keys);
        if !inserted.is_empty() {
            self.flood_except(neighbour, &Message::FlowCollection(inserted));
            self.flow_event.fire();
        }
    }

    fn on_flow_announce(&self, neighbour: NodeId, key: FlowKey) {
        if self.node.announcement(key.clone()) {
            self.flood_except(neighbour, &Message::FlowAnnounce(key));
            self.flow_event.fire();
        }
    }

    fn on_flow_request(&self, neighbour: NodeId, key: FlowKey, destination: NodeId) {
        if let Some(hop) = self.node.handle_flow_request(&key, destination) {
            self.send_to(hop, &Message::FlowRequest(key, self.self_id));
        }
        let _ = neighbour;
    }

    fn on_flow_cancel(&self, neighbour: NodeId, key: FlowKey, destination: NodeId) {
        if let Some(hop) = self.node.handle_flow_cancel(&key, destination) {
            self.send_to(hop, &Message::FlowCancel(key, self.self_id));
        }
        let _ = neighbour;
    }

    fn on_flow_withdraw(&self, neighbour: NodeId, key: FlowKey) {
        if self.node.flows.remove(&key).is_some() {
            self.players.cancel_flow(&key);
            self.flood_except(neighbour, &Message::FlowWithdraw(key));
            self.flow_event.fire();
        }
    }

    fn send_to(&self, neighbour: NodeId, msg: &Message) {
        let conn = self.connections.read().get(&neighbour).map(|rec| rec.conn.clone());
        if let Some(conn) = conn {
            if let Err(e) = conn.send(msg) {
                warn!("failed to send to {}: {}", neighbour, e);
            }
        }
    }

    fn flood_except(&self, except: NodeId, msg: &Message) {
        let conns = self.connections.read();
        for (id, rec) in conns.iter() {
            if *id != except && rec.state == ConnectionState::Connected {
                let _ = rec.conn.send(msg);
            }
        }
    }

    fn broadcast_all(&self, msg: &Message) {
        let conns = self.connections.read();
        for rec in conns.values() {
            if rec.state == ConnectionState::Connected {
                let _ = rec.conn.send(msg);
            }
        }
    }

    // ---- data loop (§4.6) ---------------------------------------------

    fn flow_processor_loop(self: Arc<Kernel>) {
        loop {
            if self.is_stopping() {
                return;
            }
            match self.flow_transport.receive() {
                Some(datagram) => {
                    self.forward(
                        &datagram.header.key,
                        datagram.frame_number,
                        datagram.chunk,
                        datagram.header.destinations,
                    );
                }
                None => return,
            }
        }
    }

    /// Shared by the data loop and the streaming loop: groups
    /// `destinations` by next-hop gateway, forwards a datagram per
    /// gateway, and delivers locally if the local node is a destination.
    fn forward(&self, key: &FlowKey, frame_number: u64, chunk: Vec<u8>, destinations: HashSet<NodeId>) {
        let (grouped, unresolved) = self.node.routing.next_hops(&destinations);
        if !unresolved.is_empty() {
            trace!("{} unresolved destinations for {}, dropping", unresolved.len(), key);
        }

        for (gateway, group) in grouped {
            let flow_addr = self.connections.read().get(&gateway).map(|rec| rec.flow_addr);
            if let Some(flow_addr) = flow_addr {
                let header = FlowHeader {
                    key: key.clone(),
                    destinations: group.into_iter().collect(),
                };
                self.flow_transport.send(header, frame_number, chunk.clone(), flow_addr);
            }
        }

        if destinations.contains(&self.self_id) {
            self.players.deliver(key, frame_number, &chunk);
        }
    }

    // ---- streaming loop (§4.6) ------------------------------------------

    fn streaming_loop(self: Arc<Kernel>, key: FlowKey, mut producer: Box<dyn crate::registry::ChunkProducer>) {
        let frame_period = Duration::from_secs_f64(1.0 / f64::from(crate::codec::mjpeg::DEFAULT_FPS));
        loop {
            if self.is_stopping() {
                return;
            }
            if self.node.flows.await_active(&key).is_err() {
                return;
            }
            let (frame_number, bytes) = match producer.next_chunk() {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("source for {} failed: {}", key, e);
                    return;
                }
            };
            let destinations = self.node.flows.destinations(&key).unwrap_or_default();
            self.forward(&key, frame_number, bytes, destinations);
            thread::sleep(frame_period);
        }
    }

    // ---- connection doctor (§4.6) ---------------------------------------

    fn doctor_loop(self: Arc<Kernel>) {
        loop {
            if self.is_stopping() {
                return;
            }
            if self.icu.is_empty() {
                self.icu.wait_nonempty(self.doctor_period);
                continue;
            }
            thread::sleep(self.doctor_period);
            if self.is_stopping() {
                return;
            }
            for (id, entry) in self.icu.tick() {
                match self.reconnect(id, &entry) {
                    Ok(()) => info!("reconnected to {}", id),
                    Err(e) => {
                        debug!("reconnect to {} failed: {}", id, e);
                        if !self.icu.requeue_after_failure(id, entry, self.doctor_period, self.backoff_curve) {
                            info!("discarding neighbour {} after exhausting reconnect attempts", id);
                        }
                    }
                }
            }
        }
    }

    /// Redials the neighbour's remembered **control** endpoint (§9: the
    /// flow endpoint is a known quirk of the source this is grounded on,
    /// deliberately not reproduced here).
    fn reconnect(self: &Arc<Kernel>, expected: NodeId, entry: &crate::doctor::IcuEntry) -> Result<(), KernelError> {
        let stream = TcpStream::connect(entry.control_addr)?;
        let conn = Arc::new(ControlConn::new(stream)?);
        let auth = self.handshake(&conn)?;
        self.install_connection(auth.node_id, conn.clone(), entry.control_addr, auth.flow_addr, auth.name.clone());
        self.seed_neighbour(auth.node_id);
        self.welcome(auth.node_id, &conn);
        {
            let kernel = self.clone();
            let id = auth.node_id;
            thread::spawn(move || kernel.control_loop(id, conn));
        }
        self.overlay_event.fire();
        let _ = expected;
        Ok(())
    }
}
