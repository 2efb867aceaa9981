//! The overlay hub.
//!
//! A single task owns every piece of mutable state: message pool, routing
//! table, topic table, connection map, authenticator map. Pumps, the
//! listener, the timer, the file watcher and the stabilizer all talk to it
//! through one event channel, so no locks are needed anywhere.
//!
//! Every inbound frame runs through four stages in order:
//!
//! 1. **intercept**: registration-class requests are caught before anything
//!    rewrites fields a signature may cover;
//! 2. **flow control**: source/label/group annotation (anti-spoofing);
//! 3. **route**: next-hop selection under the permission policy;
//! 4. **process + deliver**: local command handlers, then queue/fan-out.

use crate::auth::{challenge_digest, Authenticator, CredentialStore};
use crate::connection::{flags, is_ephemeral, Connection, EphemeralIds};
use crate::error::Result;
use crate::events::{ConnCmd, FileEvent, HubEvent, WatchSlot, WATCH_SLOTS};
use crate::identity::Identity;
use crate::pki::{ENCRYPTED_LENGTH, SIGNATURE_LENGTH};
use crate::srp::{HASH_SIZE, NONCE_SIZE};
use crate::stabilizer::{self, StabilizerConfig};
use bytes::Bytes;
use flume::{Receiver, Sender};
use hashbrown::HashMap;
use rand::RngCore;
use smallvec::SmallVec;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use weft_core::config::{DEFAULT_CLIENT_QUEUE_LIMIT, DROP_THRESHOLD, HOP_LIMIT, NODE_CACHE_SIZE};
use weft_core::hosts::{HostAddress, Hosts};
use weft_core::message::{FLAG_INVALID, FLAG_PRIORITY, FLAG_TRAP};
use weft_core::node::{
    in_open_range, map_key, Node, CONTROLLER, KEY_BITS, MAX_ID, TABLE_SIZE,
};
use weft_core::pool::{MessagePool, MessageRef};
use weft_core::topics::Topics;
use weft_core::wire::{
    qualifier, Command, Header, ACCEPTED, HEADER_SIZE, MTU, REJECTED, REQUEST,
};

/// Everything the hub needs to know at startup.
#[derive(Debug, Clone)]
pub struct HubOptions {
    pub uid: u64,
    /// Accept new client registrations
    pub enroll: bool,
    /// Require client proofs / signed challenges
    pub authenticate: bool,
    /// Actively stabilize into the ring
    pub join: bool,
    /// Stabilization and maintenance tempo
    pub period: Duration,
    /// Activity and handshake deadline
    pub timeout: Duration,
    /// Wait after a stabilization error
    pub pause: Duration,
    /// Coarse group isolation for client traffic
    pub netmask: u64,
    /// This hub's group tag
    pub group: u8,
    /// Peer identifiers to try at startup
    pub bootstrap: Vec<u64>,
    pub message_pool: usize,
    pub connection_pool: usize,
    pub client_queue_limit: usize,
}

impl HubOptions {
    /// Defaults for a standalone hub (tests and closed rings).
    #[must_use]
    pub fn new(uid: u64) -> Self {
        Self {
            uid,
            enroll: true,
            authenticate: false,
            join: false,
            period: Duration::from_millis(weft_core::config::DEFAULT_PERIOD_MS),
            timeout: Duration::from_millis(weft_core::config::DEFAULT_TIMEOUT_MS),
            pause: Duration::from_millis(weft_core::config::DEFAULT_PAUSE_MS),
            netmask: 0,
            group: 0,
            bootstrap: Vec::new(),
            message_pool: weft_core::config::DEFAULT_MESSAGE_POOL_SIZE,
            connection_pool: weft_core::config::DEFAULT_CONNECTION_POOL_SIZE,
            client_queue_limit: DEFAULT_CLIENT_QUEUE_LIMIT,
        }
    }

    /// Options from a parsed settings file.
    pub fn from_settings(uid: u64, settings: &crate::settings::Settings) -> Result<Self> {
        Ok(Self {
            uid,
            enroll: settings.overlay.enroll,
            authenticate: settings.overlay.authenticate,
            join: settings.overlay.join,
            period: Duration::from_millis(settings.overlay.period),
            timeout: Duration::from_millis(settings.overlay.timeout),
            pause: Duration::from_millis(settings.overlay.pause),
            netmask: settings.netmask()?,
            group: settings.overlay.group,
            bootstrap: settings.bootstrap.nodes.clone(),
            message_pool: settings.limits.messages,
            connection_pool: settings.limits.connections,
            client_queue_limit: DEFAULT_CLIENT_QUEUE_LIMIT,
        })
    }
}

/// Operational counters surfaced by `null/describe`.
#[derive(Debug)]
pub struct Metrics {
    pub received_messages: u64,
    pub received_bytes: u64,
    pub dropped_messages: u64,
    pub dropped_bytes: u64,
    started: Instant,
}

impl Metrics {
    fn new() -> Self {
        Self {
            received_messages: 0,
            received_bytes: 0,
            dropped_messages: 0,
            dropped_bytes: 0,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Connection purge sweeps, run under resource pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMode {
    /// Ephemeral connections that never authenticated
    Temporary,
    /// Connections whose key no longer maps into this hub's half
    Invalid,
    /// Client connections, oldest idle first
    Client,
    /// Temporary, then clients if the target is not met
    Default,
}

#[derive(Debug, Default, Clone, Copy)]
struct WatchState {
    ignored: bool,
    modified: bool,
}

struct Worker {
    id: u64,
    header: Header,
}

struct NodeCache {
    index: usize,
    ids: [u64; NODE_CACHE_SIZE],
}

/// What the registration intercept decided to do with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistrationMode {
    /// Same identifier: just (re)activate, reply accepted
    Activate,
    /// New identifier; fail if it is already taken
    Fresh,
    /// New identifier; replace the holder on conflict
    Replace,
}

/// The overlay hub state machine.
///
/// `run` drives it from the event channel; `handle_event` is public so
/// embedders and tests can feed events synchronously.
pub struct OverlayHub {
    options: HubOptions,
    node: Node,
    pool: MessagePool,
    topics: Topics,
    connections: HashMap<u64, Connection>,
    /// Pump identifier -> current connection identifier. Pumps keep tagging
    /// events with the identifier assigned at accept time; registration only
    /// re-keys the hub side.
    aliases: HashMap<u64, u64>,
    authenticators: HashMap<u64, Authenticator>,
    credentials: Box<dyn CredentialStore>,
    identity: Identity,
    /// Keys the deterministic fake salt/nonce fabrication.
    secret: [u8; 32],
    worker: Worker,
    /// Pending handshake digests, one per finger plus the controller.
    sessions: [[u8; HASH_SIZE]; TABLE_SIZE + 1],
    cache: NodeCache,
    watch: [WatchState; WATCH_SLOTS],
    metrics: Metrics,
    events_tx: Sender<HubEvent>,
    events_rx: Receiver<HubEvent>,
    ids: EphemeralIds,
    /// Outgoing connects decided by maintenance; drained by `run`.
    pending_connects: Vec<(u64, HostAddress)>,
}

impl OverlayHub {
    pub fn new(
        options: HubOptions,
        identity: Identity,
        credentials: Box<dyn CredentialStore>,
    ) -> Result<Self> {
        let node = Node::new(options.uid)?;
        let (events_tx, events_rx) = flume::unbounded();
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let uid = options.uid;
        Ok(Self {
            pool: MessagePool::new(options.message_pool),
            node,
            topics: Topics::new(),
            connections: HashMap::new(),
            aliases: HashMap::new(),
            authenticators: HashMap::new(),
            credentials,
            identity,
            secret,
            worker: Worker {
                id: uid,
                header: Header::default(),
            },
            sessions: [[0; HASH_SIZE]; TABLE_SIZE + 1],
            cache: NodeCache {
                index: 0,
                ids: [0; NODE_CACHE_SIZE],
            },
            watch: [WatchState::default(); WATCH_SLOTS],
            metrics: Metrics::new(),
            events_tx,
            events_rx,
            ids: EphemeralIds::new(),
            pending_connects: Vec::new(),
            options,
        })
    }

    //=================================================================
    // Identifier predicates

    #[must_use]
    pub const fn uid(&self) -> u64 {
        self.options.uid
    }

    const fn is_host_id(&self, id: u64) -> bool {
        id == self.options.uid
    }

    const fn is_controller(id: u64) -> bool {
        id == CONTROLLER
    }

    /// Overlay nodes, controller included.
    const fn is_internal(id: u64) -> bool {
        id <= MAX_ID
    }

    const fn is_external(id: u64) -> bool {
        id > MAX_ID
    }

    const fn is_worker_id(&self, id: u64) -> bool {
        id == self.worker.id && !self.is_host_id(id)
    }

    const fn is_privileged(&self, id: u64) -> bool {
        Self::is_internal(id) || self.is_worker_id(id)
    }

    /// Part of the overlay network (controller excluded).
    #[must_use]
    pub const fn is_supernode(&self) -> bool {
        self.options.join && !Self::is_controller(self.options.uid)
    }

    //=================================================================
    // Introspection (embedders and tests)

    #[must_use]
    pub const fn node(&self) -> &Node {
        &self.node
    }

    #[must_use]
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    #[must_use]
    pub fn allocated_messages(&self) -> usize {
        self.pool.allocated()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_registered(&self, id: u64) -> bool {
        self.connections
            .get(&id)
            .is_some_and(|c| c.test_flags(flags::ACTIVE))
    }

    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn identity_mut(&mut self) -> &mut Identity {
        &mut self.identity
    }

    /// Sender feeding this hub's event loop (listener, watcher, signals).
    #[must_use]
    pub fn events(&self) -> Sender<HubEvent> {
        self.events_tx.clone()
    }

    /// The ephemeral identifier allocator shared with the listener.
    #[must_use]
    pub fn ids(&self) -> EphemeralIds {
        self.ids.clone()
    }

    /// Proxy connects queued by maintenance, for the driver to spawn.
    pub fn take_pending_connects(&mut self) -> Vec<(u64, HostAddress)> {
        std::mem::take(&mut self.pending_connects)
    }

    //=================================================================
    // Event loop

    /// Run until shutdown. On supernodes this also spawns the stabilizer
    /// thread and its channel bridge.
    pub async fn run(mut self) {
        use futures::{select, FutureExt};

        let stabilizer = self.install_service();
        if let Some((bytes_rx, handle)) = stabilizer {
            let _ = handle; // joined implicitly at process exit
            let worker_id = self.worker.id;
            let bridge_tx = self.events_tx.clone();
            compio::runtime::spawn(async move {
                while let Ok(data) = bytes_rx.recv_async().await {
                    if bridge_tx.send(HubEvent::Received { id: worker_id, data }).is_err() {
                        return;
                    }
                }
            })
            .detach();
        }

        info!(uid = self.uid(), supernode = self.is_supernode(), "hub running");
        let events = self.events_rx.clone();
        let period = self.options.period;
        loop {
            // Multiplex the event channel with the maintenance timer.
            let tick = compio::time::sleep(period).fuse();
            futures::pin_mut!(tick);
            let event = select! {
                event = events.recv_async().fuse() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
                () = tick => HubEvent::Tick,
            };
            if !self.handle_event(event) {
                break;
            }
            self.spawn_pending_connects();
        }

        info!(uid = self.uid(), "hub stopping");
        for conn in self.connections.values() {
            conn.close();
        }
        // Dropping the worker connection's sender wakes the stabilizer with
        // EOF; its thread exits on its own.
    }

    fn spawn_pending_connects(&mut self) {
        for (id, address) in self.take_pending_connects() {
            let events = self.events_tx.clone();
            compio::runtime::spawn(crate::pump::connect_proxy(id, address, events)).detach();
        }
    }

    /// Create the worker connection and the stabilizer wiring.
    ///
    /// Returns the hub-bound byte stream and the thread handle; `None` when
    /// this hub does not stabilize.
    fn install_service(&mut self) -> Option<(Receiver<Bytes>, std::thread::JoinHandle<()>)> {
        if !self.is_supernode() {
            return None;
        }
        let worker_id = self.ids.next();
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (out_tx, out_rx) = flume::unbounded();

        let mut conn = Connection::new(worker_id, cmd_tx, 0);
        conn.set_flags(flags::ACTIVE | flags::PRIORITY);
        conn.set_group(self.options.group);
        self.connections.insert(worker_id, conn);
        self.aliases.insert(worker_id, worker_id);
        self.worker.id = worker_id;

        let config = StabilizerConfig {
            uid: self.uid(),
            bootstrap: self.options.bootstrap.clone(),
            period: self.options.period,
            timeout: self.options.timeout,
            pause: self.options.pause,
        };
        let handle = stabilizer::spawn(config, cmd_rx, out_tx);
        info!(worker_id, "stabilizer installed");
        Some((out_rx, handle))
    }

    /// Process one event; `false` requests shutdown.
    pub fn handle_event(&mut self, event: HubEvent) -> bool {
        match event {
            HubEvent::Accepted { id, tx } => {
                self.handle_accept(id, tx);
                true
            }
            HubEvent::ProxyUp { id, tx } => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.tx = Some(tx);
                    conn.touch();
                    self.flush_connection(id);
                } else {
                    // Purged while connecting; drop the socket.
                    let _ = tx.send(ConnCmd::Close);
                }
                true
            }
            HubEvent::ProxyFailed { id } => {
                debug!(id, "proxy connect failed");
                self.disable(id);
                self.node.set_stable(false);
                true
            }
            HubEvent::Received { id, data } => {
                let id = self.resolve(id);
                self.handle_received(id, &data);
                true
            }
            HubEvent::Closed { id } => {
                let id = self.resolve(id);
                self.handle_close(id)
            }
            HubEvent::Tick => {
                self.sweep_deadlines();
                self.maintain();
                true
            }
            HubEvent::File { slot, event } => {
                self.update_settings(slot, event);
                true
            }
            HubEvent::Shutdown => false,
        }
    }

    fn handle_accept(&mut self, id: u64, tx: Sender<ConnCmd>) {
        if self.connections.len() >= self.options.connection_pool {
            let needed = self.connections.len() + 1 - self.options.connection_pool;
            self.purge(PurgeMode::Default, needed as u32);
        }
        if self.connections.len() >= self.options.connection_pool {
            warn!(id, "connection pool exhausted, refusing accept");
            let _ = tx.send(ConnCmd::Close);
            return;
        }
        let conn = Connection::new(id, tx, self.options.client_queue_limit);
        self.connections.insert(id, conn);
        self.aliases.insert(id, id);
    }

    /// Current identifier of the connection a pump event refers to.
    fn resolve(&self, pump_id: u64) -> u64 {
        self.aliases.get(&pump_id).copied().unwrap_or(pump_id)
    }

    fn handle_close(&mut self, id: u64) -> bool {
        if self.is_worker_id(id) {
            // The stabilizer channel failed; nothing sane is left to do.
            warn!("worker connection lost, shutting down");
            return false;
        }
        self.disable(id);
        true
    }

    /// Tear a connection down and undo every registration side effect.
    fn disable(&mut self, id: u64) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };
        conn.close();
        self.aliases.remove(&conn.pump_id);
        for m in conn.out {
            self.pool.release(m);
        }
        if Self::is_internal(id) {
            self.node.update(id, false);
        }
        if conn.topics.any() {
            self.topics.remove_all(&conn.topics, id);
        }
        self.authenticators.remove(&id);
        debug!(id, "connection disabled");
    }

    //=================================================================
    // Frame ingestion

    fn handle_received(&mut self, id: u64, data: &[u8]) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.decoder.push(data);
        conn.touch();

        let mut frames: SmallVec<[Bytes; 4]> = SmallVec::new();
        let mut malformed = false;
        let mut close = false;
        loop {
            match conn.decoder.decode() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(_) => {
                    conn.decoder.clear();
                    malformed = true;
                    close = conn.count_drop(DROP_THRESHOLD);
                    break;
                }
            }
        }
        if malformed {
            self.metrics.dropped_messages += 1;
        }

        for frame in frames {
            self.ingest(id, &frame);
        }
        if close {
            debug!(id, "malformed frame threshold crossed");
            self.disable(id);
        }
    }

    fn ingest(&mut self, id: u64, frame: &[u8]) {
        self.metrics.received_messages += 1;
        self.metrics.received_bytes += frame.len() as u64;

        let mut handle = self.pool.alloc(id);
        if handle.is_none() {
            // Exhaustion: purge and retry once, then drop the frame.
            self.purge(PurgeMode::Default, 2);
            self.node.set_stable(false);
            handle = self.pool.alloc(id);
        }
        let Some(m) = handle else {
            self.metrics.dropped_messages += 1;
            self.metrics.dropped_bytes += frame.len() as u64;
            return;
        };

        let group = self.connections.get(&id).map_or(0, Connection::group);
        {
            let msg = self.pool.get_mut(m);
            if msg.load_frame(frame).is_err() {
                // The decoder bounds lengths; this only fires on a header
                // that disagrees with itself.
                self.pool.release(m);
                self.metrics.dropped_messages += 1;
                return;
            }
            msg.set_group(group);
        }
        self.route(m);
    }

    //=================================================================
    // The four-stage pipeline

    fn route(&mut self, m: MessageRef) {
        if self.intercept(m) {
            self.pool.get_mut(m).set_group(0);
        } else {
            self.apply_flow_control(m);
            self.create_route(m);
            let msg = self.pool.get(m);
            if self.is_host_id(msg.destination()) && !msg.test_flags(FLAG_INVALID) {
                self.process(m);
                self.pool.get_mut(m).set_group(0);
            }
        }

        // Internal labels never leave the hub.
        let destination = self.pool.get(m).destination();
        if Self::is_external(destination) && !self.is_worker_id(destination) {
            self.pool.get_mut(m).write_label(0);
        }
        self.dispatch(m);
    }

    /// Registration-class requests bypass annotation and routing: the
    /// signature covers fields those stages would rewrite.
    fn intercept(&mut self, m: MessageRef) -> bool {
        let msg = self.pool.get(m);
        if msg.command() != Command::Basic as u8 {
            return false;
        }
        match msg.qualifier() {
            qualifier::REGISTER => {
                self.handle_registration_request(m);
                true
            }
            qualifier::TOKEN => {
                self.handle_token_request(m);
                true
            }
            _ => false,
        }
    }

    fn apply_flow_control(&mut self, m: MessageRef) {
        let origin = self.pool.get(m).origin();
        if self.is_worker_id(origin) {
            // Tag the round trip and snapshot for response validation.
            let label = self.worker.id.wrapping_add(self.uid());
            self.pool.get_mut(m).put_label(label);
            self.worker.header = *self.pool.get(m).header();
        } else if Self::is_external(origin) {
            // The group rides the label while in transit; the source field
            // always names the connection it came from (anti-spoofing).
            let msg = self.pool.get_mut(m);
            let group = msg.group();
            msg.write_label(u64::from(group));
            msg.put_source(origin);
        } else if Self::is_external(self.pool.get(m).source()) {
            // In transit from a peer: recover the group for multicast.
            let msg = self.pool.get_mut(m);
            let label = msg.label();
            msg.set_group(label as u8);
        } else {
            let source = self.pool.get(m).source();
            self.cache_node(source);
        }
    }

    fn create_route(&mut self, m: MessageRef) {
        let (origin, destination) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.destination())
        };

        if self.is_worker_id(origin) {
            if !self.is_host_id(destination) {
                // Stabilization request leaves via the controller.
                self.pool.get_mut(m).set_destination(CONTROLLER);
            }
        } else if Self::is_controller(origin) && self.is_valid_stabilization_response(m) {
            // Stabilization response returns to the worker.
            let worker_id = self.worker.id;
            self.pool.get_mut(m).set_destination(worker_id);
        } else if self.permit(origin, destination) {
            let gateway = self.gateway(destination);
            self.pool.get_mut(m).set_destination(gateway);
        } else {
            // Highly likely a miscommunication.
            let miscommunication =
                !(self.is_host_id(destination) || Self::is_controller(destination));
            let uid = self.options.uid;
            let msg = self.pool.get_mut(m);
            if miscommunication {
                msg.set_flags(FLAG_INVALID);
            }
            msg.set_destination(uid);
        }

        // Loop guard: every forwarding decision costs a hop.
        let uid = self.uid();
        let msg = self.pool.get_mut(m);
        if msg.destination() != uid && msg.bump_hops() > HOP_LIMIT {
            msg.set_flags(FLAG_INVALID);
            msg.set_destination(uid);
        }
    }

    /// Next hop toward `destination`: itself when the key is local or the
    /// controller, else a ring shortcut through the closest live finger.
    fn gateway(&self, destination: u64) -> u64 {
        let key = map_key(destination);
        if !self.node.is_local(key) && !Self::is_controller(destination) {
            self.node.next_hop(key)
        } else {
            destination
        }
    }

    /// The netmask-gated permission policy.
    fn permit(&self, source: u64, destination: u64) -> bool {
        let active = !is_ephemeral(source) && !is_ephemeral(destination);
        let destination_ok =
            !(Self::is_controller(destination) || self.is_worker_id(destination));
        // Clients reach peers only through the controller's mediation.
        let privilege = Self::is_controller(self.uid())
            || !(Self::is_external(source) && Self::is_internal(destination));
        active && destination_ok && privilege && self.check_mask(source, destination)
    }

    fn check_mask(&self, source: u64, destination: u64) -> bool {
        Self::is_internal(source)
            || (source & self.options.netmask) == (destination & self.options.netmask)
    }

    fn is_valid_stabilization_response(&self, m: MessageRef) -> bool {
        let msg = self.pool.get(m);
        let snapshot = &self.worker.header;
        msg.status() != REQUEST
            && msg.label() == snapshot.label
            && self.is_host_id(msg.destination())
            && msg.sequence() == snapshot.sequence
            && msg.session() == snapshot.session
            && msg.command() == snapshot.command
            && msg.qualifier() == snapshot.qualifier
    }

    //=================================================================
    // Local processing

    fn process(&mut self, m: MessageRef) {
        let command = self.pool.get(m).command();
        match Command::from_raw(command) {
            Some(Command::Null) => self.process_null_request(m),
            Some(Command::Basic) => self.process_basic_request(m),
            Some(Command::Multicast) => self.process_multicast_request(m),
            Some(Command::Node) => self.process_node_request(m),
            Some(Command::Overlay) => self.process_overlay_request(m),
            None => self.handle_invalid_request(m),
        }
    }

    fn process_null_request(&mut self, m: MessageRef) {
        let (origin, qlf, status) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.qualifier(), msg.status())
        };
        if status != REQUEST {
            return self.handle_invalid_request(m);
        }
        match qlf {
            qualifier::IDENTIFY if is_ephemeral(origin) => self.handle_identify_request(m),
            qualifier::AUTHENTICATE if is_ephemeral(origin) => {
                self.handle_authenticate_request(m);
            }
            qualifier::DESCRIBE if self.is_privileged(origin) => {
                self.handle_describe_request(m);
            }
            _ => self.handle_invalid_request(m),
        }
    }

    fn process_basic_request(&mut self, m: MessageRef) {
        let (qlf, status) = {
            let msg = self.pool.get(m);
            (msg.qualifier(), msg.status())
        };
        match qlf {
            qualifier::FINDROOT => self.handle_findroot_request(m),
            qualifier::BOOTSTRAP if status == REQUEST => self.handle_bootstrap_request(m),
            _ => self.handle_invalid_request(m),
        }
    }

    fn process_multicast_request(&mut self, m: MessageRef) {
        let (origin, qlf, status) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.qualifier(), msg.status())
        };
        // Multicast is a standalone-hub facility for registered clients.
        if self.is_supernode()
            || Self::is_internal(origin)
            || is_ephemeral(origin)
            || status != REQUEST
        {
            return self.handle_invalid_request(m);
        }
        match qlf {
            qualifier::PUBLISH => self.handle_publish_request(m),
            qualifier::SUBSCRIBE => self.handle_subscribe_request(m),
            qualifier::UNSUBSCRIBE => self.handle_unsubscribe_request(m),
            _ => self.handle_invalid_request(m),
        }
    }

    fn process_node_request(&mut self, m: MessageRef) {
        let (origin, qlf, status) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.qualifier(), msg.status())
        };
        if !self.is_privileged(origin) || status != REQUEST {
            return self.handle_invalid_request(m);
        }
        match qlf {
            qualifier::GET_PREDECESSOR => self.handle_get_predecessor_request(m),
            qualifier::SET_PREDECESSOR => self.handle_set_predecessor_request(m),
            qualifier::GET_SUCCESSOR => self.handle_get_successor_request(m),
            qualifier::SET_SUCCESSOR => self.handle_set_successor_request(m),
            qualifier::GET_FINGER => self.handle_get_finger_request(m),
            qualifier::SET_FINGER => self.handle_set_finger_request(m),
            qualifier::GET_NEIGHBOURS => self.handle_get_neighbours_request(m),
            qualifier::NOTIFY => self.handle_notify_request(m),
            _ => self.handle_invalid_request(m),
        }
    }

    fn process_overlay_request(&mut self, m: MessageRef) {
        let (origin, qlf, status) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.qualifier(), msg.status())
        };
        if !self.is_privileged(origin) || status != REQUEST {
            return self.handle_invalid_request(m);
        }
        match qlf {
            qualifier::FIND_SUCCESSOR => self.handle_find_successor_request(m),
            qualifier::PING => self.handle_ping_request(m),
            qualifier::MAP => self.handle_map_request(m),
            _ => self.handle_invalid_request(m),
        }
    }

    /// Malformed or out-of-order request: a rejected null reply for fresh
    /// requests, a silent sink for stray responses.
    fn handle_invalid_request(&mut self, m: MessageRef) {
        let uid = self.uid();
        let msg = self.pool.get_mut(m);
        if msg.status() == REQUEST {
            let origin = msg.origin();
            let source = msg.source();
            msg.put_command(Command::Null as u8);
            msg.put_qualifier(qualifier::NULL);
            msg.put_status(REJECTED);
            msg.put_length(HEADER_SIZE as u16);
            msg.put_source(uid);
            msg.write_destination(source);
            msg.set_destination(origin);
        } else {
            msg.set_flags(FLAG_INVALID);
            msg.set_destination(uid);
        }
    }

    /// Point a processed message straight back at its origin.
    fn build_direct_response(&mut self, m: MessageRef, length: u16) {
        let uid = self.uid();
        let msg = self.pool.get_mut(m);
        let origin = msg.origin();
        let source = msg.source();
        msg.set_destination(origin);
        msg.write_destination(source);
        msg.put_source(uid);
        if length != 0 {
            msg.put_length(length);
        }
    }

    //=================================================================
    // Authentication and information

    fn handle_identify_request(&mut self, m: MessageRef) {
        let (origin, identity, nonce_len) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.source(), msg.payload_length())
        };
        // One authenticator per connection, ever.
        if nonce_len == 0 || self.authenticators.contains_key(&origin) {
            return self.handle_invalid_request(m);
        }
        let Some(nonce) = self.pool.get(m).data_bytes(0, nonce_len).map(<[u8]>::to_vec) else {
            return self.handle_invalid_request(m);
        };

        let (auth, salt, host_nonce) =
            Authenticator::identify(self.credentials.as_ref(), &self.secret, identity, &nonce);
        self.authenticators.insert(origin, auth);

        // salt ∥ B; the client recovers the salt as everything before the
        // fixed-size nonce.
        let total = salt.len() + host_nonce.len();
        if host_nonce.len() != NONCE_SIZE || HEADER_SIZE + total > MTU {
            return self.handle_invalid_request(m);
        }
        self.build_direct_response(m, (HEADER_SIZE + total) as u16);
        let msg = self.pool.get_mut(m);
        msg.set_data_bytes(0, &salt);
        msg.set_data_bytes(salt.len(), &host_nonce);
        msg.write_source(0);
        msg.put_status(ACCEPTED);
    }

    fn handle_authenticate_request(&mut self, m: MessageRef) {
        let (origin, proof_len) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.payload_length())
        };
        let Some(proof) = self
            .pool
            .get(m)
            .data_bytes(0, proof_len)
            .map(<[u8]>::to_vec)
        else {
            return self.handle_invalid_request(m);
        };

        let response = self
            .authenticators
            .get_mut(&origin)
            .and_then(|auth| auth.authenticate(&proof));
        match response {
            Some(host_proof) => {
                self.build_direct_response(m, (HEADER_SIZE + host_proof.len()) as u16);
                let msg = self.pool.get_mut(m);
                msg.set_data_bytes(0, &host_proof);
                msg.write_source(0);
                msg.put_status(ACCEPTED);
            }
            None => {
                // One failed attempt burns the connection's entry.
                self.authenticators.remove(&origin);
                self.handle_invalid_request(m);
            }
        }
    }

    fn handle_describe_request(&mut self, m: MessageRef) {
        if self.pool.get(m).length() as usize != HEADER_SIZE {
            return self.handle_invalid_request(m);
        }

        let uid = self.uid();
        let pool_size = self.pool.capacity() as u32;
        let pool_allocated = self.pool.allocated() as u32;
        let conn_size = self.options.connection_pool as u32;
        let conn_allocated = self.connections.len() as u32;
        let uptime = self.metrics.uptime().as_secs_f64();
        let received_messages = self.metrics.received_messages;
        let received_bytes = self.metrics.received_bytes;
        let dropped_messages = self.metrics.dropped_messages;
        let dropped_bytes = self.metrics.dropped_bytes;
        let predecessor = self.node.predecessor();
        let successor = self.node.successor();
        let stable = u8::from(self.node.is_stable());

        let fingers: SmallVec<[(u64, u64, u64, u8); TABLE_SIZE]> = (0..TABLE_SIZE)
            .filter_map(|i| self.node.finger(i))
            .map(|f| (f.start(), f.id(), f.old_id(), u8::from(f.connected())))
            .collect();

        self.build_direct_response(m, 0);
        let msg = self.pool.get_mut(m);
        let mut index = 0;
        // ID(8) MTU(2) MAX_CONN(4) CONN(4) MAX_MSGS(4) MSGS(4) UPTIME(8)
        msg.set_data64(index, uid);
        index += 8;
        msg.set_data16(index, MTU as u16);
        index += 2;
        msg.set_data32(index, conn_size);
        index += 4;
        msg.set_data32(index, conn_allocated);
        index += 4;
        msg.set_data32(index, pool_size);
        index += 4;
        msg.set_data32(index, pool_allocated);
        index += 4;
        msg.set_double(index, uptime);
        index += 8;
        // IN_PACKETS(8) IN_BYTES(8) DROPPED_PACKETS(8) DROPPED_BYTES(8)
        msg.set_data64(index, received_messages);
        index += 8;
        msg.set_data64(index, received_bytes);
        index += 8;
        msg.set_data64(index, dropped_messages);
        index += 8;
        msg.set_data64(index, dropped_bytes);
        index += 8;
        // PREDECESSOR(8) SUCCESSOR(8) STABLE(1) TABLE_SIZE(1)
        msg.set_data64(index, predecessor);
        index += 8;
        msg.set_data64(index, successor);
        index += 8;
        msg.set_data8(index, stable);
        index += 1;
        msg.set_data8(index, TABLE_SIZE as u8);
        index += 1;
        // START(8) ID(8) OLD_ID(8) CONNECTED(1) per finger
        for (start, id, old_id, connected) in fingers {
            msg.set_data64(index, start);
            index += 8;
            msg.set_data64(index, id);
            index += 8;
            msg.set_data64(index, old_id);
            index += 8;
            msg.set_data8(index, connected);
            index += 1;
        }
        msg.put_length((HEADER_SIZE + index) as u16);
        msg.put_status(ACCEPTED);
    }

    //=================================================================
    // Connection management (intercept stage)

    fn handle_registration_request(&mut self, m: MessageRef) {
        let (origin, requested, status) = {
            let msg = self.pool.get_mut(m);
            msg.set_flags(FLAG_TRAP);
            (msg.origin(), msg.source(), msg.status())
        };

        // [PROXY ESTABLISHMENT] a response over one of our own outgoing
        // connections completes (or breaks) the peer handshake.
        let proxy = self
            .connections
            .get(&origin)
            .is_some_and(|c| c.test_flags(flags::PROXY));
        if proxy && status != REQUEST {
            if status == ACCEPTED {
                self.activate_proxy(origin);
            } else {
                debug!(origin, "peer rejected our registration");
                self.disable(origin);
                self.node.update(origin, false);
                self.node.set_stable(false);
            }
            let uid = self.uid();
            let msg = self.pool.get_mut(m);
            msg.set_flags(FLAG_INVALID);
            msg.set_destination(uid);
            return;
        }

        let approved = self.is_valid_registration_request(m);
        self.pool.get_mut(m).set_source(origin);

        let enrolled = approved && self.enroll(m, origin, requested);
        let msg = self.pool.get_mut(m);
        if enrolled {
            debug!(origin, requested, "registration approved");
            // Accepted: the reply goes out on the new identifier.
            msg.write_source(0);
            msg.write_destination(0);
            msg.set_destination(requested);
            msg.put_length(HEADER_SIZE as u16);
            msg.put_status(ACCEPTED);
        } else {
            debug!(origin, requested, "registration denied");
            // Denied: the regret goes out on the old identifier, then the
            // connection closes behind it.
            msg.write_source(0);
            msg.write_destination(0);
            msg.set_destination(origin);
            msg.put_length(HEADER_SIZE as u16);
            msg.put_status(REJECTED);
            if let Some(conn) = self.connections.get_mut(&origin) {
                conn.set_flags(flags::INVALID);
            }
        }
    }

    /// Identity switch on the connection. Returns `false` when the
    /// connection was deactivated instead.
    fn enroll(&mut self, m: MessageRef, origin: u64, requested: u64) -> bool {
        if !self.options.enroll || self.pool.get(m).status() != REQUEST {
            return false;
        }
        let Some(mode) = self.registration_mode(origin, requested) else {
            return false;
        };

        // Group tag: the proven one when the client authenticated, else the
        // session byte of the request. Captured before the authenticator
        // entry goes away with the ephemeral identity.
        let session_group = self.pool.get(m).session();
        let group = self
            .authenticators
            .get(&origin)
            .filter(|a| a.is_authenticated())
            .map_or(session_group, Authenticator::group);

        match mode {
            RegistrationMode::Activate => {
                // Idempotent re-registration.
                if let Some(conn) = self.connections.get_mut(&origin) {
                    conn.set_flags(flags::ACTIVE);
                    conn.set_group(group);
                }
                self.on_registration(requested);
                true
            }
            RegistrationMode::Fresh if self.connections.contains_key(&requested) => {
                self.disable(origin);
                false
            }
            RegistrationMode::Fresh | RegistrationMode::Replace => {
                if self.connections.contains_key(&requested) {
                    self.disable(requested);
                }
                let Some(mut conn) = self.connections.remove(&origin) else {
                    return false;
                };
                conn.id = requested;
                conn.set_flags(flags::ACTIVE);
                conn.set_group(group);
                self.aliases.insert(conn.pump_id, requested);
                self.connections.insert(requested, conn);
                self.authenticators.remove(&origin);
                self.on_registration(requested);
                true
            }
        }
    }

    /// Flag and queue adjustments for freshly registered connections.
    fn on_registration(&mut self, id: u64) {
        if !self.is_supernode() && !Self::is_controller(self.uid()) {
            return;
        }
        let worker = self.is_worker_id(id);
        if let Some(conn) = self.connections.get_mut(&id) {
            if Self::is_controller(id) || worker {
                conn.set_flags(flags::PRIORITY);
                conn.limit = 0;
            } else if Self::is_internal(id) {
                conn.set_flags(flags::OVERLAY);
                conn.limit = 0;
                self.node.update(id, true);
            }
        }
    }

    fn is_valid_registration_request(&mut self, m: MessageRef) -> bool {
        let msg = self.pool.get(m);
        let origin = msg.origin();
        let requested = msg.source();

        if !self.allow_registration(origin, requested) {
            return false;
        }
        // Open enrollment for clients when proofs are not required.
        if !self.options.authenticate && Self::is_external(requested) {
            return true;
        }
        // A client that completed the SRP handshake for this identity.
        if Self::is_external(requested)
            && self
                .authenticators
                .get(&origin)
                .is_some_and(|a| a.is_authenticated() && a.identity() == requested)
        {
            return true;
        }
        // Without key material there is nothing left to check.
        if !self.identity.pki().has_public() {
            return true;
        }
        // A registered connection reasserting its own identity.
        if origin == requested && self.is_registered(origin) {
            return true;
        }
        // Challenge possession: the token-step digest plus a frame signature.
        let msg = self.pool.get(m);
        if msg.payload_length() == HASH_SIZE + SIGNATURE_LENGTH {
            let Some(digest) = msg.data_bytes(0, HASH_SIZE) else {
                return false;
            };
            digest == challenge_digest(origin, self.uid())
                && self.identity.pki().verify_message(msg)
        } else {
            false
        }
    }

    fn allow_registration(&self, source: u64, requested: u64) -> bool {
        if !self.options.enroll {
            return false;
        }
        // An established connection may reassert its own identity (an
        // accepted no-op); otherwise only fresh connections register, and
        // only onto a real id.
        if !is_ephemeral(source) {
            return source == requested && self.is_registered(source);
        }
        if is_ephemeral(requested) {
            return false;
        }
        if self.is_host_id(requested)
            || Self::is_controller(requested)
            || self.is_worker_id(requested)
        {
            return false;
        }
        // Requested client ids must map into this hub's half of the ring.
        if Self::is_external(requested) && !self.node.is_local(map_key(requested)) {
            return false;
        }
        true
    }

    fn registration_mode(&self, old: u64, new: u64) -> Option<RegistrationMode> {
        if self.is_host_id(new) || self.is_worker_id(new) {
            None
        } else if old == new {
            Some(RegistrationMode::Activate)
        } else if Self::is_internal(new) {
            // Precedence when both sides connect at once: the numerically
            // smaller identifier wins. Both ends apply the same rule.
            Some(if new < self.uid() {
                RegistrationMode::Fresh
            } else {
                RegistrationMode::Replace
            })
        } else {
            // Keep a few slots free for internal connections on supernodes.
            let slack = self.options.connection_pool - self.connections.len();
            let reserved = self.is_supernode() && slack <= TABLE_SIZE;
            if self.node.is_local(map_key(new)) && !reserved {
                Some(RegistrationMode::Replace)
            } else {
                None
            }
        }
    }

    /// A proxy link completed its register exchange; bring it up.
    fn activate_proxy(&mut self, id: u64) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.clear_flags(flags::PROXY);
            conn.set_flags(flags::ACTIVE);
            conn.touch();
        }
        self.on_registration(id);
        debug!(id, "proxy connection active");
    }

    fn handle_token_request(&mut self, m: MessageRef) {
        let (origin, status, payload_len) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.status(), msg.payload_length())
        };

        // [PROXY ESTABLISHMENT] the nonce pair came back; answer with a
        // signed registration request over the same link.
        let proxy = self
            .connections
            .get(&origin)
            .is_some_and(|c| c.test_flags(flags::PROXY));
        if proxy && status != REQUEST {
            return self.complete_token_exchange(m, origin, status, payload_len);
        }

        let uid = self.uid();
        if is_ephemeral(origin) && payload_len <= HASH_SIZE {
            // Plain challenge: append our digest after the caller's nonce.
            let digest = challenge_digest(origin, uid);
            let msg = self.pool.get_mut(m);
            if !msg.append_bytes(&digest) {
                return self.handle_invalid_request(m);
            }
            msg.put_source(uid);
            msg.write_source(0);
            msg.write_destination(0);
            msg.set_destination(origin);
            msg.put_status(ACCEPTED);
        } else if is_ephemeral(origin)
            && payload_len == ENCRYPTED_LENGTH
            && self.options.authenticate
            && self.identity.pki().has_private()
        {
            // Sealed challenge: recover the caller's nonce, pair it with our
            // digest and sign the reply.
            let Some(cipher) = self.pool.get(m).data_bytes(0, ENCRYPTED_LENGTH).map(<[u8]>::to_vec)
            else {
                return self.handle_invalid_request(m);
            };
            let Ok(challenge) = self.identity.pki().decrypt(&cipher) else {
                return self.handle_invalid_request(m);
            };
            if challenge.len() != HASH_SIZE {
                return self.handle_invalid_request(m);
            }
            let digest = challenge_digest(origin, uid);
            let msg = self.pool.get_mut(m);
            msg.set_data_bytes(0, &challenge);
            msg.set_data_bytes(HASH_SIZE, &digest);
            msg.put_length((HEADER_SIZE + 2 * HASH_SIZE) as u16);
            msg.put_source(uid);
            msg.write_source(0);
            msg.write_destination(0);
            msg.set_destination(origin);
            msg.put_status(ACCEPTED);
            let pki = self.identity.pki().clone();
            if !pki.sign_message(self.pool.get_mut(m)) {
                return self.handle_invalid_request(m);
            }
        } else {
            let msg = self.pool.get_mut(m);
            msg.put_source(uid);
            msg.write_source(0);
            msg.write_destination(0);
            msg.set_destination(origin);
            msg.put_length(HEADER_SIZE as u16);
            msg.put_status(REJECTED);
        }
    }

    fn complete_token_exchange(
        &mut self,
        m: MessageRef,
        origin: u64,
        status: u8,
        payload_len: usize,
    ) {
        if status != ACCEPTED {
            return self.handle_invalid_request(m);
        }
        if !(payload_len == 2 * HASH_SIZE || payload_len == 2 * HASH_SIZE + SIGNATURE_LENGTH) {
            return self.handle_invalid_request(m);
        }
        if self.options.authenticate && !self.identity.pki().verify_message(self.pool.get(m)) {
            return self.handle_invalid_request(m);
        }
        let Some(our_nonce) = self.pool.get(m).data_bytes(0, HASH_SIZE).map(<[u8]>::to_vec)
        else {
            return self.handle_invalid_request(m);
        };
        if self.nonce_to_id(&our_nonce) != origin {
            return self.handle_invalid_request(m);
        }
        let Some(their_nonce) = self
            .pool
            .get(m)
            .data_bytes(HASH_SIZE, HASH_SIZE)
            .map(<[u8]>::to_vec)
        else {
            return self.handle_invalid_request(m);
        };

        // Rewrite the message into our registration request.
        let uid = self.uid();
        let sequence = self.pool.get(m).sequence();
        let msg = self.pool.get_mut(m);
        msg.build(Header {
            label: 0,
            source: uid,
            destination: origin,
            length: HEADER_SIZE as u16,
            sequence,
            session: 0,
            command: Command::Basic as u8,
            qualifier: qualifier::REGISTER,
            status: REQUEST,
        });
        if !msg.append_bytes(&their_nonce) {
            return self.handle_invalid_request(m);
        }
        let pki = self.identity.pki().clone();
        if !pki.sign_message(self.pool.get_mut(m)) {
            return self.handle_invalid_request(m);
        }
        self.pool.get_mut(m).set_destination(origin);
    }

    /// Which peer the pending-handshake digest belongs to.
    fn nonce_to_id(&self, nonce: &[u8]) -> u64 {
        for (i, session) in self.sessions.iter().enumerate() {
            if session[..] == *nonce {
                return if i < TABLE_SIZE {
                    self.node.get(i).unwrap_or(self.uid())
                } else {
                    CONTROLLER
                };
            }
        }
        self.uid()
    }

    fn handle_findroot_request(&mut self, m: MessageRef) {
        let (origin, source, status) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.source(), msg.status())
        };

        // A result came home: unwrap the stashed addressing and deliver.
        if status == ACCEPTED {
            let msg = self.pool.get(m);
            if Self::is_internal(origin) && msg.payload_length() == 4 * 8 {
                let final_destination = msg.data64(16).unwrap_or(0);
                let original_source = msg.data64(24).unwrap_or(0);
                let msg = self.pool.get_mut(m);
                msg.put_length((HEADER_SIZE + 2 * 8) as u16);
                msg.set_destination(final_destination);
                msg.write_source(0);
                if Self::is_controller(final_destination) {
                    msg.write_destination(original_source);
                } else {
                    msg.write_destination(0);
                }
            } else {
                self.handle_invalid_request(m);
            }
            return;
        }

        let Some(query) = self.pool.get(m).data64(0) else {
            return self.handle_invalid_request(m);
        };
        let local_successor = self.node.local_successor(map_key(query));

        if local_successor.is_some() || Self::is_controller(self.uid()) {
            // Found: answer with self (or the controller's own key).
            let answer = local_successor.unwrap_or(CONTROLLER);
            self.pool.get_mut(m).set_data64(8, answer);
            self.pool.get_mut(m).put_status(ACCEPTED);
            if Self::is_external(origin)
                || Self::is_controller(self.uid())
                || Self::is_controller(origin)
            {
                // Initiated here: direct response.
                let uid = self.uid();
                let msg = self.pool.get_mut(m);
                msg.put_length((HEADER_SIZE + 2 * 8) as u16);
                msg.set_destination(origin);
                msg.put_source(uid);
                msg.write_source(0);
                if Self::is_controller(origin) {
                    msg.write_destination(source);
                } else {
                    msg.write_destination(0);
                }
            } else {
                // Initiated remotely: route the answer toward the origin.
                self.pool.get_mut(m).put_destination(source);
                self.create_route(m);
            }
        } else {
            if Self::is_external(origin) || Self::is_controller(origin) {
                // Fresh query: stash origin and final destination so the
                // answer can return directly.
                let msg = self.pool.get(m);
                if msg.payload_length() == 8 && status == REQUEST {
                    let uid = self.uid();
                    let msg = self.pool.get_mut(m);
                    msg.put_length((HEADER_SIZE + 4 * 8) as u16);
                    msg.set_data64(16, origin);
                    msg.set_data64(24, source);
                    msg.write_source(uid);
                } else {
                    return self.handle_invalid_request(m);
                }
            }
            let next = self.node.closest_predecessor(map_key(query), true);
            self.pool.get_mut(m).put_destination(next);
        }
    }

    fn handle_bootstrap_request(&mut self, m: MessageRef) {
        let (origin, source, length) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.source(), msg.length() as usize)
        };
        if length != HEADER_SIZE {
            return self.handle_invalid_request(m);
        }

        let uid = self.uid();
        let cache = self.cache.ids;
        let msg = self.pool.get_mut(m);
        msg.put_source(uid);
        msg.write_source(0);
        msg.write_destination(if Self::is_external(origin) { 0 } else { source });
        msg.set_destination(origin);
        msg.put_length((HEADER_SIZE + 4 + 8 * NODE_CACHE_SIZE) as u16);
        msg.put_status(ACCEPTED);
        msg.set_data32(0, NODE_CACHE_SIZE as u32);
        let mut offset = 4;
        for id in cache {
            msg.set_data64(offset, id);
            offset += 8;
        }
    }

    //=================================================================
    // Multicasting

    fn handle_publish_request(&mut self, m: MessageRef) {
        let (origin, topic, group) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.session(), msg.group())
        };

        let subscribers: SmallVec<[u64; 8]> = self
            .topics
            .iter(topic)
            .filter(|&id| id != origin)
            .collect();

        let mut delivered: SmallVec<[u64; 8]> = SmallVec::new();
        for id in subscribers {
            if !self.check_mask(origin, id) {
                continue;
            }
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            // Same-group subscribers are the sender's own other channels.
            if group != 0 && conn.group() == group {
                continue;
            }
            if !conn.has_capacity() {
                self.metrics.dropped_messages += 1;
                continue;
            }
            self.pool.retain(m);
            conn.out.push_back(m);
            delivered.push(id);
        }

        {
            // Scrub transit information; accepted status prevents a rebound.
            let uid = self.uid();
            let msg = self.pool.get_mut(m);
            msg.write_label(0);
            msg.write_destination(0);
            msg.write_status(ACCEPTED);
            msg.set_destination(uid);
        }
        for id in delivered {
            self.flush_connection(id);
        }
    }

    fn handle_subscribe_request(&mut self, m: MessageRef) {
        if self.pool.get(m).length() as usize != HEADER_SIZE {
            return self.handle_invalid_request(m);
        }
        let (origin, topic) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.session())
        };

        self.build_direct_response(m, HEADER_SIZE as u16);
        self.pool.get_mut(m).write_source(0);

        let Some(conn) = self.connections.get_mut(&origin) else {
            return self.handle_invalid_request(m);
        };
        if conn.topics.test(topic) {
            // Idempotent.
            self.pool.get_mut(m).put_status(ACCEPTED);
        } else if self.topics.put(topic, origin) {
            conn.topics.set(topic);
            conn.set_flags(flags::MULTICAST);
            self.pool.get_mut(m).put_status(ACCEPTED);
        } else {
            self.pool.get_mut(m).put_status(REJECTED);
        }
    }

    fn handle_unsubscribe_request(&mut self, m: MessageRef) {
        if self.pool.get(m).length() as usize != HEADER_SIZE {
            return self.handle_invalid_request(m);
        }
        let (origin, topic) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.session())
        };

        if let Some(conn) = self.connections.get_mut(&origin) {
            if conn.topics.test(topic) {
                conn.topics.clear(topic);
                self.topics.remove(topic, origin);
                if !conn.topics.any() {
                    conn.clear_flags(flags::MULTICAST);
                }
            }
        }

        self.build_direct_response(m, HEADER_SIZE as u16);
        let msg = self.pool.get_mut(m);
        msg.write_source(0);
        msg.put_status(ACCEPTED);
    }

    //=================================================================
    // Route management (controller-mediated)

    fn handle_get_predecessor_request(&mut self, m: MessageRef) {
        if self.pool.get(m).length() as usize != HEADER_SIZE {
            return self.handle_invalid_request(m);
        }
        let predecessor = self.node.predecessor();
        self.build_direct_response(m, (HEADER_SIZE + 8) as u16);
        let msg = self.pool.get_mut(m);
        msg.put_status(ACCEPTED);
        msg.set_data64(0, predecessor);
    }

    fn handle_set_predecessor_request(&mut self, m: MessageRef) {
        if self.pool.get(m).payload_length() != 8 {
            return self.handle_invalid_request(m);
        }
        let candidate = self.pool.get(m).data64(0).unwrap_or(u64::MAX);
        self.build_direct_response(m, 0);
        if self.node.set_predecessor(candidate) {
            let confirmed = self.node.predecessor();
            let msg = self.pool.get_mut(m);
            msg.put_status(ACCEPTED);
            msg.set_data64(0, confirmed);
        } else {
            let msg = self.pool.get_mut(m);
            msg.put_status(REJECTED);
            msg.set_data64(0, 0);
        }
    }

    fn handle_get_successor_request(&mut self, m: MessageRef) {
        if self.pool.get(m).length() as usize != HEADER_SIZE {
            return self.handle_invalid_request(m);
        }
        let successor = self.node.successor();
        self.build_direct_response(m, (HEADER_SIZE + 8) as u16);
        let msg = self.pool.get_mut(m);
        msg.put_status(ACCEPTED);
        msg.set_data64(0, successor);
    }

    fn handle_set_successor_request(&mut self, m: MessageRef) {
        if self.pool.get(m).payload_length() != 8 {
            return self.handle_invalid_request(m);
        }
        let candidate = self.pool.get(m).data64(0).unwrap_or(u64::MAX);
        self.build_direct_response(m, 0);
        if self.node.set_successor(candidate) {
            self.node.set_stable(false);
            let confirmed = self.node.successor();
            let msg = self.pool.get_mut(m);
            msg.put_status(ACCEPTED);
            msg.set_data64(0, confirmed);
        } else {
            let msg = self.pool.get_mut(m);
            msg.put_status(REJECTED);
            msg.set_data64(0, 0);
        }
    }

    fn handle_get_finger_request(&mut self, m: MessageRef) {
        if self.pool.get(m).payload_length() != 4 {
            return self.handle_invalid_request(m);
        }
        let index = self.pool.get(m).data32(0).unwrap_or(u32::MAX) as usize;
        let finger = self.node.get(index).unwrap_or(0);
        self.build_direct_response(m, (HEADER_SIZE + 4 + 8) as u16);
        let msg = self.pool.get_mut(m);
        msg.put_status(ACCEPTED);
        msg.set_data64(4, finger);
    }

    fn handle_set_finger_request(&mut self, m: MessageRef) {
        if self.pool.get(m).payload_length() != 4 + 8 {
            return self.handle_invalid_request(m);
        }
        let index = self.pool.get(m).data32(0).unwrap_or(u32::MAX) as usize;
        let candidate = self.pool.get(m).data64(4).unwrap_or(u64::MAX);
        self.build_direct_response(m, 0);
        if self.node.set(index, candidate) {
            self.node.set_stable(false);
            let confirmed = self.node.get(index).unwrap_or(0);
            let msg = self.pool.get_mut(m);
            msg.put_status(ACCEPTED);
            msg.set_data64(4, confirmed);
        } else {
            let msg = self.pool.get_mut(m);
            msg.put_status(REJECTED);
            msg.set_data64(4, 0);
        }
    }

    fn handle_get_neighbours_request(&mut self, m: MessageRef) {
        if self.pool.get(m).length() as usize != HEADER_SIZE {
            return self.handle_invalid_request(m);
        }
        let predecessor = self.node.predecessor();
        let successor = self.node.successor();
        self.build_direct_response(m, (HEADER_SIZE + 16) as u16);
        let msg = self.pool.get_mut(m);
        msg.put_status(ACCEPTED);
        msg.set_data64(0, predecessor);
        msg.set_data64(8, successor);
    }

    fn handle_notify_request(&mut self, m: MessageRef) {
        if self.pool.get(m).payload_length() != 8 {
            return self.handle_invalid_request(m);
        }
        let candidate = self.pool.get(m).data64(0).unwrap_or(u64::MAX);
        self.build_direct_response(m, HEADER_SIZE as u16);
        self.pool.get_mut(m).put_status(ACCEPTED);
        if self.node.notify(candidate) {
            debug!(candidate, "predecessor candidate accepted");
        }
    }

    //=================================================================
    // Overlay management

    fn handle_find_successor_request(&mut self, m: MessageRef) {
        if self.pool.get(m).payload_length() != 8 {
            return self.handle_invalid_request(m);
        }

        let key = self.pool.get(m).data64(0).unwrap_or(0);
        match self.node.local_successor(map_key(key)) {
            Some(successor) => {
                self.build_direct_response(m, (HEADER_SIZE + 16) as u16);
                let msg = self.pool.get_mut(m);
                msg.put_status(ACCEPTED);
                msg.set_data64(8, successor);
            }
            None => {
                // Recurse through the closest preceding node, via the
                // controller like every peer exchange.
                let preceding = self.node.closest_predecessor(map_key(key), false);
                if preceding == self.uid() {
                    return self.handle_invalid_request(m);
                }
                let msg = self.pool.get_mut(m);
                msg.set_destination(CONTROLLER);
                msg.write_destination(preceding);
            }
        }
    }

    fn handle_ping_request(&mut self, m: MessageRef) {
        let origin = self.pool.get(m).origin();
        if self.is_worker_id(origin) {
            // The worker asks for maintenance.
            self.node.set_stable(false);
            self.build_direct_response(m, HEADER_SIZE as u16);
            self.pool.get_mut(m).put_status(ACCEPTED);
        } else if Self::is_controller(origin) || Self::is_controller(self.uid()) {
            self.build_direct_response(m, HEADER_SIZE as u16);
            self.pool.get_mut(m).put_status(ACCEPTED);
        } else {
            self.handle_invalid_request(m);
        }
    }

    fn handle_map_request(&mut self, m: MessageRef) {
        let (origin, source) = {
            let msg = self.pool.get(m);
            (msg.origin(), msg.source())
        };

        // Insertion happens at the controller boundary only.
        if Self::is_external(origin) && !self.is_worker_id(origin) {
            return self.handle_invalid_request(m);
        }
        if Self::is_controller(origin) || self.is_worker_id(origin) {
            // Record the originator and start the hop count.
            let uid = self.uid();
            let msg = self.pool.get_mut(m);
            if !(msg.append_data64(source) && msg.append_bytes(&[0u8])) {
                return self.handle_invalid_request(m);
            }
            msg.put_source(uid);
        } else if Self::is_external(source)
            || origin != self.node.predecessor()
            || self.pool.get(m).payload_length() < 9
        {
            // Ring traversal must arrive from the predecessor.
            return self.handle_invalid_request(m);
        }

        // Hop guard on top of the ring termination condition.
        let payload_len = self.pool.get(m).payload_length();
        let hop_offset = payload_len - 1;
        let hops = self.pool.get(m).data8(hop_offset).unwrap_or(u8::MAX);
        if hops as usize > 2 * KEY_BITS as usize {
            return self.handle_invalid_request(m);
        }
        self.pool.get_mut(m).set_data8(hop_offset, hops.saturating_add(1));

        let result = self.map_function(m);
        let successor = self.node.successor();
        let uid = self.uid();
        let keep_going = result == 0
            && (self.is_host_id(source) || !in_open_range(map_key(source), uid, map_key(successor)))
            && uid != successor;

        if keep_going {
            // Forward around the ring until it closes.
            self.pool.get_mut(m).put_destination(successor);
        } else {
            // Ring closed (or the function finished): return to origin.
            let origin_offset = payload_len - 9;
            let destination = self.pool.get(m).data64(origin_offset).unwrap_or(0);
            let msg = self.pool.get_mut(m);
            msg.set_destination(CONTROLLER);
            msg.write_destination(destination);
            msg.put_source(uid);
            msg.put_length(HEADER_SIZE as u16);
            msg.put_status(if result >= 0 { ACCEPTED } else { REJECTED });
        }
    }

    /// The per-hub map callback; extension point for derived deployments.
    #[allow(clippy::unused_self)]
    fn map_function(&mut self, _m: MessageRef) -> i32 {
        debug!("map request traversing this hub");
        0
    }

    //=================================================================
    // Delivery

    fn dispatch(&mut self, m: MessageRef) {
        let (destination, origin, status, length, invalid) = {
            let msg = self.pool.get(m);
            (
                msg.destination(),
                msg.origin(),
                msg.status(),
                msg.length(),
                msg.test_flags(FLAG_INVALID),
            )
        };

        if invalid || self.is_host_id(destination) {
            if invalid {
                self.metrics.dropped_messages += 1;
                self.metrics.dropped_bytes += u64::from(length);
            }
            self.pool.release(m);
            return;
        }

        let priority = self.pool.get(m).test_flags(FLAG_PRIORITY);
        if let Some(conn) = self.connections.get_mut(&destination) {
            if !conn.has_capacity() && !priority {
                self.metrics.dropped_messages += 1;
                self.metrics.dropped_bytes += u64::from(length);
                self.pool.release(m);
                return;
            }
            conn.out.push_back(m);
            self.flush_connection(destination);
            // A connection scheduled for close goes down once its last
            // frame (e.g. a registration regret) is on the wire.
            let doomed = self
                .connections
                .get(&destination)
                .is_some_and(|c| c.test_flags(flags::INVALID) && c.out.is_empty());
            if doomed {
                self.disable(destination);
            }
        } else if status == REQUEST && destination != origin && self.connections.contains_key(&origin)
        {
            // No such destination here: a rejected null goes back to the
            // originator so it is not left waiting.
            self.bounce(m, origin);
        } else {
            self.metrics.dropped_messages += 1;
            self.metrics.dropped_bytes += u64::from(length);
            self.pool.release(m);
        }
    }

    fn bounce(&mut self, m: MessageRef, origin: u64) {
        let uid = self.uid();
        let msg = self.pool.get_mut(m);
        let sender = msg.source();
        let header = Header {
            label: 0,
            source: uid,
            destination: sender,
            length: HEADER_SIZE as u16,
            sequence: msg.sequence(),
            session: msg.session(),
            command: Command::Null as u8,
            qualifier: qualifier::NULL,
            status: REJECTED,
        };
        msg.build(header);
        msg.set_destination(origin);
        if let Some(conn) = self.connections.get_mut(&origin) {
            conn.out.push_back(m);
            self.flush_connection(origin);
        } else {
            self.pool.release(m);
        }
    }

    /// Encode and hand queued frames to the pump, FIFO, releasing each.
    fn flush_connection(&mut self, id: u64) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.tx.is_none() {
            // Proxy still connecting; the queue drains on ProxyUp.
            return;
        }
        while let Some(&m) = conn.out.front() {
            let frame = Bytes::copy_from_slice(self.pool.get(m).frame());
            if !conn.send(frame) {
                // Pump gone; Closed will clean the rest up.
                break;
            }
            conn.out.pop_front();
            conn.touch();
            self.pool.release(m);
        }
    }

    //=================================================================
    // Maintenance

    fn sweep_deadlines(&mut self) {
        let timeout = self.options.timeout;
        let stale: Vec<u64> = self
            .connections
            .values()
            .filter(|c| {
                let pending_proxy =
                    c.test_flags(flags::PROXY) && !c.test_flags(flags::ACTIVE);
                let unauthenticated =
                    is_ephemeral(c.id()) && !c.test_flags(flags::ACTIVE | flags::PRIORITY);
                (pending_proxy && c.timed_out(timeout))
                    || (unauthenticated && c.timed_out(timeout * 2))
            })
            .map(Connection::id)
            .collect();
        for id in stale {
            debug!(id, "activity deadline missed");
            self.disable(id);
            self.node.set_stable(false);
        }
    }

    /// Bring the routing table back in shape after a destabilizing event.
    fn maintain(&mut self) {
        if self.node.is_stable() {
            return;
        }
        self.node.set_stable(true);
        if self.fix_controller() {
            self.fix_routing_table();
        }
    }

    fn fix_controller(&mut self) -> bool {
        if Self::is_controller(self.uid()) {
            return true;
        }
        self.connect_to_route(CONTROLLER, TABLE_SIZE)
    }

    fn fix_routing_table(&mut self) {
        for i in 0..TABLE_SIZE {
            if !self.node.is_consistent(i) {
                let old = self.node.make_consistent(i).unwrap_or_else(|| self.uid());
                // The previous peer may hold other finger slots still.
                if !self.node.is_in_route(old) {
                    let drop_proxy = self
                        .connections
                        .get(&old)
                        .is_some_and(|c| c.test_flags(flags::PROXY | flags::OVERLAY));
                    if drop_proxy {
                        self.disable(old);
                    }
                }
            }
            let id = self.node.get(i).unwrap_or_else(|| self.uid());
            let connected = self.connect_to_route(id, i);
            self.node.set_connected(i, connected);
        }

        if self.node.predecessor_changed() {
            // Some clients now map to a different overlay node.
            self.node.make_predecessor_consistent();
            self.purge(PurgeMode::Invalid, 0);
        }
    }

    /// Make sure a live connection to `id` exists or is on its way.
    ///
    /// Returns `true` only when the connection is registered and active.
    fn connect_to_route(&mut self, id: u64, session_slot: usize) -> bool {
        if self.is_host_id(id) {
            return false;
        }
        match self.connections.get(&id) {
            Some(conn) if conn.test_flags(flags::ACTIVE) => true,
            Some(conn) if conn.timed_out(self.options.timeout) => {
                self.disable(id);
                false
            }
            Some(_) => false, // handshake still in flight
            None => {
                self.initiate_proxy(id, session_slot);
                false
            }
        }
    }

    /// Start the token handshake toward `id`: pending connection, queued
    /// token request, connect task for the driver.
    fn initiate_proxy(&mut self, id: u64, session_slot: usize) {
        let Some(address) = self.identity.hosts().and_then(|h| h.get(id)) else {
            debug!(id, "no host entry, cannot connect");
            return;
        };
        if self.connections.len() >= self.options.connection_pool {
            self.purge(PurgeMode::Client, 2);
            self.node.set_stable(false);
            if self.connections.len() >= self.options.connection_pool {
                return;
            }
        }

        // The digest doubles as the session identifier bound to the slot.
        let probe = self.ids.next();
        let nonce = challenge_digest(probe, self.uid());
        if session_slot < self.sessions.len() {
            self.sessions[session_slot] = nonce;
        }

        let Some(m) = self.pool.alloc(self.uid()) else {
            self.node.set_stable(false);
            return;
        };
        let uid = self.uid();
        let sealed = if self.options.authenticate && self.identity.pki().has_public() {
            self.identity.pki().encrypt(&nonce).ok()
        } else {
            None
        };
        {
            let msg = self.pool.get_mut(m);
            msg.build(Header {
                label: 0,
                source: uid,
                destination: id,
                length: HEADER_SIZE as u16,
                sequence: 0,
                session: 0,
                command: Command::Basic as u8,
                qualifier: qualifier::TOKEN,
                status: REQUEST,
            });
            let ok = match &sealed {
                Some(cipher) => msg.append_bytes(cipher),
                None => msg.append_bytes(&nonce),
            };
            if !ok {
                drop(msg);
                self.pool.release(m);
                return;
            }
            msg.set_destination(id);
        }

        let mut conn = Connection::pending(id);
        conn.out.push_back(m);
        self.connections.insert(id, conn);
        self.aliases.insert(id, id);
        self.pending_connects.push((id, address));
        debug!(id, "proxy handshake initiated");
    }

    fn cache_node(&mut self, id: u64) {
        if id != 0 && Self::is_internal(id) && !self.is_host_id(id) {
            self.cache.ids[self.cache.index] = id;
            self.cache.index = (self.cache.index + 1) & (NODE_CACHE_SIZE - 1);
        }
    }

    //=================================================================
    // Purge policy

    /// Close connections per `mode` until `target` is met (0 = no cap).
    /// Returns how many went down.
    pub fn purge(&mut self, mode: PurgeMode, target: u32) -> u32 {
        match mode {
            PurgeMode::Temporary => self.purge_matching(target, |hub, c| {
                is_ephemeral(c.id()) && !c.test_flags(flags::ACTIVE | flags::PRIORITY)
                    && !hub.is_worker_id(c.id())
            }),
            PurgeMode::Invalid => self.purge_matching(target, |hub, c| {
                let id = c.id();
                !(is_ephemeral(id)
                    || hub.node.is_local(map_key(id))
                    || Self::is_internal(id)
                    || hub.is_worker_id(id))
            }),
            PurgeMode::Client => self.purge_matching(target, |hub, c| {
                let id = c.id();
                Self::is_external(id)
                    && !hub.is_worker_id(id)
                    && !c.test_flags(flags::PRIORITY)
                    && !(is_ephemeral(id) && c.test_flags(flags::ACTIVE))
            }),
            PurgeMode::Default => {
                let count = self.purge(PurgeMode::Temporary, target);
                if target == 0 || count < target {
                    count + self.purge(PurgeMode::Client, target.saturating_sub(count))
                } else {
                    count
                }
            }
        }
    }

    fn purge_matching(
        &mut self,
        target: u32,
        predicate: impl Fn(&Self, &Connection) -> bool,
    ) -> u32 {
        // Oldest idle first.
        let mut candidates: Vec<(Duration, u64)> = self
            .connections
            .values()
            .filter(|c| predicate(self, c))
            .map(|c| (c.idle_for(), c.id()))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let mut count = 0;
        for (_, id) in candidates {
            if target != 0 && count >= target {
                break;
            }
            self.disable(id);
            count += 1;
        }
        if count > 0 {
            debug!(count, "purged connections");
        }
        count
    }

    //=================================================================
    // Hot reload

    fn update_settings(&mut self, slot: WatchSlot, event: FileEvent) {
        let state = &mut self.watch[slot as usize];
        if state.ignored {
            return;
        }
        match event {
            FileEvent::Ignored => {
                info!(?slot, "watch invalidated, file will no longer be monitored");
                state.ignored = true;
            }
            FileEvent::Modified => {
                state.modified = true;
            }
            FileEvent::CloseWrite => {
                if !state.modified {
                    // Closed without modification.
                    return;
                }
                state.modified = false;
                self.reload_slot(slot);
            }
        }
    }

    fn reload_slot(&mut self, slot: WatchSlot) {
        match slot {
            WatchSlot::Configuration => {
                info!("configuration file modified (restart required)");
            }
            WatchSlot::HostsDatabase => {
                info!("hosts database modified");
            }
            WatchSlot::HostsFile => self.identity.reload_hosts(),
            WatchSlot::PrivateKey => self.identity.reload_private_key(),
            WatchSlot::PublicKey => self.identity.reload_public_key(),
            WatchSlot::SslRoot => {
                info!("trusted certificate modified (restart required)");
            }
            WatchSlot::SslCertificate | WatchSlot::SslKey => {
                info!("TLS material modified, picked up on the next accept");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;

    fn hub(uid: u64) -> OverlayHub {
        OverlayHub::new(
            HubOptions::new(uid),
            Identity::default(),
            Box::new(StaticCredentials::new()),
        )
        .unwrap()
    }

    const CLIENT_A: u64 = MAX_ID + 10;
    const CLIENT_B: u64 = MAX_ID + 11;
    const EPHEMERAL: u64 = crate::connection::EPHEMERAL_BASE + 3;

    #[test]
    fn permission_policy_matrix() {
        let mut hub = hub(100);

        // Ephemeral endpoints never pass.
        assert!(!hub.permit(EPHEMERAL, CLIENT_A));
        assert!(!hub.permit(CLIENT_A, EPHEMERAL));

        // Controller and worker are not addressable destinations.
        assert!(!hub.permit(CLIENT_A, CONTROLLER));

        // Clients must not reach overlay peers directly...
        assert!(!hub.permit(CLIENT_A, 7));
        // ...but peers reach anyone, and clients reach clients.
        assert!(hub.permit(7, CLIENT_A));
        assert!(hub.permit(CLIENT_A, CLIENT_B));

        // The controller hub mediates client-to-peer traffic.
        let controller = self::hub(CONTROLLER);
        assert!(controller.permit(CLIENT_A, 7));

        // Netmask 0 allows all client pairs; !0 demands an exact match.
        hub.options.netmask = u64::MAX;
        assert!(!hub.permit(CLIENT_A, CLIENT_B));
        assert!(hub.permit(CLIENT_A, CLIENT_A));
        // Internal sources bypass the mask.
        assert!(hub.permit(7, CLIENT_A));
    }

    #[test]
    fn registration_race_smaller_id_wins() {
        let hub = hub(100);
        // A peer with a smaller identifier may not displace an existing
        // connection; a larger one replaces it.
        assert_eq!(
            hub.registration_mode(EPHEMERAL, 40),
            Some(RegistrationMode::Fresh)
        );
        assert_eq!(
            hub.registration_mode(EPHEMERAL, 200),
            Some(RegistrationMode::Replace)
        );
        // Same identifier re-registers in place.
        assert_eq!(
            hub.registration_mode(CLIENT_A, CLIENT_A),
            Some(RegistrationMode::Activate)
        );
        // The hub's own identifier is never grantable.
        assert_eq!(hub.registration_mode(EPHEMERAL, 100), None);
    }

    #[test]
    fn stabilization_response_validation() {
        let mut hub = hub(100);
        let snapshot = Header {
            label: 4242,
            source: 100,
            destination: 0,
            length: HEADER_SIZE as u16,
            sequence: 17,
            session: 3,
            command: Command::Overlay as u8,
            qualifier: qualifier::FIND_SUCCESSOR,
            status: REQUEST,
        };
        hub.worker.header = snapshot;

        let mut response = snapshot;
        response.destination = 100; // returned to this hub
        response.status = ACCEPTED;

        let m = hub.pool.alloc(CONTROLLER).unwrap();
        hub.pool.get_mut(m).build(response);
        assert!(hub.is_valid_stabilization_response(m));

        // Any mismatch against the snapshot drops the response.
        let mutations: [fn(&mut Header); 6] = [
            |h| h.sequence = 18,
            |h| h.session = 4,
            |h| h.label = 1,
            |h| h.qualifier = qualifier::PING,
            |h| h.status = REQUEST,
            |h| h.destination = 55,
        ];
        for mutate in mutations {
            let mut stale = response;
            mutate(&mut stale);
            hub.pool.get_mut(m).build(stale);
            assert!(!hub.is_valid_stabilization_response(m));
        }
        hub.pool.release(m);
    }

    #[test]
    fn watch_state_machine_needs_modify_then_close() {
        let mut hub = hub(100);

        // Close without a preceding modification does nothing and keeps the
        // slot armed.
        hub.update_settings(WatchSlot::HostsFile, FileEvent::CloseWrite);
        assert!(!hub.watch[WatchSlot::HostsFile as usize].modified);

        // Modify then close-write triggers the reload and resets the state.
        hub.update_settings(WatchSlot::HostsFile, FileEvent::Modified);
        assert!(hub.watch[WatchSlot::HostsFile as usize].modified);
        hub.update_settings(WatchSlot::HostsFile, FileEvent::CloseWrite);
        assert!(!hub.watch[WatchSlot::HostsFile as usize].modified);

        // An invalidated watch ignores everything afterwards.
        hub.update_settings(WatchSlot::HostsFile, FileEvent::Ignored);
        hub.update_settings(WatchSlot::HostsFile, FileEvent::Modified);
        assert!(!hub.watch[WatchSlot::HostsFile as usize].modified);
    }

    #[test]
    fn gateway_prefers_local_and_controller() {
        let mut hub = hub(100);
        // Lone node: everything is local.
        assert_eq!(hub.gateway(CLIENT_A), CLIENT_A);
        assert_eq!(hub.gateway(CONTROLLER), CONTROLLER);

        // Partitioned ring: keys outside (0, 100] hop via the successor.
        hub.node.set_predecessor(CONTROLLER);
        hub.node.set_successor(CONTROLLER);
        let far = MAX_ID + 1; // maps to key 0
        assert_eq!(map_key(far), 0);
        assert_eq!(hub.gateway(far), CONTROLLER);
    }
}
