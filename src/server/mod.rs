//! The message-server replica.
//!
//! One process, several cooperating threads: the client reply loop, the
//! replication reply loop, the election reply loop, the registry heartbeat
//! and peer-list refresh, the coordinator-liveness monitor, the publisher
//! drain, and short-lived tasks for each replication push and Berkeley
//! probe. Shared state sits behind a single mutex; everything long-running
//! snapshots under the lock and does its I/O outside it.

pub mod berkeley;
pub mod client;
pub mod election;
pub mod publisher;
pub mod registry_client;
pub mod replication;

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use crate::config::Config;
use crate::state::ReplicaState;
use crate::store::DataStore;
use crate::wire::frame::{FrameError, FrameReader, FrameWriter};
use crate::wire::proto::{Meta, PeerInfo};
use crate::Error;

use election::ElectionManager;
use registry_client::RegistryClient;

/// State shared by every thread of the replica.
pub struct Shared {
    pub config: Config,
    pub state: Mutex<ReplicaState>,
    pub store: DataStore,
    pub replication_log: Mutex<Vec<replication::ReplicationEvent>>,
    pub berkeley_history: Mutex<Vec<berkeley::SyncRecord>>,
    peers: Mutex<Vec<PeerInfo>>,
    stop: Arc<AtomicBool>,
}

impl Shared {
    pub fn running(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Stamp an outbound frame: advances the Lamport clock under the lock.
    pub fn stamp(&self) -> Meta {
        lock(&self.state).stamp()
    }

    /// Merge a received Lamport clock.
    pub fn observe(&self, clock: u64) {
        lock(&self.state).observe(clock);
    }

    pub fn set_peers(&self, list: Vec<PeerInfo>) {
        *lock(&self.peers) = list;
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        lock(&self.peers).clone()
    }

    pub fn peers_excluding_self(&self) -> Vec<PeerInfo> {
        lock(&self.peers)
            .iter()
            .filter(|peer| peer.server != self.config.server_name)
            .cloned()
            .collect()
    }

    /// Flush all three sequences to disk; persistence failures are logged
    /// and the in-memory state stays authoritative.
    pub fn flush(&self) {
        let snapshot = lock(&self.state).snapshot();
        if let Err(err) = self.store.save_logins(&snapshot.logins) {
            tracing::warn!("flush of logins failed: {err}");
        }
        if let Err(err) = self.store.save_channels(&snapshot.channels) {
            tracing::warn!("flush of channels failed: {err}");
        }
        if let Err(err) = self.store.save_messages(&snapshot.messages) {
            tracing::warn!("flush of messages failed: {err}");
        }
    }
}

/// Lock acquisition that outlives a panicking peer thread.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Peer RPC plumbing
// =============================================================================

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(FrameError),
    #[error(transparent)]
    Decode(#[from] crate::wire::proto::ProtoDecodeError),
    #[error(transparent)]
    Encode(#[from] crate::wire::proto::ProtoEncodeError),
    #[error("peer closed connection before replying")]
    Closed,
    #[error("reply shape did not match the request")]
    UnexpectedReply,
}

impl From<FrameError> for RpcError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => RpcError::Io(err),
            other => RpcError::Frame(other),
        }
    }
}

pub(crate) fn resolve(addr: &str) -> std::io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no address for {addr}"),
        )
    })
}

/// One framed request/reply exchange with a remote peer. Every send and
/// receive is bounded by `timeout`; there are no unbounded waits on the
/// network anywhere in the replica.
pub(crate) fn request_reply(
    addr: &str,
    payload: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, RpcError> {
    let socket_addr = resolve(addr)?;
    let stream = TcpStream::connect_timeout(&socket_addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    FrameWriter::new(&stream).write_frame(payload)?;
    match FrameReader::new(&stream).read_frame()? {
        Some(reply) => Ok(reply),
        None => Err(RpcError::Closed),
    }
}

/// Sleep in short slices so shutdown is observed promptly. Returns false
/// once the stop flag is raised.
pub(crate) fn sleep_with_stop(stop: &AtomicBool, duration: Duration) -> bool {
    const SLICE: Duration = Duration::from_millis(100);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
    !stop.load(Ordering::Relaxed)
}

/// Non-blocking accept loop polling the stop flag; one handler thread per
/// connection.
fn run_accept_loop<F>(listener: TcpListener, stop: Arc<AtomicBool>, name: &'static str, handler: F)
where
    F: Fn(TcpStream) + Send + Sync + Clone + 'static,
{
    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!(listener = name, "set_nonblocking failed: {err}");
        return;
    }
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        match listener.accept() {
            Ok((stream, _peer)) => {
                let _ = stream.set_nonblocking(false);
                let handler = handler.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-conn"))
                    .spawn(move || handler(stream))
                    .ok();
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                tracing::warn!(listener = name, "accept failed: {err}");
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn bind(addr: &str) -> crate::Result<TcpListener> {
    TcpListener::bind(addr).map_err(|source| Error::Bind {
        addr: addr.to_string(),
        source,
    })
}

// =============================================================================
// Replica lifecycle
// =============================================================================

pub struct Replica {
    config: Config,
}

/// A started replica: bound addresses plus the levers to stop it.
pub struct ReplicaHandle {
    pub client_addr: SocketAddr,
    pub replication_addr: SocketAddr,
    pub election_addr: SocketAddr,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    joins: Vec<JoinHandle<()>>,
}

impl ReplicaHandle {
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Stop accepting work, flush the sequences to disk, join every thread.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.shared.flush();
        for join in self.joins {
            let _ = join.join();
        }
    }
}

impl Replica {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until a termination signal, then drain and exit. Fatal bind,
    /// store or registration errors surface as `Err`; everything else is
    /// handled inside the background loops.
    pub fn run(self) -> crate::Result<()> {
        let handle = self.start()?;
        let stop = handle.stop_flag();
        let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, stop.clone());
        let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, stop.clone());

        while sleep_with_stop(&stop, Duration::from_millis(500)) {}
        tracing::info!("shutting down");
        handle.shutdown();
        Ok(())
    }

    /// Bind the three reply sockets, register with the registry, pull the
    /// coordinator's snapshot, and spawn every background loop.
    pub fn start(self) -> crate::Result<ReplicaHandle> {
        let config = self.config;
        let store = DataStore::open(&config.data_dir).map_err(Error::Store)?;
        let state = ReplicaState::load(&store);
        {
            let snapshot = state.snapshot();
            tracing::info!(
                server = %config.server_name,
                users = snapshot.logins.len(),
                channels = snapshot.channels.len(),
                messages = snapshot.messages.len(),
                "state loaded"
            );
        }

        // Bind all three reply sockets up front; a taken port is fatal.
        let client_listener = bind(&config.client_bind_addr())?;
        let replication_listener = bind(&config.replication_bind_addr())?;
        let election_listener = bind(&config.election_bind_addr())?;

        let client_addr = client_listener.local_addr().map_err(Error::Io)?;
        let replication_local = replication_listener.local_addr().map_err(Error::Io)?;
        let election_local = election_listener.local_addr().map_err(Error::Io)?;
        let replication_addr = format!("{}:{}", config.advertise_host, replication_local.port());
        let election_addr = format!("{}:{}", config.advertise_host, election_local.port());

        let stop = Arc::new(AtomicBool::new(false));

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            store,
            replication_log: Mutex::new(Vec::new()),
            berkeley_history: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            stop: stop.clone(),
            config,
        });

        let (publisher, publisher_join) =
            publisher::spawn(shared.config.proxy_pub_addr.clone(), stop.clone());

        // Rank acquisition is the one registry call that must succeed: the
        // replica has no Bully identity without it.
        let registry = Arc::new(RegistryClient::new(shared.clone()));
        let rank = registry.register(&replication_addr, &election_addr)?;
        tracing::info!(server = %shared.config.server_name, rank, "registered with registry");

        let election = Arc::new(ElectionManager::new(
            shared.clone(),
            rank,
            publisher.clone(),
        ));

        match registry.fetch_list() {
            Ok(list) => {
                shared.set_peers(list.clone());
                election.update_from_peer_list(&list);
            }
            Err(err) => {
                tracing::warn!("initial peer list unavailable: {err}");
            }
        }

        // Pull-on-start: overwrite local state from the coordinator when one
        // is reachable; otherwise keep what the disk gave us.
        replication::sync_from_coordinator(&shared, &election);

        let mut joins: Vec<JoinHandle<()>> = vec![publisher_join];

        {
            let shared = shared.clone();
            let publisher = publisher.clone();
            let election = election.clone();
            let stop = stop.clone();
            joins.push(spawn_named("client-listener", move || {
                run_accept_loop(client_listener, stop, "client", move |stream| {
                    client::handle_connection(stream, &shared, &publisher, &election);
                });
            }));
        }
        {
            let shared = shared.clone();
            let stop = stop.clone();
            joins.push(spawn_named("replication-listener", move || {
                run_accept_loop(replication_listener, stop, "replication", move |stream| {
                    replication::handle_connection(stream, &shared);
                });
            }));
        }
        {
            let election = election.clone();
            let stop = stop.clone();
            joins.push(spawn_named("election-listener", move || {
                run_accept_loop(election_listener, stop, "election", move |stream| {
                    election.handle_connection(stream);
                });
            }));
        }
        {
            let registry = registry.clone();
            joins.push(spawn_named("heartbeat", move || {
                registry.run_heartbeat_loop();
            }));
        }
        {
            let registry = registry.clone();
            let election = election.clone();
            joins.push(spawn_named("list-refresh", move || {
                registry.run_list_refresh_loop(&election);
            }));
        }
        {
            let election = election.clone();
            joins.push(spawn_named("coordinator-monitor", move || {
                election.run_monitor_loop();
            }));
        }
        {
            let shared = shared.clone();
            let election = election.clone();
            joins.push(spawn_named("servers-topic", move || {
                election::run_servers_topic_loop(&shared, &election);
            }));
        }

        tracing::info!(
            server = %shared.config.server_name,
            client = %client_addr,
            replication = %replication_addr,
            election = %election_addr,
            "replica ready"
        );

        Ok(ReplicaHandle {
            client_addr,
            replication_addr: replication_local,
            election_addr: election_local,
            shared,
            stop,
            joins,
        })
    }
}

fn spawn_named<F>(name: &'static str, f: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .unwrap_or_else(|err| panic!("failed to spawn {name} thread: {err}"))
}
