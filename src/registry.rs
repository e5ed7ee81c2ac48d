//! The reference server (registry).
//!
//! Single request/reply process the cluster trusts for identity: it assigns
//! each replica a stable integer rank, tracks heartbeats, and serves the
//! live peer list with the advertised peer addresses. Servers that stop
//! heartbeating are swept out after a timeout; the whole table persists to
//! `reference.json` so ranks survive a registry restart. It coordinates
//! nothing itself; Bully decides the coordinator among the replicas.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{wall_now, LamportClock};
use crate::store::DataStore;
use crate::wire::frame::{FrameReader, FrameWriter};
use crate::wire::proto::{
    decode_registry_request, encode_reply, PeerInfo, RegistryRequest, Reply, ReplyBody, Status,
};
use crate::Error;

const STATE_FILE: &str = "reference.json";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    /// A server silent for longer than this is dropped from the list.
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", crate::config::DEFAULT_REGISTRY_PORT),
            data_dir: PathBuf::from("/data"),
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerEntry {
    rank: u32,
    last_heartbeat: f64,
    #[serde(default)]
    replication_addr: String,
    #[serde(default)]
    election_addr: String,
}

/// On-disk shape of the registry table.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    servers: BTreeMap<String, ServerEntry>,
    next_rank: u32,
    timestamp: f64,
}

struct Inner {
    servers: BTreeMap<String, ServerEntry>,
    next_rank: u32,
    clock: LamportClock,
}

pub struct Registry {
    config: RegistryConfig,
    store: DataStore,
    inner: Mutex<Inner>,
}

pub struct RegistryHandle {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    joins: Vec<JoinHandle<()>>,
}

impl RegistryHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        for join in self.joins {
            let _ = join.join();
        }
    }
}

impl Registry {
    pub fn new(config: RegistryConfig) -> crate::Result<Self> {
        let store = DataStore::open(&config.data_dir).map_err(Error::Store)?;

        let mut servers = BTreeMap::new();
        let mut next_rank = 1;
        if let Some(persisted) = store.load_document::<PersistedState>(STATE_FILE) {
            servers = persisted.servers;
            next_rank = persisted.next_rank;
            // Known servers get a grace period after a registry restart.
            let now = wall_now();
            for entry in servers.values_mut() {
                entry.last_heartbeat = now;
            }
            tracing::info!(servers = servers.len(), next_rank, "registry state loaded");
        }

        Ok(Self {
            config,
            store,
            inner: Mutex::new(Inner {
                servers,
                next_rank,
                clock: LamportClock::new(),
            }),
        })
    }

    /// Bind, spawn the accept and sweep loops, and return the handle.
    pub fn start(self) -> crate::Result<RegistryHandle> {
        let listener = TcpListener::bind(&self.config.bind_addr).map_err(|source| Error::Bind {
            addr: self.config.bind_addr.clone(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(Error::Io)?;
        listener.set_nonblocking(true).map_err(Error::Io)?;

        let stop = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(self);
        let mut joins = Vec::new();

        {
            let registry = registry.clone();
            let stop = stop.clone();
            joins.push(std::thread::spawn(move || {
                registry.run_accept_loop(listener, &stop);
            }));
        }
        {
            let registry = registry.clone();
            let stop = stop.clone();
            joins.push(std::thread::spawn(move || {
                registry.run_sweep_loop(&stop);
            }));
        }

        tracing::info!(addr = %local_addr, "registry listening");
        Ok(RegistryHandle {
            local_addr,
            stop,
            joins,
        })
    }

    /// Run until a termination signal (binary entry point).
    pub fn run(self) -> crate::Result<()> {
        let handle = self.start()?;
        let stop = handle.stop_flag();
        let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, stop.clone());
        let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, stop.clone());
        while !stop.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(200));
        }
        tracing::info!("registry shutting down");
        handle.shutdown();
        Ok(())
    }

    fn run_accept_loop(self: &Arc<Self>, listener: TcpListener, stop: &AtomicBool) {
        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            match listener.accept() {
                Ok((stream, _peer)) => {
                    let _ = stream.set_nonblocking(false);
                    let registry = self.clone();
                    std::thread::spawn(move || registry.handle_connection(stream));
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => {
                    tracing::warn!("registry accept failed: {err}");
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
        }
    }

    fn run_sweep_loop(self: &Arc<Self>, stop: &AtomicBool) {
        loop {
            let mut remaining = self.config.sweep_interval;
            while remaining > Duration::ZERO {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                let step = remaining.min(Duration::from_millis(100));
                std::thread::sleep(step);
                remaining -= step;
            }
            self.sweep_inactive();
        }
    }

    fn handle_connection(self: &Arc<Self>, stream: TcpStream) {
        let mut reader = FrameReader::new(&stream);
        loop {
            let frame = match reader.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(err) => {
                    tracing::debug!("registry connection dropped: {err}");
                    return;
                }
            };

            let reply = match decode_registry_request(&frame) {
                Ok((request, meta)) => self.handle_request(request, meta.clock),
                Err(err) => Reply::new("error", Status::Erro, self.stamp())
                    .with_description(err.to_string()),
            };

            let Ok(payload) = encode_reply(&reply) else {
                return;
            };
            if FrameWriter::new(&stream).write_frame(&payload).is_err() {
                return;
            }
        }
    }

    fn handle_request(&self, request: RegistryRequest, received_clock: u64) -> Reply {
        lock(&self.inner).clock.observe(received_clock);
        match request {
            RegistryRequest::Rank {
                server,
                replication_addr,
                election_addr,
            } => {
                if server.is_empty() {
                    return Reply::new("rank", Status::Erro, self.stamp())
                        .with_description("Nome do servidor não fornecido");
                }
                let rank = {
                    let mut inner = lock(&self.inner);
                    let now = wall_now();
                    if let Some(entry) = inner.servers.get_mut(&server) {
                        // Re-registration keeps the rank stable but may move
                        // the advertised sockets.
                        entry.last_heartbeat = now;
                        entry.replication_addr = replication_addr;
                        entry.election_addr = election_addr;
                        entry.rank
                    } else {
                        let rank = inner.next_rank;
                        inner.next_rank += 1;
                        inner.servers.insert(
                            server.clone(),
                            ServerEntry {
                                rank,
                                last_heartbeat: now,
                                replication_addr,
                                election_addr,
                            },
                        );
                        tracing::info!(server = %server, rank, "server registered");
                        rank
                    }
                };
                self.persist();
                Reply::new("rank", Status::Sucesso, self.stamp()).with_body(ReplyBody::Rank(rank))
            }

            RegistryRequest::List => {
                let list: Vec<PeerInfo> = lock(&self.inner)
                    .servers
                    .iter()
                    .map(|(name, entry)| PeerInfo {
                        server: name.clone(),
                        rank: entry.rank,
                        last_heartbeat: entry.last_heartbeat,
                        replication_addr: entry.replication_addr.clone(),
                        election_addr: entry.election_addr.clone(),
                    })
                    .collect();
                Reply::new("list", Status::Sucesso, self.stamp())
                    .with_body(ReplyBody::Servers(list))
            }

            RegistryRequest::Heartbeat { server } => {
                if server.is_empty() {
                    return Reply::new("heartbeat", Status::Erro, self.stamp())
                        .with_description("Nome do servidor não fornecido");
                }
                let registered = {
                    let mut inner = lock(&self.inner);
                    let now = wall_now();
                    if let Some(entry) = inner.servers.get_mut(&server) {
                        entry.last_heartbeat = now;
                        false
                    } else {
                        // Unknown heartbeat sender: register it fresh.
                        let rank = inner.next_rank;
                        inner.next_rank += 1;
                        inner.servers.insert(
                            server.clone(),
                            ServerEntry {
                                rank,
                                last_heartbeat: now,
                                replication_addr: String::new(),
                                election_addr: String::new(),
                            },
                        );
                        tracing::info!(server = %server, rank, "server registered via heartbeat");
                        true
                    }
                };
                if registered {
                    self.persist();
                }
                Reply::new("heartbeat", Status::Sucesso, self.stamp())
            }
        }
    }

    fn sweep_inactive(&self) {
        let timeout = self.config.heartbeat_timeout.as_secs_f64();
        let removed: Vec<String> = {
            let mut inner = lock(&self.inner);
            let now = wall_now();
            let dead: Vec<String> = inner
                .servers
                .iter()
                .filter(|(_, entry)| now - entry.last_heartbeat > timeout)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &dead {
                inner.servers.remove(name);
            }
            dead
        };
        if !removed.is_empty() {
            for name in &removed {
                tracing::info!(server = %name, "inactive server removed");
            }
            self.persist();
        }
    }

    fn stamp(&self) -> crate::wire::proto::Meta {
        crate::wire::proto::Meta {
            timestamp: wall_now(),
            clock: lock(&self.inner).clock.tick(),
        }
    }

    fn persist(&self) {
        let snapshot = {
            let inner = lock(&self.inner);
            PersistedState {
                servers: inner.servers.clone(),
                next_rank: inner.next_rank,
                timestamp: wall_now(),
            }
        };
        if let Err(err) = self.store.save_document(STATE_FILE, &snapshot) {
            tracing::warn!("registry state not persisted: {err}");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> Registry {
        Registry::new(RegistryConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            data_dir: dir.path().to_path_buf(),
            heartbeat_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(10),
        })
        .unwrap()
    }

    fn rank_request(server: &str) -> RegistryRequest {
        RegistryRequest::Rank {
            server: server.to_string(),
            replication_addr: format!("{server}:6000"),
            election_addr: format!("{server}:6001"),
        }
    }

    #[test]
    fn ranks_are_monotonic_and_stable() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);

        let first = registry.handle_request(rank_request("server_1"), 0);
        let second = registry.handle_request(rank_request("server_2"), 0);
        let again = registry.handle_request(rank_request("server_1"), 0);

        assert_eq!(first.body, ReplyBody::Rank(1));
        assert_eq!(second.body, ReplyBody::Rank(2));
        assert_eq!(again.body, ReplyBody::Rank(1));
    }

    #[test]
    fn empty_name_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        let reply = registry.handle_request(rank_request(""), 0);
        assert_eq!(reply.status, Status::Erro);
    }

    #[test]
    fn list_returns_registered_servers_with_addresses() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        registry.handle_request(rank_request("server_1"), 0);
        registry.handle_request(rank_request("server_2"), 0);

        let reply = registry.handle_request(RegistryRequest::List, 0);
        let ReplyBody::Servers(list) = reply.body else {
            panic!("expected server list");
        };
        assert_eq!(list.len(), 2);
        let one = list.iter().find(|info| info.server == "server_1").unwrap();
        assert_eq!(one.rank, 1);
        assert_eq!(one.replication_addr, "server_1:6000");
    }

    #[test]
    fn heartbeat_auto_registers_unknown_server() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        let reply = registry.handle_request(
            RegistryRequest::Heartbeat {
                server: "server_9".to_string(),
            },
            0,
        );
        assert_eq!(reply.status, Status::Sucesso);
        let listed = registry.handle_request(RegistryRequest::List, 0);
        let ReplyBody::Servers(list) = listed.body else {
            panic!("expected server list");
        };
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn sweep_drops_silent_servers() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        registry.handle_request(rank_request("server_1"), 0);
        std::thread::sleep(Duration::from_millis(80));
        registry.sweep_inactive();

        let reply = registry.handle_request(RegistryRequest::List, 0);
        let ReplyBody::Servers(list) = reply.body else {
            panic!("expected server list");
        };
        assert!(list.is_empty());
    }

    #[test]
    fn ranks_survive_restart() {
        let dir = TempDir::new().expect("tempdir");
        {
            let registry = registry(&dir);
            registry.handle_request(rank_request("server_1"), 0);
            registry.handle_request(rank_request("server_2"), 0);
        }
        let reopened = registry(&dir);
        let reply = reopened.handle_request(rank_request("server_3"), 0);
        assert_eq!(reply.body, ReplyBody::Rank(3));
        let again = reopened.handle_request(rank_request("server_1"), 0);
        assert_eq!(again.body, ReplyBody::Rank(1));
    }

    #[test]
    fn clock_merges_on_requests() {
        let dir = TempDir::new().expect("tempdir");
        let registry = registry(&dir);
        let reply = registry.handle_request(RegistryRequest::List, 40);
        assert!(reply.meta.clock > 40);
    }
}
