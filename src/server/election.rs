//! Bully coordinator election.
//!
//! Ranks come from the registry; the steady-state coordinator is the lowest
//! live rank, and an election is won by the survivor no higher rank answers
//! for. Phases:
//!
//! ```text
//! NORMAL      -- coordinator silent past timeout --> ELECTING
//! ELECTING    -- some higher rank replied OK     --> WAITING
//! ELECTING    -- nobody outranks us              --> COORDINATOR
//! WAITING     -- announcement received           --> NORMAL
//! WAITING     -- announcement wait expired       --> ELECTING (restart)
//! COORDINATOR -- another announcement received   --> NORMAL
//! ```
//!
//! An ELECTION frame from a lower rank is answered OK and triggers our own
//! candidacy; concurrent elections resolve because every candidate defers to
//! any strictly higher-ranked one.

use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::wire::frame::{FrameReader, FrameWriter};
use crate::wire::proto::{
    decode_election_request, decode_publication, decode_reply, encode_election_request,
    encode_reply, ElectionRequest, PeerInfo, Publication, Reply, ReplyBody, Status, SERVERS_TOPIC,
};

use super::publisher::PublisherHandle;
use super::{lock, request_reply, sleep_with_stop, RpcError, Shared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Normal,
    Electing,
    Waiting,
    Coordinator,
}

struct Inner {
    phase: Phase,
    coordinator: Option<String>,
    /// Last moment we had evidence the coordinator was alive.
    last_seen: Instant,
    waiting_since: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
struct ElectionEvent {
    timestamp: f64,
    event: &'static str,
    server: String,
    rank: u32,
}

pub struct ElectionManager {
    shared: Arc<Shared>,
    rank: u32,
    publisher: PublisherHandle,
    inner: Mutex<Inner>,
    log: Mutex<Vec<ElectionEvent>>,
}

impl ElectionManager {
    pub fn new(shared: Arc<Shared>, rank: u32, publisher: PublisherHandle) -> Self {
        // Rank 1 starts as coordinator; everyone else waits to hear who is.
        let (phase, coordinator) = if rank == 1 {
            (
                Phase::Coordinator,
                Some(shared.config.server_name.clone()),
            )
        } else {
            (Phase::Normal, None)
        };
        Self {
            shared,
            rank,
            publisher,
            inner: Mutex::new(Inner {
                phase,
                coordinator,
                last_seen: Instant::now(),
                waiting_since: None,
            }),
            log: Mutex::new(Vec::new()),
        }
    }

    fn name(&self) -> &str {
        &self.shared.config.server_name
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn coordinator(&self) -> Option<String> {
        lock(&self.inner).coordinator.clone()
    }

    pub fn is_coordinator(&self) -> bool {
        lock(&self.inner).coordinator.as_deref() == Some(self.name())
    }

    // =========================================================================
    // Inbound: the election reply socket
    // =========================================================================

    pub fn handle_connection(self: &Arc<Self>, stream: TcpStream) {
        let mut reader = FrameReader::new(&stream);
        loop {
            let frame = match reader.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(err) => {
                    tracing::debug!("election connection dropped: {err}");
                    return;
                }
            };

            let reply = match decode_election_request(&frame) {
                Ok((request, meta)) => {
                    self.shared.observe(meta.clock);
                    self.handle_request(request)
                }
                Err(err) => Reply::new("election", Status::Erro, self.shared.stamp())
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

    fn handle_request(self: &Arc<Self>, request: ElectionRequest) -> Reply {
        match request {
            ElectionRequest::Election { rank, server } => {
                tracing::info!(
                    from = %server,
                    their_rank = rank,
                    our_rank = self.rank,
                    "election challenge received"
                );
                if self.rank > rank {
                    // We outrank the candidate: preempt it and run our own
                    // election without blocking the reply.
                    let manager = self.clone();
                    std::thread::spawn(move || manager.start_election());
                    Reply::new("election", Status::Ok, self.shared.stamp()).with_body(
                        ReplyBody::ElectionOk {
                            rank: self.rank,
                            server: self.name().to_string(),
                        },
                    )
                } else {
                    Reply::new("election", Status::Erro, self.shared.stamp())
                        .with_description("Rank não supera o candidato")
                }
            }
            ElectionRequest::Coordinator { coordinator, rank } => {
                self.accept_coordinator(&coordinator, rank);
                Reply::new("coordinator", Status::Ok, self.shared.stamp())
            }
        }
    }

    /// A coordinator announcement, whether point-to-point or from the
    /// `servers` topic. Stops any in-flight wait and re-enters NORMAL (or
    /// COORDINATOR when we are the one announced).
    pub fn accept_coordinator(&self, coordinator: &str, rank: u32) {
        let changed = {
            let mut inner = lock(&self.inner);
            let changed = inner.coordinator.as_deref() != Some(coordinator);
            inner.coordinator = Some(coordinator.to_string());
            inner.phase = if coordinator == self.name() {
                Phase::Coordinator
            } else {
                Phase::Normal
            };
            inner.waiting_since = None;
            inner.last_seen = Instant::now();
            changed
        };
        if changed {
            tracing::info!(coordinator, rank, "coordinator announced");
        }
        self.log_event("coordinator_announced", coordinator, rank);
    }

    /// Registry view: the lowest live rank holds the role at steady state.
    /// Never applied mid-election; the announcement settles that instead.
    pub fn update_from_peer_list(&self, list: &[PeerInfo]) {
        let Some(lowest) = list.iter().min_by_key(|peer| peer.rank) else {
            return;
        };
        let mut inner = lock(&self.inner);
        if matches!(inner.phase, Phase::Electing | Phase::Waiting) {
            return;
        }
        if list
            .iter()
            .any(|peer| Some(peer.server.as_str()) == inner.coordinator.as_deref())
        {
            // The coordinator still heartbeats the registry.
            inner.last_seen = Instant::now();
        }
        if inner.coordinator.as_deref() != Some(lowest.server.as_str()) {
            let old = inner.coordinator.clone().unwrap_or_default();
            tracing::info!(
                old = %old,
                new = %lowest.server,
                rank = lowest.rank,
                "coordinator changed via registry view"
            );
            inner.coordinator = Some(lowest.server.clone());
            inner.phase = if lowest.server == self.name() {
                Phase::Coordinator
            } else {
                Phase::Normal
            };
            inner.last_seen = Instant::now();
        }
    }

    // =========================================================================
    // Liveness monitor
    // =========================================================================

    pub fn run_monitor_loop(self: &Arc<Self>) {
        let stop = self.shared.stop_flag();
        let interval = self.shared.config.monitor_interval;
        while sleep_with_stop(&stop, interval) {
            let action = {
                let mut inner = lock(&self.inner);
                match inner.phase {
                    Phase::Waiting => {
                        let expired = inner
                            .waiting_since
                            .map(|since| since.elapsed() > self.shared.config.announcement_timeout)
                            .unwrap_or(true);
                        if expired {
                            inner.phase = Phase::Normal;
                            inner.waiting_since = None;
                            Some("announcement wait expired")
                        } else {
                            None
                        }
                    }
                    Phase::Normal => {
                        let watching_other = inner
                            .coordinator
                            .as_deref()
                            .is_some_and(|coordinator| coordinator != self.name());
                        if !watching_other {
                            inner.last_seen = Instant::now();
                            None
                        } else if inner.last_seen.elapsed()
                            > self.shared.config.coordinator_timeout
                        {
                            Some("coordinator unresponsive")
                        } else {
                            None
                        }
                    }
                    Phase::Electing | Phase::Coordinator => None,
                }
            };

            if let Some(reason) = action {
                tracing::warn!(reason, "starting election");
                self.start_election();
            }
        }
    }

    // =========================================================================
    // Candidacy
    // =========================================================================

    pub fn start_election(self: &Arc<Self>) {
        {
            let mut inner = lock(&self.inner);
            if matches!(inner.phase, Phase::Electing) {
                tracing::debug!("election already in progress");
                return;
            }
            inner.phase = Phase::Electing;
            inner.waiting_since = None;
        }
        tracing::info!(rank = self.rank, "election started");
        self.log_event("election_started", self.name(), self.rank);

        let higher: Vec<PeerInfo> = self
            .shared
            .peers()
            .into_iter()
            .filter(|peer| peer.rank > self.rank && peer.server != self.name())
            .collect();

        if higher.is_empty() {
            self.become_coordinator();
            return;
        }

        let mut received_ok = false;
        for peer in &higher {
            if !self.shared.running() {
                return;
            }
            match self.challenge(peer) {
                Ok(true) => {
                    tracing::info!(peer = %peer.server, "higher rank answered OK, standing down");
                    self.log_event("ok_received", &peer.server, peer.rank);
                    received_ok = true;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(peer = %peer.server, "election challenge failed: {err}");
                }
            }
        }

        if received_ok {
            // An announcement may already have landed while we challenged;
            // only wait if the election is still ours to wait on.
            let mut inner = lock(&self.inner);
            if matches!(inner.phase, Phase::Electing) {
                inner.phase = Phase::Waiting;
                inner.waiting_since = Some(Instant::now());
            }
        } else {
            self.become_coordinator();
        }
    }

    fn challenge(&self, peer: &PeerInfo) -> Result<bool, RpcError> {
        let meta = self.shared.stamp();
        let payload = encode_election_request(
            &ElectionRequest::Election {
                rank: self.rank,
                server: self.name().to_string(),
            },
            meta,
        )?;
        let raw = request_reply(
            &peer.election_addr,
            &payload,
            self.shared.config.election_timeout,
        )?;
        let reply = decode_reply(&raw)?;
        self.shared.observe(reply.meta.clock);
        Ok(reply.status == Status::Ok)
    }

    fn become_coordinator(self: &Arc<Self>) {
        {
            let mut inner = lock(&self.inner);
            inner.phase = Phase::Coordinator;
            inner.coordinator = Some(self.name().to_string());
            inner.waiting_since = None;
            inner.last_seen = Instant::now();
        }
        tracing::info!(rank = self.rank, "this replica is now the coordinator");
        self.log_event("became_coordinator", self.name(), self.rank);

        // Announce on the servers topic and point-to-point to every peer.
        let meta = self.shared.stamp();
        self.publisher.publish(Publication::NewCoordinator {
            coordinator: self.name().to_string(),
            rank: self.rank,
            timestamp: meta.timestamp,
            clock: meta.clock,
        });

        for peer in self.shared.peers_excluding_self() {
            if let Err(err) = self.announce_to(&peer) {
                tracing::warn!(peer = %peer.server, "coordinator announcement failed: {err}");
            }
        }
        self.log_event("coordinator_announced", self.name(), self.rank);
    }

    fn announce_to(&self, peer: &PeerInfo) -> Result<(), RpcError> {
        let meta = self.shared.stamp();
        let payload = encode_election_request(
            &ElectionRequest::Coordinator {
                coordinator: self.name().to_string(),
                rank: self.rank,
            },
            meta,
        )?;
        let raw = request_reply(
            &peer.election_addr,
            &payload,
            self.shared.config.election_timeout,
        )?;
        let reply = decode_reply(&raw)?;
        self.shared.observe(reply.meta.clock);
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    fn log_event(&self, event: &'static str, server: &str, rank: u32) {
        let entry = ElectionEvent {
            timestamp: lock(&self.shared.state).now(),
            event,
            server: server.to_string(),
            rank,
        };
        let snapshot = {
            let mut log = lock(&self.log);
            log.push(entry);
            log.clone()
        };
        let document = serde_json::json!({
            "server": self.name(),
            "log": snapshot,
        });
        if let Err(err) = self.shared.store.save_diagnostic("election_log", &document) {
            tracing::warn!("election log write failed: {err}");
        }
    }
}

// =============================================================================
// `servers` topic subscriber
// =============================================================================

/// Listen on the proxy's subscriber side for `servers`-topic frames and feed
/// coordinator announcements into the election manager. Reconnects with a
/// short pause for as long as the replica runs.
pub fn run_servers_topic_loop(shared: &Arc<Shared>, election: &Arc<ElectionManager>) {
    let stop = shared.stop_flag();
    let addr = shared.config.proxy_sub_addr.clone();
    while shared.running() {
        match subscribe(&addr) {
            Ok(stream) => consume(&stream, shared, election),
            Err(err) => {
                tracing::debug!(addr = %addr, "servers topic unavailable: {err}");
            }
        }
        if !sleep_with_stop(&stop, Duration::from_secs(1)) {
            return;
        }
    }
}

fn subscribe(addr: &str) -> std::io::Result<TcpStream> {
    let socket_addr = super::resolve(addr)?;
    let stream = TcpStream::connect_timeout(&socket_addr, Duration::from_secs(1))?;
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;
    FrameWriter::new(&stream)
        .write_frame(SERVERS_TOPIC.as_bytes())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
    Ok(stream)
}

fn consume(stream: &TcpStream, shared: &Arc<Shared>, election: &Arc<ElectionManager>) {
    let mut reader = FrameReader::new(stream);
    let mut pending_topic: Option<Vec<u8>> = None;
    loop {
        if !shared.running() {
            return;
        }
        let frame = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(crate::wire::frame::FrameError::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => {
                tracing::debug!("servers topic stream ended: {err}");
                return;
            }
        };

        // Frames arrive in (topic, payload) pairs.
        let Some(topic) = pending_topic.take() else {
            pending_topic = Some(frame);
            continue;
        };
        if topic != SERVERS_TOPIC.as_bytes() {
            continue;
        }
        match decode_publication(&frame) {
            Ok(Publication::NewCoordinator {
                coordinator,
                rank,
                clock,
                ..
            }) => {
                shared.observe(clock);
                election.accept_coordinator(&coordinator, rank);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!("unparseable servers-topic frame: {err}");
            }
        }
    }
}
