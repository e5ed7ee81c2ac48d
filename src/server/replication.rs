//! Replication manager.
//!
//! Last-writer-wins, whole-kind replication. Every `SYNC_INTERVAL` processed
//! mutations the replica ships its three sequences to every known peer, one
//! detached task per (peer, kind) with a 3-second timeout and no retry; the
//! next scheduled push subsumes anything lost. The listener side accepts
//! `replicate` (wholesale overwrite), `sync_state` (atomic snapshot for a
//! restarted peer), and the Berkeley probes `get_time` / `adjust_time`.

use std::net::TcpStream;
use std::sync::Arc;

use serde::Serialize;

use crate::store::Kind;
use crate::wire::frame::{FrameReader, FrameWriter};
use crate::wire::proto::{
    decode_peer_request, decode_reply, encode_peer_request, encode_reply, Meta, PeerInfo,
    PeerRequest, RecordSet, Reply, ReplyBody, Status,
};

use super::berkeley;
use super::election::ElectionManager;
use super::{lock, request_reply, RpcError, Shared};

/// One replication receipt, kept for the per-replica diagnostic journal.
/// Never consulted by the state machine.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationEvent {
    pub timestamp: f64,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub records: usize,
}

// =============================================================================
// Listener side
// =============================================================================

pub fn handle_connection(stream: TcpStream, shared: &Arc<Shared>) {
    let mut reader = FrameReader::new(&stream);
    loop {
        let frame = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                tracing::debug!("replication connection dropped: {err}");
                return;
            }
        };

        let reply = match decode_peer_request(&frame) {
            Ok((request, meta)) => {
                shared.observe(meta.clock);
                handle_request(shared, request)
            }
            Err(err) => Reply::new("replicate", Status::Erro, shared.stamp())
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

fn handle_request(shared: &Arc<Shared>, request: PeerRequest) -> Reply {
    match request {
        PeerRequest::Replicate { source, records } => {
            let kind = records.kind();
            let count = records.len();
            tracing::debug!(source = %source, kind = %kind, records = count, "replication received");

            // The new value overrides the old, in memory and on disk.
            lock(&shared.state).apply_replicated(records.clone());
            let persisted = match records {
                RecordSet::Logins(records) => shared.store.save_logins(&records),
                RecordSet::Channels(records) => shared.store.save_channels(&records),
                RecordSet::Messages(records) => shared.store.save_messages(&records),
            };
            if let Err(err) = persisted {
                tracing::warn!(kind = %kind, "replicated state not persisted: {err}");
            }

            journal_receipt(shared, &source, kind, count);

            Reply::new("replicate", Status::Success, shared.stamp())
                .with_body(ReplyBody::RecordsReceived(count as u64))
        }
        PeerRequest::SyncState => {
            let snapshot = lock(&shared.state).snapshot();
            Reply::new("sync_state", Status::Success, shared.stamp())
                .with_body(ReplyBody::State(snapshot))
        }
        PeerRequest::GetTime => {
            let time = lock(&shared.state).now();
            Reply::new("get_time", Status::Success, shared.stamp()).with_body(ReplyBody::Time {
                time,
                server: shared.config.server_name.clone(),
            })
        }
        PeerRequest::AdjustTime {
            coordinator,
            offset,
        } => {
            let total = lock(&shared.state).adjust_time(offset);
            tracing::info!(
                from = %coordinator,
                offset_secs = offset,
                total_offset_secs = total,
                "clock offset applied"
            );
            berkeley::record_adjustment(shared, offset, total);
            Reply::new("adjust_time", Status::Success, shared.stamp())
        }
    }
}

fn journal_receipt(shared: &Arc<Shared>, source: &str, kind: Kind, count: usize) {
    let event = ReplicationEvent {
        timestamp: lock(&shared.state).now(),
        source: source.to_string(),
        kind: kind.as_str().to_string(),
        records: count,
    };
    let log = {
        let mut journal = lock(&shared.replication_log);
        journal.push(event);
        journal.clone()
    };
    let document = serde_json::json!({
        "server": shared.config.server_name,
        "log": log,
    });
    if let Err(err) = shared
        .store
        .save_diagnostic(&shared.config.server_name, &document)
    {
        tracing::warn!("replication journal write failed: {err}");
    }
}

// =============================================================================
// Push side
// =============================================================================

/// Sync-interval trigger: flush to disk, push everything to every peer, and
/// run a Berkeley cycle when this replica holds the coordinator role. All
/// network work happens on detached threads with snapshots taken up front.
pub fn run_sync_round(shared: &Arc<Shared>, election: &Arc<ElectionManager>) {
    shared.flush();

    {
        let shared = shared.clone();
        std::thread::spawn(move || push_to_peers(&shared));
    }

    if election.is_coordinator() {
        let shared = shared.clone();
        let election = election.clone();
        std::thread::spawn(move || berkeley::run_cycle(&shared, &election));
    }
}

pub fn push_to_peers(shared: &Arc<Shared>) {
    let peers = shared.peers_excluding_self();
    if peers.is_empty() {
        tracing::debug!("no peers to replicate to");
        return;
    }

    // Snapshot the three kinds and stamp their frames under one lock hold;
    // the sends happen outside it.
    let sets: Vec<(RecordSet, Meta)> = {
        let mut state = lock(&shared.state);
        Kind::ALL
            .iter()
            .map(|kind| {
                let records = state.record_set(*kind);
                let meta = state.stamp();
                (records, meta)
            })
            .collect()
    };

    tracing::debug!(peers = peers.len(), "replicating state to peers");
    let mut workers = Vec::new();
    for peer in peers {
        for (records, meta) in &sets {
            let shared = shared.clone();
            let peer = peer.clone();
            let records = records.clone();
            let meta = *meta;
            workers.push(std::thread::spawn(move || {
                push_one(&shared, &peer, records, meta);
            }));
        }
    }
    for worker in workers {
        let _ = worker.join();
    }
}

fn push_one(shared: &Arc<Shared>, peer: &PeerInfo, records: RecordSet, meta: Meta) {
    let kind = records.kind();
    let count = records.len();
    let request = PeerRequest::Replicate {
        source: shared.config.server_name.clone(),
        records,
    };
    match send_peer_request(shared, &peer.replication_addr, &request, meta) {
        Ok(reply) if reply.status == Status::Success => {
            tracing::debug!(peer = %peer.server, kind = %kind, records = count, "replicated");
        }
        Ok(reply) => {
            tracing::warn!(
                peer = %peer.server,
                kind = %kind,
                status = reply.status.as_str(),
                "peer refused replication: {}",
                reply.description.unwrap_or_default()
            );
        }
        Err(err) => {
            // Not retried: the next scheduled push subsumes this one.
            tracing::warn!(peer = %peer.server, kind = %kind, "replication push failed: {err}");
        }
    }
}

fn send_peer_request(
    shared: &Arc<Shared>,
    addr: &str,
    request: &PeerRequest,
    meta: Meta,
) -> Result<Reply, RpcError> {
    let payload = encode_peer_request(request, meta)?;
    let raw = request_reply(addr, &payload, shared.config.replication_timeout)?;
    let reply = decode_reply(&raw)?;
    shared.observe(reply.meta.clock);
    Ok(reply)
}

// =============================================================================
// Pull-on-start
// =============================================================================

/// Overwrite local state with the coordinator's full snapshot. On any
/// failure the replica proceeds with whatever it loaded from disk; the next
/// push round converges it.
pub fn sync_from_coordinator(shared: &Arc<Shared>, election: &Arc<ElectionManager>) {
    let Some(coordinator) = election.coordinator() else {
        tracing::debug!("no coordinator known, skipping startup sync");
        return;
    };
    if coordinator == shared.config.server_name {
        return;
    }
    let Some(peer) = shared
        .peers()
        .into_iter()
        .find(|peer| peer.server == coordinator)
    else {
        tracing::warn!(coordinator = %coordinator, "coordinator missing from peer list, skipping startup sync");
        return;
    };

    let meta = shared.stamp();
    match send_peer_request(shared, &peer.replication_addr, &PeerRequest::SyncState, meta) {
        Ok(reply) => match reply.body {
            ReplyBody::State(snapshot) => {
                let counts = (
                    snapshot.logins.len(),
                    snapshot.channels.len(),
                    snapshot.messages.len(),
                );
                lock(&shared.state).apply_snapshot(snapshot);
                shared.flush();
                tracing::info!(
                    coordinator = %coordinator,
                    logins = counts.0,
                    channels = counts.1,
                    messages = counts.2,
                    "state synchronized from coordinator"
                );
            }
            _ => {
                tracing::warn!(coordinator = %coordinator, "sync_state reply had no snapshot");
            }
        },
        Err(err) => {
            tracing::warn!(coordinator = %coordinator, "startup sync failed, using local state: {err}");
        }
    }
}
