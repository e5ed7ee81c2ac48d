//! Berkeley physical-clock synchronizer.
//!
//! Coordinator-only. One cycle: probe every peer's corrected clock in
//! parallel (2-second timeout, non-responders dropped for the round),
//! average the reported times including our own, then distribute the
//! per-server deltas as additive offsets. Every stamped record thereafter
//! reads `wall_clock + time_offset`.

use std::sync::Arc;

use serde::Serialize;

use crate::wire::proto::{
    decode_reply, encode_peer_request, PeerInfo, PeerRequest, Reply, ReplyBody, Status,
};

use super::election::ElectionManager;
use super::{lock, request_reply, RpcError, Shared};

/// One applied adjustment, kept for the sync-history diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRecord {
    pub timestamp: f64,
    pub offset_applied: f64,
    pub total_offset: f64,
}

/// `avg(times) - time_i` for every reporter. All zero when every clock
/// already agrees.
pub fn compute_offsets(times: &[(String, f64)]) -> Vec<(String, f64)> {
    if times.is_empty() {
        return Vec::new();
    }
    let avg = times.iter().map(|(_, time)| *time).sum::<f64>() / times.len() as f64;
    times
        .iter()
        .map(|(server, time)| (server.clone(), avg - time))
        .collect()
}

pub fn run_cycle(shared: &Arc<Shared>, election: &Arc<ElectionManager>) {
    if !election.is_coordinator() {
        tracing::debug!("not coordinator, skipping clock sync");
        return;
    }

    // Collect.
    let peers = shared.peers_excluding_self();
    let own_time = lock(&shared.state).now();
    let server_name = shared.config.server_name.clone();

    let (tx, rx) = crossbeam::channel::unbounded();
    for peer in peers {
        let shared = shared.clone();
        let tx = tx.clone();
        std::thread::spawn(move || {
            let result = probe(&shared, &peer);
            let _ = tx.send((peer, result));
        });
    }
    drop(tx);

    let mut times = vec![(server_name.clone(), own_time)];
    let mut responders = Vec::new();
    // Every probe thread finishes within its timeout, so this drains.
    for (peer, result) in rx.iter() {
        match result {
            Ok(time) => {
                times.push((peer.server.clone(), time));
                responders.push(peer);
            }
            Err(err) => {
                tracing::warn!(peer = %peer.server, "clock probe failed, discarding for this round: {err}");
            }
        }
    }

    if times.len() < 2 {
        tracing::debug!(reporters = times.len(), "not enough clocks to synchronize");
        return;
    }

    // Compute.
    let offsets = compute_offsets(&times);
    tracing::info!(reporters = times.len(), "clock offsets computed");

    // Distribute.
    for peer in &responders {
        let Some((_, offset)) = offsets.iter().find(|(server, _)| *server == peer.server) else {
            continue;
        };
        if let Err(err) = distribute(shared, peer, *offset) {
            tracing::warn!(peer = %peer.server, "offset distribution failed: {err}");
        }
    }

    // Apply our own share.
    if let Some((_, own_offset)) = offsets.iter().find(|(server, _)| *server == server_name) {
        let total = lock(&shared.state).adjust_time(*own_offset);
        tracing::info!(
            offset_secs = own_offset,
            total_offset_secs = total,
            "coordinator clock adjusted"
        );
        record_adjustment(shared, *own_offset, total);
    }
}

fn probe(shared: &Arc<Shared>, peer: &PeerInfo) -> Result<f64, RpcError> {
    let reply = exchange(shared, &peer.replication_addr, &PeerRequest::GetTime)?;
    match reply.body {
        ReplyBody::Time { time, .. } => Ok(time),
        _ => Err(RpcError::UnexpectedReply),
    }
}

fn distribute(shared: &Arc<Shared>, peer: &PeerInfo, offset: f64) -> Result<(), RpcError> {
    let request = PeerRequest::AdjustTime {
        coordinator: shared.config.server_name.clone(),
        offset,
    };
    let reply = exchange(shared, &peer.replication_addr, &request)?;
    if reply.status != Status::Success {
        tracing::warn!(
            peer = %peer.server,
            status = reply.status.as_str(),
            "peer rejected offset"
        );
    }
    Ok(())
}

fn exchange(shared: &Arc<Shared>, addr: &str, request: &PeerRequest) -> Result<Reply, RpcError> {
    let meta = shared.stamp();
    let payload = encode_peer_request(request, meta)?;
    let raw = request_reply(addr, &payload, shared.config.berkeley_timeout)?;
    let reply = decode_reply(&raw)?;
    shared.observe(reply.meta.clock);
    Ok(reply)
}

/// Append to the per-replica sync history diagnostic.
pub fn record_adjustment(shared: &Arc<Shared>, offset: f64, total: f64) {
    let record = SyncRecord {
        timestamp: crate::clock::wall_now(),
        offset_applied: offset,
        total_offset: total,
    };
    let history = {
        let mut history = lock(&shared.berkeley_history);
        history.push(record);
        history.clone()
    };
    let document = serde_json::json!({
        "server": shared.config.server_name,
        "time_offset": total,
        "sync_history": history,
    });
    let name = format!("berkeley_sync_{}", shared.config.server_name);
    if let Err(err) = shared.store.save_diagnostic(&name, &document) {
        tracing::warn!("sync history write failed: {err}");
    }
}
