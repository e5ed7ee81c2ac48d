//! Registry (reference server) client.
//!
//! Blocking request/reply calls: `rank` at startup, `heartbeat` every 5 s,
//! `list` every 20 s. The registry is a single point; when it is unreachable
//! the replica keeps serving with its cached peer list and the loops simply
//! try again next round.

use std::sync::Arc;
use std::time::Duration;

use crate::wire::proto::{
    decode_reply, encode_registry_request, PeerInfo, RegistryRequest, Reply, ReplyBody, Status,
};
use crate::Error;

use super::election::ElectionManager;
use super::{request_reply, sleep_with_stop, RpcError, Shared};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);
const REGISTER_ATTEMPTS: u32 = 5;

pub struct RegistryClient {
    shared: Arc<Shared>,
}

impl RegistryClient {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn call(&self, request: &RegistryRequest) -> Result<Reply, RpcError> {
        let meta = self.shared.stamp();
        let payload = encode_registry_request(request, meta)?;
        let raw = request_reply(&self.shared.config.registry_addr, &payload, CALL_TIMEOUT)?;
        let reply = decode_reply(&raw)?;
        self.shared.observe(reply.meta.clock);
        Ok(reply)
    }

    /// Acquire this replica's rank, advertising where peers can reach its
    /// replication and election sockets. The rank is stable across the
    /// process lifetime; without one the replica cannot take part in Bully,
    /// so persistent failure here is fatal.
    pub fn register(&self, replication_addr: &str, election_addr: &str) -> crate::Result<u32> {
        let request = RegistryRequest::Rank {
            server: self.shared.config.server_name.clone(),
            replication_addr: replication_addr.to_string(),
            election_addr: election_addr.to_string(),
        };

        let mut last_error = String::new();
        for attempt in 1..=REGISTER_ATTEMPTS {
            match self.call(&request) {
                Ok(reply) => match (reply.status, reply.body) {
                    (Status::Sucesso, ReplyBody::Rank(rank)) => return Ok(rank),
                    (status, _) => {
                        last_error = format!(
                            "registry answered {} ({})",
                            status.as_str(),
                            reply.description.unwrap_or_default()
                        );
                    }
                },
                Err(err) => last_error = err.to_string(),
            }
            tracing::warn!(attempt, "rank acquisition failed: {last_error}");
            if !sleep_with_stop(&self.shared.stop_flag(), Duration::from_secs(1)) {
                break;
            }
        }
        Err(Error::Registration(last_error))
    }

    pub fn fetch_list(&self) -> Result<Vec<PeerInfo>, RpcError> {
        let reply = self.call(&RegistryRequest::List)?;
        match reply.body {
            ReplyBody::Servers(list) => Ok(list),
            _ => Err(RpcError::UnexpectedReply),
        }
    }

    pub fn run_heartbeat_loop(&self) {
        let stop = self.shared.stop_flag();
        let interval = self.shared.config.heartbeat_interval;
        let request = RegistryRequest::Heartbeat {
            server: self.shared.config.server_name.clone(),
        };
        while sleep_with_stop(&stop, interval) {
            if let Err(err) = self.call(&request) {
                tracing::warn!("heartbeat failed: {err}");
            }
        }
    }

    /// Refresh the peer view. A successful list also refreshes the
    /// coordinator choice (minimum live rank) and counts as evidence the
    /// coordinator is alive.
    pub fn run_list_refresh_loop(&self, election: &Arc<ElectionManager>) {
        let stop = self.shared.stop_flag();
        let interval = self.shared.config.list_refresh_interval;
        while sleep_with_stop(&stop, interval) {
            match self.fetch_list() {
                Ok(list) => {
                    tracing::debug!(peers = list.len(), "peer list refreshed");
                    self.shared.set_peers(list.clone());
                    election.update_from_peer_list(&list);
                }
                Err(err) => {
                    tracing::warn!("peer list refresh failed, keeping cached list: {err}");
                }
            }
        }
    }
}
