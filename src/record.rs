//! Persisted record types.
//!
//! Records are append-only: the core never mutates or deletes them. Every
//! externally visible record carries a physical `timestamp` (wall clock plus
//! Berkeley offset at creation) and a Lamport `clock`; the total order on
//! records is lexicographic `(clock, timestamp)`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// One `login` registration. User names are globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginRecord {
    pub user: String,
    pub timestamp: f64,
    pub clock: u64,
}

/// One channel creation. Channel names are globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel: String,
    pub timestamp: f64,
    pub clock: u64,
}

/// A public channel message or a private direct message.
///
/// Both kinds live in the same `messages` sequence, distinguished by the
/// `type` field on the wire and on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageRecord {
    #[serde(rename = "publish")]
    Publish {
        user: String,
        channel: String,
        message: String,
        timestamp: f64,
        clock: u64,
    },
    #[serde(rename = "message")]
    Private {
        src: String,
        dst: String,
        message: String,
        timestamp: f64,
        clock: u64,
    },
}

impl MessageRecord {
    pub fn clock(&self) -> u64 {
        match self {
            MessageRecord::Publish { clock, .. } | MessageRecord::Private { clock, .. } => *clock,
        }
    }

    pub fn timestamp(&self) -> f64 {
        match self {
            MessageRecord::Publish { timestamp, .. }
            | MessageRecord::Private { timestamp, .. } => *timestamp,
        }
    }

    /// The deterministic order every replica agrees on once converged.
    pub fn cmp_causal(&self, other: &Self) -> Ordering {
        self.clock()
            .cmp(&other.clock())
            .then(self.timestamp().total_cmp(&other.timestamp()))
    }
}

/// Sort a message sequence into `(clock, timestamp)` order.
pub fn sort_causal(records: &mut [MessageRecord]) {
    records.sort_by(MessageRecord::cmp_causal);
}

/// Channel history: public records for `channel`, causal order, most recent
/// `limit`. A non-positive limit yields the empty list.
pub fn channel_history(records: &[MessageRecord], channel: &str, limit: i64) -> Vec<MessageRecord> {
    let mut matched: Vec<MessageRecord> = records
        .iter()
        .filter(|record| matches!(record, MessageRecord::Publish { channel: c, .. } if c == channel))
        .cloned()
        .collect();
    sort_causal(&mut matched);
    tail(matched, limit)
}

/// Private history for `user`: direct records the user sent or received,
/// narrowed to the conversation with `peer` when `peer` is non-empty.
pub fn private_history(
    records: &[MessageRecord],
    user: &str,
    peer: &str,
    limit: i64,
) -> Vec<MessageRecord> {
    let mut matched: Vec<MessageRecord> = records
        .iter()
        .filter(|record| match record {
            MessageRecord::Private { src, dst, .. } => {
                if peer.is_empty() {
                    src == user || dst == user
                } else {
                    (src == user && dst == peer) || (src == peer && dst == user)
                }
            }
            MessageRecord::Publish { .. } => false,
        })
        .cloned()
        .collect();
    sort_causal(&mut matched);
    tail(matched, limit)
}

fn tail(mut records: Vec<MessageRecord>, limit: i64) -> Vec<MessageRecord> {
    if limit <= 0 {
        return Vec::new();
    }
    let limit = limit as usize;
    if records.len() > limit {
        records.drain(..records.len() - limit);
    }
    records
}

/// Full-state capture shipped by `sync_state` and applied wholesale on
/// replication receipt.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub logins: Vec<LoginRecord>,
    pub channels: Vec<ChannelRecord>,
    pub messages: Vec<MessageRecord>,
}
