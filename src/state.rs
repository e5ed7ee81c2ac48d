//! In-memory replica state.
//!
//! One owned object holding the three record sequences, the name sets
//! derived from them, the Lamport counter, the Berkeley `time_offset` and the
//! processed-mutation counter. All of it advances under a single lock, so an
//! observer sees either a pre-operation or post-operation state. Mutation
//! happens in exactly two places: a client request or a replication receipt,
//! and a replication receipt replaces a whole sequence.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::clock::{corrected_now, LamportClock};
use crate::record::{self, ChannelRecord, LoginRecord, MessageRecord, StateSnapshot};
use crate::store::{DataStore, Kind};
use crate::wire::proto::{Meta, RecordSet};

/// Validation failures, surfaced to clients in the `description` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OpError {
    #[error("Nome de usuário não fornecido")]
    EmptyUser,
    #[error("Usuário já cadastrado")]
    DuplicateUser,
    #[error("Usuário não cadastrado")]
    UnknownUser,
    #[error("Nome do canal não fornecido")]
    EmptyChannel,
    #[error("Canal já existe")]
    DuplicateChannel,
    #[error("Canal não existe")]
    UnknownChannel,
    #[error("Remetente não fornecido")]
    EmptySrc,
    #[error("Usuário remetente não existe")]
    UnknownSrc,
    #[error("Destinatário não fornecido")]
    EmptyDst,
    #[error("Usuário destinatário não existe")]
    UnknownDst,
}

pub struct ReplicaState {
    logins: Vec<LoginRecord>,
    channel_records: Vec<ChannelRecord>,
    messages: Vec<MessageRecord>,
    users: BTreeSet<String>,
    channels: BTreeSet<String>,
    clock: LamportClock,
    time_offset: f64,
    processed: u64,
}

impl ReplicaState {
    pub fn new() -> Self {
        Self {
            logins: Vec::new(),
            channel_records: Vec::new(),
            messages: Vec::new(),
            users: BTreeSet::new(),
            channels: BTreeSet::new(),
            clock: LamportClock::new(),
            time_offset: 0.0,
            processed: 0,
        }
    }

    /// Rebuild from the persisted sequences. Applying the sequences in
    /// insertion order reproduces the pre-restart state.
    pub fn load(store: &DataStore) -> Self {
        let mut state = Self::new();
        state.replace_logins(store.load_logins());
        state.replace_channels(store.load_channels());
        state.messages = store.load_messages();

        // Resume the Lamport counter past every stamp we ever issued.
        let max_clock = state
            .logins
            .iter()
            .map(|r| r.clock)
            .chain(state.channel_records.iter().map(|r| r.clock))
            .chain(state.messages.iter().map(MessageRecord::clock))
            .max()
            .unwrap_or(0);
        if max_clock > 0 {
            state.clock.observe(max_clock);
        }
        state
    }

    // =========================================================================
    // Clock discipline
    // =========================================================================

    /// Merge a received Lamport value.
    pub fn observe(&mut self, received: u64) {
        self.clock.observe(received);
    }

    /// Advance the clock and stamp a frame: `(corrected wall time, tick)`.
    pub fn stamp(&mut self) -> Meta {
        Meta {
            timestamp: corrected_now(self.time_offset),
            clock: self.clock.tick(),
        }
    }

    pub fn clock_value(&self) -> u64 {
        self.clock.current()
    }

    /// Offset-corrected wall clock.
    pub fn now(&self) -> f64 {
        corrected_now(self.time_offset)
    }

    pub fn time_offset(&self) -> f64 {
        self.time_offset
    }

    /// Berkeley adjustment: offsets accumulate across rounds.
    pub fn adjust_time(&mut self, offset: f64) -> f64 {
        self.time_offset += offset;
        self.time_offset
    }

    // =========================================================================
    // Client operations
    // =========================================================================

    pub fn login(&mut self, user: &str) -> Result<LoginRecord, OpError> {
        if user.is_empty() {
            return Err(OpError::EmptyUser);
        }
        if self.users.contains(user) {
            return Err(OpError::DuplicateUser);
        }
        let meta = self.stamp();
        let record = LoginRecord {
            user: user.to_string(),
            timestamp: meta.timestamp,
            clock: meta.clock,
        };
        self.users.insert(record.user.clone());
        self.logins.push(record.clone());
        Ok(record)
    }

    pub fn users(&self) -> Vec<String> {
        self.users.iter().cloned().collect()
    }

    pub fn create_channel(&mut self, channel: &str) -> Result<ChannelRecord, OpError> {
        if channel.is_empty() {
            return Err(OpError::EmptyChannel);
        }
        if self.channels.contains(channel) {
            return Err(OpError::DuplicateChannel);
        }
        let meta = self.stamp();
        let record = ChannelRecord {
            channel: channel.to_string(),
            timestamp: meta.timestamp,
            clock: meta.clock,
        };
        self.channels.insert(record.channel.clone());
        self.channel_records.push(record.clone());
        Ok(record)
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().cloned().collect()
    }

    pub fn publish(
        &mut self,
        user: &str,
        channel: &str,
        message: &str,
    ) -> Result<MessageRecord, OpError> {
        if channel.is_empty() {
            return Err(OpError::EmptyChannel);
        }
        if !self.channels.contains(channel) {
            return Err(OpError::UnknownChannel);
        }
        if user.is_empty() {
            return Err(OpError::EmptyUser);
        }
        if !self.users.contains(user) {
            return Err(OpError::UnknownUser);
        }
        let meta = self.stamp();
        let record = MessageRecord::Publish {
            user: user.to_string(),
            channel: channel.to_string(),
            message: message.to_string(),
            timestamp: meta.timestamp,
            clock: meta.clock,
        };
        self.messages.push(record.clone());
        Ok(record)
    }

    pub fn private_message(
        &mut self,
        src: &str,
        dst: &str,
        message: &str,
    ) -> Result<MessageRecord, OpError> {
        if dst.is_empty() {
            return Err(OpError::EmptyDst);
        }
        if !self.users.contains(dst) {
            return Err(OpError::UnknownDst);
        }
        if src.is_empty() {
            return Err(OpError::EmptySrc);
        }
        if !self.users.contains(src) {
            return Err(OpError::UnknownSrc);
        }
        let meta = self.stamp();
        let record = MessageRecord::Private {
            src: src.to_string(),
            dst: dst.to_string(),
            message: message.to_string(),
            timestamp: meta.timestamp,
            clock: meta.clock,
        };
        self.messages.push(record.clone());
        Ok(record)
    }

    pub fn history(&self, channel: &str, limit: i64) -> Result<Vec<MessageRecord>, OpError> {
        if channel.is_empty() {
            return Err(OpError::EmptyChannel);
        }
        if !self.channels.contains(channel) {
            return Err(OpError::UnknownChannel);
        }
        Ok(record::channel_history(&self.messages, channel, limit))
    }

    pub fn private_history(
        &self,
        user: &str,
        peer: &str,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, OpError> {
        if user.is_empty() {
            return Err(OpError::EmptyUser);
        }
        if !self.users.contains(user) {
            return Err(OpError::UnknownUser);
        }
        Ok(record::private_history(&self.messages, user, peer, limit))
    }

    // =========================================================================
    // Sync bookkeeping
    // =========================================================================

    /// Count a successful mutation; true when a sync round is due.
    pub fn bump_processed(&mut self, sync_interval: u64) -> bool {
        self.processed += 1;
        sync_interval > 0 && self.processed % sync_interval == 0
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    // =========================================================================
    // Snapshots and replication
    // =========================================================================

    /// The full message sequence, cloned for persistence.
    pub fn messages(&self) -> Vec<MessageRecord> {
        self.messages.clone()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            logins: self.logins.clone(),
            channels: self.channel_records.clone(),
            messages: self.messages.clone(),
        }
    }

    pub fn record_set(&self, kind: Kind) -> RecordSet {
        match kind {
            Kind::Logins => RecordSet::Logins(self.logins.clone()),
            Kind::Channels => RecordSet::Channels(self.channel_records.clone()),
            Kind::Messages => RecordSet::Messages(self.messages.clone()),
        }
    }

    /// Wholesale overwrite of one kind (last writer wins; no merging).
    pub fn apply_replicated(&mut self, records: RecordSet) {
        match records {
            RecordSet::Logins(records) => self.replace_logins(records),
            RecordSet::Channels(records) => self.replace_channels(records),
            RecordSet::Messages(records) => self.messages = records,
        }
    }

    /// Wholesale overwrite of everything (startup pull from the coordinator).
    pub fn apply_snapshot(&mut self, snapshot: StateSnapshot) {
        self.replace_logins(snapshot.logins);
        self.replace_channels(snapshot.channels);
        self.messages = snapshot.messages;
    }

    fn replace_logins(&mut self, records: Vec<LoginRecord>) {
        self.users = records.iter().map(|r| r.user.clone()).collect();
        self.logins = records;
    }

    fn replace_channels(&mut self, records: Vec<ChannelRecord>) {
        self.channels = records.iter().map(|r| r.channel.clone()).collect();
        self.channel_records = records;
    }
}

impl Default for ReplicaState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn login_rejects_duplicates_and_keeps_one_record() {
        let mut state = ReplicaState::new();
        state.login("alice").unwrap();
        assert_eq!(state.login("alice"), Err(OpError::DuplicateUser));
        assert_eq!(state.users(), vec!["alice".to_string()]);
        assert_eq!(state.snapshot().logins.len(), 1);
    }

    #[test]
    fn empty_names_are_rejected() {
        let mut state = ReplicaState::new();
        assert_eq!(state.login(""), Err(OpError::EmptyUser));
        assert_eq!(state.create_channel(""), Err(OpError::EmptyChannel));
        assert_eq!(state.history("", 5), Err(OpError::EmptyChannel));
    }

    #[test]
    fn publish_requires_channel_and_user() {
        let mut state = ReplicaState::new();
        assert_eq!(
            state.publish("alice", "geral", "oi"),
            Err(OpError::UnknownChannel)
        );
        state.login("bob").unwrap();
        state.create_channel("geral").unwrap();
        assert_eq!(
            state.publish("alice", "geral", "oi"),
            Err(OpError::UnknownUser)
        );
        assert!(state.publish("bob", "geral", "oi").is_ok());
    }

    #[test]
    fn private_message_checks_both_ends() {
        let mut state = ReplicaState::new();
        state.login("alice").unwrap();
        assert_eq!(
            state.private_message("alice", "bob", "oi"),
            Err(OpError::UnknownDst)
        );
        state.login("bob").unwrap();
        assert_eq!(
            state.private_message("carol", "bob", "oi"),
            Err(OpError::UnknownSrc)
        );
        assert!(state.private_message("alice", "bob", "oi").is_ok());
    }

    #[test]
    fn record_clocks_are_unique_and_increasing() {
        let mut state = ReplicaState::new();
        state.login("alice").unwrap();
        state.create_channel("geral").unwrap();
        for i in 0..20 {
            state.publish("alice", "geral", &format!("m{i}")).unwrap();
        }
        let snapshot = state.snapshot();
        // Stamped in insertion order: login, channel, then the publishes.
        let clocks: Vec<u64> = snapshot
            .logins
            .iter()
            .map(|r| r.clock)
            .chain(snapshot.channels.iter().map(|r| r.clock))
            .chain(snapshot.messages.iter().map(MessageRecord::clock))
            .collect();
        assert!(clocks.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn reply_stamp_exceeds_observed_clock() {
        let mut state = ReplicaState::new();
        state.observe(41);
        let meta = state.stamp();
        assert!(meta.clock > 41);
    }

    #[test]
    fn bump_processed_fires_on_interval() {
        let mut state = ReplicaState::new();
        let mut fired = 0;
        for _ in 0..20 {
            if state.bump_processed(10) {
                fired += 1;
            }
        }
        assert_eq!(fired, 2);
    }

    #[test]
    fn replicated_overwrite_replaces_wholesale() {
        let mut state = ReplicaState::new();
        state.login("old").unwrap();

        state.apply_replicated(RecordSet::Logins(vec![LoginRecord {
            user: "new".into(),
            timestamp: 1.0,
            clock: 1,
        }]));
        assert_eq!(state.users(), vec!["new".to_string()]);
        assert_eq!(state.login("new"), Err(OpError::DuplicateUser));
        assert!(state.login("old").is_ok());
    }

    #[test]
    fn reload_reproduces_state_and_resumes_clock() {
        let dir = TempDir::new().expect("tempdir");
        let store = DataStore::open(dir.path()).unwrap();

        let mut state = ReplicaState::new();
        state.login("alice").unwrap();
        state.create_channel("geral").unwrap();
        state.publish("alice", "geral", "oi").unwrap();
        let snapshot = state.snapshot();
        store.save_logins(&snapshot.logins).unwrap();
        store.save_channels(&snapshot.channels).unwrap();
        store.save_messages(&snapshot.messages).unwrap();

        let mut reloaded = ReplicaState::load(&store);
        assert_eq!(reloaded.snapshot(), snapshot);
        // New stamps must not collide with persisted ones.
        let meta = reloaded.stamp();
        assert!(meta.clock > snapshot.messages[0].clock());
    }

    #[test]
    fn adjust_time_accumulates() {
        let mut state = ReplicaState::new();
        state.adjust_time(2.5);
        state.adjust_time(-1.0);
        assert!((state.time_offset() - 1.5).abs() < f64::EPSILON);
    }
}
