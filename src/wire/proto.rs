//! Wire protocol: binary-packed `{service, data}` envelopes in CBOR.
//!
//! Every frame on every surface is a two-key map: the `service` name and a
//! `data` map. Requests and replies both carry the sender's Lamport `clock`
//! and offset-corrected `timestamp` inside `data`. Decoders skip unknown
//! keys, reject indefinite-length containers and trailing bytes, and report
//! missing required fields by name.

use std::convert::Infallible;

use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::record::{ChannelRecord, LoginRecord, MessageRecord, StateSnapshot};
use crate::store::Kind;

/// Topic carrying election announcements and system notifications.
pub const SERVERS_TOPIC: &str = "servers";

/// History window when the client does not send a `limit`.
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

/// Lamport clock and physical timestamp attached to a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Meta {
    pub timestamp: f64,
    pub clock: u64,
}

/// Reply status vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// `"sucesso"`: client-surface success.
    Sucesso,
    /// `"erro"`: failure on any surface.
    Erro,
    /// `"OK"`: publish/message acks and election replies.
    Ok,
    /// `"success"`: peer-surface success.
    Success,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Sucesso => "sucesso",
            Status::Erro => "erro",
            Status::Ok => "OK",
            Status::Success => "success",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sucesso" => Some(Status::Sucesso),
            "erro" => Some(Status::Erro),
            "OK" => Some(Status::Ok),
            "success" => Some(Status::Success),
            _ => None,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Status::Erro)
    }
}

// =============================================================================
// Requests
// =============================================================================

/// The eight client services.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientRequest {
    Login {
        user: String,
    },
    Users,
    Channel {
        channel: String,
    },
    Channels,
    Publish {
        user: String,
        channel: String,
        message: String,
    },
    Message {
        src: String,
        dst: String,
        message: String,
    },
    GetHistory {
        channel: String,
        limit: i64,
    },
    GetPrivateHistory {
        user: String,
        peer: String,
        limit: i64,
    },
}

impl ClientRequest {
    pub fn service(&self) -> &'static str {
        match self {
            ClientRequest::Login { .. } => "login",
            ClientRequest::Users => "users",
            ClientRequest::Channel { .. } => "channel",
            ClientRequest::Channels => "channels",
            ClientRequest::Publish { .. } => "publish",
            ClientRequest::Message { .. } => "message",
            ClientRequest::GetHistory { .. } => "get_history",
            ClientRequest::GetPrivateHistory { .. } => "get_private_history",
        }
    }
}

/// One replicated sequence, pushed wholesale.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordSet {
    Logins(Vec<LoginRecord>),
    Channels(Vec<ChannelRecord>),
    Messages(Vec<MessageRecord>),
}

impl RecordSet {
    pub fn kind(&self) -> Kind {
        match self {
            RecordSet::Logins(_) => Kind::Logins,
            RecordSet::Channels(_) => Kind::Channels,
            RecordSet::Messages(_) => Kind::Messages,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RecordSet::Logins(records) => records.len(),
            RecordSet::Channels(records) => records.len(),
            RecordSet::Messages(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Services on the replication port.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerRequest {
    Replicate { source: String, records: RecordSet },
    SyncState,
    GetTime,
    AdjustTime { coordinator: String, offset: f64 },
}

impl PeerRequest {
    pub fn service(&self) -> &'static str {
        match self {
            PeerRequest::Replicate { .. } => "replicate",
            PeerRequest::SyncState => "sync_state",
            PeerRequest::GetTime => "get_time",
            PeerRequest::AdjustTime { .. } => "adjust_time",
        }
    }
}

/// Services on the election port.
#[derive(Clone, Debug, PartialEq)]
pub enum ElectionRequest {
    /// Candidacy announcement; the callee replies OK iff its rank is greater.
    Election { rank: u32, server: String },
    /// Point-to-point new-coordinator announcement.
    Coordinator { coordinator: String, rank: u32 },
}

impl ElectionRequest {
    pub fn service(&self) -> &'static str {
        match self {
            ElectionRequest::Election { .. } => "election",
            ElectionRequest::Coordinator { .. } => "coordinator",
        }
    }
}

/// Services on the registry (reference server).
#[derive(Clone, Debug, PartialEq)]
pub enum RegistryRequest {
    Rank {
        server: String,
        replication_addr: String,
        election_addr: String,
    },
    List,
    Heartbeat {
        server: String,
    },
}

impl RegistryRequest {
    pub fn service(&self) -> &'static str {
        match self {
            RegistryRequest::Rank { .. } => "rank",
            RegistryRequest::List => "list",
            RegistryRequest::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// One registry entry as returned by `list`.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerInfo {
    pub server: String,
    pub rank: u32,
    pub last_heartbeat: f64,
    pub replication_addr: String,
    pub election_addr: String,
}

// =============================================================================
// Replies
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    /// Echoes the request service.
    pub service: String,
    pub status: Status,
    pub meta: Meta,
    pub description: Option<String>,
    pub body: ReplyBody,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReplyBody {
    Empty,
    Users(Vec<String>),
    Channels(Vec<String>),
    Messages(Vec<MessageRecord>),
    State(StateSnapshot),
    Time { time: f64, server: String },
    RecordsReceived(u64),
    Rank(u32),
    Servers(Vec<PeerInfo>),
    ElectionOk { rank: u32, server: String },
}

impl Reply {
    pub fn new(service: impl Into<String>, status: Status, meta: Meta) -> Self {
        Self {
            service: service.into(),
            status,
            meta,
            description: None,
            body: ReplyBody::Empty,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_body(mut self, body: ReplyBody) -> Self {
        self.body = body;
        self
    }
}

// =============================================================================
// Publications (topic frame + payload frame through the proxy)
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum Publication {
    /// Full message record, fanned out on the channel's topic (public) or
    /// the destination user's topic (private). The record carries its own
    /// stamps.
    Record(MessageRecord),
    /// Channel creation notice on the `servers` topic.
    NewChannel {
        channel: String,
        timestamp: f64,
        clock: u64,
    },
    /// Election result on the `servers` topic.
    NewCoordinator {
        coordinator: String,
        rank: u32,
        timestamp: f64,
        clock: u64,
    },
}

impl Publication {
    pub fn topic(&self) -> &str {
        match self {
            Publication::Record(MessageRecord::Publish { channel, .. }) => channel,
            Publication::Record(MessageRecord::Private { dst, .. }) => dst,
            Publication::NewChannel { .. } | Publication::NewCoordinator { .. } => SERVERS_TOPIC,
        }
    }

    fn service(&self) -> &'static str {
        match self {
            Publication::Record(MessageRecord::Publish { .. }) => "publish",
            Publication::Record(MessageRecord::Private { .. }) => "message",
            Publication::NewChannel { .. } => "channel",
            Publication::NewCoordinator { .. } => "election",
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("trailing bytes after envelope")]
    TrailingBytes,
}

// =============================================================================
// Envelope plumbing
// =============================================================================

type Enc<'a> = Encoder<&'a mut Vec<u8>>;

fn encode_envelope<F>(
    service: &str,
    data_len: u64,
    fill: F,
) -> Result<Vec<u8>, ProtoEncodeError>
where
    F: FnOnce(&mut Enc) -> Result<(), ProtoEncodeError>,
{
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(2)?;
    enc.str("service")?;
    enc.str(service)?;
    enc.str("data")?;
    enc.map(data_len)?;
    fill(&mut enc)?;
    Ok(buf)
}

fn encode_meta(enc: &mut Enc, meta: Meta) -> Result<(), ProtoEncodeError> {
    enc.str("timestamp")?;
    enc.f64(meta.timestamp)?;
    enc.str("clock")?;
    enc.u64(meta.clock)?;
    Ok(())
}

struct RawEnvelope<'a> {
    service: String,
    data: &'a [u8],
}

fn split_envelope(bytes: &[u8]) -> Result<RawEnvelope<'_>, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = map_len(&mut dec)?;

    let mut service = None;
    let mut data_span = None;
    for _ in 0..map_len {
        match dec.str()? {
            "service" => service = Some(dec.str()?.to_string()),
            "data" => {
                let start = dec.position();
                dec.skip()?;
                data_span = Some((start, dec.position()));
            }
            _ => dec.skip()?,
        }
    }
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    let service = service.ok_or(ProtoDecodeError::MissingField("service"))?;
    let (start, end) = data_span.ok_or(ProtoDecodeError::MissingField("data"))?;
    Ok(RawEnvelope {
        service,
        data: &bytes[start..end],
    })
}

fn map_len(dec: &mut Decoder) -> Result<u64, ProtoDecodeError> {
    dec.map()?.ok_or(ProtoDecodeError::IndefiniteLength)
}

fn array_len(dec: &mut Decoder) -> Result<u64, ProtoDecodeError> {
    dec.array()?.ok_or(ProtoDecodeError::IndefiniteLength)
}

/// Accumulator for the flat `data` map: one decode loop shared by every
/// surface, with per-service constructors pulling the fields they require.
#[derive(Default)]
struct DataMap {
    status: Option<String>,
    description: Option<String>,
    timestamp: Option<f64>,
    clock: Option<u64>,
    user: Option<String>,
    channel: Option<String>,
    message: Option<String>,
    src: Option<String>,
    dst: Option<String>,
    peer: Option<String>,
    limit: Option<i64>,
    server: Option<String>,
    coordinator: Option<String>,
    event: Option<String>,
    rank: Option<u32>,
    offset: Option<f64>,
    time: Option<f64>,
    source: Option<String>,
    kind: Option<Kind>,
    records_received: Option<u64>,
    replication_addr: Option<String>,
    election_addr: Option<String>,
    users: Option<Vec<String>>,
    channels: Option<Vec<String>>,
    messages: Option<Vec<MessageRecord>>,
    state: Option<StateSnapshot>,
    list: Option<Vec<PeerInfo>>,
    payload_span: Option<(usize, usize)>,
}

impl DataMap {
    fn meta(&self) -> Meta {
        Meta {
            timestamp: self.timestamp.unwrap_or_default(),
            clock: self.clock.unwrap_or_default(),
        }
    }

    fn require<T>(value: Option<T>, field: &'static str) -> Result<T, ProtoDecodeError> {
        value.ok_or(ProtoDecodeError::MissingField(field))
    }
}

fn decode_data(bytes: &[u8]) -> Result<DataMap, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = map_len(&mut dec)?;
    let mut data = DataMap::default();

    for _ in 0..map_len {
        match dec.str()? {
            "status" => data.status = Some(dec.str()?.to_string()),
            "description" => data.description = Some(dec.str()?.to_string()),
            "timestamp" => data.timestamp = Some(dec.f64()?),
            "clock" => data.clock = Some(dec.u64()?),
            "user" => data.user = Some(dec.str()?.to_string()),
            "channel" => data.channel = Some(dec.str()?.to_string()),
            "message" => data.message = Some(dec.str()?.to_string()),
            "src" => data.src = Some(dec.str()?.to_string()),
            "dst" => data.dst = Some(dec.str()?.to_string()),
            "peer" => data.peer = Some(dec.str()?.to_string()),
            "limit" => data.limit = Some(dec.i64()?),
            "server" => data.server = Some(dec.str()?.to_string()),
            "coordinator" => data.coordinator = Some(dec.str()?.to_string()),
            "event" => data.event = Some(dec.str()?.to_string()),
            "rank" => data.rank = Some(dec.u32()?),
            "offset" => data.offset = Some(dec.f64()?),
            "time" => data.time = Some(dec.f64()?),
            "source" => data.source = Some(dec.str()?.to_string()),
            "type" => {
                let raw = dec.str()?;
                data.kind = Some(Kind::parse(raw).ok_or_else(|| {
                    ProtoDecodeError::InvalidField {
                        field: "type",
                        reason: format!("unknown record kind {raw}"),
                    }
                })?);
            }
            "records_received" => data.records_received = Some(dec.u64()?),
            "replication_addr" => data.replication_addr = Some(dec.str()?.to_string()),
            "election_addr" => data.election_addr = Some(dec.str()?.to_string()),
            "users" => data.users = Some(decode_string_array(&mut dec)?),
            "channels" => data.channels = Some(decode_string_array(&mut dec)?),
            "messages" => data.messages = Some(decode_message_array(&mut dec)?),
            "state" => data.state = Some(decode_snapshot(&mut dec)?),
            "list" => data.list = Some(decode_peer_list(&mut dec)?),
            "payload" => {
                // Typed decode needs the sibling `type` key; remember the
                // span and decode once the whole map is scanned.
                let start = dec.position();
                dec.skip()?;
                data.payload_span = Some((start, dec.position()));
            }
            _ => dec.skip()?,
        }
    }
    Ok(data)
}

// =============================================================================
// Client surface
// =============================================================================

pub fn encode_client_request(
    request: &ClientRequest,
    meta: Meta,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let service = request.service();
    match request {
        ClientRequest::Login { user } => encode_envelope(service, 3, |enc| {
            enc.str("user")?;
            enc.str(user)?;
            encode_meta(enc, meta)
        }),
        ClientRequest::Users | ClientRequest::Channels => {
            encode_envelope(service, 2, |enc| encode_meta(enc, meta))
        }
        ClientRequest::Channel { channel } => encode_envelope(service, 3, |enc| {
            enc.str("channel")?;
            enc.str(channel)?;
            encode_meta(enc, meta)
        }),
        ClientRequest::Publish {
            user,
            channel,
            message,
        } => encode_envelope(service, 5, |enc| {
            enc.str("user")?;
            enc.str(user)?;
            enc.str("channel")?;
            enc.str(channel)?;
            enc.str("message")?;
            enc.str(message)?;
            encode_meta(enc, meta)
        }),
        ClientRequest::Message { src, dst, message } => encode_envelope(service, 5, |enc| {
            enc.str("src")?;
            enc.str(src)?;
            enc.str("dst")?;
            enc.str(dst)?;
            enc.str("message")?;
            enc.str(message)?;
            encode_meta(enc, meta)
        }),
        ClientRequest::GetHistory { channel, limit } => encode_envelope(service, 4, |enc| {
            enc.str("channel")?;
            enc.str(channel)?;
            enc.str("limit")?;
            enc.i64(*limit)?;
            encode_meta(enc, meta)
        }),
        ClientRequest::GetPrivateHistory { user, peer, limit } => {
            encode_envelope(service, 5, |enc| {
                enc.str("user")?;
                enc.str(user)?;
                enc.str("peer")?;
                enc.str(peer)?;
                enc.str("limit")?;
                enc.i64(*limit)?;
                encode_meta(enc, meta)
            })
        }
    }
}

pub fn decode_client_request(bytes: &[u8]) -> Result<(ClientRequest, Meta), ProtoDecodeError> {
    let envelope = split_envelope(bytes)?;
    let data = decode_data(envelope.data)?;
    let meta = data.meta();

    let request = match envelope.service.as_str() {
        "login" => ClientRequest::Login {
            user: data.user.unwrap_or_default(),
        },
        "users" => ClientRequest::Users,
        "channel" => ClientRequest::Channel {
            channel: data.channel.unwrap_or_default(),
        },
        "channels" => ClientRequest::Channels,
        "publish" => ClientRequest::Publish {
            user: data.user.unwrap_or_default(),
            channel: data.channel.unwrap_or_default(),
            message: data.message.unwrap_or_default(),
        },
        "message" => ClientRequest::Message {
            src: data.src.unwrap_or_default(),
            dst: data.dst.unwrap_or_default(),
            message: data.message.unwrap_or_default(),
        },
        "get_history" => ClientRequest::GetHistory {
            channel: data.channel.unwrap_or_default(),
            limit: data.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        },
        "get_private_history" => ClientRequest::GetPrivateHistory {
            user: data.user.unwrap_or_default(),
            peer: data.peer.unwrap_or_default(),
            limit: data.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        },
        other => return Err(ProtoDecodeError::UnknownService(other.to_string())),
    };
    Ok((request, meta))
}

// =============================================================================
// Peer surface
// =============================================================================

pub fn encode_peer_request(
    request: &PeerRequest,
    meta: Meta,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let service = request.service();
    match request {
        PeerRequest::Replicate { source, records } => encode_envelope(service, 5, |enc| {
            enc.str("source")?;
            enc.str(source)?;
            enc.str("type")?;
            enc.str(records.kind().as_str())?;
            enc.str("payload")?;
            encode_record_set(enc, records)?;
            encode_meta(enc, meta)
        }),
        PeerRequest::SyncState | PeerRequest::GetTime => {
            encode_envelope(service, 2, |enc| encode_meta(enc, meta))
        }
        PeerRequest::AdjustTime {
            coordinator,
            offset,
        } => encode_envelope(service, 4, |enc| {
            enc.str("coordinator")?;
            enc.str(coordinator)?;
            enc.str("offset")?;
            enc.f64(*offset)?;
            encode_meta(enc, meta)
        }),
    }
}

pub fn decode_peer_request(bytes: &[u8]) -> Result<(PeerRequest, Meta), ProtoDecodeError> {
    let envelope = split_envelope(bytes)?;
    let data = decode_data(envelope.data)?;
    let meta = data.meta();

    let request = match envelope.service.as_str() {
        "replicate" => {
            let kind = DataMap::require(data.kind, "type")?;
            let (start, end) = DataMap::require(data.payload_span, "payload")?;
            let records = decode_record_set(&envelope.data[start..end], kind)?;
            PeerRequest::Replicate {
                source: DataMap::require(data.source, "source")?,
                records,
            }
        }
        "sync_state" => PeerRequest::SyncState,
        "get_time" => PeerRequest::GetTime,
        "adjust_time" => PeerRequest::AdjustTime {
            coordinator: data.coordinator.unwrap_or_default(),
            offset: DataMap::require(data.offset, "offset")?,
        },
        other => return Err(ProtoDecodeError::UnknownService(other.to_string())),
    };
    Ok((request, meta))
}

// =============================================================================
// Election surface
// =============================================================================

pub fn encode_election_request(
    request: &ElectionRequest,
    meta: Meta,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let service = request.service();
    match request {
        ElectionRequest::Election { rank, server } => encode_envelope(service, 4, |enc| {
            enc.str("rank")?;
            enc.u32(*rank)?;
            enc.str("server")?;
            enc.str(server)?;
            encode_meta(enc, meta)
        }),
        ElectionRequest::Coordinator { coordinator, rank } => {
            encode_envelope(service, 4, |enc| {
                enc.str("coordinator")?;
                enc.str(coordinator)?;
                enc.str("rank")?;
                enc.u32(*rank)?;
                encode_meta(enc, meta)
            })
        }
    }
}

pub fn decode_election_request(
    bytes: &[u8],
) -> Result<(ElectionRequest, Meta), ProtoDecodeError> {
    let envelope = split_envelope(bytes)?;
    let data = decode_data(envelope.data)?;
    let meta = data.meta();

    let request = match envelope.service.as_str() {
        "election" => ElectionRequest::Election {
            rank: DataMap::require(data.rank, "rank")?,
            server: DataMap::require(data.server, "server")?,
        },
        "coordinator" => ElectionRequest::Coordinator {
            coordinator: DataMap::require(data.coordinator, "coordinator")?,
            rank: DataMap::require(data.rank, "rank")?,
        },
        other => return Err(ProtoDecodeError::UnknownService(other.to_string())),
    };
    Ok((request, meta))
}

// =============================================================================
// Registry surface
// =============================================================================

pub fn encode_registry_request(
    request: &RegistryRequest,
    meta: Meta,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let service = request.service();
    match request {
        RegistryRequest::Rank {
            server,
            replication_addr,
            election_addr,
        } => encode_envelope(service, 5, |enc| {
            enc.str("server")?;
            enc.str(server)?;
            enc.str("replication_addr")?;
            enc.str(replication_addr)?;
            enc.str("election_addr")?;
            enc.str(election_addr)?;
            encode_meta(enc, meta)
        }),
        RegistryRequest::List => encode_envelope(service, 2, |enc| encode_meta(enc, meta)),
        RegistryRequest::Heartbeat { server } => encode_envelope(service, 3, |enc| {
            enc.str("server")?;
            enc.str(server)?;
            encode_meta(enc, meta)
        }),
    }
}

pub fn decode_registry_request(
    bytes: &[u8],
) -> Result<(RegistryRequest, Meta), ProtoDecodeError> {
    let envelope = split_envelope(bytes)?;
    let data = decode_data(envelope.data)?;
    let meta = data.meta();

    let request = match envelope.service.as_str() {
        "rank" => RegistryRequest::Rank {
            server: DataMap::require(data.server, "server")?,
            replication_addr: data.replication_addr.unwrap_or_default(),
            election_addr: data.election_addr.unwrap_or_default(),
        },
        "list" => RegistryRequest::List,
        "heartbeat" => RegistryRequest::Heartbeat {
            server: DataMap::require(data.server, "server")?,
        },
        other => return Err(ProtoDecodeError::UnknownService(other.to_string())),
    };
    Ok((request, meta))
}

// =============================================================================
// Replies
// =============================================================================

pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut data_len = 3; // status + timestamp + clock
    if reply.description.is_some() {
        data_len += 1;
    }
    data_len += body_key_count(&reply.body);

    encode_envelope(&reply.service, data_len, |enc| {
        enc.str("status")?;
        enc.str(reply.status.as_str())?;
        if let Some(description) = &reply.description {
            enc.str("description")?;
            enc.str(description)?;
        }
        encode_reply_body(enc, &reply.body)?;
        encode_meta(enc, reply.meta)
    })
}

fn body_key_count(body: &ReplyBody) -> u64 {
    match body {
        ReplyBody::Empty => 0,
        ReplyBody::Users(_)
        | ReplyBody::Channels(_)
        | ReplyBody::Messages(_)
        | ReplyBody::State(_)
        | ReplyBody::RecordsReceived(_)
        | ReplyBody::Rank(_)
        | ReplyBody::Servers(_) => 1,
        ReplyBody::Time { .. } | ReplyBody::ElectionOk { .. } => 2,
    }
}

fn encode_reply_body(enc: &mut Enc, body: &ReplyBody) -> Result<(), ProtoEncodeError> {
    match body {
        ReplyBody::Empty => {}
        ReplyBody::Users(users) => {
            enc.str("users")?;
            encode_string_array(enc, users)?;
        }
        ReplyBody::Channels(channels) => {
            enc.str("channels")?;
            encode_string_array(enc, channels)?;
        }
        ReplyBody::Messages(messages) => {
            enc.str("messages")?;
            encode_message_array(enc, messages)?;
        }
        ReplyBody::State(snapshot) => {
            enc.str("state")?;
            encode_snapshot(enc, snapshot)?;
        }
        ReplyBody::Time { time, server } => {
            enc.str("time")?;
            enc.f64(*time)?;
            enc.str("server")?;
            enc.str(server)?;
        }
        ReplyBody::RecordsReceived(count) => {
            enc.str("records_received")?;
            enc.u64(*count)?;
        }
        ReplyBody::Rank(rank) => {
            enc.str("rank")?;
            enc.u32(*rank)?;
        }
        ReplyBody::Servers(servers) => {
            enc.str("list")?;
            encode_peer_list(enc, servers)?;
        }
        ReplyBody::ElectionOk { rank, server } => {
            enc.str("rank")?;
            enc.u32(*rank)?;
            enc.str("server")?;
            enc.str(server)?;
        }
    }
    Ok(())
}

pub fn decode_reply(bytes: &[u8]) -> Result<Reply, ProtoDecodeError> {
    let envelope = split_envelope(bytes)?;
    let data = decode_data(envelope.data)?;
    let meta = data.meta();

    let raw_status = data
        .status
        .ok_or(ProtoDecodeError::MissingField("status"))?;
    let status = Status::parse(&raw_status).ok_or_else(|| ProtoDecodeError::InvalidField {
        field: "status",
        reason: format!("unknown status {raw_status}"),
    })?;

    // Failure replies never carry a body, whatever the service.
    let body = if status.is_failure() {
        ReplyBody::Empty
    } else {
        match envelope.service.as_str() {
            "users" => ReplyBody::Users(DataMap::require(data.users, "users")?),
            "channels" => ReplyBody::Channels(DataMap::require(data.channels, "channels")?),
            "get_history" | "get_private_history" => {
                ReplyBody::Messages(DataMap::require(data.messages, "messages")?)
            }
            "sync_state" => ReplyBody::State(DataMap::require(data.state, "state")?),
            "get_time" => ReplyBody::Time {
                time: DataMap::require(data.time, "time")?,
                server: data.server.unwrap_or_default(),
            },
            "replicate" => ReplyBody::RecordsReceived(
                DataMap::require(data.records_received, "records_received")?,
            ),
            "rank" => ReplyBody::Rank(DataMap::require(data.rank, "rank")?),
            "list" => ReplyBody::Servers(DataMap::require(data.list, "list")?),
            "election" => ReplyBody::ElectionOk {
                rank: DataMap::require(data.rank, "rank")?,
                server: DataMap::require(data.server, "server")?,
            },
            _ => ReplyBody::Empty,
        }
    };

    Ok(Reply {
        service: envelope.service,
        status,
        meta,
        description: data.description,
        body,
    })
}

// =============================================================================
// Publications
// =============================================================================

pub fn encode_publication(publication: &Publication) -> Result<Vec<u8>, ProtoEncodeError> {
    let service = publication.service();
    match publication {
        Publication::Record(record) => encode_envelope(service, 5, |enc| {
            encode_message_fields(enc, record)?;
            Ok(())
        }),
        Publication::NewChannel {
            channel,
            timestamp,
            clock,
        } => encode_envelope(service, 4, |enc| {
            enc.str("event")?;
            enc.str("new_channel")?;
            enc.str("channel")?;
            enc.str(channel)?;
            encode_meta(
                enc,
                Meta {
                    timestamp: *timestamp,
                    clock: *clock,
                },
            )
        }),
        Publication::NewCoordinator {
            coordinator,
            rank,
            timestamp,
            clock,
        } => encode_envelope(service, 5, |enc| {
            enc.str("event")?;
            enc.str("new_coordinator")?;
            enc.str("coordinator")?;
            enc.str(coordinator)?;
            enc.str("rank")?;
            enc.u32(*rank)?;
            encode_meta(
                enc,
                Meta {
                    timestamp: *timestamp,
                    clock: *clock,
                },
            )
        }),
    }
}

pub fn decode_publication(bytes: &[u8]) -> Result<Publication, ProtoDecodeError> {
    let envelope = split_envelope(bytes)?;
    let data = decode_data(envelope.data)?;

    let publication = match envelope.service.as_str() {
        "publish" => Publication::Record(MessageRecord::Publish {
            user: data.user.unwrap_or_default(),
            channel: DataMap::require(data.channel, "channel")?,
            message: data.message.unwrap_or_default(),
            timestamp: data.timestamp.unwrap_or_default(),
            clock: data.clock.unwrap_or_default(),
        }),
        "message" => Publication::Record(MessageRecord::Private {
            src: data.src.unwrap_or_default(),
            dst: DataMap::require(data.dst, "dst")?,
            message: data.message.unwrap_or_default(),
            timestamp: data.timestamp.unwrap_or_default(),
            clock: data.clock.unwrap_or_default(),
        }),
        "channel" => Publication::NewChannel {
            channel: DataMap::require(data.channel, "channel")?,
            timestamp: data.timestamp.unwrap_or_default(),
            clock: data.clock.unwrap_or_default(),
        },
        "election" => {
            let event = data.event.unwrap_or_default();
            if event != "new_coordinator" {
                return Err(ProtoDecodeError::InvalidField {
                    field: "event",
                    reason: format!("unknown election event {event}"),
                });
            }
            Publication::NewCoordinator {
                coordinator: DataMap::require(data.coordinator, "coordinator")?,
                rank: DataMap::require(data.rank, "rank")?,
                timestamp: data.timestamp.unwrap_or_default(),
                clock: data.clock.unwrap_or_default(),
            }
        }
        other => return Err(ProtoDecodeError::UnknownService(other.to_string())),
    };
    Ok(publication)
}

// =============================================================================
// Record codecs
// =============================================================================

fn encode_string_array(enc: &mut Enc, values: &[String]) -> Result<(), ProtoEncodeError> {
    enc.array(values.len() as u64)?;
    for value in values {
        enc.str(value)?;
    }
    Ok(())
}

fn decode_string_array(dec: &mut Decoder) -> Result<Vec<String>, ProtoDecodeError> {
    let len = array_len(dec)?;
    let mut values = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        values.push(dec.str()?.to_string());
    }
    Ok(values)
}

fn encode_login_record(enc: &mut Enc, record: &LoginRecord) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("user")?;
    enc.str(&record.user)?;
    enc.str("timestamp")?;
    enc.f64(record.timestamp)?;
    enc.str("clock")?;
    enc.u64(record.clock)?;
    Ok(())
}

fn decode_login_record(dec: &mut Decoder) -> Result<LoginRecord, ProtoDecodeError> {
    let map_len = map_len(dec)?;
    let mut user = None;
    let mut timestamp = None;
    let mut clock = None;
    for _ in 0..map_len {
        match dec.str()? {
            "user" => user = Some(dec.str()?.to_string()),
            "timestamp" => timestamp = Some(dec.f64()?),
            "clock" => clock = Some(dec.u64()?),
            _ => dec.skip()?,
        }
    }
    Ok(LoginRecord {
        user: user.ok_or(ProtoDecodeError::MissingField("user"))?,
        timestamp: timestamp.unwrap_or_default(),
        clock: clock.unwrap_or_default(),
    })
}

fn encode_channel_record(enc: &mut Enc, record: &ChannelRecord) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("channel")?;
    enc.str(&record.channel)?;
    enc.str("timestamp")?;
    enc.f64(record.timestamp)?;
    enc.str("clock")?;
    enc.u64(record.clock)?;
    Ok(())
}

fn decode_channel_record(dec: &mut Decoder) -> Result<ChannelRecord, ProtoDecodeError> {
    let map_len = map_len(dec)?;
    let mut channel = None;
    let mut timestamp = None;
    let mut clock = None;
    for _ in 0..map_len {
        match dec.str()? {
            "channel" => channel = Some(dec.str()?.to_string()),
            "timestamp" => timestamp = Some(dec.f64()?),
            "clock" => clock = Some(dec.u64()?),
            _ => dec.skip()?,
        }
    }
    Ok(ChannelRecord {
        channel: channel.ok_or(ProtoDecodeError::MissingField("channel"))?,
        timestamp: timestamp.unwrap_or_default(),
        clock: clock.unwrap_or_default(),
    })
}

/// Message record fields without the surrounding map header; the caller
/// decides whether they sit in a record map or a publication `data` map.
fn encode_message_fields(enc: &mut Enc, record: &MessageRecord) -> Result<(), ProtoEncodeError> {
    match record {
        MessageRecord::Publish {
            user,
            channel,
            message,
            timestamp,
            clock,
        } => {
            enc.str("user")?;
            enc.str(user)?;
            enc.str("channel")?;
            enc.str(channel)?;
            enc.str("message")?;
            enc.str(message)?;
            enc.str("timestamp")?;
            enc.f64(*timestamp)?;
            enc.str("clock")?;
            enc.u64(*clock)?;
        }
        MessageRecord::Private {
            src,
            dst,
            message,
            timestamp,
            clock,
        } => {
            enc.str("src")?;
            enc.str(src)?;
            enc.str("dst")?;
            enc.str(dst)?;
            enc.str("message")?;
            enc.str(message)?;
            enc.str("timestamp")?;
            enc.f64(*timestamp)?;
            enc.str("clock")?;
            enc.u64(*clock)?;
        }
    }
    Ok(())
}

fn encode_message_record(enc: &mut Enc, record: &MessageRecord) -> Result<(), ProtoEncodeError> {
    enc.map(6)?;
    enc.str("type")?;
    enc.str(match record {
        MessageRecord::Publish { .. } => "publish",
        MessageRecord::Private { .. } => "message",
    })?;
    encode_message_fields(enc, record)
}

fn decode_message_record(dec: &mut Decoder) -> Result<MessageRecord, ProtoDecodeError> {
    let map_len = map_len(dec)?;
    let mut kind = None;
    let mut user = None;
    let mut channel = None;
    let mut src = None;
    let mut dst = None;
    let mut message = None;
    let mut timestamp = None;
    let mut clock = None;
    for _ in 0..map_len {
        match dec.str()? {
            "type" => kind = Some(dec.str()?.to_string()),
            "user" => user = Some(dec.str()?.to_string()),
            "channel" => channel = Some(dec.str()?.to_string()),
            "src" => src = Some(dec.str()?.to_string()),
            "dst" => dst = Some(dec.str()?.to_string()),
            "message" => message = Some(dec.str()?.to_string()),
            "timestamp" => timestamp = Some(dec.f64()?),
            "clock" => clock = Some(dec.u64()?),
            _ => dec.skip()?,
        }
    }

    let kind = kind.ok_or(ProtoDecodeError::MissingField("type"))?;
    match kind.as_str() {
        "publish" => Ok(MessageRecord::Publish {
            user: user.unwrap_or_default(),
            channel: channel.ok_or(ProtoDecodeError::MissingField("channel"))?,
            message: message.unwrap_or_default(),
            timestamp: timestamp.unwrap_or_default(),
            clock: clock.unwrap_or_default(),
        }),
        "message" => Ok(MessageRecord::Private {
            src: src.unwrap_or_default(),
            dst: dst.ok_or(ProtoDecodeError::MissingField("dst"))?,
            message: message.unwrap_or_default(),
            timestamp: timestamp.unwrap_or_default(),
            clock: clock.unwrap_or_default(),
        }),
        other => Err(ProtoDecodeError::InvalidField {
            field: "type",
            reason: format!("unknown message type {other}"),
        }),
    }
}

fn encode_message_array(
    enc: &mut Enc,
    records: &[MessageRecord],
) -> Result<(), ProtoEncodeError> {
    enc.array(records.len() as u64)?;
    for record in records {
        encode_message_record(enc, record)?;
    }
    Ok(())
}

fn decode_message_array(dec: &mut Decoder) -> Result<Vec<MessageRecord>, ProtoDecodeError> {
    let len = array_len(dec)?;
    let mut records = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        records.push(decode_message_record(dec)?);
    }
    Ok(records)
}

fn encode_record_set(enc: &mut Enc, records: &RecordSet) -> Result<(), ProtoEncodeError> {
    match records {
        RecordSet::Logins(records) => {
            enc.array(records.len() as u64)?;
            for record in records {
                encode_login_record(enc, record)?;
            }
        }
        RecordSet::Channels(records) => {
            enc.array(records.len() as u64)?;
            for record in records {
                encode_channel_record(enc, record)?;
            }
        }
        RecordSet::Messages(records) => encode_message_array(enc, records)?,
    }
    Ok(())
}

fn decode_record_set(bytes: &[u8], kind: Kind) -> Result<RecordSet, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    match kind {
        Kind::Logins => {
            let len = array_len(&mut dec)?;
            let mut records = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                records.push(decode_login_record(&mut dec)?);
            }
            Ok(RecordSet::Logins(records))
        }
        Kind::Channels => {
            let len = array_len(&mut dec)?;
            let mut records = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                records.push(decode_channel_record(&mut dec)?);
            }
            Ok(RecordSet::Channels(records))
        }
        Kind::Messages => Ok(RecordSet::Messages(decode_message_array(&mut dec)?)),
    }
}

fn encode_snapshot(enc: &mut Enc, snapshot: &StateSnapshot) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("logins")?;
    enc.array(snapshot.logins.len() as u64)?;
    for record in &snapshot.logins {
        encode_login_record(enc, record)?;
    }
    enc.str("channels")?;
    enc.array(snapshot.channels.len() as u64)?;
    for record in &snapshot.channels {
        encode_channel_record(enc, record)?;
    }
    enc.str("messages")?;
    encode_message_array(enc, &snapshot.messages)?;
    Ok(())
}

fn decode_snapshot(dec: &mut Decoder) -> Result<StateSnapshot, ProtoDecodeError> {
    let map_len = map_len(dec)?;
    let mut snapshot = StateSnapshot::default();
    for _ in 0..map_len {
        match dec.str()? {
            "logins" => {
                let len = array_len(dec)?;
                for _ in 0..len {
                    snapshot.logins.push(decode_login_record(dec)?);
                }
            }
            "channels" => {
                let len = array_len(dec)?;
                for _ in 0..len {
                    snapshot.channels.push(decode_channel_record(dec)?);
                }
            }
            "messages" => snapshot.messages = decode_message_array(dec)?,
            _ => dec.skip()?,
        }
    }
    Ok(snapshot)
}

fn encode_peer_list(enc: &mut Enc, servers: &[PeerInfo]) -> Result<(), ProtoEncodeError> {
    enc.array(servers.len() as u64)?;
    for info in servers {
        enc.map(5)?;
        enc.str("server")?;
        enc.str(&info.server)?;
        enc.str("rank")?;
        enc.u32(info.rank)?;
        enc.str("last_heartbeat")?;
        enc.f64(info.last_heartbeat)?;
        enc.str("replication_addr")?;
        enc.str(&info.replication_addr)?;
        enc.str("election_addr")?;
        enc.str(&info.election_addr)?;
    }
    Ok(())
}

fn decode_peer_list(dec: &mut Decoder) -> Result<Vec<PeerInfo>, ProtoDecodeError> {
    let len = array_len(dec)?;
    let mut servers = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        let map_len = map_len(dec)?;
        let mut server = None;
        let mut rank = None;
        let mut last_heartbeat = None;
        let mut replication_addr = None;
        let mut election_addr = None;
        for _ in 0..map_len {
            match dec.str()? {
                "server" => server = Some(dec.str()?.to_string()),
                "rank" => rank = Some(dec.u32()?),
                "last_heartbeat" => last_heartbeat = Some(dec.f64()?),
                "replication_addr" => replication_addr = Some(dec.str()?.to_string()),
                "election_addr" => election_addr = Some(dec.str()?.to_string()),
                _ => dec.skip()?,
            }
        }
        servers.push(PeerInfo {
            server: server.ok_or(ProtoDecodeError::MissingField("server"))?,
            rank: rank.ok_or(ProtoDecodeError::MissingField("rank"))?,
            last_heartbeat: last_heartbeat.unwrap_or_default(),
            replication_addr: replication_addr.unwrap_or_default(),
            election_addr: election_addr.unwrap_or_default(),
        });
    }
    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(clock: u64) -> Meta {
        Meta {
            timestamp: clock as f64 + 0.5,
            clock,
        }
    }

    #[test]
    fn client_requests_round_trip() {
        let requests = vec![
            ClientRequest::Login {
                user: "alice".into(),
            },
            ClientRequest::Users,
            ClientRequest::Channel {
                channel: "geral".into(),
            },
            ClientRequest::Channels,
            ClientRequest::Publish {
                user: "alice".into(),
                channel: "geral".into(),
                message: "oi".into(),
            },
            ClientRequest::Message {
                src: "alice".into(),
                dst: "bob".into(),
                message: "oi bob".into(),
            },
            ClientRequest::GetHistory {
                channel: "geral".into(),
                limit: 10,
            },
            ClientRequest::GetPrivateHistory {
                user: "alice".into(),
                peer: "bob".into(),
                limit: -1,
            },
        ];

        for request in requests {
            let bytes = encode_client_request(&request, meta(7)).unwrap();
            let (decoded, decoded_meta) = decode_client_request(&bytes).unwrap();
            assert_eq!(decoded, request);
            assert_eq!(decoded_meta.clock, 7);
        }
    }

    #[test]
    fn unknown_service_is_rejected_per_surface() {
        let bytes = encode_client_request(
            &ClientRequest::Login {
                user: "alice".into(),
            },
            meta(1),
        )
        .unwrap();
        // A client frame arriving on the peer surface is an unknown service.
        assert!(matches!(
            decode_peer_request(&bytes),
            Err(ProtoDecodeError::UnknownService(service)) if service == "login"
        ));
    }

    #[test]
    fn replicate_round_trips_each_kind() {
        let sets = vec![
            RecordSet::Logins(vec![LoginRecord {
                user: "alice".into(),
                timestamp: 1.0,
                clock: 1,
            }]),
            RecordSet::Channels(vec![ChannelRecord {
                channel: "geral".into(),
                timestamp: 2.0,
                clock: 2,
            }]),
            RecordSet::Messages(vec![
                MessageRecord::Publish {
                    user: "alice".into(),
                    channel: "geral".into(),
                    message: "oi".into(),
                    timestamp: 3.0,
                    clock: 3,
                },
                MessageRecord::Private {
                    src: "alice".into(),
                    dst: "bob".into(),
                    message: "oi bob".into(),
                    timestamp: 4.0,
                    clock: 4,
                },
            ]),
        ];

        for records in sets {
            let request = PeerRequest::Replicate {
                source: "server_1".into(),
                records: records.clone(),
            };
            let bytes = encode_peer_request(&request, meta(9)).unwrap();
            let (decoded, _) = decode_peer_request(&bytes).unwrap();
            match decoded {
                PeerRequest::Replicate {
                    source,
                    records: decoded_records,
                } => {
                    assert_eq!(source, "server_1");
                    assert_eq!(decoded_records, records);
                }
                other => panic!("unexpected decode: {other:?}"),
            }
        }
    }

    #[test]
    fn reply_bodies_round_trip() {
        let replies = vec![
            Reply::new("login", Status::Sucesso, meta(2)),
            Reply::new("login", Status::Erro, meta(3))
                .with_description("Usuário já cadastrado"),
            Reply::new("users", Status::Sucesso, meta(4))
                .with_body(ReplyBody::Users(vec!["alice".into(), "bob".into()])),
            Reply::new("get_history", Status::Sucesso, meta(5)).with_body(ReplyBody::Messages(
                vec![MessageRecord::Publish {
                    user: "alice".into(),
                    channel: "geral".into(),
                    message: "oi".into(),
                    timestamp: 1.0,
                    clock: 1,
                }],
            )),
            Reply::new("sync_state", Status::Success, meta(6)).with_body(ReplyBody::State(
                StateSnapshot {
                    logins: vec![LoginRecord {
                        user: "alice".into(),
                        timestamp: 1.0,
                        clock: 1,
                    }],
                    channels: Vec::new(),
                    messages: Vec::new(),
                },
            )),
            Reply::new("get_time", Status::Success, meta(7)).with_body(ReplyBody::Time {
                time: 1234.5,
                server: "server_2".into(),
            }),
            Reply::new("replicate", Status::Success, meta(8))
                .with_body(ReplyBody::RecordsReceived(12)),
            Reply::new("rank", Status::Sucesso, meta(9)).with_body(ReplyBody::Rank(3)),
            Reply::new("list", Status::Sucesso, meta(10)).with_body(ReplyBody::Servers(vec![
                PeerInfo {
                    server: "server_1".into(),
                    rank: 1,
                    last_heartbeat: 99.0,
                    replication_addr: "server_1:6000".into(),
                    election_addr: "server_1:6001".into(),
                },
            ])),
            Reply::new("election", Status::Ok, meta(11)).with_body(ReplyBody::ElectionOk {
                rank: 3,
                server: "server_3".into(),
            }),
        ];

        for reply in replies {
            let bytes = encode_reply(&reply).unwrap();
            let decoded = decode_reply(&bytes).unwrap();
            assert_eq!(decoded, reply);
        }
    }

    #[test]
    fn publications_round_trip() {
        let publications = vec![
            Publication::Record(MessageRecord::Publish {
                user: "alice".into(),
                channel: "geral".into(),
                message: "oi".into(),
                timestamp: 1.0,
                clock: 1,
            }),
            Publication::Record(MessageRecord::Private {
                src: "alice".into(),
                dst: "bob".into(),
                message: "oi bob".into(),
                timestamp: 2.0,
                clock: 2,
            }),
            Publication::NewChannel {
                channel: "geral".into(),
                timestamp: 3.0,
                clock: 3,
            },
            Publication::NewCoordinator {
                coordinator: "server_3".into(),
                rank: 3,
                timestamp: 4.0,
                clock: 4,
            },
        ];

        for publication in publications {
            let bytes = encode_publication(&publication).unwrap();
            let decoded = decode_publication(&bytes).unwrap();
            assert_eq!(decoded, publication);
        }
    }

    #[test]
    fn publication_topics() {
        let channel = Publication::Record(MessageRecord::Publish {
            user: "alice".into(),
            channel: "geral".into(),
            message: "oi".into(),
            timestamp: 1.0,
            clock: 1,
        });
        assert_eq!(channel.topic(), "geral");

        let private = Publication::Record(MessageRecord::Private {
            src: "alice".into(),
            dst: "bob".into(),
            message: "oi".into(),
            timestamp: 1.0,
            clock: 1,
        });
        assert_eq!(private.topic(), "bob");

        let coordinator = Publication::NewCoordinator {
            coordinator: "server_3".into(),
            rank: 3,
            timestamp: 1.0,
            clock: 1,
        };
        assert_eq!(coordinator.topic(), SERVERS_TOPIC);
    }

    #[test]
    fn unknown_keys_are_skipped() {
        // Hand-build an envelope with extra keys at both levels.
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.str("service").unwrap();
        enc.str("login").unwrap();
        enc.str("future").unwrap();
        enc.str("ignored").unwrap();
        enc.str("data").unwrap();
        enc.map(3).unwrap();
        enc.str("user").unwrap();
        enc.str("alice").unwrap();
        enc.str("extra").unwrap();
        enc.u64(42).unwrap();
        enc.str("clock").unwrap();
        enc.u64(5).unwrap();

        let (request, meta) = decode_client_request(&buf).unwrap();
        assert_eq!(
            request,
            ClientRequest::Login {
                user: "alice".into()
            }
        );
        assert_eq!(meta.clock, 5);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode_client_request(&ClientRequest::Users, meta(1)).unwrap();
        let mut enc = Encoder::new(&mut bytes);
        enc.u64(99).unwrap();
        assert!(matches!(
            decode_client_request(&bytes),
            Err(ProtoDecodeError::TrailingBytes)
        ));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(decode_client_request(b"\xffnot cbor").is_err());
        assert!(decode_reply(b"").is_err());
    }

    #[test]
    fn missing_limit_defaults() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("service").unwrap();
        enc.str("get_history").unwrap();
        enc.str("data").unwrap();
        enc.map(1).unwrap();
        enc.str("channel").unwrap();
        enc.str("geral").unwrap();

        let (request, _) = decode_client_request(&buf).unwrap();
        assert_eq!(
            request,
            ClientRequest::GetHistory {
                channel: "geral".into(),
                limit: DEFAULT_HISTORY_LIMIT,
            }
        );
    }
}
