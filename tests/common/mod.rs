//! Shared fixtures: an in-process registry, replicas on ephemeral loopback
//! ports, and thin framed clients for each wire surface.
#![allow(dead_code)]

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tempfile::TempDir;

use mural::registry::{Registry, RegistryConfig, RegistryHandle};
use mural::wire::frame::{FrameReader, FrameWriter};
use mural::wire::proto::{
    decode_reply, encode_client_request, encode_election_request, encode_peer_request,
    ClientRequest, ElectionRequest, Meta, PeerRequest, Reply,
};
use mural::Config;

/// A closed loopback port: connections are refused immediately, which is
/// exactly what the publisher and subscriber loops are built to tolerate.
pub const DEAD_PROXY: &str = "127.0.0.1:1";

pub struct RegistryFixture {
    pub handle: RegistryHandle,
    pub addr: String,
    _dir: TempDir,
}

pub fn start_registry() -> RegistryFixture {
    let dir = TempDir::new().expect("registry tempdir");
    let registry = Registry::new(RegistryConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        data_dir: dir.path().to_path_buf(),
        heartbeat_timeout: Duration::from_secs(30),
        sweep_interval: Duration::from_secs(5),
    })
    .expect("registry init");
    let handle = registry.start().expect("registry start");
    let addr = handle.local_addr().to_string();
    RegistryFixture {
        handle,
        addr,
        _dir: dir,
    }
}

/// Replica config for loopback tests: ephemeral ports, short loops, and a
/// coordinator timeout long enough that no election fires mid-test.
pub fn replica_config(name: &str, data_dir: &TempDir, registry_addr: &str) -> Config {
    let mut config = Config::default();
    config.server_name = name.to_string();
    config.data_dir = data_dir.path().to_path_buf();
    config.bind_host = "127.0.0.1".to_string();
    config.advertise_host = "127.0.0.1".to_string();
    config.client_port = 0;
    config.replication_port = 0;
    config.election_port = 0;
    config.registry_addr = registry_addr.to_string();
    config.proxy_pub_addr = DEAD_PROXY.to_string();
    config.proxy_sub_addr = DEAD_PROXY.to_string();
    config.sync_interval = 3;
    config.heartbeat_interval = Duration::from_millis(300);
    config.list_refresh_interval = Duration::from_millis(300);
    config.monitor_interval = Duration::from_millis(300);
    config.coordinator_timeout = Duration::from_secs(120);
    config.replication_timeout = Duration::from_secs(3);
    config.berkeley_timeout = Duration::from_secs(2);
    config.election_timeout = Duration::from_secs(2);
    config
}

/// Framed client-surface connection with its own Lamport counter.
pub struct Client {
    stream: TcpStream,
    clock: u64,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to replica");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        Self { stream, clock: 0 }
    }

    pub fn call(&mut self, request: &ClientRequest) -> Reply {
        self.clock += 1;
        let meta = Meta {
            timestamp: now(),
            clock: self.clock,
        };
        let payload = encode_client_request(request, meta).expect("encode request");
        self.exchange(&payload)
    }

    pub fn send_raw(&mut self, payload: &[u8]) -> Reply {
        self.exchange(payload)
    }

    fn exchange(&mut self, payload: &[u8]) -> Reply {
        FrameWriter::new(&self.stream)
            .write_frame(payload)
            .expect("send frame");
        let raw = FrameReader::new(&self.stream)
            .read_frame()
            .expect("read reply")
            .expect("reply frame");
        let reply = decode_reply(&raw).expect("decode reply");
        self.clock = self.clock.max(reply.meta.clock);
        reply
    }
}

/// One-shot request on the replication surface.
pub fn peer_call(addr: SocketAddr, request: &PeerRequest, clock: u64) -> Reply {
    let meta = Meta {
        timestamp: now(),
        clock,
    };
    let payload = encode_peer_request(request, meta).expect("encode peer request");
    one_shot(addr, &payload)
}

/// One-shot request on the election surface.
pub fn election_call(addr: SocketAddr, request: &ElectionRequest, clock: u64) -> Reply {
    let meta = Meta {
        timestamp: now(),
        clock,
    };
    let payload = encode_election_request(request, meta).expect("encode election request");
    one_shot(addr, &payload)
}

fn one_shot(addr: SocketAddr, payload: &[u8]) -> Reply {
    let stream = TcpStream::connect(addr).expect("connect to peer port");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    FrameWriter::new(&stream)
        .write_frame(payload)
        .expect("send frame");
    let raw = FrameReader::new(&stream)
        .read_frame()
        .expect("read reply")
        .expect("reply frame");
    decode_reply(&raw).expect("decode reply")
}

pub fn now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}
