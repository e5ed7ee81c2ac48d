//! Multi-replica tests: push replication convergence, snapshot pull on
//! startup, the Bully challenge rule on the election port, and the Berkeley
//! probes on the replication port.

mod common;

use std::time::{Duration, Instant};

use tempfile::TempDir;

use common::{election_call, now, peer_call, replica_config, start_registry, Client};
use mural::server::Replica;
use mural::wire::proto::{
    ClientRequest, ElectionRequest, PeerRequest, RecordSet, ReplyBody, Status,
};
use mural::{LoginRecord, MessageRecord};

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn pushes_converge_a_second_replica() {
    let registry = start_registry();
    let dir_1 = TempDir::new().expect("tempdir");
    let dir_2 = TempDir::new().expect("tempdir");

    // server_1 registers first and takes rank 1 (initial coordinator).
    let handle_1 = Replica::new(replica_config("server_1", &dir_1, &registry.addr))
        .start()
        .expect("server_1 start");
    let handle_2 = Replica::new(replica_config("server_2", &dir_2, &registry.addr))
        .start()
        .expect("server_2 start");

    // Let server_1's peer-list refresh discover server_2.
    std::thread::sleep(Duration::from_millis(800));

    let mut client = Client::connect(handle_1.client_addr);
    client.call(&ClientRequest::Login {
        user: "alice".to_string(),
    });
    client.call(&ClientRequest::Channel {
        channel: "geral".to_string(),
    });
    // Third mutation hits the sync interval and schedules the push.
    let reply = client.call(&ClientRequest::Publish {
        user: "alice".to_string(),
        channel: "geral".to_string(),
        message: "oi de server_1".to_string(),
    });
    assert_eq!(reply.status, Status::Ok);

    // The same history must appear on server_2.
    let mut client_2 = Client::connect(handle_2.client_addr);
    let converged = wait_until(Duration::from_secs(3), || {
        let history = client_2.call(&ClientRequest::GetHistory {
            channel: "geral".to_string(),
            limit: 10,
        });
        match history.body {
            ReplyBody::Messages(messages) => messages.len() == 1,
            _ => false,
        }
    });
    assert!(converged, "server_2 never converged");

    let users = client_2.call(&ClientRequest::Users);
    assert_eq!(users.body, ReplyBody::Users(vec!["alice".to_string()]));

    handle_1.shutdown();
    handle_2.shutdown();
    registry.handle.shutdown();
}

#[test]
fn restarted_replica_pulls_coordinator_snapshot() {
    let registry = start_registry();
    let dir_1 = TempDir::new().expect("tempdir");
    let dir_2 = TempDir::new().expect("tempdir");

    let mut config_1 = replica_config("server_1", &dir_1, &registry.addr);
    // Keep the interval high so convergence can only come from the pull.
    config_1.sync_interval = 1000;
    let handle_1 = Replica::new(config_1).start().expect("server_1 start");

    let mut client = Client::connect(handle_1.client_addr);
    client.call(&ClientRequest::Login {
        user: "bob".to_string(),
    });
    client.call(&ClientRequest::Channel {
        channel: "avisos".to_string(),
    });
    client.call(&ClientRequest::Publish {
        user: "bob".to_string(),
        channel: "avisos".to_string(),
        message: "estado do coordenador".to_string(),
    });

    // server_2 starts empty; its startup sync must copy the coordinator's
    // three sequences wholesale.
    let mut config_2 = replica_config("server_2", &dir_2, &registry.addr);
    config_2.sync_interval = 1000;
    let handle_2 = Replica::new(config_2).start().expect("server_2 start");

    let mut client_2 = Client::connect(handle_2.client_addr);
    let history = client_2.call(&ClientRequest::GetHistory {
        channel: "avisos".to_string(),
        limit: 10,
    });
    assert_eq!(history.status, Status::Sucesso);
    match history.body {
        ReplyBody::Messages(messages) => {
            assert_eq!(messages.len(), 1);
            match &messages[0] {
                MessageRecord::Publish { message, .. } => {
                    assert_eq!(message, "estado do coordenador");
                }
                other => panic!("unexpected record {other:?}"),
            }
        }
        other => panic!("expected messages, got {other:?}"),
    }

    handle_1.shutdown();
    handle_2.shutdown();
    registry.handle.shutdown();
}

#[test]
fn election_port_applies_the_bully_rule() {
    let registry = start_registry();
    let dir_1 = TempDir::new().expect("tempdir");
    let dir_2 = TempDir::new().expect("tempdir");

    let handle_1 = Replica::new(replica_config("server_1", &dir_1, &registry.addr))
        .start()
        .expect("server_1 start");
    let handle_2 = Replica::new(replica_config("server_2", &dir_2, &registry.addr))
        .start()
        .expect("server_2 start");

    // server_2 holds rank 2: a rank-1 candidate is preempted with OK.
    let preempted = election_call(
        handle_2.election_addr,
        &ElectionRequest::Election {
            rank: 1,
            server: "server_1".to_string(),
        },
        7,
    );
    assert_eq!(preempted.status, Status::Ok);
    match preempted.body {
        ReplyBody::ElectionOk { rank, server } => {
            assert_eq!(rank, 2);
            assert_eq!(server, "server_2");
        }
        other => panic!("expected election body, got {other:?}"),
    }
    assert!(preempted.meta.clock > 7, "election reply must merge clocks");

    // A higher-ranked candidate is not preempted.
    let unchallenged = election_call(
        handle_2.election_addr,
        &ElectionRequest::Election {
            rank: 9,
            server: "server_9".to_string(),
        },
        1,
    );
    assert_eq!(unchallenged.status, Status::Erro);

    // Announcements are acknowledged.
    let announced = election_call(
        handle_2.election_addr,
        &ElectionRequest::Coordinator {
            coordinator: "server_1".to_string(),
            rank: 1,
        },
        1,
    );
    assert_eq!(announced.status, Status::Ok);

    handle_1.shutdown();
    handle_2.shutdown();
    registry.handle.shutdown();
}

#[test]
fn replication_port_serves_time_and_applies_offsets() {
    let registry = start_registry();
    let dir = TempDir::new().expect("tempdir");
    let handle = Replica::new(replica_config("server_1", &dir, &registry.addr))
        .start()
        .expect("replica start");

    let before = peer_call(handle.replication_addr, &PeerRequest::GetTime, 1);
    let ReplyBody::Time { time: t0, server } = before.body else {
        panic!("expected time body");
    };
    assert_eq!(server, "server_1");
    assert!((t0 - now()).abs() < 2.0);

    // Apply +5 s; subsequent reads must reflect it.
    let adjust = peer_call(
        handle.replication_addr,
        &PeerRequest::AdjustTime {
            coordinator: "server_9".to_string(),
            offset: 5.0,
        },
        1,
    );
    assert_eq!(adjust.status, Status::Success);

    let after = peer_call(handle.replication_addr, &PeerRequest::GetTime, 1);
    let ReplyBody::Time { time: t1, .. } = after.body else {
        panic!("expected time body");
    };
    assert!(t1 - now() > 4.0, "offset was not applied");

    // Offsets accumulate: a correction can pull the clock back.
    peer_call(
        handle.replication_addr,
        &PeerRequest::AdjustTime {
            coordinator: "server_9".to_string(),
            offset: -5.0,
        },
        1,
    );
    let restored = peer_call(handle.replication_addr, &PeerRequest::GetTime, 1);
    let ReplyBody::Time { time: t2, .. } = restored.body else {
        panic!("expected time body");
    };
    assert!((t2 - now()).abs() < 2.0);

    handle.shutdown();
    registry.handle.shutdown();
}

#[test]
fn replicate_overwrites_wholesale() {
    let registry = start_registry();
    let dir = TempDir::new().expect("tempdir");
    let handle = Replica::new(replica_config("server_1", &dir, &registry.addr))
        .start()
        .expect("replica start");

    let mut client = Client::connect(handle.client_addr);
    client.call(&ClientRequest::Login {
        user: "local".to_string(),
    });

    // A peer push replaces the whole logins sequence.
    let push = peer_call(
        handle.replication_addr,
        &PeerRequest::Replicate {
            source: "server_2".to_string(),
            records: RecordSet::Logins(vec![
                LoginRecord {
                    user: "alice".to_string(),
                    timestamp: now(),
                    clock: 10,
                },
                LoginRecord {
                    user: "bob".to_string(),
                    timestamp: now(),
                    clock: 11,
                },
            ]),
        },
        12,
    );
    assert_eq!(push.status, Status::Success);
    assert_eq!(push.body, ReplyBody::RecordsReceived(2));

    let users = client.call(&ClientRequest::Users);
    assert_eq!(
        users.body,
        ReplyBody::Users(vec!["alice".to_string(), "bob".to_string()])
    );

    // Snapshot served to restarting peers reflects the overwrite.
    let snapshot = peer_call(handle.replication_addr, &PeerRequest::SyncState, 1);
    let ReplyBody::State(state) = snapshot.body else {
        panic!("expected state body");
    };
    assert_eq!(state.logins.len(), 2);

    handle.shutdown();
    registry.handle.shutdown();
}
