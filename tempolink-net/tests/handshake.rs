mod common;

use std::time::Duration;

use tempolink_net::SessionClient;
use tempolink_types::Command;

#[test]
fn connect_assigns_a_unique_connection_id() {
    let server = common::TestServer::start();

    let client_a = SessionClient::connect(&server.addr()).unwrap();
    let client_b = SessionClient::connect(&server.addr()).unwrap();

    assert_ne!(client_a.connection_id(), client_b.connection_id());
}

#[test]
fn join_session_returns_a_snapshot() {
    let server = common::TestServer::start();
    let mut client = SessionClient::connect(&server.addr()).unwrap();

    client
        .send(Command::JoinSession {
            session_id: "handshake".to_string().into(),
            display_name: Some("alice".to_string()),
            role: None,
        })
        .unwrap();

    let event = common::recv_until(&mut client, Duration::from_secs(2), |e| {
        matches!(e, tempolink_types::Event::Snapshot { .. })
    });
    match event {
        tempolink_types::Event::Snapshot {
            session, members, ..
        } => {
            assert_eq!(session.tempo_bpm, 120);
            assert_eq!(members.len(), 1);
        }
        _ => unreachable!(),
    }
}
