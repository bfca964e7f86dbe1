mod common;

use std::time::Duration;

use tempolink_net::SessionClient;
use tempolink_types::{Command, ErrorCode, Event};

fn join(client: &mut SessionClient, session_id: &str, name: &str) {
    client
        .send(Command::JoinSession {
            session_id: session_id.to_string().into(),
            display_name: Some(name.to_string()),
            role: None,
        })
        .unwrap();
    common::recv_until(client, Duration::from_secs(2), |e| {
        matches!(e, Event::Snapshot { .. })
    });
}

/// Two clients join the same session; the first joiner becomes leader and
/// its `setTempo` is observed by both members.
#[test]
fn leader_tempo_change_is_observed_by_all_members() {
    let server = common::TestServer::start();
    let mut a = SessionClient::connect(&server.addr()).unwrap();
    let mut b = SessionClient::connect(&server.addr()).unwrap();

    join(&mut a, "s1", "a");
    join(&mut b, "s1", "a follower");
    // Drain the userJoined broadcast A receives for B.
    common::recv_until(&mut a, Duration::from_secs(2), |e| {
        matches!(e, Event::UserJoined { .. })
    });

    a.send(Command::SetTempo {
        session_id: "s1".to_string().into(),
        tempo_bpm: 140,
    })
    .unwrap();

    let a_snapshot = common::recv_until(&mut a, Duration::from_secs(2), |e| {
        matches!(e, Event::Snapshot { session, .. } if session.tempo_bpm == 140)
    });
    let b_snapshot = common::recv_until(&mut b, Duration::from_secs(2), |e| {
        matches!(e, Event::Snapshot { session, .. } if session.tempo_bpm == 140)
    });
    for event in [a_snapshot, b_snapshot] {
        match event {
            Event::Snapshot { session, .. } => assert_eq!(session.tempo_bpm, 140),
            _ => unreachable!(),
        }
    }
}

/// A follower's `play` is rejected and no `scrollTick` is ever emitted.
#[test]
fn follower_play_is_rejected_with_insufficient_role() {
    let server = common::TestServer::start();
    let mut a = SessionClient::connect(&server.addr()).unwrap();
    let mut b = SessionClient::connect(&server.addr()).unwrap();

    join(&mut a, "s2", "leader");
    join(&mut b, "s2", "follower");
    common::recv_until(&mut a, Duration::from_secs(2), |e| {
        matches!(e, Event::UserJoined { .. })
    });

    b.send(Command::Play {
        session_id: "s2".to_string().into(),
    })
    .unwrap();

    let error = common::recv_until(&mut b, Duration::from_secs(2), |e| {
        matches!(e, Event::Error { .. })
    });
    match error {
        Event::Error {
            code,
            current_leader,
            ..
        } => {
            assert_eq!(code, ErrorCode::InsufficientRole);
            assert!(current_leader.is_some());
        }
        _ => unreachable!(),
    }

    // No scrollTick should ever show up for either member.
    for _ in 0..5 {
        for event in b.poll_events() {
            assert!(!matches!(event, Event::ScrollTick { .. }));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
