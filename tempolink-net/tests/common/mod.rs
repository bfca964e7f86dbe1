#![allow(dead_code)]
//! Test harness utilities for `tempolink-net` integration tests.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tempolink_core::config::Config;
use tempolink_net::{CoordinatorServer, ServerConfig};
use tempolink_types::Event;

/// A running coordinator server plus its accept-loop thread, torn down on drop.
pub struct TestServer {
    pub server: Arc<CoordinatorServer>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start() -> Self {
        let server = CoordinatorServer::bind("127.0.0.1:0", ServerConfig::default(), |sink| {
            tempolink_core::Coordinator::new(&Config::load(), sink)
        })
        .expect("bind");
        let server = Arc::new(server);
        let for_thread = server.clone();
        let handle = thread::spawn(move || for_thread.serve());
        thread::sleep(Duration::from_millis(20));
        Self {
            server,
            handle: Some(handle),
        }
    }

    pub fn addr(&self) -> String {
        self.server.local_addr().unwrap().to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Blocks until `pred` matches an incoming event, panicking after `timeout`.
pub fn recv_until(
    client: &mut tempolink_net::SessionClient,
    timeout: Duration,
    mut pred: impl FnMut(&Event) -> bool,
) -> Event {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for matching event");
        }
        for event in client.poll_events() {
            if pred(&event) {
                return event;
            }
        }
        thread::sleep(Duration::from_millis(5));
    }
}
