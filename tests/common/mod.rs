//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use proxy_nlb::config::NlbConfig;
use proxy_nlb::inspector::Protocol;
use proxy_nlb::load_balancer::ModuleSpec;
use proxy_nlb::observability::RecordingSink;
use proxy_nlb::Nlb;

pub const HTTP_GET: &[u8] = b"GET /orders HTTP/1.1\r\nHost: shop\r\n\r\n";
pub const REDIS_PING: &[u8] = b"*1\r\n$4\r\nPING\r\n";
pub const PG_STARTUP: &[u8] = &[
    0x00, 0x00, 0x00, 0x29, 0x00, 0x03, 0x00, 0x00, b'u', b's', b'e', b'r', 0x00,
];

/// Build a balancer that records every metric it emits.
pub fn build_nlb(config: NlbConfig) -> (Arc<Nlb>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let nlb = Nlb::new(config, sink.clone()).expect("valid test config");
    (Arc::new(nlb), sink)
}

pub fn module(name: &str, protocol: Protocol, max_conns: usize) -> ModuleSpec {
    ModuleSpec {
        name: name.to_string(),
        protocol,
        address: "127.0.0.1".to_string(),
        port: 9000,
        version: "v1".to_string(),
        weight: 1,
        max_conns,
    }
}

pub fn versioned(name: &str, protocol: Protocol, version: &str) -> ModuleSpec {
    ModuleSpec {
        version: version.to_string(),
        ..module(name, protocol, 0)
    }
}

/// A module stand-in that accepts connections and holds them open.
pub struct ModuleServer {
    pub port: u16,
    handle: JoinHandle<()>,
}

impl ModuleServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener)
    }

    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        Self::serve(listener)
    }

    fn serve(listener: TcpListener) -> Self {
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        Self { port, handle }
    }

    /// Close the listener and every accepted connection.
    pub fn stop(self) {
        self.handle.abort();
    }
}

/// A port with nothing listening on it.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
