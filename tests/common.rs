//! Common test harness utilities for integration tests.
//!
//! Provides an engine harness wired to in-memory channels and persistence,
//! a deliberately failing persistence backend, and a scripted broker that
//! speaks real frames over an in-process duplex stream.

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use photon::protocol::codec::{encode_packet, read_packet};
use photon::protocol::{Packet, ProtocolVersion};
use photon::{MemPersistence, Notification, Persistence, SessionEngine};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct EngineHarness {
    pub engine: SessionEngine,
    pub persist: Arc<MemPersistence>,
    pub notify_rx: mpsc::Receiver<Notification>,
    pub user_rx: mpsc::Receiver<Packet>,
    pub out_rx: mpsc::Receiver<Packet>,
    pub cancel: CancellationToken,
}

/// Route crate logs through the test writer; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Engine wired to buffered channels so tests can drive transitions
/// directly and observe every emitted packet and notification.
pub fn engine_harness(version: ProtocolVersion) -> EngineHarness {
    engine_with_persistence(version, Arc::new(MemPersistence::new()))
}

pub fn engine_with_persistence(
    version: ProtocolVersion,
    persist: Arc<MemPersistence>,
) -> EngineHarness {
    init_tracing();
    let (notify_tx, notify_rx) = mpsc::channel(64);
    let (user_tx, user_rx) = mpsc::channel(64);
    let (out_tx, out_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let engine = SessionEngine::new(
        version,
        persist.clone() as Arc<dyn Persistence>,
        notify_tx,
        user_tx,
        out_tx,
        cancel.clone(),
    );
    EngineHarness {
        engine,
        persist,
        notify_rx,
        user_rx,
        out_rx,
        cancel,
    }
}

/// Persistence backend whose operations all fail, for exercising the
/// non-fatal error path.
#[derive(Debug, Default)]
pub struct FailingPersistence;

impl Persistence for FailingPersistence {
    fn store(&self, key: &str, _packet: &[u8]) -> anyhow::Result<()> {
        anyhow::bail!("store {key}: disk full")
    }

    fn load(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        anyhow::bail!("load {key}: disk full")
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        anyhow::bail!("delete {key}: disk full")
    }

    fn range(&self, _visit: &mut dyn FnMut(&str, &[u8])) -> anyhow::Result<()> {
        anyhow::bail!("range: disk full")
    }
}

/// Scripted broker half of a duplex connection.
pub struct Broker {
    pub stream: DuplexStream,
    pub version: ProtocolVersion,
}

impl Broker {
    pub fn new(stream: DuplexStream, version: ProtocolVersion) -> Self {
        init_tracing();
        Self { stream, version }
    }

    pub async fn read(&mut self) -> Packet {
        read_packet(&mut self.stream, self.version)
            .await
            .expect("broker read")
    }

    pub async fn write(&mut self, packet: &Packet) {
        let frame = encode_packet(packet, self.version).expect("broker encode");
        self.stream.write_all(&frame).await.expect("broker write");
        self.stream.flush().await.expect("broker flush");
    }

    /// Serve the CONNECT handshake with a success CONNACK.
    pub async fn accept_connect(&mut self) -> Packet {
        let connect = self.read().await;
        assert!(matches!(connect, Packet::Connect(_)), "expected CONNECT");
        self.write(&Packet::ConnAck(photon::protocol::ConnAckPacket {
            session_present: false,
            reason_code: 0,
            properties: Default::default(),
        }))
        .await;
        connect
    }
}
