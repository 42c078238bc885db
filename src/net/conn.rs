use crate::core::config::Options;
use crate::core::time::{Clock, SystemClock};
use crate::error::SessionError;
use crate::protocol::codec::{encode_packet, read_packet};
use crate::protocol::properties::{SubscribeProperties, UnsubscribeProperties};
use crate::protocol::{
    ConnectPacket, DisconnectPacket, Packet, ProtocolVersion, PublishPacket, TopicFilter, Will,
};
use crate::session::persist::Persistence;
use crate::session::{Notification, Request, SessionEngine};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Handle to one live MQTT connection.
///
/// Requests are enqueued to the session engine and complete through the
/// notification channel returned by [`Connection::connect`]. Dropping the
/// handle does not close the connection; call [`Connection::disconnect`]
/// for an orderly shutdown or [`Connection::close`] to tear down hard.
#[derive(Debug)]
pub struct Connection {
    req_tx: mpsc::Sender<Request>,
    cancel: CancellationToken,
}

impl Connection {
    /// Establish a session over an already-connected byte stream: perform
    /// the CONNECT/CONNACK handshake, then spawn the receive loop, send
    /// pipeline, session engine and keepalive tasks.
    pub async fn connect<S>(
        stream: S,
        options: Options,
        persist: Arc<dyn Persistence>,
    ) -> Result<(Self, mpsc::Receiver<Notification>)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::connect_with_clock(stream, options, persist, SystemClock).await
    }

    /// [`Connection::connect`] with an explicit clock, letting tests drive
    /// the keepalive timers deterministically.
    pub async fn connect_with_clock<S, C>(
        stream: S,
        options: Options,
        persist: Arc<dyn Persistence>,
        clock: C,
    ) -> Result<(Self, mpsc::Receiver<Notification>)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        C: Clock,
    {
        options.validate()?;
        let version = options.protocol_version;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        // Handshake happens inline; no task exists until the session is up.
        let connect = build_connect(&options);
        let frame =
            encode_packet(&Packet::Connect(connect), version).context("encoding CONNECT")?;
        writer.write_all(&frame).await.context("writing CONNECT")?;
        writer.flush().await.context("flushing CONNECT")?;
        let connack = match read_packet(&mut reader, version)
            .await
            .context("reading CONNACK")?
        {
            Packet::ConnAck(c) => c,
            other => bail!("expected CONNACK, got {:?}", other.control_type()),
        };
        if connack.reason_code != 0 {
            let code = connack.reason_code;
            let error = match (version, code) {
                (ProtocolVersion::V311, 0x01) | (ProtocolVersion::V5, 0x84) => {
                    SessionError::VersionMismatch { code }
                }
                _ => SessionError::ConnectRejected { code },
            };
            return Err(error.into());
        }
        tracing::debug!(
            session_present = connack.session_present,
            "connection established"
        );

        // An MQTT 5.0 server may dictate its own keepalive interval.
        let keep_alive_secs = connack
            .properties
            .server_keep_alive
            .unwrap_or(options.keep_alive_secs);

        let cap = options.channel_capacity;
        let (notify_tx, notify_rx) = mpsc::channel(cap);
        let (user_tx, user_rx) = mpsc::channel(cap);
        let (engine_tx, engine_rx) = mpsc::channel(cap);
        let (packet_tx, packet_rx) = mpsc::channel(cap);
        let (ping_tx, ping_rx) = mpsc::channel(1);
        let (req_tx, req_rx) = mpsc::channel(cap);
        let cancel = CancellationToken::new();

        let engine = SessionEngine::new(
            version,
            persist,
            notify_tx.clone(),
            user_tx,
            engine_tx.clone(),
            cancel.clone(),
        );
        tokio::spawn(engine_task(
            engine,
            req_rx,
            packet_rx,
            cancel.clone(),
            options.clean_start,
        ));
        tokio::spawn(super::recv::recv_loop(
            reader,
            version,
            packet_tx,
            ping_tx,
            notify_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(super::send::send_loop(
            writer,
            version,
            user_rx,
            engine_rx,
            notify_tx.clone(),
            cancel.clone(),
            options.flush_interval(),
        ));
        if keep_alive_secs > 0 {
            tokio::spawn(super::keepalive::keepalive_loop(
                clock,
                Duration::from_secs(u64::from(keep_alive_secs)),
                options.effective_keepalive_factor(),
                engine_tx,
                ping_rx,
                notify_tx,
                cancel.clone(),
            ));
        }

        Ok((Self { req_tx, cancel }, notify_rx))
    }

    /// Publish an application message. The outcome arrives as a
    /// [`Notification::Publish`] event.
    pub async fn publish(&self, publish: PublishPacket) -> Result<(), SessionError> {
        self.request(Request::Publish(publish)).await
    }

    pub async fn subscribe(&self, filters: Vec<TopicFilter>) -> Result<(), SessionError> {
        self.request(Request::Subscribe {
            filters,
            properties: SubscribeProperties::default(),
        })
        .await
    }

    pub async fn subscribe_with_properties(
        &self,
        filters: Vec<TopicFilter>,
        properties: SubscribeProperties,
    ) -> Result<(), SessionError> {
        self.request(Request::Subscribe {
            filters,
            properties,
        })
        .await
    }

    pub async fn unsubscribe(&self, filters: Vec<String>) -> Result<(), SessionError> {
        self.request(Request::Unsubscribe {
            filters,
            properties: UnsubscribeProperties::default(),
        })
        .await
    }

    /// Orderly shutdown: DISCONNECT is flushed to the server, then the
    /// connection tears down.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(Request::Disconnect(DisconnectPacket::default()))
            .await
    }

    pub async fn disconnect_with(&self, packet: DisconnectPacket) -> Result<(), SessionError> {
        self.request(Request::Disconnect(packet)).await
    }

    async fn request(&self, request: Request) -> Result<(), SessionError> {
        self.req_tx
            .send(request)
            .await
            .map_err(|_| SessionError::ConnectionClosed)
    }

    /// Tear the connection down without the DISCONNECT exchange.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection has terminated for any reason.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

/// Engine task: replay or wipe persisted session state, then serve user
/// requests and decoded packets until termination. On the way out the
/// request channel is drained so every pending request fails exactly once.
async fn engine_task(
    mut engine: SessionEngine,
    mut req_rx: mpsc::Receiver<Request>,
    mut packet_rx: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
    clean_start: bool,
) {
    if clean_start {
        engine.wipe().await;
    } else {
        engine.resume().await;
    }

    let mut requests_open = true;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            packet = packet_rx.recv() => match packet {
                Some(packet) => engine.handle_packet(packet).await,
                None => break,
            },
            request = req_rx.recv(), if requests_open => match request {
                Some(request) => engine.handle_request(request).await,
                None => requests_open = false,
            },
        }
    }

    cancel.cancel();
    req_rx.close();
    while let Ok(request) = req_rx.try_recv() {
        engine
            .fail_request(request, SessionError::ConnectionClosed)
            .await;
    }
    tracing::debug!("session engine exit");
}

fn build_connect(options: &Options) -> ConnectPacket {
    ConnectPacket {
        client_id: options.client_id.clone(),
        keep_alive: options.keep_alive_secs,
        clean_start: options.clean_start,
        will: options.will.as_ref().map(|will| Will {
            topic: will.topic.clone(),
            payload: will.payload.clone(),
            qos: will.qos,
            retain: will.retain,
            properties: will.properties.clone(),
        }),
        username: options.username.clone(),
        password: options
            .password
            .as_ref()
            .map(|password| password.as_bytes().to_vec()),
        properties: options.connect_properties.clone(),
    }
}
