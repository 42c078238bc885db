//! Per-connection session engine.
//!
//! The engine is the single consumer of decoded packets and the sole owner
//! of the in-flight map and packet-identifier allocator. It ingests server
//! packets, emits protocol replies into the engine-generated send stream,
//! prepares user requests for the wire, and reports typed events on the
//! notification channel. Persistence failures are surfaced as events and
//! never abort the session.

pub mod persist;
pub mod pid;

use crate::error::SessionError;
use crate::protocol::codec::{decode_frame, encode_packet};
use crate::protocol::properties::{SubscribeProperties, UnsubscribeProperties};
use crate::protocol::{
    AckPacket, AuthPacket, ControlType, DisconnectPacket, Packet, ProtocolVersion, PublishPacket,
    Qos, SubAckPacket, SubscribePacket, TopicFilter, UnsubAckPacket, UnsubscribePacket,
    valid_topic,
};
use persist::{parse_key, recv_key, send_key, KeyDirection, Persistence};
use pid::PidAllocator;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Granted (or refused) QoS for one requested topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicGrant {
    pub filter: String,
    /// Reason code from the server: 0-2 grant that QoS, 0x80 and above
    /// refuse the subscription.
    pub code: u8,
}

impl TopicGrant {
    pub fn granted_qos(&self) -> Option<Qos> {
        Qos::from_bits(self.code).ok()
    }
}

/// Typed events emitted by the connection to the embedding client.
#[derive(Debug)]
pub enum Notification {
    Subscribe {
        grants: Vec<TopicGrant>,
        error: Option<SessionError>,
    },
    Unsubscribe {
        topics: Vec<String>,
        error: Option<SessionError>,
    },
    /// Outcome of one outbound publish. The topic is absent for flows
    /// resumed from persistence past the PUBREC stage, where only the
    /// PUBREL survives.
    Publish {
        topic: Option<String>,
        error: Option<SessionError>,
    },
    /// An application message delivered by the server.
    Inbound(PublishPacket),
    /// A persistence operation failed; the session continues.
    Persistence {
        packet: ControlType,
        error: String,
    },
    Net(SessionError),
    Disconnected {
        reason_code: u8,
    },
    /// MQTT 5.0 enhanced-auth exchange packet, forwarded to the embedding
    /// client which owns the authentication method.
    Auth(AuthPacket),
}

/// User-side commands consumed by the engine.
#[derive(Debug)]
pub enum Request {
    /// Publish an application message. Any packet identifier on the
    /// request is ignored; the engine assigns one for QoS above 0.
    Publish(PublishPacket),
    Subscribe {
        filters: Vec<TopicFilter>,
        properties: SubscribeProperties,
    },
    Unsubscribe {
        filters: Vec<String>,
        properties: UnsubscribeProperties,
    },
    Disconnect(DisconnectPacket),
}

/// Where an in-flight exchange stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitAck,
    AwaitRec,
    AwaitComp,
    AwaitSubAck,
    AwaitUnsubAck,
}

#[derive(Debug)]
enum Origin {
    Publish { topic: Option<String> },
    Subscribe { filters: Vec<TopicFilter> },
    Unsubscribe { filters: Vec<String> },
}

#[derive(Debug)]
struct InFlight {
    origin: Origin,
    phase: Phase,
    first_sent: Instant,
}

pub struct SessionEngine {
    version: ProtocolVersion,
    sent: PidAllocator<InFlight>,
    persist: Arc<dyn Persistence>,
    notify_tx: mpsc::Sender<Notification>,
    /// Prepared user packets, FIFO into the send pipeline.
    user_tx: mpsc::Sender<Packet>,
    /// Engine-generated replies, FIFO into the send pipeline on its own
    /// stream so acknowledgements never queue behind user publishes.
    out_tx: mpsc::Sender<Packet>,
    cancel: CancellationToken,
    closing: bool,
}

impl SessionEngine {
    pub fn new(
        version: ProtocolVersion,
        persist: Arc<dyn Persistence>,
        notify_tx: mpsc::Sender<Notification>,
        user_tx: mpsc::Sender<Packet>,
        out_tx: mpsc::Sender<Packet>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            version,
            sent: PidAllocator::new(),
            persist,
            notify_tx,
            user_tx,
            out_tx,
            cancel,
            closing: false,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.sent.outstanding()
    }

    async fn notify(&self, notification: Notification) {
        let _ = self.notify_tx.send(notification).await;
    }

    async fn send_reply(&self, packet: Packet) {
        if self.out_tx.send(packet).await.is_err() {
            tracing::debug!("send pipeline gone, dropping engine reply");
        }
    }

    async fn persist_store(&self, key: &str, packet: &Packet) {
        let kind = packet.control_type();
        match encode_packet(packet, self.version) {
            Ok(bytes) => {
                if let Err(err) = self.persist.store(key, &bytes) {
                    self.notify(Notification::Persistence {
                        packet: kind,
                        error: format!("{err:#}"),
                    })
                    .await;
                }
            }
            Err(err) => {
                self.notify(Notification::Persistence {
                    packet: kind,
                    error: format!("encoding for persistence: {err}"),
                })
                .await;
            }
        }
    }

    async fn persist_delete(&self, key: &str, kind: ControlType) {
        if let Err(err) = self.persist.delete(key) {
            self.notify(Notification::Persistence {
                packet: kind,
                error: format!("{err:#}"),
            })
            .await;
        }
    }

    // -----------------------------------------------------------------
    // Outbound requests
    // -----------------------------------------------------------------

    /// Prepare a user request for the wire: allocate the identifier,
    /// install the in-flight record, persist, then hand to the pipeline.
    pub async fn handle_request(&mut self, request: Request) {
        if self.closing {
            self.fail_request(request, SessionError::ConnectionClosed)
                .await;
            return;
        }
        match request {
            Request::Publish(mut p) => {
                if !valid_topic(&p.topic) {
                    self.notify(Notification::Publish {
                        topic: Some(p.topic.clone()),
                        error: Some(SessionError::Codec(
                            crate::error::CodecError::MalformedPacket("invalid topic name"),
                        )),
                    })
                    .await;
                    return;
                }
                if p.qos == Qos::AtMostOnce {
                    p.pid = None;
                    p.dup = false;
                    self.send_user(Packet::Publish(p)).await;
                    return;
                }
                let phase = match p.qos {
                    Qos::AtLeastOnce => Phase::AwaitAck,
                    _ => Phase::AwaitRec,
                };
                let record = InFlight {
                    origin: Origin::Publish {
                        topic: Some(p.topic.clone()),
                    },
                    phase,
                    first_sent: Instant::now(),
                };
                let pid = match self.sent.alloc(record) {
                    Ok(pid) => pid,
                    Err(err) => {
                        self.notify(Notification::Publish {
                            topic: Some(p.topic.clone()),
                            error: Some(err),
                        })
                        .await;
                        return;
                    }
                };
                p.pid = Some(pid);
                let packet = Packet::Publish(p);
                self.persist_store(&send_key(pid), &packet).await;
                self.send_user(packet).await;
            }
            Request::Subscribe {
                filters,
                properties,
            } => {
                if filters.is_empty() || filters.iter().any(|f| !valid_topic(&f.filter)) {
                    self.notify(Notification::Subscribe {
                        grants: Vec::new(),
                        error: Some(SessionError::Codec(
                            crate::error::CodecError::MalformedPacket("invalid topic filter"),
                        )),
                    })
                    .await;
                    return;
                }
                let record = InFlight {
                    origin: Origin::Subscribe {
                        filters: filters.clone(),
                    },
                    phase: Phase::AwaitSubAck,
                    first_sent: Instant::now(),
                };
                let pid = match self.sent.alloc(record) {
                    Ok(pid) => pid,
                    Err(err) => {
                        self.notify(Notification::Subscribe {
                            grants: Vec::new(),
                            error: Some(err),
                        })
                        .await;
                        return;
                    }
                };
                let packet = Packet::Subscribe(SubscribePacket {
                    pid,
                    filters,
                    properties,
                });
                self.persist_store(&send_key(pid), &packet).await;
                self.send_user(packet).await;
            }
            Request::Unsubscribe {
                filters,
                properties,
            } => {
                if filters.is_empty() || filters.iter().any(|f| !valid_topic(f)) {
                    self.notify(Notification::Unsubscribe {
                        topics: filters,
                        error: Some(SessionError::Codec(
                            crate::error::CodecError::MalformedPacket("invalid topic filter"),
                        )),
                    })
                    .await;
                    return;
                }
                let record = InFlight {
                    origin: Origin::Unsubscribe {
                        filters: filters.clone(),
                    },
                    phase: Phase::AwaitUnsubAck,
                    first_sent: Instant::now(),
                };
                let pid = match self.sent.alloc(record) {
                    Ok(pid) => pid,
                    Err(err) => {
                        self.notify(Notification::Unsubscribe {
                            topics: filters,
                            error: Some(err),
                        })
                        .await;
                        return;
                    }
                };
                let packet = Packet::Unsubscribe(UnsubscribePacket {
                    pid,
                    filters,
                    properties,
                });
                self.persist_store(&send_key(pid), &packet).await;
                self.send_user(packet).await;
            }
            Request::Disconnect(d) => {
                self.closing = true;
                self.send_user(Packet::Disconnect(d)).await;
            }
        }
    }

    /// Report one failure for a request that can no longer be served.
    pub async fn fail_request(&self, request: Request, error: SessionError) {
        match request {
            Request::Publish(p) => {
                self.notify(Notification::Publish {
                    topic: Some(p.topic),
                    error: Some(error),
                })
                .await;
            }
            Request::Subscribe { .. } => {
                self.notify(Notification::Subscribe {
                    grants: Vec::new(),
                    error: Some(error),
                })
                .await;
            }
            Request::Unsubscribe { filters, .. } => {
                self.notify(Notification::Unsubscribe {
                    topics: filters,
                    error: Some(error),
                })
                .await;
            }
            Request::Disconnect(_) => {}
        }
    }

    async fn send_user(&self, packet: Packet) {
        if self.user_tx.send(packet).await.is_err() {
            tracing::debug!("send pipeline gone, dropping user packet");
        }
    }

    // -----------------------------------------------------------------
    // Inbound packets
    // -----------------------------------------------------------------

    /// Ingest one decoded server packet and apply the QoS state machine.
    pub async fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::SubAck(ack) => self.on_suback(ack).await,
            Packet::UnsubAck(ack) => self.on_unsuback(ack).await,
            Packet::Publish(p) => self.on_publish(p).await,
            Packet::PubAck(a) => self.on_puback(a).await,
            Packet::PubRec(a) => self.on_pubrec(a).await,
            Packet::PubRel(a) => self.on_pubrel(a).await,
            Packet::PubComp(a) => self.on_pubcomp(a).await,
            // The receive loop routes PINGRESP to the keepalive task; one
            // arriving here is harmless.
            Packet::PingResp => {}
            Packet::Disconnect(d) => {
                tracing::debug!(reason = d.reason_code, "server disconnect");
                self.notify(Notification::Disconnected {
                    reason_code: d.reason_code,
                })
                .await;
                self.cancel.cancel();
            }
            Packet::Auth(a) => {
                if a.properties.auth_method.is_none() {
                    self.protocol_error(SessionError::AuthMethodMissing).await;
                    return;
                }
                self.notify(Notification::Auth(a)).await;
            }
            other => {
                self.protocol_error(SessionError::UnexpectedPacket(other.control_type()))
                    .await;
            }
        }
    }

    async fn protocol_error(&self, error: SessionError) {
        tracing::warn!(%error, "protocol error, closing connection");
        self.notify(Notification::Net(error)).await;
        self.cancel.cancel();
    }

    async fn on_suback(&mut self, ack: SubAckPacket) {
        if self.sent.get(ack.pid).map(|r| r.phase) != Some(Phase::AwaitSubAck) {
            tracing::debug!(pid = ack.pid, "SUBACK without matching subscribe, ignoring");
            return;
        }
        let Some(record) = self.sent.free(ack.pid) else {
            return;
        };
        if let Origin::Subscribe { filters } = record.origin {
            if ack.codes.len() < filters.len() {
                tracing::warn!(
                    pid = ack.pid,
                    requested = filters.len(),
                    served = ack.codes.len(),
                    "SUBACK carries fewer codes than requested topics"
                );
            }
            let grants = filters
                .iter()
                .zip(&ack.codes)
                .map(|(filter, code)| TopicGrant {
                    filter: filter.filter.clone(),
                    code: *code,
                })
                .collect();
            tracing::debug!(
                pid = ack.pid,
                elapsed_ms = record.first_sent.elapsed().as_millis() as u64,
                "subscription acknowledged"
            );
            self.notify(Notification::Subscribe {
                grants,
                error: None,
            })
            .await;
            self.persist_delete(&send_key(ack.pid), ControlType::SubAck)
                .await;
        }
    }

    async fn on_unsuback(&mut self, ack: UnsubAckPacket) {
        if self.sent.get(ack.pid).map(|r| r.phase) != Some(Phase::AwaitUnsubAck) {
            tracing::debug!(pid = ack.pid, "UNSUBACK without matching unsubscribe, ignoring");
            return;
        }
        let Some(record) = self.sent.free(ack.pid) else {
            return;
        };
        if let Origin::Unsubscribe { filters } = record.origin {
            tracing::debug!(
                pid = ack.pid,
                elapsed_ms = record.first_sent.elapsed().as_millis() as u64,
                "unsubscribe acknowledged"
            );
            self.notify(Notification::Unsubscribe {
                topics: filters,
                error: None,
            })
            .await;
            self.persist_delete(&send_key(ack.pid), ControlType::UnsubAck)
                .await;
        }
    }

    async fn on_publish(&mut self, p: PublishPacket) {
        match p.qos {
            Qos::AtMostOnce => {
                self.notify(Notification::Inbound(p)).await;
            }
            Qos::AtLeastOnce => {
                let Some(pid) = p.pid else {
                    self.protocol_error(SessionError::UnexpectedPacket(ControlType::Publish))
                        .await;
                    return;
                };
                self.persist_store(&recv_key(pid), &Packet::Publish(p.clone()))
                    .await;
                self.send_reply(Packet::PubAck(AckPacket::success(pid))).await;
                self.notify(Notification::Inbound(p)).await;
            }
            Qos::ExactlyOnce => {
                let Some(pid) = p.pid else {
                    self.protocol_error(SessionError::UnexpectedPacket(ControlType::Publish))
                        .await;
                    return;
                };
                // A DUP retransmission for a flow we already hold is
                // acknowledged again but not delivered again.
                let duplicate = p.dup && self.held(pid, ControlType::Publish).await;
                self.persist_store(&recv_key(pid), &Packet::Publish(p.clone()))
                    .await;
                self.send_reply(Packet::PubRec(AckPacket::success(pid))).await;
                if duplicate {
                    tracing::debug!(pid, "suppressing duplicate QoS 2 delivery");
                } else {
                    self.notify(Notification::Inbound(p)).await;
                }
            }
        }
    }

    async fn on_puback(&mut self, ack: AckPacket) {
        if self.sent.get(ack.pid).map(|r| r.phase) != Some(Phase::AwaitAck) {
            tracing::debug!(pid = ack.pid, "PUBACK without matching publish, ignoring");
            return;
        }
        let Some(record) = self.sent.free(ack.pid) else {
            return;
        };
        if let Origin::Publish { topic } = record.origin {
            tracing::debug!(
                pid = ack.pid,
                elapsed_ms = record.first_sent.elapsed().as_millis() as u64,
                "QoS 1 publish acknowledged"
            );
            self.notify(Notification::Publish { topic, error: None }).await;
            self.persist_delete(&send_key(ack.pid), ControlType::PubAck)
                .await;
        }
    }

    async fn on_pubrec(&mut self, ack: AckPacket) {
        match self.sent.get_mut(ack.pid) {
            Some(record) if record.phase == Phase::AwaitRec => {
                record.phase = Phase::AwaitComp;
            }
            _ => {
                tracing::debug!(pid = ack.pid, "PUBREC without matching publish, ignoring");
                return;
            }
        }
        let pubrel = Packet::PubRel(AckPacket::success(ack.pid));
        self.persist_store(&send_key(ack.pid), &pubrel).await;
        self.send_reply(pubrel).await;
    }

    /// Whether an inbound flow for this identifier is still persisted.
    /// Load failures surface as events and read as "not held".
    async fn held(&self, pid: u16, kind: ControlType) -> bool {
        match self.persist.load(&recv_key(pid)) {
            Ok(entry) => entry.is_some(),
            Err(err) => {
                self.notify(Notification::Persistence {
                    packet: kind,
                    error: format!("{err:#}"),
                })
                .await;
                false
            }
        }
    }

    async fn on_pubrel(&mut self, ack: AckPacket) {
        if !self.held(ack.pid, ControlType::PubRel).await {
            tracing::debug!(pid = ack.pid, "PUBREL without held inbound flow, ignoring");
            return;
        }
        self.send_reply(Packet::PubComp(AckPacket::success(ack.pid)))
            .await;
        self.persist_delete(&recv_key(ack.pid), ControlType::PubRel)
            .await;
    }

    async fn on_pubcomp(&mut self, ack: AckPacket) {
        if self.sent.get(ack.pid).map(|r| r.phase) != Some(Phase::AwaitComp) {
            tracing::debug!(pid = ack.pid, "PUBCOMP without matching publish, ignoring");
            return;
        }
        let Some(record) = self.sent.free(ack.pid) else {
            return;
        };
        if let Origin::Publish { topic } = record.origin {
            tracing::debug!(
                pid = ack.pid,
                elapsed_ms = record.first_sent.elapsed().as_millis() as u64,
                "QoS 2 publish completed"
            );
            self.notify(Notification::Publish { topic, error: None }).await;
            self.persist_delete(&send_key(ack.pid), ControlType::PubComp)
                .await;
        }
    }

    // -----------------------------------------------------------------
    // Session state across connects
    // -----------------------------------------------------------------

    /// Replay persisted flows after reconnecting without a clean start:
    /// outbound unacknowledged PUBLISH packets go out again with DUP set,
    /// outbound PUBREL packets resume their completion wait, and inbound
    /// QoS 2 flows still awaiting PUBREL re-announce with PUBREC. Replays
    /// happen in original packet-identifier order.
    pub async fn resume(&mut self) {
        let mut outbound: Vec<(u16, Vec<u8>)> = Vec::new();
        let mut inbound: Vec<(u16, Vec<u8>)> = Vec::new();
        let result = self.persist.range(&mut |key, bytes| {
            if let Some((direction, pid)) = parse_key(key) {
                match direction {
                    KeyDirection::Send => outbound.push((pid, bytes.to_vec())),
                    KeyDirection::Recv => inbound.push((pid, bytes.to_vec())),
                }
            }
        });
        if let Err(err) = result {
            self.notify(Notification::Persistence {
                packet: ControlType::Connect,
                error: format!("resume range: {err:#}"),
            })
            .await;
            return;
        }
        outbound.sort_by_key(|(pid, _)| *pid);
        inbound.sort_by_key(|(pid, _)| *pid);

        for (pid, frame) in outbound {
            match decode_frame(self.version, &frame) {
                Ok(Packet::Publish(mut p)) if p.qos != Qos::AtMostOnce => {
                    let record = InFlight {
                        origin: Origin::Publish {
                            topic: Some(p.topic.clone()),
                        },
                        phase: match p.qos {
                            Qos::AtLeastOnce => Phase::AwaitAck,
                            _ => Phase::AwaitRec,
                        },
                        first_sent: Instant::now(),
                    };
                    if self.sent.bind(pid, record).is_ok() {
                        p.pid = Some(pid);
                        p.dup = true;
                        self.send_reply(Packet::Publish(p)).await;
                    }
                }
                Ok(Packet::PubRel(_)) => {
                    let record = InFlight {
                        origin: Origin::Publish { topic: None },
                        phase: Phase::AwaitComp,
                        first_sent: Instant::now(),
                    };
                    if self.sent.bind(pid, record).is_ok() {
                        self.send_reply(Packet::PubRel(AckPacket::success(pid))).await;
                    }
                }
                Ok(other) => {
                    tracing::warn!(pid, kind = ?other.control_type(), "unexpected persisted outbound packet");
                }
                Err(err) => {
                    tracing::warn!(pid, %err, "undecodable persisted outbound packet");
                }
            }
        }
        for (pid, frame) in inbound {
            match decode_frame(self.version, &frame) {
                Ok(Packet::Publish(p)) if p.qos == Qos::ExactlyOnce => {
                    self.send_reply(Packet::PubRec(AckPacket::success(pid))).await;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(pid, %err, "undecodable persisted inbound packet");
                }
            }
        }
    }

    /// Drop all persisted flows; used when connecting with clean start.
    pub async fn wipe(&self) {
        let mut keys = Vec::new();
        let result = self.persist.range(&mut |key, _| keys.push(key.to_string()));
        match result {
            Ok(()) => {
                for key in keys {
                    if let Err(err) = self.persist.delete(&key) {
                        self.notify(Notification::Persistence {
                            packet: ControlType::Connect,
                            error: format!("wiping {key}: {err:#}"),
                        })
                        .await;
                    }
                }
            }
            Err(err) => {
                self.notify(Notification::Persistence {
                    packet: ControlType::Connect,
                    error: format!("wipe range: {err:#}"),
                })
                .await;
            }
        }
    }
}
