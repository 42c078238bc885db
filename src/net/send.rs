use crate::error::SessionError;
use crate::protocol::codec::encode_packet;
use crate::protocol::{Packet, ProtocolVersion, Qos};
use crate::session::Notification;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

enum Flow {
    Wrote,
    Teardown,
}

/// Send pipeline: serialize the user and engine-generated streams onto the
/// buffered transport writer. Each write arms a short flush timer; packets
/// arriving before it fires coalesce into one flush. DISCONNECT flushes
/// immediately and initiates teardown, and encode or write failures close
/// the connection.
pub(crate) async fn send_loop<W>(
    mut writer: W,
    version: ProtocolVersion,
    mut user_rx: mpsc::Receiver<Packet>,
    mut engine_rx: mpsc::Receiver<Packet>,
    notify_tx: mpsc::Sender<Notification>,
    cancel: CancellationToken,
    flush_interval: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let flush = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(flush);
    let mut armed = false;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = flush.as_mut(), if armed => {
                armed = false;
                if let Err(err) = writer.flush().await {
                    transport_error(&notify_tx, &cancel, &err).await;
                    break;
                }
            }
            packet = engine_rx.recv() => match packet {
                Some(packet) => {
                    match write_one(&mut writer, version, packet, &notify_tx, &cancel).await {
                        Flow::Wrote => {
                            flush.as_mut().reset(tokio::time::Instant::now() + flush_interval);
                            armed = true;
                        }
                        Flow::Teardown => break,
                    }
                }
                None => break,
            },
            packet = user_rx.recv() => match packet {
                Some(packet) => {
                    match write_one(&mut writer, version, packet, &notify_tx, &cancel).await {
                        Flow::Wrote => {
                            flush.as_mut().reset(tokio::time::Instant::now() + flush_interval);
                            armed = true;
                        }
                        Flow::Teardown => break,
                    }
                }
                None => break,
            },
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    tracing::debug!("send pipeline exit");
}

async fn write_one<W>(
    writer: &mut W,
    version: ProtocolVersion,
    packet: Packet,
    notify_tx: &mpsc::Sender<Notification>,
    cancel: &CancellationToken,
) -> Flow
where
    W: AsyncWrite + Unpin,
{
    let frame = match encode_packet(&packet, version) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(%err, kind = ?packet.control_type(), "encode error, closing connection");
            let _ = notify_tx.send(Notification::Net(SessionError::Codec(err))).await;
            cancel.cancel();
            return Flow::Teardown;
        }
    };
    if let Err(err) = writer.write_all(&frame).await {
        transport_error(notify_tx, cancel, &err).await;
        return Flow::Teardown;
    }
    match &packet {
        // Fire-and-forget publishes complete as soon as they hit the
        // writer; there is no acknowledgement to wait for.
        Packet::Publish(p) if p.qos == Qos::AtMostOnce => {
            let _ = notify_tx
                .send(Notification::Publish {
                    topic: Some(p.topic.clone()),
                    error: None,
                })
                .await;
        }
        Packet::Disconnect(_) => {
            if let Err(err) = writer.flush().await {
                transport_error(notify_tx, cancel, &err).await;
            }
            cancel.cancel();
            return Flow::Teardown;
        }
        _ => {}
    }
    Flow::Wrote
}

async fn transport_error(
    notify_tx: &mpsc::Sender<Notification>,
    cancel: &CancellationToken,
    err: &std::io::Error,
) {
    tracing::warn!(%err, "transport write error, closing connection");
    let _ = notify_tx
        .send(Notification::Net(SessionError::Transport(err.to_string())))
        .await;
    cancel.cancel();
}
