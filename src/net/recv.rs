use crate::error::{CodecError, SessionError};
use crate::protocol::codec::read_packet;
use crate::protocol::{Packet, ProtocolVersion};
use crate::session::Notification;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Receive loop: read fixed header and body, decode for the negotiated
/// version, route PINGRESP to the keepalive task and everything else to
/// the engine. Any read or decode failure closes the connection; dropping
/// the decoded-packet sender on exit is the engine's termination signal.
pub(crate) async fn recv_loop<S>(
    mut reader: S,
    version: ProtocolVersion,
    packet_tx: mpsc::Sender<Packet>,
    ping_tx: mpsc::Sender<()>,
    notify_tx: mpsc::Sender<Notification>,
    cancel: CancellationToken,
) where
    S: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            result = read_packet(&mut reader, version) => match result {
                Ok(Packet::PingResp) => {
                    tracing::debug!("keepalive response received");
                    // Fails only when keepalive is disabled or stopping.
                    let _ = ping_tx.try_send(());
                }
                Ok(packet) => {
                    if packet_tx.send(packet).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let error = classify(err);
                    tracing::warn!(%error, "receive loop terminating");
                    let _ = notify_tx.send(Notification::Net(error)).await;
                    cancel.cancel();
                    break;
                }
            }
        }
    }
    tracing::debug!("receive loop exit");
}

fn classify(err: anyhow::Error) -> SessionError {
    match err.downcast::<CodecError>() {
        Ok(codec) => SessionError::Codec(codec),
        Err(err) => SessionError::Transport(format!("{err:#}")),
    }
}
