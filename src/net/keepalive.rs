use crate::core::time::Clock;
use crate::error::SessionError;
use crate::protocol::Packet;
use crate::session::Notification;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Keepalive task: tick at three quarters of the keepalive interval, send
/// PINGREQ through the engine-generated stream, and require the PINGRESP
/// within `interval * factor` of the send. A missed response closes the
/// connection with a keepalive-timeout error.
pub(crate) async fn keepalive_loop<C: Clock>(
    clock: C,
    interval: Duration,
    factor: f64,
    out_tx: mpsc::Sender<Packet>,
    mut ping_rx: mpsc::Receiver<()>,
    notify_tx: mpsc::Sender<Notification>,
    cancel: CancellationToken,
) {
    let period = interval.mul_f64(0.75);
    let deadline = interval.mul_f64(factor);
    tracing::debug!(?period, ?deadline, "keepalive started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = clock.sleep(period) => {}
        }

        // Discard responses from earlier cycles so a stale PINGRESP cannot
        // satisfy this round.
        while ping_rx.try_recv().is_ok() {}

        if out_tx.send(Packet::PingReq).await.is_err() {
            break;
        }
        let sent_at = clock.now();
        let wait = clock.sleep_until(sent_at + deadline);
        tokio::pin!(wait);
        tokio::select! {
            () = cancel.cancelled() => break,
            () = wait.as_mut() => {
                tracing::warn!("keepalive timeout, closing connection");
                let _ = notify_tx
                    .send(Notification::Net(SessionError::KeepaliveTimeout))
                    .await;
                cancel.cancel();
                break;
            }
            pong = ping_rx.recv() => {
                if pong.is_none() {
                    break;
                }
            }
        }
    }
    tracing::debug!("keepalive stopped");
}
