use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{
    OUTBOUND_QUEUE_CAPACITY, ProxyHandle, PumpExit, link_pair, queue_to_socket, socket_to_channel,
};
use crate::error::TunnelError;
use crate::observer::Notifier;
use crate::timeout::dial_timeout;
use crate::transport::TunnelChannel;

/// Host side: one TCP connection to the local game server, bridged to the
/// tunnel channel.
pub struct HostProxy;

impl HostProxy {
    /// Dials `target` and starts both pumps. Returns as soon as they are
    /// running; nothing that happens afterwards is reported through the
    /// return value.
    pub async fn start(
        channel: Arc<dyn TunnelChannel>,
        target: &str,
        timeout: Duration,
        notifier: Notifier,
    ) -> Result<ProxyHandle, TunnelError> {
        let stream = dial_timeout(target, timeout).await?;
        let _ = stream.set_nodelay(true);
        tracing::info!(
            target = "mc_tunnel::proxy::host",
            address = %target,
            label = %channel.label(),
            "connected to game server"
        );

        let (reader, writer) = stream.into_split();
        let (handle, tasks) = ProxyHandle::new();
        let (link_tx, link) = link_pair();

        let (inbound_tx, inbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        {
            // Dropping bytes would corrupt the game stream, so a server that
            // stops draining loses its connection instead.
            let link_tx = link_tx.clone();
            channel.on_message(Arc::new(move |payload| {
                if let Err(TrySendError::Full(_)) = inbound_tx.try_send(payload) {
                    if !*link_tx.borrow() {
                        tracing::warn!(
                            target = "mc_tunnel::proxy::host",
                            "game server stopped reading; closing its connection"
                        );
                    }
                    link_tx.send_replace(true);
                }
            }));
        }

        {
            let channel = channel.clone();
            let link_tx = link_tx.clone();
            let stop = tasks.stop_signal();
            let link = link.clone();
            let notifier = notifier.clone();
            let target = target.to_string();
            tasks.spawn(async move {
                let exit = socket_to_channel(reader, channel, stop, link).await;
                link_tx.send_replace(true);
                log_exit("game server -> tunnel", &target, &exit, &notifier);
            });
        }

        {
            let stop = tasks.stop_signal();
            let target = target.to_string();
            tasks.spawn(async move {
                let exit = queue_to_socket(writer, inbound_rx, stop, link).await;
                link_tx.send_replace(true);
                channel.clear_message_handler();
                log_exit("tunnel -> game server", &target, &exit, &notifier);
            });
        }

        Ok(handle)
    }
}

fn log_exit(direction: &str, target: &str, exit: &PumpExit, notifier: &Notifier) {
    if exit.is_failure() {
        tracing::warn!(
            target = "mc_tunnel::proxy::host",
            direction,
            address = %target,
            reason = %exit,
            "pump failed"
        );
        notifier.log(format!("Game server connection error: {exit}"));
    } else {
        tracing::debug!(
            target = "mc_tunnel::proxy::host",
            direction,
            address = %target,
            reason = %exit,
            "pump finished"
        );
    }
}
