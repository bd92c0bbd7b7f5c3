use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::{
    ClientId, ClientRegistry, OUTBOUND_QUEUE_CAPACITY, ProxyHandle, ProxyTasks, PumpExit,
    link_pair, queue_to_socket, socket_to_channel,
};
use crate::error::TunnelError;
use crate::observer::Notifier;
use crate::timeout::listen_timeout;
use crate::transport::TunnelChannel;

/// Joiner side: a local listener whose clients all share the one tunnel
/// channel.
///
/// Everything arriving from the remote peer is broadcast to every connected
/// client; every client's reads are forwarded into the channel as they
/// come, interleaved with the other clients' traffic.
pub struct JoinerProxy {
    local_addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    handle: ProxyHandle,
}

impl JoinerProxy {
    pub async fn start(
        channel: Arc<dyn TunnelChannel>,
        bind: SocketAddr,
        timeout: Duration,
        notifier: Notifier,
    ) -> Result<JoinerProxy, TunnelError> {
        let listener = listen_timeout(bind, timeout).await?;
        let local_addr = listener.local_addr().map_err(|err| TunnelError::Listen {
            address: bind.to_string(),
            reason: err.to_string(),
        })?;
        tracing::info!(
            target = "mc_tunnel::proxy::joiner",
            address = %local_addr,
            label = %channel.label(),
            "listening for local clients"
        );

        let registry = Arc::new(ClientRegistry::new());
        {
            let registry = registry.clone();
            channel.on_message(Arc::new(move |payload| {
                let delivered = registry.broadcast(&payload);
                tracing::trace!(
                    target = "mc_tunnel::proxy::joiner",
                    bytes = payload.len(),
                    clients = delivered,
                    "broadcast"
                );
            }));
        }

        let (handle, tasks) = ProxyHandle::new();
        let accept_tasks = tasks.clone();
        let accept_registry = registry.clone();
        tasks.spawn(accept_loop(
            listener,
            channel,
            accept_registry,
            accept_tasks,
            notifier,
        ));

        Ok(JoinerProxy {
            local_addr,
            registry,
            handle,
        })
    }

    /// The concrete bound address, including the port picked for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    pub fn handle(&self) -> &ProxyHandle {
        &self.handle
    }

    pub fn into_handle(self) -> ProxyHandle {
        self.handle
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    channel: Arc<dyn TunnelChannel>,
    registry: Arc<ClientRegistry>,
    tasks: ProxyTasks,
    notifier: Notifier,
) {
    let mut stop = tasks.stop_signal();
    loop {
        tokio::select! {
            _ = stop.requested() => break,
            _ = channel.closed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    admit(stream, peer, &channel, &registry, &tasks, &notifier);
                }
                Err(err) => {
                    tracing::debug!(
                        target = "mc_tunnel::proxy::joiner",
                        error = %err,
                        "accept failed; listener done"
                    );
                    break;
                }
            },
        }
    }
    drop(listener);
    channel.clear_message_handler();
    registry.clear();
    tracing::debug!(target = "mc_tunnel::proxy::joiner", "accept loop finished");
}

fn admit(
    stream: TcpStream,
    peer: SocketAddr,
    channel: &Arc<dyn TunnelChannel>,
    registry: &Arc<ClientRegistry>,
    tasks: &ProxyTasks,
    notifier: &Notifier,
) {
    let _ = stream.set_nodelay(true);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let (link_tx, link) = link_pair();
    let id = registry.insert(outbound_tx, link_tx.clone());
    tracing::info!(
        target = "mc_tunnel::proxy::joiner",
        client_id = %id,
        peer = %peer,
        clients = registry.len(),
        "client connected"
    );
    notifier.log(format!("Local client connected from {peer}"));

    let (reader, writer) = stream.into_split();

    {
        let registry = registry.clone();
        let link_tx = link_tx.clone();
        let stop = tasks.stop_signal();
        let link = link.clone();
        tasks.spawn(async move {
            let exit = queue_to_socket(writer, outbound_rx, stop, link).await;
            registry.remove(id);
            link_tx.send_replace(true);
            log_client_exit(id, "tunnel -> client", &exit);
        });
    }

    {
        let channel = channel.clone();
        let registry = registry.clone();
        let stop = tasks.stop_signal();
        let notifier = notifier.clone();
        tasks.spawn(async move {
            let exit = socket_to_channel(reader, channel, stop, link).await;
            registry.remove(id);
            link_tx.send_replace(true);
            log_client_exit(id, "client -> tunnel", &exit);
            notifier.log(format!("Local client {peer} disconnected"));
        });
    }
}

fn log_client_exit(id: ClientId, direction: &str, exit: &PumpExit) {
    if exit.is_failure() {
        tracing::warn!(
            target = "mc_tunnel::proxy::joiner",
            client_id = %id,
            direction,
            reason = %exit,
            "client pump failed"
        );
    } else {
        tracing::debug!(
            target = "mc_tunnel::proxy::joiner",
            client_id = %id,
            direction,
            reason = %exit,
            "client pump finished"
        );
    }
}
