//! Data-plane bridges between a tunnel channel and local TCP sockets.
//!
//! Each TCP connection is served by two unidirectional pumps: socket reads
//! are forwarded as channel messages, and channel messages queued by the
//! channel's handler are written back to the socket. Either pump ending
//! stops its sibling; the socket halves are owned by the pumps and dropped
//! exactly once when they return.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

use crate::error::ChannelError;
use crate::transport::TunnelChannel;

pub mod host;
pub mod joiner;
pub mod registry;

pub use host::HostProxy;
pub use joiner::JoinerProxy;
pub use registry::{ClientId, ClientRegistry};

pub const READ_BUFFER_SIZE: usize = 4096;

/// Messages buffered per local socket before its reader is considered stuck.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Control over a running proxy.
///
/// Dropping the handle detaches the proxy: it keeps running until its socket
/// or channel closes.
pub struct ProxyHandle {
    stop: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

impl ProxyHandle {
    pub(crate) fn new() -> (ProxyHandle, ProxyTasks) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let handle = ProxyHandle {
            stop: stop_tx,
            done: done_rx,
        };
        let tasks = ProxyTasks {
            stop: StopSignal(stop_rx),
            alive: Arc::new(Lifetime(done_tx)),
        };
        (handle, tasks)
    }

    /// Asks every pump and the accept loop to exit. Idempotent.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once every task of the proxy has returned.
    pub async fn stopped(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub async fn shutdown(&self) {
        self.stop();
        self.stopped().await;
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("stop_requested", &*self.stop.borrow())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Marks the proxy finished when the last task holding it returns.
struct Lifetime(watch::Sender<bool>);

impl Drop for Lifetime {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// Task-side half of a [`ProxyHandle`].
#[derive(Clone)]
pub(crate) struct ProxyTasks {
    stop: StopSignal,
    alive: Arc<Lifetime>,
}

impl ProxyTasks {
    pub(crate) fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let alive = self.alive.clone();
        tokio::spawn(async move {
            let _alive = alive;
            task.await;
        });
    }
}

#[derive(Clone)]
pub(crate) struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// Resolves once a stop is requested. Never resolves if the requesting
    /// side went away without asking.
    pub(crate) async fn requested(&mut self) {
        if self.0.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Stop pair scoped to one TCP connection, so the pump that ends first can
/// release its sibling.
pub(crate) fn link_pair() -> (Arc<watch::Sender<bool>>, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (Arc::new(tx), StopSignal(rx))
}

#[derive(Debug)]
pub(crate) enum PumpExit {
    Stopped,
    Eof,
    ChannelClosed,
    QueueClosed,
    Io(std::io::Error),
    Channel(ChannelError),
}

impl fmt::Display for PumpExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpExit::Stopped => f.write_str("stopped"),
            PumpExit::Eof => f.write_str("socket closed by peer"),
            PumpExit::ChannelClosed => f.write_str("tunnel channel closed"),
            PumpExit::QueueClosed => f.write_str("inbound queue closed"),
            PumpExit::Io(err) => write!(f, "socket error: {err}"),
            PumpExit::Channel(err) => write!(f, "{err}"),
        }
    }
}

impl PumpExit {
    pub(crate) fn is_failure(&self) -> bool {
        matches!(self, PumpExit::Io(_) | PumpExit::Channel(_))
    }
}

/// Forwards each socket read as one channel message.
pub(crate) async fn socket_to_channel(
    mut reader: OwnedReadHalf,
    channel: Arc<dyn TunnelChannel>,
    mut stop: StopSignal,
    mut link: StopSignal,
) -> PumpExit {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = stop.requested() => return PumpExit::Stopped,
            _ = link.requested() => return PumpExit::Stopped,
            _ = channel.closed() => return PumpExit::ChannelClosed,
            read = reader.read(&mut buf) => match read {
                Ok(0) => return PumpExit::Eof,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    tokio::select! {
                        _ = stop.requested() => return PumpExit::Stopped,
                        _ = link.requested() => return PumpExit::Stopped,
                        sent = channel.send(chunk) => {
                            if let Err(err) = sent {
                                return PumpExit::Channel(err);
                            }
                        }
                    }
                    tracing::trace!(target = "mc_tunnel::proxy", bytes = n, "socket -> channel");
                }
                Err(err) => return PumpExit::Io(err),
            },
        }
    }
}

/// Writes queued channel payloads to the socket verbatim, in queue order.
pub(crate) async fn queue_to_socket(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
    mut stop: StopSignal,
    mut link: StopSignal,
) -> PumpExit {
    loop {
        tokio::select! {
            _ = stop.requested() => return PumpExit::Stopped,
            _ = link.requested() => return PumpExit::Stopped,
            next = queue.recv() => match next {
                Some(payload) => {
                    // A peer that stops reading must not pin the pump past a stop.
                    tokio::select! {
                        _ = stop.requested() => return PumpExit::Stopped,
                        _ = link.requested() => return PumpExit::Stopped,
                        written = writer.write_all(&payload) => {
                            if let Err(err) = written {
                                return PumpExit::Io(err);
                            }
                        }
                    }
                    tracing::trace!(
                        target = "mc_tunnel::proxy",
                        bytes = payload.len(),
                        "channel -> socket"
                    );
                }
                None => return PumpExit::QueueClosed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stopped_resolves_after_every_task_returns() {
        let (handle, tasks) = ProxyHandle::new();
        for _ in 0..3 {
            let mut stop = tasks.stop_signal();
            tasks.spawn(async move { stop.requested().await });
        }
        drop(tasks);
        assert!(!handle.is_finished());

        handle.stop();
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), handle.stopped())
            .await
            .expect("tasks exit after stop");
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn dropped_handle_does_not_stop_tasks() {
        let (handle, tasks) = ProxyHandle::new();
        let mut stop = tasks.stop_signal();
        drop(handle);
        let waited = tokio::time::timeout(Duration::from_millis(50), stop.requested()).await;
        assert!(waited.is_err());
    }
}
