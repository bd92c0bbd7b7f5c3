//! Fire-and-forget status and log notifications to whoever embeds the core.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
    Error,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkStatus::Connected => "connected",
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Error => "error",
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("observer failed: {0}")]
pub struct ObserverError(pub String);

pub trait Observer: Send + Sync {
    fn on_status(&self, _status: LinkStatus) -> Result<(), ObserverError> {
        Ok(())
    }

    fn on_log(&self, _message: &str) -> Result<(), ObserverError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Forwards notifications into the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_status(&self, status: LinkStatus) -> Result<(), ObserverError> {
        match status {
            LinkStatus::Error => tracing::warn!(target = "mc_tunnel", %status, "status changed"),
            _ => tracing::info!(target = "mc_tunnel", %status, "status changed"),
        }
        Ok(())
    }

    fn on_log(&self, message: &str) -> Result<(), ObserverError> {
        tracing::info!(target = "mc_tunnel", "{message}");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    Status(LinkStatus),
    Log(String),
}

/// Queues every notification as an [`ObserverEvent`].
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ObserverEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ObserverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Observer for ChannelObserver {
    fn on_status(&self, status: LinkStatus) -> Result<(), ObserverError> {
        self.tx
            .send(ObserverEvent::Status(status))
            .map_err(|_| ObserverError("event receiver dropped".into()))
    }

    fn on_log(&self, message: &str) -> Result<(), ObserverError> {
        self.tx
            .send(ObserverEvent::Log(message.to_string()))
            .map_err(|_| ObserverError("event receiver dropped".into()))
    }
}

/// Delivery side of the observer. Neither an `Err` nor a panic raised by the
/// observer ever reaches the caller.
#[derive(Clone)]
pub struct Notifier {
    observer: Arc<dyn Observer>,
}

impl Notifier {
    pub fn new(observer: Arc<dyn Observer>) -> Self {
        Self { observer }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopObserver))
    }

    pub fn status(&self, status: LinkStatus) {
        let observer = &self.observer;
        deliver("status", || observer.on_status(status));
    }

    pub fn log(&self, message: impl AsRef<str>) {
        let observer = &self.observer;
        let message = message.as_ref();
        deliver("log", || observer.on_log(message));
    }

    pub fn status_and_log(&self, status: LinkStatus, message: impl AsRef<str>) {
        self.status(status);
        self.log(message);
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

fn deliver<F>(kind: &'static str, call: F)
where
    F: FnOnce() -> Result<(), ObserverError>,
{
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(target = "mc_tunnel::observer", kind, error = %err, "observer error ignored");
        }
        Err(_) => {
            tracing::warn!(target = "mc_tunnel::observer", kind, "observer panicked; ignored");
        }
    }
}
