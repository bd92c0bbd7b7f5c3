//! The tunnel channel capability the proxies run over.
//!
//! A [`TunnelChannel`] is one ordered, reliable, message-oriented pipe to the
//! remote peer. The webrtc-rs data channel is the production implementation;
//! [`memory::MemoryChannel`] connects two ends inside one process.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::error::ChannelError;

pub mod memory;
pub mod webrtc;

/// Handler invoked for every inbound message. It runs on the transport's
/// own worker context and must not block.
pub type MessageHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

#[async_trait]
pub trait TunnelChannel: Send + Sync {
    fn label(&self) -> String;

    fn state(&self) -> ChannelState;

    fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    async fn send(&self, payload: Bytes) -> Result<(), ChannelError>;

    /// Installs the inbound message handler, replacing any previous one.
    fn on_message(&self, handler: MessageHandler);

    fn clear_message_handler(&self);

    /// Resolves once the channel has closed, immediately if it already has.
    async fn closed(&self);

    async fn close(&self);
}

/// State shared by the channel implementations: lifecycle plus the single
/// message handler slot.
pub(crate) struct ChannelCore {
    state: watch::Sender<ChannelState>,
    handler: RwLock<Option<MessageHandler>>,
}

impl ChannelCore {
    pub(crate) fn new(initial: ChannelState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state,
            handler: RwLock::new(None),
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Connecting -> Open. Returns false if the channel was not connecting.
    pub(crate) fn mark_open(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ChannelState::Connecting {
                *state = ChannelState::Open;
                true
            } else {
                false
            }
        })
    }

    /// Returns true only for the call that actually closed the channel.
    pub(crate) fn mark_closed(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == ChannelState::Closed {
                false
            } else {
                *state = ChannelState::Closed;
                true
            }
        });
        if changed {
            self.handler.write().take();
        }
        changed
    }

    pub(crate) async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ChannelState::Closed).await;
    }

    pub(crate) fn set_handler(&self, handler: MessageHandler) {
        *self.handler.write() = Some(handler);
    }

    pub(crate) fn clear_handler(&self) {
        self.handler.write().take();
    }

    pub(crate) fn dispatch(&self, payload: Bytes) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(payload),
            None => tracing::trace!(
                target = "mc_tunnel::transport",
                bytes = payload.len(),
                "no message handler installed; dropping payload"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn open_only_from_connecting() {
        let core = ChannelCore::new(ChannelState::Connecting);
        assert!(core.mark_open());
        assert!(!core.mark_open());
        assert!(core.mark_closed());
        assert!(!core.mark_open());
        assert_eq!(core.state(), ChannelState::Closed);
    }

    #[test]
    fn close_reported_once_and_drops_handler() {
        let core = ChannelCore::new(ChannelState::Open);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        core.set_handler(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        core.dispatch(Bytes::from_static(b"a"));
        assert!(core.mark_closed());
        assert!(!core.mark_closed());
        core.dispatch(Bytes::from_static(b"b"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_closed_returns_after_close() {
        let core = Arc::new(ChannelCore::new(ChannelState::Open));
        let waiter = {
            let core = core.clone();
            tokio::spawn(async move { core.wait_closed().await })
        };
        core.mark_closed();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("closed resolves")
            .unwrap();
        core.wait_closed().await;
    }
}
