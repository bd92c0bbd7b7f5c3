use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::{ChannelCore, ChannelState, MessageHandler, TunnelChannel};
use crate::error::ChannelError;

/// One end of an in-process channel pair. Messages sent on one end are
/// handed to the other end's handler synchronously, in send order.
pub struct MemoryChannel {
    label: String,
    local: Arc<ChannelCore>,
    remote: Arc<ChannelCore>,
}

impl MemoryChannel {
    pub fn pair(label: &str) -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
        let a = Arc::new(ChannelCore::new(ChannelState::Open));
        let b = Arc::new(ChannelCore::new(ChannelState::Open));
        let first = Arc::new(MemoryChannel {
            label: label.to_string(),
            local: a.clone(),
            remote: b.clone(),
        });
        let second = Arc::new(MemoryChannel {
            label: label.to_string(),
            local: b,
            remote: a,
        });
        (first, second)
    }
}

#[async_trait]
impl TunnelChannel for MemoryChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn state(&self) -> ChannelState {
        self.local.state()
    }

    async fn send(&self, payload: Bytes) -> Result<(), ChannelError> {
        if self.local.state() == ChannelState::Closed || self.remote.state() == ChannelState::Closed
        {
            return Err(ChannelError::Closed);
        }
        self.remote.dispatch(payload);
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        self.local.set_handler(handler);
    }

    fn clear_message_handler(&self) {
        self.local.clear_handler();
    }

    async fn closed(&self) {
        self.local.wait_closed().await;
    }

    async fn close(&self) {
        self.local.mark_closed();
        self.remote.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn delivers_in_send_order() {
        let (left, right) = MemoryChannel::pair("test");
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        right.on_message(Arc::new(move |payload| sink.lock().push(payload)));

        for chunk in [&b"one"[..], b"two", b"three"] {
            left.send(Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        let got: Vec<Bytes> = received.lock().clone();
        assert_eq!(got, vec![&b"one"[..], b"two", b"three"]);
    }

    #[tokio::test]
    async fn closing_one_end_closes_both() {
        let (left, right) = MemoryChannel::pair("test");
        right.close().await;
        left.closed().await;
        assert_eq!(left.state(), ChannelState::Closed);
        assert_eq!(
            left.send(Bytes::from_static(b"late")).await,
            Err(ChannelError::Closed)
        );
    }
}
