use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;

use super::{ChannelCore, ChannelState, MessageHandler, TunnelChannel};
use crate::error::ChannelError;

pub type OpenHook = Box<dyn Fn(Arc<RtcTunnelChannel>) + Send + Sync>;
pub type CloseHook = Box<dyn Fn() + Send + Sync>;

/// Callbacks the owner of a data channel wants on open and close, in
/// addition to the channel's own bookkeeping.
#[derive(Default)]
pub struct ChannelHooks {
    pub on_open: Option<OpenHook>,
    pub on_close: Option<CloseHook>,
}

/// [`TunnelChannel`] over a webrtc-rs data channel.
///
/// The data channel's handlers are installed once, in [`attach`](Self::attach);
/// they hold only weak references so the data channel never keeps its
/// wrapper alive.
pub struct RtcTunnelChannel {
    dc: Arc<RTCDataChannel>,
    core: ChannelCore,
    hooks: ChannelHooks,
}

impl RtcTunnelChannel {
    pub fn attach(dc: Arc<RTCDataChannel>, hooks: ChannelHooks) -> Arc<Self> {
        let initial = match dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        };
        let channel = Arc::new(Self {
            dc: dc.clone(),
            core: ChannelCore::new(initial),
            hooks,
        });
        let label = dc.label().to_string();
        tracing::trace!(
            target = "mc_tunnel::transport::webrtc",
            label = %label,
            state = ?initial,
            "attaching data channel"
        );

        let weak = Arc::downgrade(&channel);
        dc.on_open(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    channel.handle_open();
                }
            })
        }));

        let weak = Arc::downgrade(&channel);
        dc.on_close(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    channel.handle_close();
                }
            })
        }));

        let weak = Arc::downgrade(&channel);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            if let Some(channel) = weak.upgrade() {
                channel.core.dispatch(msg.data);
            }
            Box::pin(async {})
        }));

        dc.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                tracing::warn!(
                    target = "mc_tunnel::transport::webrtc",
                    label = %label,
                    error = %err,
                    "data channel error"
                );
            })
        }));

        if initial == ChannelState::Open {
            if let Some(hook) = &channel.hooks.on_open {
                hook(channel.clone());
            }
        }
        channel
    }

    fn handle_open(self: &Arc<Self>) {
        if !self.core.mark_open() {
            return;
        }
        tracing::debug!(
            target = "mc_tunnel::transport::webrtc",
            label = %self.dc.label(),
            "data channel opened"
        );
        if let Some(hook) = &self.hooks.on_open {
            hook(self.clone());
        }
    }

    fn handle_close(&self) {
        if !self.core.mark_closed() {
            return;
        }
        tracing::debug!(
            target = "mc_tunnel::transport::webrtc",
            label = %self.dc.label(),
            "data channel closed"
        );
        if let Some(hook) = &self.hooks.on_close {
            hook();
        }
    }
}

#[async_trait]
impl TunnelChannel for RtcTunnelChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn state(&self) -> ChannelState {
        self.core.state()
    }

    async fn send(&self, payload: Bytes) -> Result<(), ChannelError> {
        if self.core.state() == ChannelState::Closed {
            return Err(ChannelError::Closed);
        }
        let len = payload.len();
        self.dc
            .send(&payload)
            .await
            .map(|written| {
                tracing::trace!(
                    target = "mc_tunnel::transport::webrtc",
                    bytes = len,
                    written,
                    "sent message"
                );
            })
            .map_err(|err| ChannelError::Transport(err.to_string()))
    }

    fn on_message(&self, handler: MessageHandler) {
        self.core.set_handler(handler);
    }

    fn clear_message_handler(&self) {
        self.core.clear_handler();
    }

    async fn closed(&self) {
        self.core.wait_closed().await;
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            tracing::debug!(
                target = "mc_tunnel::transport::webrtc",
                error = %err,
                "data channel close failed"
            );
        }
        self.handle_close();
    }
}
