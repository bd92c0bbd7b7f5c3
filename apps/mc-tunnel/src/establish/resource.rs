//! Ownership of the peer connection backing a handshake.
//!
//! A [`PeerResource`] is released at most once, whichever of
//! [`PeerResource::release`] or `Drop` gets there first. During setup it is
//! wrapped in a [`ResourceGuard`]: the handshake either commits it into the
//! session on its single success path or releases it on every other path.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::runtime::Handle;
use webrtc::api::API;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::error::{TunnelError, to_setup_error};

/// Counts the transport resources currently alive.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    open: AtomicUsize,
    allocated: AtomicU64,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resources allocated and not yet released.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Resources ever allocated through this ledger.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> u64 {
        self.open.fetch_add(1, Ordering::SeqCst);
        self.allocated.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn release(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct PeerResource {
    id: u64,
    pc: Arc<RTCPeerConnection>,
    ledger: Arc<ResourceLedger>,
    released: AtomicBool,
}

impl PeerResource {
    pub(crate) async fn allocate(
        api: &API,
        config: RTCConfiguration,
        ledger: Arc<ResourceLedger>,
    ) -> Result<ResourceGuard, TunnelError> {
        tracing::trace!(
            target = "mc_tunnel::establish",
            await = "api.new_peer_connection",
            state = "start"
        );
        let pc_result = api.new_peer_connection(config).await;
        tracing::trace!(
            target = "mc_tunnel::establish",
            await = "api.new_peer_connection",
            state = "end",
            ok = pc_result.is_ok()
        );
        let pc = Arc::new(pc_result.map_err(to_setup_error)?);
        let id = ledger.acquire();
        tracing::debug!(
            target = "mc_tunnel::establish",
            resource = id,
            open = ledger.open(),
            "peer connection allocated"
        );
        Ok(ResourceGuard(PeerResource {
            id,
            pc,
            ledger,
            released: AtomicBool::new(false),
        }))
    }

    pub(crate) fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Closes the peer connection. Only the first call does anything.
    pub(crate) async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ledger.release();
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target = "mc_tunnel::establish",
                resource = self.id,
                error = %err,
                "peer connection close failed"
            );
        }
        tracing::debug!(
            target = "mc_tunnel::establish",
            resource = self.id,
            open = self.ledger.open(),
            "peer connection released"
        );
    }
}

impl Drop for PeerResource {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ledger.release();
        match Handle::try_current() {
            Ok(handle) => {
                let pc = self.pc.clone();
                let id = self.id;
                handle.spawn(async move {
                    if let Err(err) = pc.close().await {
                        tracing::debug!(
                            target = "mc_tunnel::establish",
                            resource = id,
                            error = %err,
                            "deferred peer connection close failed"
                        );
                    }
                });
            }
            Err(_) => tracing::warn!(
                target = "mc_tunnel::establish",
                resource = self.id,
                "peer connection dropped outside a runtime; not closed"
            ),
        }
    }
}

impl fmt::Debug for PeerResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerResource")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

/// A resource whose cleanup is still owed by the handshake in progress.
///
/// Dropping the guard (a panic, or the caller abandoning the future) still
/// releases the resource through `PeerResource`'s `Drop`.
#[must_use = "a guard must be committed or released"]
pub(crate) struct ResourceGuard(PeerResource);

impl ResourceGuard {
    pub(crate) fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        self.0.peer_connection()
    }

    /// The one success path: ownership moves into the session.
    pub(crate) fn commit(self) -> PeerResource {
        self.0
    }

    pub(crate) async fn release(self) {
        self.0.release().await;
    }
}
