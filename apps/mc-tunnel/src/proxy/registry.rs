use std::collections::BTreeMap;
use std::fmt;

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Active local clients of a joiner, keyed by admission order.
///
/// Lock discipline: every operation takes the one mutex for its whole
/// duration, does no I/O while holding it, and never calls out while
/// holding it. Queue sends are non-blocking.
#[derive(Default)]
pub struct ClientRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    clients: BTreeMap<ClientId, ClientSlot>,
}

struct ClientSlot {
    outbound: mpsc::Sender<Bytes>,
    evict: Arc<watch::Sender<bool>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client. `evict` is raised if the registry drops the
    /// client because its queue filled up.
    pub fn insert(
        &self,
        outbound: mpsc::Sender<Bytes>,
        evict: Arc<watch::Sender<bool>>,
    ) -> ClientId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = ClientId(inner.next_id);
        inner.clients.insert(id, ClientSlot { outbound, evict });
        id
    }

    pub fn remove(&self, id: ClientId) -> bool {
        self.inner.lock().clients.remove(&id).is_some()
    }

    /// Queues `payload` for every client. Clients whose queue has closed, or
    /// is full because the socket stopped draining, are dropped from the
    /// registry in the same pass; full ones are also evicted. Returns the
    /// number of clients the payload was queued for.
    pub fn broadcast(&self, payload: &Bytes) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.clients.len();
        inner.clients.retain(|id, slot| match slot.outbound.try_send(payload.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    target = "mc_tunnel::proxy::registry",
                    client_id = %id,
                    "client queue full; evicting"
                );
                slot.evict.send_replace(true);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        let delivered = inner.clients.len();
        if delivered < before {
            tracing::debug!(
                target = "mc_tunnel::proxy::registry",
                pruned = before - delivered,
                "dropped clients during broadcast"
            );
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.inner.lock().clients.keys().copied().collect()
    }

    /// Drops every client queue, which ends each client's writer pump.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut self.inner.lock().clients);
        drop(drained);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evict_pair() -> (Arc<watch::Sender<bool>>, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Arc::new(tx), rx)
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let (evict, _evicted) = evict_pair();
        let a = registry.insert(tx.clone(), evict.clone());
        let b = registry.insert(tx.clone(), evict.clone());
        assert!(registry.remove(a));
        let c = registry.insert(tx, evict);
        assert!(a < b && b < c);
        assert_eq!(registry.ids(), vec![b, c]);
        assert!(!registry.remove(a));
    }

    #[test]
    fn broadcast_reaches_every_client() {
        let registry = ClientRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel(4);
            let (evict, _) = evict_pair();
            registry.insert(tx, evict);
            receivers.push(rx);
        }
        let payload = Bytes::from_static(b"\x00\x01hello");
        assert_eq!(registry.broadcast(&payload), 3);
        for rx in &mut receivers {
            assert_eq!(rx.try_recv().unwrap(), payload);
        }
    }

    #[test]
    fn broadcast_prunes_closed_clients() {
        let registry = ClientRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, rx_b) = mpsc::channel(4);
        let (evict_b, evicted_b) = evict_pair();
        registry.insert(tx_a, evict_pair().0);
        registry.insert(tx_b, evict_b);
        drop(rx_b);

        assert_eq!(registry.broadcast(&Bytes::from_static(b"x")), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(rx_a.try_recv().unwrap(), Bytes::from_static(b"x"));
        assert!(!*evicted_b.borrow());
    }

    #[test]
    fn full_queue_evicts_the_stalled_client() {
        let registry = ClientRegistry::new();
        let (stalled_tx, _stalled_rx) = mpsc::channel(2);
        let (evict, evicted) = evict_pair();
        registry.insert(stalled_tx, evict);
        let (live_tx, mut live_rx) = mpsc::channel(8);
        let live = registry.insert(live_tx, evict_pair().0);

        for _ in 0..2 {
            assert_eq!(registry.broadcast(&Bytes::from_static(b"chunk")), 2);
        }
        assert!(!*evicted.borrow());

        assert_eq!(registry.broadcast(&Bytes::from_static(b"chunk")), 1);
        assert!(*evicted.borrow());
        assert_eq!(registry.ids(), vec![live]);
        for _ in 0..3 {
            assert_eq!(live_rx.try_recv().unwrap(), Bytes::from_static(b"chunk"));
        }
    }

    #[test]
    fn clear_closes_queues() {
        let registry = ClientRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.insert(tx, evict_pair().0);
        registry.clear();
        assert!(registry.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
