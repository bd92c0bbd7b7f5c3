//! The two-phase handshake driven by manually exchanged tokens.
//!
//! ```text
//! host                                   joiner
//! create_offer()  ── offer token ──▶     accept_offer(token)
//! accept_answer() ◀── answer token ──    (returns answer token)
//! ```
//!
//! Every handshake call allocates (or reuses) one peer connection, commits
//! a local description, waits for ICE gathering under a deadline and only
//! then hands back the token. Failures release the peer connection before
//! they are returned. Once the data channel opens, the session becomes
//! Ready and the role's proxy starts on it.

pub mod api;
pub mod resource;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, watch};
use webrtc::api::API;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::TunnelConfig;
use crate::error::{TunnelError, to_rejected, to_setup_error};
use crate::observer::{LinkStatus, Notifier, Observer};
use crate::proxy::{HostProxy, JoinerProxy, ProxyHandle};
use crate::session::{PeerSession, Role, SessionPhase, TunnelSession};
use crate::signal::{self, SdpKind, SessionDescription, Token};
use crate::timeout::{TimeoutError, run_with_timeout};
use crate::transport::TunnelChannel;
use crate::transport::webrtc::{ChannelHooks, CloseHook, OpenHook, RtcTunnelChannel};

use self::resource::{PeerResource, ResourceGuard, ResourceLedger};

/// Owns the single active peer session of this application instance.
#[derive(Clone)]
pub struct ConnectionEstablisher {
    shared: Arc<Shared>,
}

struct Shared {
    config: TunnelConfig,
    api: API,
    notifier: Notifier,
    ledger: Arc<ResourceLedger>,
    // Serializes handshake steps, shutdown and Ready promotion.
    handshake: AsyncMutex<()>,
    session: Mutex<Option<PeerSession>>,
    next_session: AtomicU64,
    phase_tx: watch::Sender<SessionPhase>,
    ready_tx: watch::Sender<Option<TunnelSession>>,
}

impl ConnectionEstablisher {
    pub fn new(config: TunnelConfig, observer: Arc<dyn Observer>) -> Result<Self, TunnelError> {
        let api = api::build_api(api::default_setting_engine())?;
        Ok(Self::with_api(config, api, observer))
    }

    /// Uses a caller-built webrtc `API`, e.g. one bound to a virtual network.
    pub fn with_api(config: TunnelConfig, api: API, observer: Arc<dyn Observer>) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Idle);
        let (ready_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                config,
                api,
                notifier: Notifier::new(observer),
                ledger: Arc::new(ResourceLedger::new()),
                handshake: AsyncMutex::new(()),
                session: Mutex::new(None),
                next_session: AtomicU64::new(0),
                phase_tx,
                ready_tx,
            }),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.shared.config
    }

    /// Host side, first leg: returns the offer token for the joiner.
    pub async fn create_offer(&self) -> Result<Token, TunnelError> {
        let shared = &self.shared;
        let _handshake = shared.handshake.lock().await;
        shared.retire_session().await;
        let id = shared.begin_session(Role::Host);

        let guard = match shared.allocate().await {
            Ok(guard) => guard,
            Err(err) => return Err(shared.fail_session(id, err)),
        };
        match shared.negotiate_offer(id, &guard).await {
            Ok((token, channel)) => {
                shared.commit_session(id, guard.commit(), Some(channel));
                Ok(token)
            }
            Err(err) => {
                guard.release().await;
                Err(shared.fail_session(id, err))
            }
        }
    }

    /// Joiner side: consumes the host's offer and returns the answer token.
    pub async fn accept_offer(&self, token: &str) -> Result<Token, TunnelError> {
        let remote = expect_description(token, SdpKind::Offer)?;
        let shared = &self.shared;
        let _handshake = shared.handshake.lock().await;
        shared.retire_session().await;
        let id = shared.begin_session(Role::Joiner);

        let guard = match shared.allocate().await {
            Ok(guard) => guard,
            Err(err) => return Err(shared.fail_session(id, err)),
        };
        match shared.negotiate_answer(id, &guard, remote).await {
            Ok(token) => {
                shared.commit_session(id, guard.commit(), None);
                Ok(token)
            }
            Err(err) => {
                guard.release().await;
                Err(shared.fail_session(id, err))
            }
        }
    }

    /// Host side, second leg: applies the joiner's answer to the session
    /// created by [`create_offer`](Self::create_offer).
    pub async fn accept_answer(&self, token: &str) -> Result<(), TunnelError> {
        let remote = expect_description(token, SdpKind::Answer)?;
        let _handshake = self.shared.handshake.lock().await;
        let pc = self.shared.pending_offer().ok_or_else(|| {
            TunnelError::SignalingRejected("no offer is awaiting an answer".into())
        })?;
        tracing::trace!(
            target = "mc_tunnel::establish",
            role = "host",
            await = "pc.set_remote_description",
            state = "start"
        );
        let applied = pc.set_remote_description(remote).await;
        tracing::trace!(
            target = "mc_tunnel::establish",
            role = "host",
            await = "pc.set_remote_description",
            state = "end",
            ok = applied.is_ok()
        );
        applied.map_err(to_rejected)?;
        tracing::info!(target = "mc_tunnel::establish", "answer applied");
        Ok(())
    }

    /// Stops the proxy, closes the channel and releases the peer connection.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let _handshake = self.shared.handshake.lock().await;
        if self.shared.retire_session().await {
            tracing::info!(target = "mc_tunnel::establish", "session shut down");
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.shared.phase_tx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.shared.phase_tx.subscribe()
    }

    pub fn role(&self) -> Option<Role> {
        self.shared.session.lock().as_ref().map(|session| session.role)
    }

    /// Waits up to `timeout` for the tunnel to become Ready.
    pub async fn wait_ready(&self, timeout: Duration) -> Option<TunnelSession> {
        let mut ready = self.shared.ready_tx.subscribe();
        let wait = async move {
            match ready.wait_for(Option::is_some).await {
                Ok(session) => session.clone(),
                Err(_) => None,
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// The Ready tunnel, if there is one right now.
    pub fn tunnel(&self) -> Option<TunnelSession> {
        self.shared.ready_tx.borrow().clone()
    }

    /// Live peer connections owned by this establisher.
    pub fn open_resources(&self) -> usize {
        self.shared.ledger.open()
    }

    /// Where the joiner's local listener is bound, once it runs.
    pub fn proxy_local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .session
            .lock()
            .as_ref()
            .and_then(|session| session.proxy_addr)
    }
}

fn expect_description(token: &str, kind: SdpKind) -> Result<RTCSessionDescription, TunnelError> {
    let desc = signal::decode(token)?;
    if desc.kind != kind {
        return Err(TunnelError::SignalingRejected(format!(
            "expected an {kind} token, got an {}",
            desc.kind
        )));
    }
    desc.to_rtc()
}

impl Shared {
    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.config.rtc_ice_servers(),
            ..Default::default()
        }
    }

    async fn allocate(&self) -> Result<ResourceGuard, TunnelError> {
        PeerResource::allocate(&self.api, self.rtc_configuration(), self.ledger.clone()).await
    }

    fn publish(&self, phase: SessionPhase) {
        self.phase_tx.send_replace(phase);
        tracing::debug!(target = "mc_tunnel::establish", phase = ?phase, "session phase");
    }

    fn begin_session(&self, role: Role) -> u64 {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let mut session = PeerSession::new(id, role);
        if let Err(err) = session.transition(SessionPhase::NegotiatingLocal) {
            tracing::error!(target = "mc_tunnel::establish", error = %err, "fresh session rejected negotiation");
        }
        *self.session.lock() = Some(session);
        self.publish(SessionPhase::NegotiatingLocal);
        tracing::info!(target = "mc_tunnel::establish", session = id, role = %role, "handshake started");
        id
    }

    /// The local description is set; the session now waits on path discovery.
    fn enter_path_discovery(&self, id: u64) {
        let mut slot = self.session.lock();
        if let Some(session) = slot.as_mut().filter(|session| session.id == id) {
            match session.transition(SessionPhase::AwaitingPathDiscovery) {
                Ok(()) => self.publish(SessionPhase::AwaitingPathDiscovery),
                Err(err) => tracing::warn!(target = "mc_tunnel::establish", session = id, error = %err, "path discovery transition refused"),
            }
        }
    }

    fn commit_session(&self, id: u64, resource: PeerResource, channel: Option<Arc<RtcTunnelChannel>>) {
        let mut slot = self.session.lock();
        match slot.as_mut().filter(|session| session.id == id) {
            Some(session) => {
                session.resource = Some(resource);
                if channel.is_some() {
                    session.channel = channel;
                }
                tracing::debug!(target = "mc_tunnel::establish", session = id, "session committed");
            }
            None => {
                // Retired while negotiating; the resource drops (and releases) here.
                tracing::debug!(target = "mc_tunnel::establish", session = id, "session retired before commit");
            }
        }
    }

    /// Marks the session Failed. The resource has already been released.
    fn fail_session(&self, id: u64, err: TunnelError) -> TunnelError {
        {
            let mut slot = self.session.lock();
            if let Some(session) = slot.as_mut().filter(|session| session.id == id) {
                match session.transition(SessionPhase::Failed) {
                    Ok(()) => self.publish(SessionPhase::Failed),
                    Err(phase_err) => tracing::warn!(target = "mc_tunnel::establish", session = id, error = %phase_err, "failed transition refused"),
                }
            }
        }
        tracing::warn!(
            target = "mc_tunnel::establish",
            session = id,
            class = err.class(),
            error = %err,
            "handshake failed"
        );
        self.notifier.log(format!("Handshake failed: {err}"));
        err
    }

    /// Tears the current session down, if any. Returns whether there was one.
    async fn retire_session(&self) -> bool {
        let taken = self.session.lock().take();
        let Some(mut session) = taken else {
            return false;
        };
        if let Err(err) = session.transition(SessionPhase::Closed) {
            tracing::debug!(target = "mc_tunnel::establish", session = session.id, error = %err, "close transition refused");
        }
        self.ready_tx.send_replace(None);
        self.publish(SessionPhase::Closed);

        if let Some(proxy) = session.proxy.take() {
            proxy.shutdown().await;
        }
        if let Some(channel) = session.channel.take() {
            channel.close().await;
        }
        if let Some(resource) = session.resource.take() {
            resource.release().await;
        }
        tracing::debug!(
            target = "mc_tunnel::establish",
            session = session.id,
            open = self.ledger.open(),
            "session retired"
        );
        true
    }

    fn is_live(&self, id: u64) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|session| session.id == id && session.phase() != SessionPhase::Closed)
    }

    fn pending_offer(&self) -> Option<Arc<RTCPeerConnection>> {
        let slot = self.session.lock();
        let session = slot.as_ref()?;
        if session.role != Role::Host || session.phase() != SessionPhase::AwaitingPathDiscovery {
            return None;
        }
        session
            .resource
            .as_ref()
            .map(|resource| resource.peer_connection().clone())
    }

    async fn negotiate_offer(
        self: &Arc<Self>,
        id: u64,
        guard: &ResourceGuard,
    ) -> Result<(Token, Arc<RtcTunnelChannel>), TunnelError> {
        let pc = guard.peer_connection();
        self.watch_connection_state(id, pc);

        let dc_init = RTCDataChannelInit {
            ordered: Some(self.config.ordered),
            ..Default::default()
        };
        tracing::trace!(
            target = "mc_tunnel::establish",
            role = "host",
            await = "pc.create_data_channel",
            state = "start"
        );
        let dc_result = pc
            .create_data_channel(&self.config.channel_label, Some(dc_init))
            .await;
        tracing::trace!(
            target = "mc_tunnel::establish",
            role = "host",
            await = "pc.create_data_channel",
            state = "end",
            ok = dc_result.is_ok()
        );
        let dc = dc_result.map_err(to_setup_error)?;
        let channel = RtcTunnelChannel::attach(dc, self.channel_hooks(id, Role::Host));

        let offer = pc.create_offer(None).await.map_err(to_setup_error)?;
        let token = self.commit_local_and_gather(id, pc, offer, "host").await?;
        Ok((token, channel))
    }

    async fn negotiate_answer(
        self: &Arc<Self>,
        id: u64,
        guard: &ResourceGuard,
        remote: RTCSessionDescription,
    ) -> Result<Token, TunnelError> {
        let pc = guard.peer_connection();
        self.watch_connection_state(id, pc);

        let weak = Arc::downgrade(self);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(shared) = weak.upgrade() {
                    shared.adopt_channel(id, dc).await;
                }
            })
        }));

        tracing::trace!(
            target = "mc_tunnel::establish",
            role = "joiner",
            await = "pc.set_remote_description",
            state = "start"
        );
        let applied = pc.set_remote_description(remote).await;
        tracing::trace!(
            target = "mc_tunnel::establish",
            role = "joiner",
            await = "pc.set_remote_description",
            state = "end",
            ok = applied.is_ok()
        );
        applied.map_err(to_rejected)?;

        let answer = pc.create_answer(None).await.map_err(to_setup_error)?;
        self.commit_local_and_gather(id, pc, answer, "joiner").await
    }

    /// Sets the local description and waits, under the path discovery
    /// deadline, until ICE gathering is complete so the token carries every
    /// candidate.
    async fn commit_local_and_gather(
        &self,
        id: u64,
        pc: &Arc<RTCPeerConnection>,
        local: RTCSessionDescription,
        role: &'static str,
    ) -> Result<Token, TunnelError> {
        let mut gather = pc.gathering_complete_promise().await;
        pc.set_local_description(local)
            .await
            .map_err(to_setup_error)?;
        self.enter_path_discovery(id);

        let timeout = self.config.path_discovery_timeout;
        tracing::trace!(
            target = "mc_tunnel::establish",
            role,
            await = "gather.recv",
            state = "start"
        );
        let gathered = run_with_timeout("path discovery", timeout, async move {
            let _ = gather.recv().await;
            Ok::<(), TunnelError>(())
        })
        .await;
        tracing::trace!(
            target = "mc_tunnel::establish",
            role,
            await = "gather.recv",
            state = "end",
            ok = gathered.is_ok()
        );
        gathered.map_err(|err| match err {
            TimeoutError::Elapsed { .. } => TunnelError::PathDiscoveryTimeout { timeout },
            TimeoutError::Failed(err) => err,
            TimeoutError::Aborted { reason, .. } => TunnelError::Setup(reason),
        })?;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| TunnelError::Setup("failed to obtain local description".into()))?;
        let token = signal::encode(&SessionDescription::from_rtc(&local)?)?;
        tracing::debug!(
            target = "mc_tunnel::establish",
            role,
            token_len = token.as_str().len(),
            "local description ready"
        );
        Ok(token)
    }

    fn watch_connection_state(&self, id: u64, pc: &Arc<RTCPeerConnection>) {
        let notifier = self.notifier.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!(
                target = "mc_tunnel::establish",
                session = id,
                state = %state,
                "peer connection state changed"
            );
            match state {
                RTCPeerConnectionState::Disconnected => {
                    notifier.status_and_log(LinkStatus::Disconnected, "Peer disconnected");
                }
                RTCPeerConnectionState::Failed => {
                    notifier.status_and_log(LinkStatus::Error, "Connection failed");
                }
                _ => {}
            }
            Box::pin(async {})
        }));
    }

    fn channel_hooks(self: &Arc<Self>, id: u64, role: Role) -> ChannelHooks {
        let weak = Arc::downgrade(self);
        let on_open: OpenHook = Box::new(move |channel| {
            let weak = weak.clone();
            tokio::spawn(async move {
                if let Some(shared) = weak.upgrade() {
                    shared.promote_ready(id, role, channel).await;
                }
            });
        });
        let weak = Arc::downgrade(self);
        let on_close: CloseHook = Box::new(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.is_live(id) {
                shared
                    .notifier
                    .status_and_log(LinkStatus::Disconnected, "DataChannel closed");
            }
        });
        ChannelHooks {
            on_open: Some(on_open),
            on_close: Some(on_close),
        }
    }

    /// Joiner: takes ownership of the channel the host opened.
    async fn adopt_channel(self: &Arc<Self>, id: u64, dc: Arc<RTCDataChannel>) {
        tracing::debug!(
            target = "mc_tunnel::establish",
            session = id,
            label = %dc.label(),
            "remote data channel announced"
        );
        let channel = RtcTunnelChannel::attach(dc, self.channel_hooks(id, Role::Joiner));
        let stale = {
            let mut slot = self.session.lock();
            match slot.as_mut().filter(|session| session.id == id) {
                Some(session) if session.channel.is_none() => {
                    session.channel = Some(channel.clone());
                    false
                }
                _ => true,
            }
        };
        if stale {
            tracing::debug!(target = "mc_tunnel::establish", session = id, "closing data channel of retired session");
            channel.close().await;
        }
    }

    async fn promote_ready(self: Arc<Self>, id: u64, role: Role, channel: Arc<RtcTunnelChannel>) {
        let handshake = self.handshake.lock().await;
        let pc = {
            let slot = self.session.lock();
            slot.as_ref()
                .filter(|session| session.id == id)
                .and_then(|session| session.resource.as_ref())
                .map(|resource| resource.peer_connection().clone())
        };
        let Some(pc) = pc else {
            tracing::debug!(target = "mc_tunnel::establish", session = id, "channel opened for a retired session");
            return;
        };
        if pc.local_description().await.is_none() {
            tracing::warn!(target = "mc_tunnel::establish", session = id, "channel opened without a local description");
            return;
        }

        let tunnel = {
            let mut slot = self.session.lock();
            let Some(session) = slot.as_mut().filter(|session| session.id == id) else {
                return;
            };
            if let Err(err) = session.transition(SessionPhase::Ready) {
                tracing::debug!(target = "mc_tunnel::establish", session = id, error = %err, "ready refused");
                return;
            }
            session.channel = Some(channel.clone());
            let tunnel = TunnelSession::new(role, channel.clone() as Arc<dyn TunnelChannel>);
            // Phase first: a `wait_ready` caller must already read Ready.
            self.publish(SessionPhase::Ready);
            self.ready_tx.send_replace(Some(tunnel.clone()));
            tunnel
        };
        drop(handshake);

        tracing::info!(
            target = "mc_tunnel::establish",
            session = id,
            role = %role,
            label = %channel.label(),
            "tunnel established"
        );
        self.notifier
            .status_and_log(LinkStatus::Connected, "P2P Tunnel Established!");

        let started = self.start_proxy(&tunnel).await;
        match started {
            Ok((handle, addr)) => {
                let orphan = {
                    let mut slot = self.session.lock();
                    match slot
                        .as_mut()
                        .filter(|session| session.id == id && session.phase() == SessionPhase::Ready)
                    {
                        Some(session) => {
                            session.proxy = Some(handle);
                            session.proxy_addr = addr;
                            None
                        }
                        None => Some(handle),
                    }
                };
                if let Some(handle) = orphan {
                    handle.shutdown().await;
                }
            }
            Err(err) => {
                tracing::warn!(
                    target = "mc_tunnel::establish",
                    session = id,
                    role = %role,
                    class = err.class(),
                    error = %err,
                    "proxy failed to start"
                );
                self.notifier
                    .status_and_log(LinkStatus::Error, format!("Failed to start {role} proxy: {err}"));
            }
        }
    }

    async fn start_proxy(
        &self,
        tunnel: &TunnelSession,
    ) -> Result<(ProxyHandle, Option<SocketAddr>), TunnelError> {
        match tunnel.role() {
            Role::Host => {
                let handle = HostProxy::start(
                    tunnel.channel(),
                    &self.config.host_target,
                    self.config.dial_timeout,
                    self.notifier.clone(),
                )
                .await?;
                self.notifier
                    .log(format!("Forwarding tunnel to {}", self.config.host_target));
                Ok((handle, None))
            }
            Role::Joiner => {
                let proxy = JoinerProxy::start(
                    tunnel.channel(),
                    self.config.joiner_addr(),
                    self.config.listen_timeout,
                    self.notifier.clone(),
                )
                .await?;
                let addr = proxy.local_addr();
                self.notifier
                    .log(format!("Game clients can connect to {addr}"));
                Ok((proxy.into_handle(), Some(addr)))
            }
        }
    }
}
