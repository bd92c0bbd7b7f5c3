use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::establish::resource::PeerResource;
use crate::proxy::ProxyHandle;
use crate::transport::TunnelChannel;
use crate::transport::webrtc::RtcTunnelChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Runs the game server locally and exposes it through the tunnel.
    Host,
    /// Exposes a local listening port relaying its clients to the host.
    Joiner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Joiner => f.write_str("joiner"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    NegotiatingLocal,
    AwaitingPathDiscovery,
    Ready,
    Failed,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhaseError {
    #[error("invalid session transition {from:?} -> {to:?}")]
    Invalid { from: SessionPhase, to: SessionPhase },
    #[error("session already reached ready")]
    AlreadyReady,
    #[error("ready requires a live transport resource")]
    NoResource,
    #[error("failed requires the transport resource to be released first")]
    ResourceStillHeld,
}

/// The Ready tunnel handed to a proxy.
#[derive(Clone)]
pub struct TunnelSession {
    role: Role,
    channel: Arc<dyn TunnelChannel>,
}

impl TunnelSession {
    pub fn new(role: Role, channel: Arc<dyn TunnelChannel>) -> Self {
        Self { role, channel }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn channel(&self) -> Arc<dyn TunnelChannel> {
        self.channel.clone()
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("role", &self.role)
            .field("label", &self.channel.label())
            .field("state", &self.channel.state())
            .finish()
    }
}

/// One handshake attempt and everything it owns.
pub(crate) struct PeerSession {
    pub(crate) id: u64,
    pub(crate) role: Role,
    phase: SessionPhase,
    ready_reached: bool,
    pub(crate) resource: Option<PeerResource>,
    pub(crate) channel: Option<Arc<RtcTunnelChannel>>,
    pub(crate) proxy: Option<ProxyHandle>,
    /// Bound address of the joiner's listener once it runs.
    pub(crate) proxy_addr: Option<SocketAddr>,
}

impl PeerSession {
    pub(crate) fn new(id: u64, role: Role) -> Self {
        Self {
            id,
            role,
            phase: SessionPhase::Idle,
            ready_reached: false,
            resource: None,
            channel: None,
            proxy: None,
            proxy_addr: None,
        }
    }

    pub(crate) fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub(crate) fn transition(&mut self, to: SessionPhase) -> Result<(), PhaseError> {
        use SessionPhase::*;
        let from = self.phase;
        let allowed = matches!(
            (from, to),
            (Idle, NegotiatingLocal)
                | (Idle, Closed)
                | (NegotiatingLocal, AwaitingPathDiscovery)
                | (NegotiatingLocal, Failed)
                | (NegotiatingLocal, Closed)
                | (AwaitingPathDiscovery, Ready)
                | (AwaitingPathDiscovery, Failed)
                | (AwaitingPathDiscovery, Closed)
                | (Ready, Closed)
                | (Failed, Closed)
        );
        if !allowed {
            return Err(PhaseError::Invalid { from, to });
        }
        match to {
            Ready if self.ready_reached => return Err(PhaseError::AlreadyReady),
            Ready if self.resource.is_none() => return Err(PhaseError::NoResource),
            Failed if self.resource.is_some() => return Err(PhaseError::ResourceStillHeld),
            _ => {}
        }
        if to == Ready {
            self.ready_reached = true;
        }
        self.phase = to;
        Ok(())
    }
}
