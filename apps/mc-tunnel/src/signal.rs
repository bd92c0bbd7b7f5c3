//! Token codec: `base64(JSON({"type", "sdp"}))` of a session description.
//!
//! The JSON shape matches what browser and pion peers produce when they
//! serialise a session description, so tokens interoperate with them.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{TunnelError, to_rejected};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub(crate) fn from_rtc(desc: &RTCSessionDescription) -> Result<Self, TunnelError> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            other => {
                return Err(TunnelError::Setup(format!(
                    "unsupported local description type {other}"
                )));
            }
        };
        Ok(Self {
            kind,
            sdp: desc.sdp.clone(),
        })
    }

    /// Parses the SDP body; a body the negotiation layer cannot parse is a
    /// rejection, not a token format problem.
    pub(crate) fn to_rtc(&self) -> Result<RTCSessionDescription, TunnelError> {
        match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone()).map_err(to_rejected),
            SdpKind::Answer => {
                RTCSessionDescription::answer(self.sdp.clone()).map_err(to_rejected)
            }
        }
    }
}

/// Opaque connection token exchanged out-of-band between the two peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Token(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Token(value.to_string())
    }
}

impl FromStr for Token {
    type Err = TunnelError;

    /// Accepts only strings that decode to a session description.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)?;
        Ok(Token(s.trim().to_string()))
    }
}

pub fn encode(desc: &SessionDescription) -> Result<Token, TunnelError> {
    let json = serde_json::to_vec(desc)
        .map_err(|err| TunnelError::Setup(format!("failed to serialise {}: {err}", desc.kind)))?;
    Ok(Token(STANDARD.encode(json)))
}

/// Decodes a token. Surrounding whitespace (a pasted newline) is ignored;
/// anything else that is not base64 of a complete description is rejected.
pub fn decode(token: &str) -> Result<SessionDescription, TunnelError> {
    let raw = STANDARD
        .decode(token.trim())
        .map_err(|err| TunnelError::TokenFormat(format!("not base64: {err}")))?;
    let desc: SessionDescription = serde_json::from_slice(&raw)
        .map_err(|err| TunnelError::TokenFormat(format!("not a session description: {err}")))?;
    if desc.sdp.trim().is_empty() {
        return Err(TunnelError::TokenFormat("empty session description".into()));
    }
    Ok(desc)
}
