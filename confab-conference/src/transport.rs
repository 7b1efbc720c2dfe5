//! Seam to the transport-layer media connection
//!
//! SDP text handling and the actual peer connection live outside this crate.
//! A [`PeerTransport`] is the narrow surface a media session drives; a
//! [`TransportFactory`] hands out a fresh one per session.

use crate::error::{Error, Result};
use crate::session::SessionKind;
use crate::track::{MediaKind, VideoType};
use crate::types::{ParticipantId, SourceName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

/// SDP dialect spoken by an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SdpSemantics {
    UnifiedPlan,
    PlanB,
}

impl fmt::Display for SdpSemantics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnifiedPlan => write!(f, "unified-plan"),
            Self::PlanB => write!(f, "plan-b"),
        }
    }
}

/// Media source as announced in signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: SourceName,
    pub owner: ParticipantId,
    pub kind: MediaKind,
    #[serde(default)]
    pub video_type: Option<VideoType>,
    #[serde(default)]
    pub muted: bool,
}

/// Offer or answer; the SDP body is opaque to this crate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    pub semantics: SdpSemantics,
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
}

impl SessionDescription {
    /// Reject descriptions that cannot possibly be applied
    pub fn validate(&self) -> Result<()> {
        if self.sdp.trim().is_empty() {
            return Err(Error::Negotiation("empty session description".to_string()));
        }
        Ok(())
    }
}

/// ICE connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => Self::Checking,
            RTCIceConnectionState::Connected => Self::Connected,
            RTCIceConnectionState::Completed => Self::Completed,
            RTCIceConnectionState::Disconnected => Self::Disconnected,
            RTCIceConnectionState::Failed => Self::Failed,
            RTCIceConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

/// Transport-layer media connection driven by one media session
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// SDP dialect of the local endpoint
    fn semantics(&self) -> SdpSemantics;

    /// Produce an offer that sends `local`
    async fn create_offer(&self, local: &[SourceDescriptor]) -> Result<SessionDescription>;

    /// Apply a remote offer and produce the answer sending `local`
    async fn create_answer(
        &self,
        offer: &SessionDescription,
        local: &[SourceDescriptor],
    ) -> Result<SessionDescription>;

    async fn set_remote_answer(&self, answer: &SessionDescription) -> Result<()>;

    /// Renegotiate so the local description sends exactly `local`
    async fn set_local_sources(&self, local: &[SourceDescriptor]) -> Result<SessionDescription>;

    /// Apply a remote source-add / source-remove
    async fn update_remote_sources(
        &self,
        added: &[SourceDescriptor],
        removed: &[SourceName],
    ) -> Result<()>;

    async fn add_remote_candidates(&self, candidates: &[String]) -> Result<()>;

    async fn restart_ice(&self) -> Result<()>;

    /// Suspend or resume media without tearing the connection down
    async fn set_media_transfer_active(&self, audio: bool, video: bool) -> Result<()>;

    async fn close(&self);
}

/// Creates one transport per media session
pub trait TransportFactory: Send + Sync {
    fn create(&self, kind: SessionKind) -> Arc<dyn PeerTransport>;
}
