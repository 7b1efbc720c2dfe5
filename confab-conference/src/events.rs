//! Signals crossing the conference boundary
//!
//! Every boundary uses a closed enum. The legacy string-keyed names used by
//! the signaling collaborator and by UI consumers are handled only here
//! ([`SignalingEvent::from_legacy`], [`ConferenceEvent::event_type`]).

use crate::error::{Error, Result};
use crate::participant::{ParticipantInfo, Role};
use crate::track::{MediaKind, TrackInfo, VideoType};
use crate::transport::{SessionDescription, SourceDescriptor};
use crate::types::{Jid, ParticipantId, SessionId, SourceName};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Jingle reason condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminateCondition {
    Success,
    Decline,
    Busy,
    ConnectivityError,
    SecurityError,
    Gone,
    GeneralError,
    Timeout,
}

/// Reason attached to session-terminate or to a declined offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationReason {
    pub condition: TerminateCondition,
    #[serde(default)]
    pub text: Option<String>,
}

impl TerminationReason {
    pub fn new(condition: TerminateCondition, text: impl Into<String>) -> Self {
        Self {
            condition,
            text: Some(text.into()),
        }
    }

    /// Remote asked to tear down and start over
    #[must_use]
    pub fn is_restart_request(&self) -> bool {
        self.condition == TerminateCondition::Success && self.text.as_deref() == Some("restart")
    }

    /// Remote saw ICE fail before we did
    #[must_use]
    pub fn is_ice_failure(&self) -> bool {
        self.condition == TerminateCondition::ConnectivityError
            && self.text.as_deref() == Some("ICE FAILED")
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{:?} ({text})", self.condition),
            None => write!(f, "{:?}", self.condition),
        }
    }
}

/// Why the peer-to-peer session is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum P2pStopCause {
    ThirdParticipantJoined,
    BotJoined,
    VisitorsJoined,
    TranscriptionEnabled,
    IceFailed,
    NegotiationFailed,
    RemoteTerminated,
    PeerLeft,
    Requested,
    Leaving,
}

impl P2pStopCause {
    #[must_use]
    pub fn termination_reason(&self) -> TerminationReason {
        match self {
            Self::ThirdParticipantJoined => {
                TerminationReason::new(TerminateCondition::Success, "3rd participant joined")
            }
            Self::BotJoined => {
                TerminationReason::new(TerminateCondition::Success, "bot or gateway joined")
            }
            Self::VisitorsJoined => TerminationReason::new(TerminateCondition::Success, "visitors joined"),
            Self::TranscriptionEnabled => {
                TerminationReason::new(TerminateCondition::Success, "transcription enabled")
            }
            Self::IceFailed => TerminationReason::new(TerminateCondition::ConnectivityError, "ICE FAILED"),
            Self::NegotiationFailed => {
                TerminationReason::new(TerminateCondition::GeneralError, "offer/answer failed")
            }
            Self::RemoteTerminated => TerminationReason::new(TerminateCondition::Success, "remote ended"),
            Self::PeerLeft => TerminationReason::new(TerminateCondition::Success, "P2P peer left"),
            Self::Requested => TerminationReason::new(TerminateCondition::Success, "Turning off P2P session"),
            Self::Leaving => TerminationReason::new(TerminateCondition::Gone, "conference left"),
        }
    }
}

/// Inbound notifications from the signaling collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingEvent {
    MemberJoined {
        id: ParticipantId,
        jid: Jid,
        #[serde(default)]
        info: ParticipantInfo,
    },

    MemberLeft {
        id: ParticipantId,
    },

    MemberKicked {
        id: ParticipantId,
        #[serde(default)]
        actor: Option<ParticipantId>,
    },

    MemberUpdated {
        id: ParticipantId,
        info: ParticipantInfo,
    },

    /// Conference-wide properties (visitor count, ...) changed
    PropertiesChanged {
        #[serde(default)]
        visitor_count: u32,
    },

    TranscriptionChanged {
        active: bool,
    },

    SessionInitiate {
        from: Jid,
        sid: SessionId,
        p2p: bool,
        offer: SessionDescription,
    },

    SessionAccept {
        from: Jid,
        p2p: bool,
        answer: SessionDescription,
    },

    SourceAdd {
        p2p: bool,
        sources: Vec<SourceDescriptor>,
    },

    SourceRemove {
        p2p: bool,
        sources: Vec<SourceName>,
    },

    TransportInfo {
        p2p: bool,
        candidates: Vec<String>,
    },

    SessionTerminate {
        p2p: bool,
        reason: TerminationReason,
    },

    /// Presence-level state of a remote source changed
    SourceUpdated {
        source: SourceName,
        owner: ParticipantId,
        #[serde(default)]
        muted: bool,
        #[serde(default)]
        video_type: Option<VideoType>,
    },

    SourceRemoved {
        source: SourceName,
        owner: ParticipantId,
    },
}

impl SignalingEvent {
    /// Translate a legacy string-keyed notification into a typed event
    pub fn from_legacy(name: &str, payload: Value) -> Result<Self> {
        let tag = match name {
            "xmpp.muc_member_joined" => "member_joined",
            "xmpp.muc_member_left" => "member_left",
            "xmpp.kicked" => "member_kicked",
            "xmpp.muc_member_updated" => "member_updated",
            "xmpp.conference_properties_changed" => "properties_changed",
            "xmpp.transcription_status_changed" => "transcription_changed",
            "xmpp.callincoming.jingle" => "session_initiate",
            "xmpp.callaccepted.jingle" => "session_accept",
            "xmpp.source_add.jingle" => "source_add",
            "xmpp.source_remove.jingle" => "source_remove",
            "xmpp.transportinfo.jingle" => "transport_info",
            "xmpp.callended.jingle" => "session_terminate",
            "signaling.sourceUpdated" => "source_updated",
            "signaling.sourceRemoved" => "source_removed",
            other => {
                return Err(Error::InvalidInput(format!(
                    "unknown signaling event: {other}"
                )))
            }
        };

        let mut fields = match payload {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            other => {
                return Err(Error::InvalidInput(format!(
                    "payload of {name} must be an object, got {other}"
                )))
            }
        };
        fields.insert("type".to_string(), Value::String(tag.to_string()));
        Ok(serde_json::from_value(Value::Object(fields))?)
    }

    /// Whether the event concerns the peer-to-peer session
    #[must_use]
    pub const fn is_p2p(&self) -> bool {
        match self {
            Self::SessionInitiate { p2p, .. }
            | Self::SessionAccept { p2p, .. }
            | Self::SourceAdd { p2p, .. }
            | Self::SourceRemove { p2p, .. }
            | Self::TransportInfo { p2p, .. }
            | Self::SessionTerminate { p2p, .. } => *p2p,
            _ => false,
        }
    }
}

/// Why the conference can no longer continue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    OfferAnswerFailed { detail: String },
    IceFailed,
}

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConferenceEvent {
    Joined,
    Left,
    UserJoined { id: ParticipantId },
    UserLeft { id: ParticipantId },
    Kicked { id: ParticipantId, actor: Option<ParticipantId> },
    UserRoleChanged { id: ParticipantId, role: Role },
    TrackAdded { track: TrackInfo },
    TrackRemoved { track: TrackInfo },
    TrackMuteChanged { track: TrackInfo },
    SourceUpdated {
        source: SourceName,
        owner: ParticipantId,
        muted: bool,
        video_type: Option<VideoType>,
    },
    SourceRemoved { source: SourceName, owner: ParticipantId },
    P2pStatusChanged { active: bool },
    ConnectionEstablished { p2p: bool },
    ConnectionInterrupted,
    ConnectionRestored,
    MediaSessionStarted { p2p: bool },
    ConferenceFailed { reason: FailureReason },
}

impl ConferenceEvent {
    /// Legacy event name for string-keyed consumers
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Joined => "conference.joined",
            Self::Left => "conference.left",
            Self::UserJoined { .. } => "conference.userJoined",
            Self::UserLeft { .. } => "conference.userLeft",
            Self::Kicked { .. } => "conference.kicked",
            Self::UserRoleChanged { .. } => "conference.roleChanged",
            Self::TrackAdded { .. } => "conference.trackAdded",
            Self::TrackRemoved { .. } => "conference.trackRemoved",
            Self::TrackMuteChanged { .. } => "conference.trackMuteChanged",
            Self::SourceUpdated { .. } => "conference.sourceUpdated",
            Self::SourceRemoved { .. } => "conference.sourceRemoved",
            Self::P2pStatusChanged { .. } => "conference.p2pStatus",
            Self::ConnectionEstablished { .. } => "conference.connectionEstablished",
            Self::ConnectionInterrupted => "conference.connectionInterrupted",
            Self::ConnectionRestored => "conference.connectionRestored",
            Self::MediaSessionStarted { .. } => "conference.media_session.started",
            Self::ConferenceFailed { .. } => "conference.failed",
        }
    }
}

/// Fire-and-forget analytics notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    SessionEstablished { p2p: bool, duration_ms: u64 },
    SessionFailed { p2p: bool, reason: String },
    P2pSwitched { active: bool, cause: Option<P2pStopCause> },
    P2pDeclined { reason: TerminationReason },
    AnswerTimeout { p2p: bool },
    IceRestartScheduled { attempt: u32, delay_ms: u64 },
    IceRestartsExhausted { attempts: u32 },
    MuteRequested { id: ParticipantId, kind: MediaKind },
}
