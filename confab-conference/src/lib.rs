//! Confab conference session and topology state machine
//!
//! This crate drives one endpoint's participation in a multi-party
//! conference. Media normally flows through a bridge (SFU); for exactly two
//! parties a direct peer-to-peer session is negotiated and media is moved
//! onto it, then back to the bridge when a third party arrives.
//!
//! ## Architecture
//!
//! - **`Conference`**: Public facade; owns the roster, both media sessions and the topology
//! - **`MediaSession`**: One offer/answer session (bridge or peer-to-peer) with serialized renegotiation
//! - **`Topology`**: Eligibility rule, leader election, deferred switch-back timer
//! - **`RecoveryController`**: Bridge ICE restarts with exponential backoff, P2P fallback
//! - **`SignalingLayer`**: Source ownership and presence bookkeeping
//!
//! ## Features
//!
//! - Automatic mode switching (bridge <-> P2P based on roster size)
//! - Deterministic choice of the P2P initiator
//! - Suspended (not torn down) bridge session while P2P carries media
//! - Bounded ICE restart schedule with jitter
//!
//! ## Usage
//!
//! ```rust,ignore
//! use confab_conference::{Conference, StaticCapabilities, TracingAnalytics};
//! use confab_core::ConferenceConfig;
//!
//! let conference = Conference::new(
//!     ParticipantId::from("abcd1234"),
//!     ConferenceConfig::default(),
//!     signaling,
//!     transports,
//!     Arc::new(StaticCapabilities { p2p: true }),
//!     Arc::new(TracingAnalytics),
//! );
//! conference.join(None, false).await?;
//! conference.handle_signal(event).await?;
//! ```

pub mod conference;
pub mod error;
pub mod events;
pub mod external;
pub mod participant;
pub mod recovery;
pub mod roster;
pub mod session;
pub mod signaling;
pub mod topology;
pub mod track;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod test_helpers;

pub use conference::{Conference, ConferenceStats, Lifecycle};
pub use error::{Error, Result};
pub use events::{
    AnalyticsEvent, ConferenceEvent, FailureReason, P2pStopCause, SignalingEvent,
    TerminateCondition, TerminationReason,
};
pub use external::{AnalyticsSink, CapabilityProbe, StaticCapabilities, TracingAnalytics};
pub use participant::{BotType, Participant, ParticipantInfo, Role};
pub use recovery::{with_jitter, IceRestartSchedule, RecoveryAction, RecoveryController};
pub use roster::Roster;
pub use session::{MediaSession, SessionKind, SessionSignal, SessionState, TerminateOptions};
pub use signaling::{PresenceUpdate, SignalingChannel, SignalingLayer, SourceChange, SourcePresence};
pub use topology::{p2p_initiation, should_be_in_p2p, Initiation, P2pConditions, Topology};
pub use track::{MediaKind, MediaTrack, TrackInfo, VideoType};
pub use transport::{
    IceConnectionState, PeerTransport, SdpSemantics, SessionDescription, SourceDescriptor,
    TransportFactory,
};
pub use types::{Jid, ParticipantId, SessionId, SourceName, TrackId};
