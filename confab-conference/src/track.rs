//! Local and remote media tracks
//!
//! A [`MediaTrack`] is shared as `Arc<MediaTrack>` between the conference,
//! the sessions that carry it and (for remote tracks) the owning participant.
//! Mutable state sits behind `parking_lot` locks; no lock is ever held across
//! an await point.

use crate::error::{Error, Result};
use crate::transport::SourceDescriptor;
use crate::types::{ParticipantId, SessionId, SourceName, TrackId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Single letter used inside source names
    #[must_use]
    pub const fn short_name(&self) -> char {
        match self {
            Self::Audio => 'a',
            Self::Video => 'v',
        }
    }
}

impl From<RTPCodecType> for MediaKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl From<&str> for MediaKind {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "audio" => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// Video sub-type; audio tracks carry none
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoType {
    Camera,
    Desktop,
}

/// Where a track comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOrigin {
    Local,
    Remote {
        owner: ParticipantId,
        /// Received over the peer-to-peer session rather than the bridge
        p2p: bool,
    },
}

/// Audio or video track, local or remote
#[derive(Debug)]
pub struct MediaTrack {
    pub id: TrackId,
    pub kind: MediaKind,
    pub origin: TrackOrigin,
    video_type: RwLock<Option<VideoType>>,
    source_name: RwLock<Option<SourceName>>,
    muted: RwLock<bool>,
    disposed: RwLock<bool>,
    /// Session the track is currently attached to
    binding: RwLock<Option<SessionId>>,
}

impl MediaTrack {
    /// Create a local track; the conference assigns its source name on add
    #[must_use]
    pub fn local(kind: MediaKind, video_type: Option<VideoType>) -> Self {
        Self::with_origin(TrackOrigin::Local, kind, video_type, None, false)
    }

    /// Create a remote track from a signaled source
    #[must_use]
    pub fn remote(descriptor: &SourceDescriptor, p2p: bool) -> Self {
        Self::with_origin(
            TrackOrigin::Remote {
                owner: descriptor.owner.clone(),
                p2p,
            },
            descriptor.kind,
            descriptor.video_type,
            Some(descriptor.name.clone()),
            descriptor.muted,
        )
    }

    fn with_origin(
        origin: TrackOrigin,
        kind: MediaKind,
        video_type: Option<VideoType>,
        source_name: Option<SourceName>,
        muted: bool,
    ) -> Self {
        let video_type = match kind {
            MediaKind::Audio => None,
            MediaKind::Video => video_type.or(Some(VideoType::Camera)),
        };
        Self {
            id: TrackId::generate(),
            kind,
            origin,
            video_type: RwLock::new(video_type),
            source_name: RwLock::new(source_name),
            muted: RwLock::new(muted),
            disposed: RwLock::new(false),
            binding: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.origin == TrackOrigin::Local
    }

    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.kind == MediaKind::Audio
    }

    #[must_use]
    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Owner of a remote track
    #[must_use]
    pub fn owner(&self) -> Option<&ParticipantId> {
        match &self.origin {
            TrackOrigin::Local => None,
            TrackOrigin::Remote { owner, .. } => Some(owner),
        }
    }

    #[must_use]
    pub fn is_p2p(&self) -> bool {
        matches!(self.origin, TrackOrigin::Remote { p2p: true, .. })
    }

    #[must_use]
    pub fn source_name(&self) -> Option<SourceName> {
        self.source_name.read().clone()
    }

    /// Assign the source name; a name can be set only once
    pub fn assign_source_name(&self, name: SourceName) -> Result<()> {
        let mut current = self.source_name.write();
        match &*current {
            Some(existing) if *existing == name => Ok(()),
            Some(existing) => Err(Error::Usage(format!(
                "track {} already has source name {existing}",
                self.id
            ))),
            None => {
                *current = Some(name);
                Ok(())
            }
        }
    }

    /// Drop the source name so the source can be re-owned
    pub fn clear_source_name(&self) -> Option<SourceName> {
        self.source_name.write().take()
    }

    #[must_use]
    pub fn video_type(&self) -> Option<VideoType> {
        *self.video_type.read()
    }

    /// Returns true when the value changed
    pub fn set_video_type(&self, video_type: Option<VideoType>) -> bool {
        let mut current = self.video_type.write();
        if *current == video_type || self.kind == MediaKind::Audio {
            return false;
        }
        debug!(track_id = %self.id, old = ?*current, new = ?video_type, "Video type changed");
        *current = video_type;
        true
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        *self.muted.read()
    }

    /// Returns true when the value changed
    pub fn set_muted(&self, muted: bool) -> bool {
        let mut current = self.muted.write();
        if *current == muted {
            return false;
        }
        *current = muted;
        true
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        *self.disposed.read()
    }

    pub fn dispose(&self) {
        *self.disposed.write() = true;
        self.detach();
    }

    /// Fail if the track can no longer be used
    pub fn ensure_usable(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::TrackDisposed(self.id.to_string()));
        }
        Ok(())
    }

    pub fn attach(&self, session: &SessionId) {
        *self.binding.write() = Some(session.clone());
    }

    pub fn detach(&self) {
        self.binding.write().take();
    }

    #[must_use]
    pub fn binding(&self) -> Option<SessionId> {
        self.binding.read().clone()
    }

    /// Signaling view of this track, if it has a name
    #[must_use]
    pub fn descriptor(&self, owner: &ParticipantId) -> Option<SourceDescriptor> {
        Some(SourceDescriptor {
            name: self.source_name()?,
            owner: self.owner().cloned().unwrap_or_else(|| owner.clone()),
            kind: self.kind,
            video_type: self.video_type(),
            muted: self.is_muted(),
        })
    }
}

/// Serializable snapshot of a track, used in events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub track_id: TrackId,
    pub source_name: Option<SourceName>,
    pub owner: Option<ParticipantId>,
    pub kind: MediaKind,
    pub video_type: Option<VideoType>,
    pub muted: bool,
    pub p2p: bool,
}

impl From<&MediaTrack> for TrackInfo {
    fn from(track: &MediaTrack) -> Self {
        Self {
            track_id: track.id.clone(),
            source_name: track.source_name(),
            owner: track.owner().cloned(),
            kind: track.kind,
            video_type: track.video_type(),
            muted: track.is_muted(),
            p2p: track.is_p2p(),
        }
    }
}
