//! Remote conference participants
//!
//! This module handles:
//! - Participant identity, role and capability flags
//! - Bot classification used by the topology decision
//! - The ordered set of remote tracks a participant owns

use crate::track::{MediaKind, MediaTrack};
use crate::types::{Jid, ParticipantId, SourceName};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Disco feature announced by gateway (SIP) participants
pub const FEATURE_JIGASI: &str = "http://jitsi.org/protocol/jigasi";
/// Disco feature for DTMF support
pub const FEATURE_DTMF: &str = "urn:xmpp:jingle:dtmf:0";
/// Disco feature for end-to-end encryption support
pub const FEATURE_E2EE: &str = "https://jitsi.org/meet/e2ee";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    None,
    Participant,
    Moderator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotType {
    Poltergeist,
    Transcriber,
    Jigasi,
}

/// Metadata carried by member-joined / member-updated signals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub features: BTreeSet<String>,
    #[serde(default)]
    pub bot_type: Option<BotType>,
    #[serde(default)]
    pub hidden: bool,
}

/// Remote conference participant
pub struct Participant {
    pub id: ParticipantId,
    pub jid: Jid,
    info: RwLock<ParticipantInfo>,
    tracks: RwLock<Vec<Arc<MediaTrack>>>,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    #[must_use]
    pub fn new(id: ParticipantId, jid: Jid, info: ParticipantInfo) -> Self {
        Self {
            id,
            jid,
            info: RwLock::new(info),
            tracks: RwLock::new(Vec::new()),
            joined_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn info(&self) -> ParticipantInfo {
        self.info.read().clone()
    }

    /// Replace metadata; returns the previous role when it changed
    pub fn update(&self, info: ParticipantInfo) -> Option<Role> {
        let mut current = self.info.write();
        let old_role = current.role;
        *current = info;
        (old_role != current.role).then_some(old_role)
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.info.read().role
    }

    #[must_use]
    pub fn is_moderator(&self) -> bool {
        self.role() == Role::Moderator
    }

    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.info.read().features.contains(feature)
    }

    #[must_use]
    pub fn bot_type(&self) -> Option<BotType> {
        self.info.read().bot_type
    }

    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.info.read().hidden
    }

    /// Bots and gateways keep the conference on the bridge
    #[must_use]
    pub fn is_bot(&self) -> bool {
        self.bot_type().is_some() || self.has_feature(FEATURE_JIGASI)
    }

    #[must_use]
    pub fn supports_dtmf(&self) -> bool {
        self.has_feature(FEATURE_DTMF)
    }

    #[must_use]
    pub fn is_e2ee_capable(&self) -> bool {
        self.has_feature(FEATURE_E2EE)
    }

    /// Attach a remote track; a track is listed at most once
    pub fn add_track(&self, track: Arc<MediaTrack>) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| Arc::ptr_eq(t, &track)) {
            return false;
        }
        debug!(participant_id = %self.id, track_id = %track.id, "Track attached to participant");
        tracks.push(track);
        true
    }

    pub fn remove_track(&self, track: &Arc<MediaTrack>) -> bool {
        let mut tracks = self.tracks.write();
        let before = tracks.len();
        tracks.retain(|t| !Arc::ptr_eq(t, track));
        before != tracks.len()
    }

    /// Detach every track, returning them in attach order
    pub fn take_tracks(&self) -> Vec<Arc<MediaTrack>> {
        std::mem::take(&mut *self.tracks.write())
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks.read().clone()
    }

    #[must_use]
    pub fn track_by_source(&self, source: &SourceName) -> Option<Arc<MediaTrack>> {
        self.tracks
            .read()
            .iter()
            .find(|t| t.source_name().as_ref() == Some(source))
            .cloned()
    }

    /// Mute state of the first track of `kind`; no track counts as muted
    #[must_use]
    pub fn is_muted(&self, kind: MediaKind) -> bool {
        self.tracks
            .read()
            .iter()
            .find(|t| t.kind == kind)
            .map_or(true, |t| t.is_muted())
    }
}
