//! Signaling layer adapter
//!
//! Two jobs:
//! - keep the source name -> owner / mute / video type map for remote
//!   sources, resolved against the roster
//! - turn local track mute and video type changes into presence updates,
//!   sending each distinct presence state once
//!
//! Stanza construction stays behind [`SignalingChannel`].

use crate::error::Result;
use crate::events::{ConferenceEvent, TerminationReason};
use crate::roster::Roster;
use crate::track::{MediaKind, TrackInfo, VideoType};
use crate::transport::{SessionDescription, SourceDescriptor};
use crate::types::{Jid, ParticipantId, SessionId, SourceName};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Outbound side of the signaling collaborator
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn join_room(&self, password: Option<&str>, replace_participant: bool) -> Result<()>;

    async fn leave_room(&self, reason: Option<&str>) -> Result<()>;

    async fn send_presence(&self, presence: &PresenceUpdate) -> Result<()>;

    async fn send_session_initiate(
        &self,
        to: &Jid,
        sid: &SessionId,
        offer: &SessionDescription,
    ) -> Result<()>;

    async fn send_session_accept(
        &self,
        to: &Jid,
        sid: &SessionId,
        answer: &SessionDescription,
    ) -> Result<()>;

    /// Also used to decline an incoming offer
    async fn send_session_terminate(
        &self,
        to: &Jid,
        sid: &SessionId,
        reason: &TerminationReason,
    ) -> Result<()>;

    async fn send_source_add(
        &self,
        to: &Jid,
        sid: &SessionId,
        sources: &[SourceDescriptor],
    ) -> Result<()>;

    async fn send_source_remove(&self, to: &Jid, sid: &SessionId, sources: &[SourceName]) -> Result<()>;

    async fn send_transport_info(&self, to: &Jid, sid: &SessionId, candidates: &[String]) -> Result<()>;

    /// Ask a participant to mute itself
    async fn send_mute_request(&self, to: &Jid, kind: MediaKind) -> Result<()>;

    /// Forward the receive-side last-N limit to the bridge
    async fn send_last_n(&self, last_n: i32) -> Result<()>;

    /// Whether `jid` is the conference focus, the only sender allowed to
    /// start bridge sessions
    fn is_focus(&self, jid: &Jid) -> bool;
}

/// Presence-level state of one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePresence {
    pub muted: bool,
    pub video_type: Option<VideoType>,
}

/// Source part of the local presence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub sources: BTreeMap<SourceName, SourcePresence>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteSource {
    owner: ParticipantId,
    presence: SourcePresence,
}

/// Result of resolving a source notification
#[derive(Debug, Clone, PartialEq)]
pub enum SourceChange {
    Updated {
        source: SourceName,
        owner: ParticipantId,
        presence: SourcePresence,
    },
    Removed {
        source: SourceName,
        owner: ParticipantId,
    },
    TrackMuteChanged(TrackInfo),
    /// The previous owner's track lost its source to a new owner
    TrackRemoved(TrackInfo),
}

impl From<SourceChange> for ConferenceEvent {
    fn from(change: SourceChange) -> Self {
        match change {
            SourceChange::Updated {
                source,
                owner,
                presence,
            } => Self::SourceUpdated {
                source,
                owner,
                muted: presence.muted,
                video_type: presence.video_type,
            },
            SourceChange::Removed { source, owner } => Self::SourceRemoved { source, owner },
            SourceChange::TrackMuteChanged(track) => Self::TrackMuteChanged { track },
            SourceChange::TrackRemoved(track) => Self::TrackRemoved { track },
        }
    }
}

#[derive(Default)]
pub struct SignalingLayer {
    remote_sources: RwLock<HashMap<SourceName, RemoteSource>>,
    local_sources: RwLock<BTreeMap<SourceName, SourcePresence>>,
    last_presence: RwLock<Option<PresenceUpdate>>,
}

impl SignalingLayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a source-updated notification
    pub fn on_source_updated(
        &self,
        roster: &Roster,
        source: SourceName,
        owner: ParticipantId,
        presence: SourcePresence,
    ) -> Vec<SourceChange> {
        let Some(participant) = roster.get(&owner) else {
            warn!(source = %source, owner = %owner, "Source update for unknown participant");
            return Vec::new();
        };

        let mut changes = Vec::new();
        let previous = self.remote_sources.write().insert(
            source.clone(),
            RemoteSource {
                owner: owner.clone(),
                presence,
            },
        );

        match previous {
            Some(previous) if previous.owner != owner => {
                debug!(source = %source, old_owner = %previous.owner, new_owner = %owner, "Source re-owned");
                if let Some(old) = roster.get(&previous.owner) {
                    if let Some(track) = old.track_by_source(&source) {
                        old.remove_track(&track);
                        changes.push(SourceChange::TrackRemoved(TrackInfo::from(&*track)));
                        track.clear_source_name();
                    }
                }
                changes.push(SourceChange::Removed {
                    source: source.clone(),
                    owner: previous.owner,
                });
            }
            Some(previous) if previous.presence == presence => return changes,
            _ => {}
        }

        if let Some(track) = participant.track_by_source(&source) {
            track.set_video_type(presence.video_type);
            if track.set_muted(presence.muted) {
                changes.push(SourceChange::TrackMuteChanged(TrackInfo::from(&*track)));
            }
        }

        changes.push(SourceChange::Updated {
            source,
            owner,
            presence,
        });
        changes
    }

    /// Remove one source if `owner` still owns it
    pub fn on_source_removed(&self, source: &SourceName, owner: &ParticipantId) -> Option<SourceChange> {
        let mut sources = self.remote_sources.write();
        match sources.get(source) {
            Some(entry) if entry.owner == *owner => {
                sources.remove(source);
                Some(SourceChange::Removed {
                    source: source.clone(),
                    owner: owner.clone(),
                })
            }
            _ => None,
        }
    }

    /// Record sources learned from a session description or source-add
    pub fn note_remote_sources(&self, sources: &[SourceDescriptor]) {
        let mut known = self.remote_sources.write();
        for descriptor in sources {
            known.entry(descriptor.name.clone()).or_insert(RemoteSource {
                owner: descriptor.owner.clone(),
                presence: SourcePresence {
                    muted: descriptor.muted,
                    video_type: descriptor.video_type,
                },
            });
        }
    }

    /// Forget sources named in a source-remove
    pub fn forget_remote_sources(&self, sources: &[SourceName]) -> Vec<SourceChange> {
        let mut known = self.remote_sources.write();
        sources
            .iter()
            .filter_map(|name| {
                known.remove(name).map(|entry| SourceChange::Removed {
                    source: name.clone(),
                    owner: entry.owner,
                })
            })
            .collect()
    }

    /// Drop every source owned by a departing participant
    pub fn remove_sources_of(&self, owner: &ParticipantId) -> Vec<SourceChange> {
        let mut known = self.remote_sources.write();
        let names: Vec<SourceName> = known
            .iter()
            .filter(|(_, entry)| entry.owner == *owner)
            .map(|(name, _)| name.clone())
            .collect();
        let mut removed: Vec<SourceChange> = names
            .into_iter()
            .map(|name| {
                known.remove(&name);
                SourceChange::Removed {
                    source: name,
                    owner: owner.clone(),
                }
            })
            .collect();
        removed.sort_by(|a, b| match (a, b) {
            (SourceChange::Removed { source: a, .. }, SourceChange::Removed { source: b, .. }) => a.cmp(b),
            _ => std::cmp::Ordering::Equal,
        });
        removed
    }

    #[must_use]
    pub fn source_owner(&self, source: &SourceName) -> Option<ParticipantId> {
        self.remote_sources.read().get(source).map(|s| s.owner.clone())
    }

    #[must_use]
    pub fn source_presence(&self, source: &SourceName) -> Option<SourcePresence> {
        self.remote_sources.read().get(source).map(|s| s.presence)
    }

    pub fn set_local_source(&self, source: SourceName, presence: SourcePresence) {
        self.local_sources.write().insert(source, presence);
    }

    pub fn remove_local_source(&self, source: &SourceName) -> bool {
        self.local_sources.write().remove(source).is_some()
    }

    /// Returns true when the stored state changed
    pub fn set_track_mute(&self, source: &SourceName, muted: bool) -> bool {
        match self.local_sources.write().get_mut(source) {
            Some(presence) if presence.muted != muted => {
                presence.muted = muted;
                true
            }
            _ => false,
        }
    }

    /// Returns true when the stored state changed
    pub fn set_track_video_type(&self, source: &SourceName, video_type: Option<VideoType>) -> bool {
        match self.local_sources.write().get_mut(source) {
            Some(presence) if presence.video_type != video_type => {
                presence.video_type = video_type;
                true
            }
            _ => false,
        }
    }

    /// Presence to send, or `None` when it equals what was last sent
    #[must_use]
    pub fn pending_presence(&self) -> Option<PresenceUpdate> {
        let current = PresenceUpdate {
            sources: self.local_sources.read().clone(),
        };
        if self.last_presence.read().as_ref() == Some(&current) {
            return None;
        }
        Some(current)
    }

    pub fn mark_presence_sent(&self, presence: PresenceUpdate) {
        *self.last_presence.write() = Some(presence);
    }

    pub fn reset(&self) {
        self.remote_sources.write().clear();
        self.local_sources.write().clear();
        self.last_presence.write().take();
    }
}
