//! Participant roster
//!
//! Written only by the conference facade in response to membership signals.

use crate::participant::{Participant, ParticipantInfo};
use crate::track::MediaTrack;
use crate::types::{Jid, ParticipantId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Participant removed from the roster, with the tracks it owned
pub struct Departure {
    pub participant: Arc<Participant>,
    pub tracks: Vec<Arc<MediaTrack>>,
}

#[derive(Default)]
pub struct Roster {
    participants: RwLock<HashMap<ParticipantId, Arc<Participant>>>,
}

impl Roster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new participant; `None` when the id is already known
    pub fn add(&self, id: ParticipantId, jid: Jid, info: ParticipantInfo) -> Option<Arc<Participant>> {
        let mut participants = self.participants.write();
        if participants.contains_key(&id) {
            debug!(participant_id = %id, "Ignoring duplicate member join");
            return None;
        }
        let participant = Arc::new(Participant::new(id.clone(), jid, info));
        participants.insert(id.clone(), Arc::clone(&participant));
        info!(participant_id = %id, count = participants.len(), "Participant joined");
        Some(participant)
    }

    /// Remove a participant, detaching its tracks first
    pub fn remove(&self, id: &ParticipantId) -> Option<Departure> {
        let participant = self.participants.write().remove(id)?;
        let tracks = participant.take_tracks();
        info!(participant_id = %id, detached_tracks = tracks.len(), "Participant left");
        Some(Departure {
            participant,
            tracks,
        })
    }

    #[must_use]
    pub fn get(&self, id: &ParticipantId) -> Option<Arc<Participant>> {
        self.participants.read().get(id).cloned()
    }

    #[must_use]
    pub fn find_by_jid(&self, jid: &Jid) -> Option<Arc<Participant>> {
        self.participants
            .read()
            .values()
            .find(|p| p.jid == *jid)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.read().is_empty()
    }

    /// Participants ordered by join time
    #[must_use]
    pub fn participants(&self) -> Vec<Arc<Participant>> {
        let mut all: Vec<_> = self.participants.read().values().cloned().collect();
        all.sort_by_key(|p| p.joined_at);
        all
    }

    /// The single remote participant, if there is exactly one
    #[must_use]
    pub fn only_peer(&self) -> Option<Arc<Participant>> {
        let participants = self.participants.read();
        if participants.len() == 1 {
            participants.values().next().cloned()
        } else {
            None
        }
    }

    #[must_use]
    pub fn has_bot(&self) -> bool {
        self.participants.read().values().any(|p| p.is_bot())
    }

    /// Drop everyone, detaching all tracks
    pub fn clear(&self) -> Vec<Departure> {
        let drained: Vec<_> = self.participants.write().drain().map(|(_, p)| p).collect();
        drained
            .into_iter()
            .map(|participant| Departure {
                tracks: participant.take_tracks(),
                participant,
            })
            .collect()
    }
}
