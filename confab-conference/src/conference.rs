//! Conference facade
//!
//! This module provides:
//! - The public conference API (join/leave, local tracks, last-N, mute requests)
//! - Dispatch of inbound signaling into roster, sessions and topology
//! - Execution of bridge <-> peer-to-peer switches
//! - ICE recovery timers for the bridge path
//!
//! One [`Conference`] owns all state from construction to `leave`. Topology
//! transitions (P2P start, stop, accept) are serialized by one async mutex;
//! the presence pass by another. Timer tasks hold a `Weak` to the conference.

use crate::error::{Error, Result};
use crate::events::{
    AnalyticsEvent, ConferenceEvent, FailureReason, P2pStopCause, SignalingEvent,
    TerminateCondition, TerminationReason,
};
use crate::external::{AnalyticsSink, CapabilityProbe};
use crate::participant::{Participant, ParticipantInfo};
use crate::recovery::{RecoveryAction, RecoveryController};
use crate::roster::Roster;
use crate::session::{
    MediaSession, SessionContext, SessionKind, SessionSignal, SessionState, TerminateOptions,
};
use crate::signaling::{SignalingChannel, SignalingLayer, SourceChange, SourcePresence};
use crate::topology::{p2p_initiation, should_be_in_p2p, stop_cause, Initiation, Topology};
use crate::track::{MediaKind, MediaTrack, TrackInfo, VideoType};
use crate::transport::{IceConnectionState, SessionDescription, SourceDescriptor, TransportFactory};
use crate::types::{Jid, ParticipantId, SessionId, SourceName};
use confab_core::config::ConferenceConfig;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    Joined,
    Left,
}

/// Conference statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ConferenceStats {
    /// Remote participants in the roster
    pub participant_count: usize,
    pub local_tracks: usize,
    pub p2p_active: bool,
    pub active_path: Option<SessionKind>,
    /// Bridge <-> P2P switches so far
    pub mode_switches: u64,
    /// Bridge ICE restarts scheduled so far
    pub ice_restart_attempts: u64,
}

/// What triggered a topology re-evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reevaluation {
    MemberJoined,
    MemberLeft,
    Other,
}

pub struct Conference {
    local_id: ParticipantId,
    config: ConferenceConfig,
    signaling: Arc<dyn SignalingChannel>,
    transports: Arc<dyn TransportFactory>,
    capabilities: Arc<dyn CapabilityProbe>,
    analytics: Arc<dyn AnalyticsSink>,

    lifecycle: RwLock<Lifecycle>,
    roster: Roster,
    sources: SignalingLayer,
    topology: Topology,
    recovery: RecoveryController,

    jvb: RwLock<Option<Arc<MediaSession>>>,
    p2p: RwLock<Option<Arc<MediaSession>>>,

    local_tracks: RwLock<Vec<Arc<MediaTrack>>>,
    source_indices: Mutex<HashMap<MediaKind, usize>>,
    last_n: RwLock<i32>,

    transition: tokio::sync::Mutex<()>,
    presence: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ConferenceEvent>,
}

impl Conference {
    pub fn new(
        local_id: ParticipantId,
        config: ConferenceConfig,
        signaling: Arc<dyn SignalingChannel>,
        transports: Arc<dyn TransportFactory>,
        capabilities: Arc<dyn CapabilityProbe>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            local_id = %local_id,
            p2p_enabled = config.p2p.enabled,
            p2p_test_mode = config.p2p.test_mode,
            max_connection_retries = config.recovery.max_connection_retries,
            "Conference created"
        );

        Arc::new(Self {
            topology: Topology::new(config.p2p.clone()),
            recovery: RecoveryController::new(config.recovery.clone()),
            local_id,
            config,
            signaling,
            transports,
            capabilities,
            analytics,
            lifecycle: RwLock::new(Lifecycle::Created),
            roster: Roster::new(),
            sources: SignalingLayer::new(),
            jvb: RwLock::new(None),
            p2p: RwLock::new(None),
            local_tracks: RwLock::new(Vec::new()),
            source_indices: Mutex::new(HashMap::new()),
            last_n: RwLock::new(-1),
            transition: tokio::sync::Mutex::new(()),
            presence: tokio::sync::Mutex::new(()),
            events,
        })
    }

    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    /// Event stream for the application
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConferenceEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn participants(&self) -> Vec<Arc<Participant>> {
        self.roster.participants()
    }

    #[must_use]
    pub fn participant(&self, id: &ParticipantId) -> Option<Arc<Participant>> {
        self.roster.get(id)
    }

    #[must_use]
    pub fn local_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.local_tracks.read().clone()
    }

    #[must_use]
    pub fn is_p2p_active(&self) -> bool {
        self.topology.is_p2p_active()
    }

    #[must_use]
    pub fn session(&self, kind: SessionKind) -> Option<Arc<MediaSession>> {
        match kind {
            SessionKind::Bridge => self.jvb.read().clone(),
            SessionKind::PeerToPeer => self.p2p.read().clone(),
        }
    }

    /// The session currently carrying user-facing media
    #[must_use]
    pub fn get_active_peer_connection(&self) -> Option<Arc<MediaSession>> {
        self.session(self.active_kind())
    }

    /// ICE state of the active session
    #[must_use]
    pub fn get_connection_state(&self) -> Option<IceConnectionState> {
        self.get_active_peer_connection().map(|s| s.ice_state())
    }

    #[must_use]
    pub fn stats(&self) -> ConferenceStats {
        ConferenceStats {
            participant_count: self.roster.len(),
            local_tracks: self.local_tracks.read().len(),
            p2p_active: self.topology.is_p2p_active(),
            active_path: self.get_active_peer_connection().map(|s| s.kind),
            mode_switches: self.topology.mode_switches(),
            ice_restart_attempts: self.recovery.total_restarts(),
        }
    }

    fn active_kind(&self) -> SessionKind {
        SessionKind::from_p2p(self.topology.is_p2p_active())
    }

    fn sessions(&self) -> Vec<Arc<MediaSession>> {
        [SessionKind::Bridge, SessionKind::PeerToPeer]
            .into_iter()
            .filter_map(|kind| self.session(kind))
            .collect()
    }

    fn emit(&self, event: ConferenceEvent) {
        debug!(event = event.event_type(), "Conference event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn ensure_not_left(&self) -> Result<()> {
        if self.lifecycle() == Lifecycle::Left {
            return Err(Error::NotJoined);
        }
        Ok(())
    }

    fn ensure_joined(&self) -> Result<()> {
        if self.lifecycle() != Lifecycle::Joined {
            return Err(Error::NotJoined);
        }
        Ok(())
    }

    fn p2p_allowed(&self) -> bool {
        self.topology.config().enabled && self.capabilities.supports_p2p()
    }

    fn create_session(&self, id: SessionId, kind: SessionKind, remote: Jid) -> Arc<MediaSession> {
        let context = SessionContext {
            local_id: self.local_id.clone(),
            signaling: Arc::clone(&self.signaling),
            analytics: Arc::clone(&self.analytics),
            answer_timeout: self.config.session.answer_timeout(),
        };
        Arc::new(MediaSession::new(
            id,
            kind,
            remote,
            self.transports.create(kind),
            context,
        ))
    }

    fn set_session(&self, kind: SessionKind, session: Option<Arc<MediaSession>>) {
        match kind {
            SessionKind::Bridge => *self.jvb.write() = session,
            SessionKind::PeerToPeer => *self.p2p.write() = session,
        }
    }

    fn take_session(&self, kind: SessionKind) -> Option<Arc<MediaSession>> {
        match kind {
            SessionKind::Bridge => self.jvb.write().take(),
            SessionKind::PeerToPeer => self.p2p.write().take(),
        }
    }

    // ---- lifecycle ----

    /// Join the room; members already announced are evaluated afterwards
    pub async fn join(self: &Arc<Self>, password: Option<&str>, replace_participant: bool) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Created => {}
            Lifecycle::Joined => return Err(Error::Usage("conference already joined".to_string())),
            Lifecycle::Left => return Err(Error::NotJoined),
        }

        self.signaling.join_room(password, replace_participant).await?;
        *self.lifecycle.write() = Lifecycle::Joined;
        info!(local_id = %self.local_id, replace_participant, "Conference joined");
        self.emit(ConferenceEvent::Joined);

        self.send_presence_if_changed().await?;
        self.evaluate_topology(Reevaluation::Other).await;
        Ok(())
    }

    /// Leave the room and tear everything down
    ///
    /// Both sessions are terminated best-effort, each bounded by the
    /// configured terminate timeout.
    pub async fn leave(&self, reason: Option<&str>) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.write();
            if *lifecycle != Lifecycle::Joined {
                return Err(Error::NotJoined);
            }
            *lifecycle = Lifecycle::Left;
        }
        info!(local_id = %self.local_id, reason = ?reason, "Leaving conference");

        self.topology.reset();
        self.recovery.cancel_all();
        if let Some(p2p) = self.session(SessionKind::PeerToPeer) {
            p2p.abort_invite();
        }

        {
            let _transition = self.transition.lock().await;
            let timeout = self.config.session.terminate_timeout();
            let teardown = [
                (
                    self.take_session(SessionKind::PeerToPeer),
                    P2pStopCause::Leaving.termination_reason(),
                ),
                (
                    self.take_session(SessionKind::Bridge),
                    TerminationReason::new(TerminateCondition::Success, "Leaving"),
                ),
            ];
            for (session, reason) in teardown {
                let Some(session) = session else { continue };
                let options = TerminateOptions {
                    reason,
                    send_session_terminate: true,
                };
                match tokio::time::timeout(timeout, session.terminate(options)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(session_id = %session.id, kind = %session.kind, error = %e, "Session terminate failed");
                    }
                    Err(_) => {
                        warn!(
                            session_id = %session.id,
                            kind = %session.kind,
                            timeout_ms = timeout.as_millis() as u64,
                            "Session terminate timed out"
                        );
                    }
                }
            }
        }

        for track in self.local_tracks() {
            track.detach();
        }
        let departed = self.roster.clear();
        self.sources.reset();
        debug!(participants = departed.len(), "Roster cleared");

        let result = self.signaling.leave_room(reason).await;
        self.emit(ConferenceEvent::Left);
        result
    }

    // ---- local tracks ----

    fn next_source_name(&self, kind: MediaKind) -> SourceName {
        let mut indices = self.source_indices.lock();
        let index = indices.entry(kind).or_insert(0);
        let name = SourceName::for_track(&self.local_id, kind, *index);
        *index += 1;
        name
    }

    fn is_local_track(&self, track: &Arc<MediaTrack>) -> bool {
        self.local_tracks.read().iter().any(|t| Arc::ptr_eq(t, track))
    }

    fn ensure_local_track(&self, track: &Arc<MediaTrack>) -> Result<()> {
        if !self.is_local_track(track) {
            return Err(Error::NotFound(format!("local track {}", track.id)));
        }
        Ok(())
    }

    fn presence_of(track: &MediaTrack) -> SourcePresence {
        SourcePresence {
            muted: track.is_muted(),
            video_type: track.video_type(),
        }
    }

    /// Add a local track to the conference and every session
    pub async fn add_track(&self, track: Arc<MediaTrack>) -> Result<()> {
        self.ensure_not_left()?;
        if !track.is_local() {
            return Err(Error::Usage("only local tracks can be added".to_string()));
        }
        track.ensure_usable()?;
        {
            let tracks = self.local_tracks.read();
            if tracks.iter().any(|t| Arc::ptr_eq(t, &track)) {
                return Err(Error::Usage(format!("track {} already added", track.id)));
            }
        }
        self.ensure_track_type_free(track.kind, track.video_type(), None)?;

        let name = match track.source_name() {
            Some(name) => name,
            None => {
                let name = self.next_source_name(track.kind);
                track.assign_source_name(name.clone())?;
                name
            }
        };

        self.local_tracks.write().push(Arc::clone(&track));
        self.sources.set_local_source(name.clone(), Self::presence_of(&track));
        if let Some(active) = self.get_active_peer_connection() {
            track.attach(&active.id);
        }

        for session in self.sessions() {
            if let Err(e) = session.add_tracks(&[Arc::clone(&track)]).await {
                warn!(session_id = %session.id, source = %name, error = %e, "Failed to add local track");
                self.rollback_local_track(&track, &name).await;
                return Err(e);
            }
        }

        info!(track_id = %track.id, source = %name, kind = ?track.kind, "Local track added");
        self.emit(ConferenceEvent::TrackAdded {
            track: TrackInfo::from(track.as_ref()),
        });
        self.send_presence_if_changed().await
    }

    /// At most one local track per kind and video type, `except` aside
    fn ensure_track_type_free(
        &self,
        kind: MediaKind,
        video_type: Option<VideoType>,
        except: Option<&Arc<MediaTrack>>,
    ) -> Result<()> {
        if self.config.testing.allow_multiple_local_tracks {
            return Ok(());
        }
        let taken = self.local_tracks.read().iter().any(|t| {
            !except.is_some_and(|except| Arc::ptr_eq(t, except))
                && t.kind == kind
                && t.video_type() == video_type
        });
        if taken {
            return Err(Error::Usage(format!(
                "cannot have a second local {kind:?} track of type {video_type:?}"
            )));
        }
        Ok(())
    }

    async fn rollback_local_track(&self, track: &Arc<MediaTrack>, name: &SourceName) {
        self.local_tracks.write().retain(|t| !Arc::ptr_eq(t, track));
        self.sources.remove_local_source(name);
        for session in self.sessions() {
            if let Err(e) = session.remove_track(track).await {
                debug!(session_id = %session.id, error = %e, "Rollback of local track failed");
            }
        }
        track.detach();
    }

    /// Remove a local track from the conference and every session
    pub async fn remove_track(&self, track: &Arc<MediaTrack>) -> Result<()> {
        self.ensure_not_left()?;
        {
            let mut tracks = self.local_tracks.write();
            let before = tracks.len();
            tracks.retain(|t| !Arc::ptr_eq(t, track));
            if tracks.len() == before {
                return Err(Error::NotFound(format!("local track {}", track.id)));
            }
        }
        if let Some(name) = track.source_name() {
            self.sources.remove_local_source(&name);
        }

        let mut result = Ok(());
        for session in self.sessions() {
            if let Err(e) = session.remove_track(track).await {
                warn!(session_id = %session.id, track_id = %track.id, error = %e, "Failed to remove local track");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        track.detach();

        info!(track_id = %track.id, "Local track removed");
        self.emit(ConferenceEvent::TrackRemoved {
            track: TrackInfo::from(track.as_ref()),
        });
        self.send_presence_if_changed().await?;
        result
    }

    /// Replace `old` with `new`; the new track takes over the old source name
    ///
    /// With only `new` this adds, with only `old` this removes.
    pub async fn replace_track(
        &self,
        old: Option<&Arc<MediaTrack>>,
        new: Option<Arc<MediaTrack>>,
    ) -> Result<()> {
        self.ensure_not_left()?;
        let (old, new) = match (old, new) {
            (None, None) => {
                return Err(Error::InvalidInput(
                    "replace_track needs an old or a new track".to_string(),
                ))
            }
            (None, Some(new)) => return self.add_track(new).await,
            (Some(old), None) => return self.remove_track(old).await,
            (Some(old), Some(new)) => (old, new),
        };

        if !new.is_local() {
            return Err(Error::Usage("only local tracks can be added".to_string()));
        }
        new.ensure_usable()?;
        if old.kind != new.kind {
            return Err(Error::Usage(format!(
                "cannot replace a {:?} track with a {:?} track",
                old.kind, new.kind
            )));
        }
        self.ensure_local_track(old)?;
        if self.local_tracks.read().iter().any(|t| Arc::ptr_eq(t, &new)) {
            return Err(Error::Usage(format!("track {} already added", new.id)));
        }
        self.ensure_track_type_free(new.kind, new.video_type(), Some(old))?;

        let name = match old.source_name() {
            Some(name) => name,
            None => self.next_source_name(old.kind),
        };
        new.assign_source_name(name.clone())?;

        let binding = old.binding();
        let mut replaced: Vec<Arc<MediaSession>> = Vec::new();
        for session in self.sessions() {
            if let Err(e) = session.replace_track(Some(old), Some(&new)).await {
                warn!(session_id = %session.id, source = %name, error = %e, "Failed to replace local track");
                for done in &replaced {
                    if let Err(e) = done.replace_track(Some(&new), Some(old)).await {
                        debug!(session_id = %done.id, error = %e, "Rollback of replaced track failed");
                    }
                }
                match binding {
                    Some(binding) => old.attach(&binding),
                    None => old.detach(),
                }
                new.detach();
                new.clear_source_name();
                return Err(e);
            }
            replaced.push(session);
        }

        {
            let mut tracks = self.local_tracks.write();
            if let Some(slot) = tracks.iter_mut().find(|t| Arc::ptr_eq(t, old)) {
                *slot = Arc::clone(&new);
            }
        }
        if let Some(binding) = old.binding() {
            new.attach(&binding);
        }
        old.detach();
        self.sources.set_local_source(name.clone(), Self::presence_of(&new));

        info!(old = %old.id, new = %new.id, source = %name, "Local track replaced");
        self.emit(ConferenceEvent::TrackRemoved {
            track: TrackInfo::from(old.as_ref()),
        });
        old.clear_source_name();
        self.emit(ConferenceEvent::TrackAdded {
            track: TrackInfo::from(new.as_ref()),
        });
        self.send_presence_if_changed().await
    }

    pub async fn set_track_muted(&self, track: &Arc<MediaTrack>, muted: bool) -> Result<()> {
        self.ensure_not_left()?;
        self.ensure_local_track(track)?;
        if !track.set_muted(muted) {
            return Ok(());
        }
        if let Some(name) = track.source_name() {
            self.sources.set_track_mute(&name, muted);
        }
        debug!(track_id = %track.id, muted, "Local track mute changed");
        self.emit(ConferenceEvent::TrackMuteChanged {
            track: TrackInfo::from(track.as_ref()),
        });
        self.send_presence_if_changed().await
    }

    pub async fn set_track_video_type(&self, track: &Arc<MediaTrack>, video_type: VideoType) -> Result<()> {
        self.ensure_not_left()?;
        if !track.is_video() {
            return Err(Error::Usage("audio tracks have no video type".to_string()));
        }
        self.ensure_local_track(track)?;
        self.ensure_track_type_free(MediaKind::Video, Some(video_type), Some(track))?;
        if !track.set_video_type(Some(video_type)) {
            return Ok(());
        }
        if let Some(name) = track.source_name() {
            self.sources.set_track_video_type(&name, Some(video_type));
        }
        self.send_presence_if_changed().await
    }

    /// Send presence if it differs from what was last sent
    async fn send_presence_if_changed(&self) -> Result<()> {
        let _pass = self.presence.lock().await;
        if self.lifecycle() != Lifecycle::Joined {
            return Ok(());
        }
        let Some(update) = self.sources.pending_presence() else {
            return Ok(());
        };
        self.signaling.send_presence(&update).await?;
        debug!(sources = update.sources.len(), "Presence sent");
        self.sources.mark_presence_sent(update);
        Ok(())
    }

    // ---- remote control ----

    /// Ask a participant to mute its `kind` track
    pub async fn mute_participant(&self, id: &ParticipantId, kind: MediaKind) -> Result<()> {
        self.ensure_joined()?;
        let participant = self
            .roster
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("participant {id}")))?;
        self.signaling.send_mute_request(&participant.jid, kind).await?;
        info!(participant_id = %id, kind = ?kind, "Mute requested");
        self.analytics.send_event(AnalyticsEvent::MuteRequested {
            id: id.clone(),
            kind,
        });
        Ok(())
    }

    /// Limit how many remote video streams are received; -1 means unlimited
    pub async fn set_last_n(&self, last_n: i32) -> Result<()> {
        if last_n < -1 {
            return Err(Error::InvalidInput(format!("last-N must be >= -1, got {last_n}")));
        }
        self.ensure_joined()?;
        let previous = std::mem::replace(&mut *self.last_n.write(), last_n);
        if previous == last_n {
            return Ok(());
        }
        self.signaling.send_last_n(last_n).await?;
        if let Some(p2p) = self.session(SessionKind::PeerToPeer) {
            p2p.set_video_transfer_active(last_n != 0).await?;
        }
        debug!(last_n, previous, "Last-N changed");
        Ok(())
    }

    // ---- manual P2P control (test mode) ----

    pub fn start_p2p_session(self: &Arc<Self>) -> Result<()> {
        self.ensure_joined()?;
        if !self.topology.config().test_mode {
            return Err(Error::Usage("manual P2P control requires test mode".to_string()));
        }
        if self.session(SessionKind::PeerToPeer).is_some() {
            return Err(Error::Usage("P2P session already exists".to_string()));
        }
        self.spawn_p2p_start(true);
        Ok(())
    }

    pub async fn stop_p2p_session(&self) -> Result<()> {
        self.ensure_joined()?;
        if !self.topology.config().test_mode {
            return Err(Error::Usage("manual P2P control requires test mode".to_string()));
        }
        if !self.stop_p2p(P2pStopCause::Requested).await {
            return Err(Error::NotFound("P2P session".to_string()));
        }
        Ok(())
    }

    // ---- inbound signaling ----

    /// Apply one inbound signaling event
    pub async fn handle_signal(self: &Arc<Self>, event: SignalingEvent) -> Result<()> {
        if self.lifecycle() == Lifecycle::Left {
            debug!(event = ?event, "Ignoring signal after leave");
            return Ok(());
        }

        match event {
            SignalingEvent::MemberJoined { id, jid, info } => {
                self.on_member_joined(id, jid, info).await;
                Ok(())
            }
            SignalingEvent::MemberLeft { id } => {
                self.on_member_left(&id).await;
                Ok(())
            }
            SignalingEvent::MemberKicked { id, actor } => self.on_member_kicked(id, actor).await,
            SignalingEvent::MemberUpdated { id, info } => {
                self.on_member_updated(&id, info).await;
                Ok(())
            }
            SignalingEvent::PropertiesChanged { visitor_count } => {
                if self.topology.set_visitor_count(visitor_count) {
                    debug!(visitor_count, "Visitor count changed");
                    self.evaluate_topology(Reevaluation::Other).await;
                }
                Ok(())
            }
            SignalingEvent::TranscriptionChanged { active } => {
                if self.topology.set_transcription_active(active) {
                    info!(active, "Transcription status changed");
                    self.evaluate_topology(Reevaluation::Other).await;
                }
                Ok(())
            }
            SignalingEvent::SessionInitiate {
                from,
                sid,
                p2p: true,
                offer,
            } => {
                self.on_p2p_offer(from, sid, offer).await;
                Ok(())
            }
            SignalingEvent::SessionInitiate {
                from,
                sid,
                p2p: false,
                offer,
            } => self.on_bridge_offer(from, sid, offer).await,
            SignalingEvent::SessionAccept { from, p2p, answer } => {
                self.on_session_accept(SessionKind::from_p2p(p2p), &from, answer);
                Ok(())
            }
            SignalingEvent::SourceAdd { p2p, sources } => {
                self.on_remote_source_add(SessionKind::from_p2p(p2p), sources).await
            }
            SignalingEvent::SourceRemove { p2p, sources } => {
                self.on_remote_source_remove(SessionKind::from_p2p(p2p), sources).await
            }
            SignalingEvent::TransportInfo { p2p, candidates } => {
                let kind = SessionKind::from_p2p(p2p);
                match self.session(kind) {
                    Some(session) => session.add_remote_candidates(&candidates).await,
                    None => {
                        debug!(kind = %kind, "Transport-info without a session");
                        Ok(())
                    }
                }
            }
            SignalingEvent::SessionTerminate { p2p: true, reason } => {
                self.on_p2p_terminated(reason).await;
                Ok(())
            }
            SignalingEvent::SessionTerminate { p2p: false, reason } => {
                self.on_bridge_terminated(reason).await
            }
            SignalingEvent::SourceUpdated {
                source,
                owner,
                muted,
                video_type,
            } => {
                let changes = self.sources.on_source_updated(
                    &self.roster,
                    source,
                    owner,
                    SourcePresence { muted, video_type },
                );
                for change in changes {
                    if let SourceChange::TrackRemoved(track) = &change {
                        for session in self.sessions() {
                            session.forget_remote_track(&track.track_id);
                        }
                    }
                    self.emit(change.into());
                }
                Ok(())
            }
            SignalingEvent::SourceRemoved { source, owner } => {
                if let Some(change) = self.sources.on_source_removed(&source, &owner) {
                    self.emit(change.into());
                }
                Ok(())
            }
        }
    }

    async fn on_member_joined(self: &Arc<Self>, id: ParticipantId, jid: Jid, info: ParticipantInfo) {
        if id == self.local_id {
            debug!(participant_id = %id, "Ignoring own member-joined");
            return;
        }
        if self.roster.add(id.clone(), jid, info).is_none() {
            return;
        }
        self.emit(ConferenceEvent::UserJoined { id: id.clone() });

        // Bridge tracks can be announced before their owner's presence
        if !self.topology.is_p2p_active() {
            if let Some(jvb) = self.session(SessionKind::Bridge) {
                let owned: Vec<_> = jvb
                    .remote_tracks()
                    .into_iter()
                    .filter(|t| t.owner() == Some(&id))
                    .collect();
                self.attach_remote_tracks(&owned);
            }
        }

        self.evaluate_topology(Reevaluation::MemberJoined).await;
    }

    async fn on_member_left(self: &Arc<Self>, id: &ParticipantId) {
        let Some(departure) = self.roster.remove(id) else {
            debug!(participant_id = %id, "Member-left for unknown participant");
            return;
        };
        for track in &departure.tracks {
            self.emit(ConferenceEvent::TrackRemoved {
                track: TrackInfo::from(track.as_ref()),
            });
        }
        for change in self.sources.remove_sources_of(id) {
            self.emit(change.into());
        }
        self.emit(ConferenceEvent::UserLeft { id: id.clone() });

        self.evaluate_topology(Reevaluation::MemberLeft).await;
    }

    async fn on_member_kicked(self: &Arc<Self>, id: ParticipantId, actor: Option<ParticipantId>) -> Result<()> {
        self.emit(ConferenceEvent::Kicked {
            id: id.clone(),
            actor: actor.clone(),
        });
        if id == self.local_id {
            warn!(actor = ?actor, "Kicked from the conference");
            return self.leave(Some("kicked")).await;
        }
        info!(participant_id = %id, actor = ?actor, "Participant kicked");
        self.on_member_left(&id).await;
        Ok(())
    }

    async fn on_member_updated(self: &Arc<Self>, id: &ParticipantId, info: ParticipantInfo) {
        let Some(participant) = self.roster.get(id) else {
            debug!(participant_id = %id, "Member-updated for unknown participant");
            return;
        };
        if participant.update(info).is_some() {
            self.emit(ConferenceEvent::UserRoleChanged {
                id: id.clone(),
                role: participant.role(),
            });
        }
        // Bot flags can change with an update
        self.evaluate_topology(Reevaluation::Other).await;
    }

    async fn decline(&self, to: &Jid, sid: &SessionId, reason: TerminationReason) {
        info!(to = %to, sid = %sid, reason = %reason, "Declining session-initiate");
        if let Err(e) = self.signaling.send_session_terminate(to, sid, &reason).await {
            warn!(to = %to, error = %e, "Failed to send decline");
        }
    }

    async fn on_bridge_offer(&self, from: Jid, sid: SessionId, offer: SessionDescription) -> Result<()> {
        if !self.signaling.is_focus(&from) {
            warn!(from = %from, "Rejecting bridge session-initiate from a non-focus sender");
            self.decline(
                &from,
                &sid,
                TerminationReason::new(TerminateCondition::SecurityError, "only focus can start new sessions"),
            )
            .await;
            return Ok(());
        }
        if self.session(SessionKind::Bridge).is_some() {
            warn!(from = %from, "Duplicate bridge session-initiate");
            self.decline(
                &from,
                &sid,
                TerminationReason::new(TerminateCondition::Busy, "duplicate session-initiate"),
            )
            .await;
            return Ok(());
        }

        let session = self.create_session(sid, SessionKind::Bridge, from);
        self.set_session(SessionKind::Bridge, Some(Arc::clone(&session)));
        let tracks = self.local_tracks();

        let remote = match session.accept_offer(&offer, tracks.clone()).await {
            Ok(remote) => remote,
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Bridge offer/answer failed");
                self.take_session(SessionKind::Bridge);
                self.emit(ConferenceEvent::ConferenceFailed {
                    reason: FailureReason::OfferAnswerFailed {
                        detail: e.to_string(),
                    },
                });
                return Err(e);
            }
        };
        self.sources.note_remote_sources(&offer.sources);

        if self.topology.is_p2p_active() {
            if let Err(e) = session.set_media_transfer_active(false).await {
                warn!(session_id = %session.id, error = %e, "Failed to suspend bridge media");
            }
        } else {
            for track in &tracks {
                track.attach(&session.id);
            }
            self.attach_remote_tracks(&remote);
        }

        info!(session_id = %session.id, remote_tracks = remote.len(), "Bridge session started");
        self.emit(ConferenceEvent::MediaSessionStarted { p2p: false });
        Ok(())
    }

    /// Incoming peer-to-peer offer; every rejection is a decline, never an error
    async fn on_p2p_offer(&self, from: Jid, sid: SessionId, offer: SessionDescription) {
        if !self.p2p_allowed() {
            self.decline(&from, &sid, TerminationReason::new(TerminateCondition::Decline, "P2P disabled"))
                .await;
            return;
        }

        let _transition = self.transition.lock().await;
        if self.session(SessionKind::PeerToPeer).is_some() {
            self.decline(
                &from,
                &sid,
                TerminationReason::new(TerminateCondition::Busy, "P2P session already exists"),
            )
            .await;
            return;
        }
        if !self.topology.should_be_in_p2p(&self.roster) {
            let reason = TerminationReason::new(TerminateCondition::Decline, "P2P requirements not met");
            self.analytics.send_event(AnalyticsEvent::P2pDeclined {
                reason: reason.clone(),
            });
            self.decline(&from, &sid, reason).await;
            return;
        }
        let Some(peer) = self.roster.find_by_jid(&from) else {
            warn!(from = %from, "P2P offer from a sender outside the conference");
            self.decline(
                &from,
                &sid,
                TerminationReason::new(TerminateCondition::SecurityError, "sender not in conference"),
            )
            .await;
            return;
        };

        self.topology.cancel_deferred();
        let session = self.create_session(sid, SessionKind::PeerToPeer, from);
        match session.accept_offer(&offer, self.local_tracks()).await {
            Ok(remote) => {
                self.set_session(SessionKind::PeerToPeer, Some(Arc::clone(&session)));
                self.sources.note_remote_sources(&offer.sources);
                info!(session_id = %session.id, peer = %peer.id, remote_tracks = remote.len(), "P2P offer accepted");
                self.emit(ConferenceEvent::MediaSessionStarted { p2p: true });
            }
            Err(e) => {
                warn!(session_id = %session.id, peer = %peer.id, error = %e, "Rejecting P2P offer");
                let reason = if e.is_negotiation_failure() {
                    TerminationReason::new(TerminateCondition::Decline, e.to_string())
                } else {
                    P2pStopCause::NegotiationFailed.termination_reason()
                };
                let options = TerminateOptions {
                    reason,
                    send_session_terminate: true,
                };
                if let Err(e) = session.terminate(options).await {
                    debug!(error = %e, "Failed to send P2P rejection");
                }
            }
        }
    }

    fn on_session_accept(&self, kind: SessionKind, from: &Jid, answer: SessionDescription) {
        let Some(session) = self.session(kind) else {
            warn!(kind = %kind, from = %from, "Session-accept without a session");
            return;
        };
        if session.remote != *from {
            warn!(kind = %kind, from = %from, expected = %session.remote, "Session-accept from unexpected sender");
            return;
        }
        if let Err(e) = session.deliver_answer(answer) {
            warn!(session_id = %session.id, error = %e, "Dropping session-accept");
        }
    }

    async fn on_remote_source_add(&self, kind: SessionKind, sources: Vec<SourceDescriptor>) -> Result<()> {
        let Some(session) = self.session(kind) else {
            debug!(kind = %kind, "Source-add without a session");
            return Ok(());
        };
        let change = session.update_remote_sources(&sources, &[]).await?;
        self.sources.note_remote_sources(&sources);
        if self.active_kind() == kind {
            self.attach_remote_tracks(&change.added);
        }
        Ok(())
    }

    async fn on_remote_source_remove(&self, kind: SessionKind, names: Vec<SourceName>) -> Result<()> {
        let Some(session) = self.session(kind) else {
            debug!(kind = %kind, "Source-remove without a session");
            return Ok(());
        };
        let change = session.update_remote_sources(&[], &names).await?;
        self.detach_remote_tracks(&change.removed);
        for change in self.sources.forget_remote_sources(&names) {
            self.emit(change.into());
        }
        Ok(())
    }

    async fn on_p2p_terminated(self: &Arc<Self>, reason: TerminationReason) {
        if self.session(SessionKind::PeerToPeer).is_none() {
            debug!(reason = %reason, "P2P session-terminate without a session");
            return;
        }
        let restart = reason.is_restart_request();
        info!(reason = %reason, restart, "Remote ended the P2P session");
        self.stop_p2p(P2pStopCause::RemoteTerminated).await;
        if restart {
            self.evaluate_topology(Reevaluation::Other).await;
        }
    }

    async fn on_bridge_terminated(&self, reason: TerminationReason) -> Result<()> {
        let Some(session) = self.take_session(SessionKind::Bridge) else {
            debug!(reason = %reason, "Bridge session-terminate without a session");
            return Ok(());
        };
        info!(session_id = %session.id, reason = %reason, "Focus ended the bridge session");
        self.recovery.reset(SessionKind::Bridge);
        if !self.topology.is_p2p_active() {
            self.detach_remote_tracks(&session.remote_tracks());
        }
        session
            .terminate(TerminateOptions {
                reason,
                send_session_terminate: false,
            })
            .await
    }

    fn attach_remote_tracks(&self, tracks: &[Arc<MediaTrack>]) {
        for track in tracks {
            let Some(owner) = track.owner().and_then(|id| self.roster.get(id)) else {
                debug!(track_id = %track.id, "Remote track owner not in roster");
                continue;
            };
            if let Some(presence) = track
                .source_name()
                .and_then(|name| self.sources.source_presence(&name))
            {
                track.set_muted(presence.muted);
                if presence.video_type.is_some() {
                    track.set_video_type(presence.video_type);
                }
            }
            if owner.add_track(Arc::clone(track)) {
                self.emit(ConferenceEvent::TrackAdded {
                    track: TrackInfo::from(track.as_ref()),
                });
            }
        }
    }

    fn detach_remote_tracks(&self, tracks: &[Arc<MediaTrack>]) {
        for track in tracks {
            let Some(owner) = track.owner().and_then(|id| self.roster.get(id)) else {
                continue;
            };
            if owner.remove_track(track) {
                self.emit(ConferenceEvent::TrackRemoved {
                    track: TrackInfo::from(track.as_ref()),
                });
            }
        }
    }

    // ---- topology ----

    /// Start or stop P2P as the roster and conference properties require
    async fn evaluate_topology(self: &Arc<Self>, trigger: Reevaluation) {
        if self.lifecycle() != Lifecycle::Joined {
            return;
        }
        if self.topology.config().test_mode {
            debug!("P2P test mode; automatic switching disabled");
            return;
        }

        let conditions = self.topology.conditions(&self.roster);
        if !should_be_in_p2p(&conditions) {
            self.topology.cancel_deferred();
            if self.session(SessionKind::PeerToPeer).is_some() {
                let cause = stop_cause(&conditions).unwrap_or(P2pStopCause::Requested);
                self.stop_p2p(cause).await;
            }
            return;
        }

        if !self.p2p_allowed() || self.session(SessionKind::PeerToPeer).is_some() {
            return;
        }
        let Some(peer) = self.roster.only_peer() else {
            return;
        };
        match p2p_initiation(&self.local_id, &peer.id) {
            Initiation::Initiate => {}
            Initiation::AwaitRemote => {
                debug!(peer = %peer.id, "Waiting for the peer to start P2P");
                return;
            }
            Initiation::Conflict => {
                error!(local_id = %self.local_id, peer = %peer.id, "Peer has the same endpoint id; not starting P2P");
                return;
            }
        }

        if trigger == Reevaluation::MemberLeft {
            self.schedule_deferred_p2p();
        } else {
            self.spawn_p2p_start(false);
        }
    }

    fn schedule_deferred_p2p(self: &Arc<Self>) {
        let delay = self.topology.config().back_to_p2p_delay();
        let conference = Arc::downgrade(self);
        self.topology.schedule_deferred(move || {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(conference) = conference.upgrade() else {
                    return;
                };
                conference.topology.deferred_fired();
                conference.start_p2p(false).await;
            })
        });
    }

    fn spawn_p2p_start(self: &Arc<Self>, manual: bool) {
        let conference = Arc::clone(self);
        tokio::spawn(async move {
            conference.start_p2p(manual).await;
        });
    }

    /// Create the P2P session and invite the peer
    ///
    /// Conditions are checked again under the transition lock. A `manual`
    /// start skips the eligibility rule and the leader election.
    async fn start_p2p(&self, manual: bool) {
        {
            let _transition = self.transition.lock().await;
            if self.lifecycle() != Lifecycle::Joined || self.session(SessionKind::PeerToPeer).is_some() {
                return;
            }
            let Some(peer) = self.roster.only_peer() else {
                debug!("No single peer to start P2P with");
                return;
            };
            if !manual && !(self.p2p_allowed() && self.topology.should_be_in_p2p(&self.roster)) {
                debug!(peer = %peer.id, "P2P conditions no longer met");
                return;
            }
            match p2p_initiation(&self.local_id, &peer.id) {
                Initiation::Initiate => {}
                Initiation::AwaitRemote if manual => {}
                Initiation::AwaitRemote => return,
                Initiation::Conflict => {
                    error!(local_id = %self.local_id, "Peer has the same endpoint id; not starting P2P");
                    return;
                }
            }

            let session = self.create_session(SessionId::generate(), SessionKind::PeerToPeer, peer.jid.clone());
            self.set_session(SessionKind::PeerToPeer, Some(Arc::clone(&session)));
            info!(session_id = %session.id, peer = %peer.id, manual, "Starting P2P session");

            match session.invite(self.local_tracks()).await {
                Ok(remote) => {
                    let announced: Vec<SourceDescriptor> =
                        remote.iter().filter_map(|t| t.descriptor(&peer.id)).collect();
                    self.sources.note_remote_sources(&announced);
                    self.emit(ConferenceEvent::MediaSessionStarted { p2p: true });
                    return;
                }
                Err(Error::SessionTerminated(_)) => {
                    debug!(session_id = %session.id, "P2P invite aborted");
                    return;
                }
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "P2P invite failed");
                }
            }
        }
        self.stop_p2p(P2pStopCause::NegotiationFailed).await;
    }

    /// Move user-facing media onto the established P2P session
    async fn on_p2p_established(&self, session: &Arc<MediaSession>) {
        let _transition = self.transition.lock().await;
        let current = self.session(SessionKind::PeerToPeer);
        if !current.is_some_and(|c| Arc::ptr_eq(&c, session)) {
            debug!(session_id = %session.id, "Ignoring establishment of a stale P2P session");
            return;
        }
        if self.topology.is_p2p_active() {
            return;
        }
        let was_interrupted = self.recovery.is_interrupted(SessionKind::Bridge);

        if let Some(jvb) = self.session(SessionKind::Bridge) {
            self.detach_remote_tracks(&jvb.remote_tracks());
            if let Err(e) = jvb.set_media_transfer_active(false).await {
                warn!(session_id = %jvb.id, error = %e, "Failed to suspend bridge media");
            }
        }

        let video_active = *self.last_n.read() != 0;
        if let Err(e) = session.set_video_transfer_active(video_active).await {
            warn!(session_id = %session.id, error = %e, "Failed to apply last-N to P2P");
        }
        if let Err(e) = session.set_media_transfer_active(true).await {
            warn!(session_id = %session.id, error = %e, "Failed to resume P2P media");
        }
        for track in self.local_tracks() {
            track.attach(&session.id);
        }
        self.attach_remote_tracks(&session.remote_tracks());
        self.topology.set_p2p_active(true);

        info!(
            session_id = %session.id,
            mode_switches = self.topology.mode_switches(),
            "Switched to P2P"
        );
        self.emit(ConferenceEvent::P2pStatusChanged { active: true });
        self.analytics.send_event(AnalyticsEvent::P2pSwitched {
            active: true,
            cause: None,
        });
        self.follow_active_path(was_interrupted);
    }

    /// Tear down P2P and move media back to the bridge
    ///
    /// Returns false if there was no P2P session.
    async fn stop_p2p(&self, cause: P2pStopCause) -> bool {
        // A start still inviting holds the transition lock
        if let Some(session) = self.session(SessionKind::PeerToPeer) {
            session.abort_invite();
        }

        {
            let _transition = self.transition.lock().await;
            let Some(session) = self.take_session(SessionKind::PeerToPeer) else {
                return false;
            };
            let was_interrupted = self.recovery.is_interrupted(SessionKind::PeerToPeer);
            self.recovery.reset(SessionKind::PeerToPeer);
            let was_active = self.topology.set_p2p_active(false);
            info!(session_id = %session.id, cause = ?cause, was_active, "Stopping P2P session");

            if was_active {
                self.detach_remote_tracks(&session.remote_tracks());
            }
            // The peer never heard of a session that was aborted before its initiate
            let options = TerminateOptions {
                reason: cause.termination_reason(),
                send_session_terminate: cause != P2pStopCause::RemoteTerminated
                    && session.state() != SessionState::Idle,
            };
            if let Err(e) = session.terminate(options).await {
                warn!(session_id = %session.id, error = %e, "P2P terminate failed");
            }

            if let Some(jvb) = self.session(SessionKind::Bridge) {
                if let Err(e) = jvb.set_media_transfer_active(true).await {
                    warn!(session_id = %jvb.id, error = %e, "Failed to resume bridge media");
                }
                let local = self.local_tracks();
                if let Err(e) = jvb.sync_local_tracks(&local).await {
                    warn!(session_id = %jvb.id, error = %e, "Failed to re-sync local tracks with the bridge");
                }
                for track in &local {
                    track.attach(&jvb.id);
                }
                if was_active {
                    self.attach_remote_tracks(&jvb.remote_tracks());
                }
            }

            if was_active {
                self.emit(ConferenceEvent::P2pStatusChanged { active: false });
                self.analytics.send_event(AnalyticsEvent::P2pSwitched {
                    active: false,
                    cause: Some(cause),
                });
                self.follow_active_path(was_interrupted);
            }
        }

        if let Err(e) = self.send_presence_if_changed().await {
            warn!(error = %e, "Presence update after P2P stop failed");
        }
        true
    }

    /// Make the user-visible interrupted state follow a new active path
    fn follow_active_path(&self, was_interrupted: bool) {
        let interrupted = self.recovery.is_interrupted(self.active_kind());
        match (was_interrupted, interrupted) {
            (false, true) => self.emit(ConferenceEvent::ConnectionInterrupted),
            (true, false) => self.emit(ConferenceEvent::ConnectionRestored),
            _ => {}
        }
    }

    // ---- connectivity ----

    /// ICE connection state reported by the transport of `kind`
    pub async fn on_ice_connection_state(self: &Arc<Self>, kind: SessionKind, state: IceConnectionState) {
        let Some(session) = self.session(kind) else {
            debug!(kind = %kind, state = ?state, "ICE state for a missing session");
            return;
        };
        let Some(signal) = session.on_ice_state(state) else {
            return;
        };

        match signal {
            SessionSignal::Established => {
                self.recovery.on_connected(kind);
                if kind.is_p2p() {
                    self.on_p2p_established(&session).await;
                }
                self.emit(ConferenceEvent::ConnectionEstablished { p2p: kind.is_p2p() });
            }
            SessionSignal::Interrupted => {
                if self.recovery.on_interrupted(kind) && self.active_kind() == kind {
                    warn!(session_id = %session.id, kind = %kind, "Connection interrupted");
                    self.emit(ConferenceEvent::ConnectionInterrupted);
                }
            }
            SessionSignal::Restored => {
                if self.recovery.on_connected(kind) && self.active_kind() == kind {
                    info!(session_id = %session.id, kind = %kind, "Connection restored");
                    self.emit(ConferenceEvent::ConnectionRestored);
                }
            }
            SessionSignal::IceFailed => {
                if !kind.is_p2p() && self.recovery.on_interrupted(kind) && self.active_kind() == kind {
                    self.emit(ConferenceEvent::ConnectionInterrupted);
                }
                self.on_ice_failed(kind, session).await;
            }
        }
    }

    async fn on_ice_failed(self: &Arc<Self>, kind: SessionKind, session: Arc<MediaSession>) {
        if self.lifecycle() == Lifecycle::Left {
            return;
        }
        match self.recovery.on_ice_failed(kind) {
            RecoveryAction::Fallback => {
                warn!(session_id = %session.id, "P2P ICE failed; falling back to the bridge");
                self.stop_p2p(P2pStopCause::IceFailed).await;
            }
            RecoveryAction::Restart { attempt, delay } => {
                self.analytics.send_event(AnalyticsEvent::IceRestartScheduled {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                self.schedule_ice_restart(kind, session, delay);
            }
            RecoveryAction::Exhausted { attempts } => {
                error!(session_id = %session.id, kind = %kind, attempts, "ICE restarts exhausted");
                session.mark_failed();
                self.analytics
                    .send_event(AnalyticsEvent::IceRestartsExhausted { attempts });
                self.emit(ConferenceEvent::ConferenceFailed {
                    reason: FailureReason::IceFailed,
                });
            }
        }
    }

    fn schedule_ice_restart(self: &Arc<Self>, kind: SessionKind, session: Arc<MediaSession>, delay: Duration) {
        let conference = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(conference) = conference.upgrade() else {
                return;
            };
            conference.recovery.timer_fired(kind);
            if let Err(e) = session.restart_ice().await {
                // Counts as another failure of the streak
                warn!(session_id = %session.id, error = %e, "ICE restart failed");
                conference.on_ice_failed(kind, session).await;
            }
        });
        self.recovery.set_timer(kind, timer);
    }

    /// Forward locally gathered candidates as transport-info
    pub async fn on_local_candidates(&self, kind: SessionKind, candidates: Vec<String>) -> Result<()> {
        let Some(session) = self.session(kind) else {
            return Err(Error::NotFound(format!("{kind} session")));
        };
        session.send_local_candidates(&candidates).await
    }
}
