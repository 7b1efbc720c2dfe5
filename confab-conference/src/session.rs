//! Media session
//!
//! One [`MediaSession`] owns one transport-layer connection (bridge or
//! peer-to-peer), its local and remote track sets and the offer/answer
//! exchange that keeps them in sync with the remote side.
//!
//! Every operation that changes a description (invite, accept, renegotiation,
//! ICE restart) runs under the session's negotiation lock, so cycles on one
//! session never interleave. `tokio::sync::Mutex` is FIFO, which keeps
//! concurrent requests in call order.

use crate::error::{Error, Result};
use crate::events::{AnalyticsEvent, TerminateCondition, TerminationReason};
use crate::external::AnalyticsSink;
use crate::signaling::SignalingChannel;
use crate::track::MediaTrack;
use crate::transport::{IceConnectionState, PeerTransport, SessionDescription, SourceDescriptor};
use crate::types::{Jid, ParticipantId, SessionId, SourceName, TrackId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which path a session carries media over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Bridge,
    PeerToPeer,
}

impl SessionKind {
    #[must_use]
    pub const fn is_p2p(&self) -> bool {
        matches!(self, Self::PeerToPeer)
    }

    #[must_use]
    pub const fn from_p2p(p2p: bool) -> Self {
        if p2p {
            Self::PeerToPeer
        } else {
            Self::Bridge
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge => write!(f, "jvb"),
            Self::PeerToPeer => write!(f, "p2p"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Pending,
    Active,
    Interrupted,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// What an ICE state change means for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    Established,
    Interrupted,
    Restored,
    IceFailed,
}

/// Options for [`MediaSession::terminate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateOptions {
    pub reason: TerminationReason,
    pub send_session_terminate: bool,
}

impl Default for TerminateOptions {
    fn default() -> Self {
        Self {
            reason: TerminationReason::new(TerminateCondition::Success, "session ended"),
            send_session_terminate: true,
        }
    }
}

/// Remote tracks created or dropped by a remote source update
#[derive(Debug, Default)]
pub struct RemoteSourceChange {
    pub added: Vec<Arc<MediaTrack>>,
    pub removed: Vec<Arc<MediaTrack>>,
}

/// Collaborators shared by every session of a conference
#[derive(Clone)]
pub struct SessionContext {
    pub local_id: ParticipantId,
    pub signaling: Arc<dyn SignalingChannel>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub answer_timeout: Duration,
}

pub struct MediaSession {
    pub id: SessionId,
    pub kind: SessionKind,
    /// Address of the remote side (focus or peer)
    pub remote: Jid,
    transport: Arc<dyn PeerTransport>,
    context: SessionContext,
    state: RwLock<SessionState>,
    role: RwLock<Option<SessionRole>>,
    local_tracks: RwLock<Vec<Arc<MediaTrack>>>,
    remote_tracks: RwLock<Vec<Arc<MediaTrack>>>,
    created_at: DateTime<Utc>,
    established_at: RwLock<Option<DateTime<Utc>>>,
    ice_state: RwLock<IceConnectionState>,
    media_transfer_active: RwLock<bool>,
    video_transfer_active: RwLock<bool>,
    negotiation: tokio::sync::Mutex<()>,
    pending_answer: Mutex<Option<oneshot::Sender<SessionDescription>>>,
    invite_cancel: CancellationToken,
}

impl MediaSession {
    /// Peer-to-peer sessions start with media transfer suspended until the
    /// conference switches onto them.
    #[must_use]
    pub fn new(
        id: SessionId,
        kind: SessionKind,
        remote: Jid,
        transport: Arc<dyn PeerTransport>,
        context: SessionContext,
    ) -> Self {
        debug!(session_id = %id, kind = %kind, remote = %remote, "Media session created");
        Self {
            id,
            kind,
            remote,
            transport,
            context,
            state: RwLock::new(SessionState::Idle),
            role: RwLock::new(None),
            local_tracks: RwLock::new(Vec::new()),
            remote_tracks: RwLock::new(Vec::new()),
            created_at: Utc::now(),
            established_at: RwLock::new(None),
            ice_state: RwLock::new(IceConnectionState::New),
            media_transfer_active: RwLock::new(!kind.is_p2p()),
            video_transfer_active: RwLock::new(true),
            negotiation: tokio::sync::Mutex::new(()),
            pending_answer: Mutex::new(None),
            invite_cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    #[must_use]
    pub fn role(&self) -> Option<SessionRole> {
        *self.role.read()
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    #[must_use]
    pub fn ice_state(&self) -> IceConnectionState {
        *self.ice_state.read()
    }

    #[must_use]
    pub fn established_at(&self) -> Option<DateTime<Utc>> {
        *self.established_at.read()
    }

    #[must_use]
    pub fn local_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.local_tracks.read().clone()
    }

    #[must_use]
    pub fn remote_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.remote_tracks.read().clone()
    }

    #[must_use]
    pub fn is_media_transfer_active(&self) -> bool {
        *self.media_transfer_active.read()
    }

    #[must_use]
    pub fn is_video_transfer_active(&self) -> bool {
        *self.video_transfer_active.read()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(session_id = %self.id, kind = %self.kind, from = ?*current, to = ?state, "Session state changed");
            *current = state;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::SessionTerminated(self.id.clone()));
        }
        Ok(())
    }

    fn descriptors(&self, tracks: &[Arc<MediaTrack>]) -> Vec<SourceDescriptor> {
        tracks
            .iter()
            .filter_map(|track| track.descriptor(&self.context.local_id))
            .collect()
    }

    fn check_semantics(&self, description: &SessionDescription) -> Result<()> {
        let local = self.transport.semantics();
        if local != description.semantics {
            return Err(Error::SemanticsMismatch {
                local: local.to_string(),
                remote: description.semantics.to_string(),
            });
        }
        Ok(())
    }

    fn fail(&self, reason: &Error) {
        self.set_state(SessionState::Failed);
        self.context.analytics.send_event(AnalyticsEvent::SessionFailed {
            p2p: self.kind.is_p2p(),
            reason: reason.to_string(),
        });
    }

    /// Create remote tracks for sources not seen before
    fn add_remote_sources(&self, sources: &[SourceDescriptor]) -> Vec<Arc<MediaTrack>> {
        let mut remote = self.remote_tracks.write();
        let mut added = Vec::new();
        for descriptor in sources {
            if remote
                .iter()
                .any(|t| t.source_name().as_ref() == Some(&descriptor.name))
            {
                debug!(session_id = %self.id, source = %descriptor.name, "Remote source already known");
                continue;
            }
            let track = Arc::new(MediaTrack::remote(descriptor, self.kind.is_p2p()));
            track.attach(&self.id);
            remote.push(Arc::clone(&track));
            added.push(track);
        }
        added
    }

    /// Initiator path: offer, send session-initiate and wait for the answer
    ///
    /// The answer is handed in through [`MediaSession::deliver_answer`]. On
    /// timeout the session stays pending. [`MediaSession::abort_invite`] ends
    /// the invite at any point, and nothing is sent if it lands before the
    /// offer is ready.
    pub async fn invite(&self, tracks: Vec<Arc<MediaTrack>>) -> Result<Vec<Arc<MediaTrack>>> {
        let _negotiation = tokio::select! {
            biased;
            () = self.invite_cancel.cancelled() => return Err(Error::SessionTerminated(self.id.clone())),
            guard = self.negotiation.lock() => guard,
        };
        self.ensure_open()?;
        if self.state() != SessionState::Idle {
            return Err(Error::Usage(format!("session {} already negotiated", self.id)));
        }
        for track in &tracks {
            track.ensure_usable()?;
        }

        *self.role.write() = Some(SessionRole::Initiator);
        let descriptors = self.descriptors(&tracks);
        let offer = tokio::select! {
            biased;
            () = self.invite_cancel.cancelled() => {
                debug!(session_id = %self.id, kind = %self.kind, "Invite aborted while creating the offer");
                return Err(Error::SessionTerminated(self.id.clone()));
            }
            offer = self.transport.create_offer(&descriptors) => offer?,
        };

        let (answer_tx, answer_rx) = oneshot::channel();
        *self.pending_answer.lock() = Some(answer_tx);
        if self.invite_cancel.is_cancelled() {
            self.pending_answer.lock().take();
            return Err(Error::SessionTerminated(self.id.clone()));
        }
        *self.local_tracks.write() = tracks;
        self.set_state(SessionState::Pending);

        self.context
            .signaling
            .send_session_initiate(&self.remote, &self.id, &offer)
            .await?;
        info!(session_id = %self.id, kind = %self.kind, to = %self.remote, "Session initiate sent");

        let waited = tokio::select! {
            biased;
            () = self.invite_cancel.cancelled() => return Err(Error::SessionTerminated(self.id.clone())),
            waited = tokio::time::timeout(self.context.answer_timeout, answer_rx) => waited,
        };
        let answer = match waited {
            Ok(Ok(answer)) => answer,
            // Sender dropped: aborted or terminated while waiting
            Ok(Err(_)) => return Err(Error::SessionTerminated(self.id.clone())),
            Err(_) => {
                self.pending_answer.lock().take();
                warn!(
                    session_id = %self.id,
                    kind = %self.kind,
                    timeout_ms = self.context.answer_timeout.as_millis() as u64,
                    "No answer to session initiate"
                );
                self.context.analytics.send_event(AnalyticsEvent::AnswerTimeout {
                    p2p: self.kind.is_p2p(),
                });
                return Err(Error::AnswerTimeout(self.id.clone()));
            }
        };

        answer.validate()?;
        self.check_semantics(&answer)?;
        if let Err(e) = self.transport.set_remote_answer(&answer).await {
            self.fail(&e);
            return Err(e);
        }
        Ok(self.add_remote_sources(&answer.sources))
    }

    /// Hand the remote answer to a waiting [`MediaSession::invite`]
    pub fn deliver_answer(&self, answer: SessionDescription) -> Result<()> {
        let sender = self.pending_answer.lock().take().ok_or_else(|| {
            Error::ProtocolViolation(format!("unexpected session-accept for session {}", self.id))
        })?;
        sender
            .send(answer)
            .map_err(|_| Error::SessionTerminated(self.id.clone()))
    }

    /// Cancel a running or future invite; returns true if one was waiting
    /// for its answer
    pub fn abort_invite(&self) -> bool {
        self.invite_cancel.cancel();
        self.pending_answer.lock().take().is_some()
    }

    #[must_use]
    pub fn is_awaiting_answer(&self) -> bool {
        self.pending_answer.lock().is_some()
    }

    /// Responder path: apply a remote offer and send session-accept
    ///
    /// Returns the remote tracks announced in the offer.
    pub async fn accept_offer(
        &self,
        offer: &SessionDescription,
        tracks: Vec<Arc<MediaTrack>>,
    ) -> Result<Vec<Arc<MediaTrack>>> {
        let _negotiation = self.negotiation.lock().await;
        self.ensure_open()?;
        if self.state() != SessionState::Idle {
            return Err(Error::ProtocolViolation(format!(
                "session {} already negotiated",
                self.id
            )));
        }
        offer.validate()?;
        self.check_semantics(offer)?;

        *self.role.write() = Some(SessionRole::Responder);
        self.set_state(SessionState::Pending);

        let local = self.descriptors(&tracks);
        let answer = match self.transport.create_answer(offer, &local).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(session_id = %self.id, kind = %self.kind, error = %e, "Failed to apply remote offer");
                self.fail(&e);
                return Err(e);
            }
        };
        *self.local_tracks.write() = tracks;

        if let Err(e) = self
            .context
            .signaling
            .send_session_accept(&self.remote, &self.id, &answer)
            .await
        {
            self.fail(&e);
            return Err(e);
        }
        info!(session_id = %self.id, kind = %self.kind, sources = offer.sources.len(), "Session accepted");
        Ok(self.add_remote_sources(&offer.sources))
    }

    /// Run one renegotiation cycle producing the track set `change` returns
    async fn renegotiate<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&[Arc<MediaTrack>]) -> Vec<Arc<MediaTrack>>,
    {
        let _negotiation = self.negotiation.lock().await;
        self.ensure_open()?;

        let current = self.local_tracks.read().clone();
        let next = change(&current);
        if next.len() == current.len() && next.iter().zip(&current).all(|(a, b)| Arc::ptr_eq(a, b)) {
            return Ok(());
        }

        for track in &current {
            if !next.iter().any(|t| Arc::ptr_eq(t, track)) && track.binding().as_ref() == Some(&self.id) {
                track.detach();
            }
        }

        if self.state() == SessionState::Idle {
            *self.local_tracks.write() = next;
            return Ok(());
        }

        let before = self.descriptors(&current);
        let after = self.descriptors(&next);
        if let Err(e) = self.transport.set_local_sources(&after).await {
            warn!(session_id = %self.id, kind = %self.kind, error = %e, "Renegotiation failed");
            return Err(e);
        }
        *self.local_tracks.write() = next;

        let removed: Vec<SourceName> = before
            .iter()
            .filter(|old| !after.iter().any(|new| new.name == old.name))
            .map(|old| old.name.clone())
            .collect();
        let added: Vec<SourceDescriptor> = after
            .iter()
            .filter(|new| !before.iter().any(|old| old.name == new.name))
            .cloned()
            .collect();

        if !removed.is_empty() {
            self.context
                .signaling
                .send_source_remove(&self.remote, &self.id, &removed)
                .await?;
        }
        if !added.is_empty() {
            self.context
                .signaling
                .send_source_add(&self.remote, &self.id, &added)
                .await?;
        }
        debug!(
            session_id = %self.id,
            kind = %self.kind,
            added = added.len(),
            removed = removed.len(),
            "Renegotiation applied"
        );
        Ok(())
    }

    pub async fn add_tracks(&self, tracks: &[Arc<MediaTrack>]) -> Result<()> {
        for track in tracks {
            track.ensure_usable()?;
        }
        self.renegotiate(|current| {
            let mut next = current.to_vec();
            for track in tracks {
                if !next.iter().any(|t| Arc::ptr_eq(t, track)) {
                    next.push(Arc::clone(track));
                }
            }
            next
        })
        .await
    }

    pub async fn remove_track(&self, track: &Arc<MediaTrack>) -> Result<()> {
        self.renegotiate(|current| {
            current
                .iter()
                .filter(|t| !Arc::ptr_eq(t, track))
                .cloned()
                .collect()
        })
        .await
    }

    /// Swap `old` for `new` in one cycle; either side may be absent
    pub async fn replace_track(
        &self,
        old: Option<&Arc<MediaTrack>>,
        new: Option<&Arc<MediaTrack>>,
    ) -> Result<()> {
        if let Some(track) = new {
            track.ensure_usable()?;
        }
        self.renegotiate(|current| {
            let mut next: Vec<Arc<MediaTrack>> = Vec::with_capacity(current.len() + 1);
            let mut replaced = false;
            for track in current {
                match (old, new) {
                    (Some(old), Some(new)) if Arc::ptr_eq(track, old) => {
                        next.push(Arc::clone(new));
                        replaced = true;
                    }
                    (Some(old), None) if Arc::ptr_eq(track, old) => {}
                    _ => next.push(Arc::clone(track)),
                }
            }
            if let (false, Some(new)) = (replaced, new) {
                if !next.iter().any(|t| Arc::ptr_eq(t, new)) {
                    next.push(Arc::clone(new));
                }
            }
            next
        })
        .await
    }

    /// Drop a remote track whose source moved to another owner
    pub fn forget_remote_track(&self, track_id: &TrackId) -> Option<Arc<MediaTrack>> {
        let mut remote = self.remote_tracks.write();
        let index = remote.iter().position(|t| t.id == *track_id)?;
        let track = remote.remove(index);
        track.dispose();
        debug!(session_id = %self.id, track_id = %track_id, "Remote track forgotten");
        Some(track)
    }

    /// Make the local description send exactly `tracks`
    pub async fn sync_local_tracks(&self, tracks: &[Arc<MediaTrack>]) -> Result<()> {
        self.renegotiate(|_| tracks.to_vec()).await
    }

    /// Apply a remote source-add / source-remove
    pub async fn update_remote_sources(
        &self,
        added: &[SourceDescriptor],
        removed: &[SourceName],
    ) -> Result<RemoteSourceChange> {
        let _negotiation = self.negotiation.lock().await;
        self.ensure_open()?;
        self.transport.update_remote_sources(added, removed).await?;

        let mut change = RemoteSourceChange {
            added: self.add_remote_sources(added),
            removed: Vec::new(),
        };
        self.remote_tracks.write().retain(|track| {
            let gone = track
                .source_name()
                .is_some_and(|name| removed.contains(&name));
            if gone {
                change.removed.push(Arc::clone(track));
            }
            !gone
        });
        for track in &change.removed {
            track.dispose();
        }
        Ok(change)
    }

    pub async fn add_remote_candidates(&self, candidates: &[String]) -> Result<()> {
        self.ensure_open()?;
        self.transport.add_remote_candidates(candidates).await
    }

    pub async fn send_local_candidates(&self, candidates: &[String]) -> Result<()> {
        self.ensure_open()?;
        self.context
            .signaling
            .send_transport_info(&self.remote, &self.id, candidates)
            .await
    }

    pub async fn restart_ice(&self) -> Result<()> {
        let _negotiation = self.negotiation.lock().await;
        self.ensure_open()?;
        info!(session_id = %self.id, kind = %self.kind, "Restarting ICE");
        self.transport.restart_ice().await
    }

    /// Suspend or resume all media; no-op when already in that state
    pub async fn set_media_transfer_active(&self, active: bool) -> Result<()> {
        self.ensure_open()?;
        if self.is_media_transfer_active() == active {
            return Ok(());
        }
        let video = active && self.is_video_transfer_active();
        self.transport.set_media_transfer_active(active, video).await?;
        *self.media_transfer_active.write() = active;
        debug!(session_id = %self.id, kind = %self.kind, active, "Media transfer toggled");
        Ok(())
    }

    /// Suspend or resume video only
    pub async fn set_video_transfer_active(&self, active: bool) -> Result<()> {
        self.ensure_open()?;
        if self.is_video_transfer_active() == active {
            return Ok(());
        }
        // Applied on the next media resume
        if self.is_media_transfer_active() {
            self.transport.set_media_transfer_active(true, active).await?;
        }
        *self.video_transfer_active.write() = active;
        Ok(())
    }

    /// Map an ICE connection state onto a session signal
    pub fn on_ice_state(&self, ice: IceConnectionState) -> Option<SessionSignal> {
        *self.ice_state.write() = ice;
        let state = self.state();
        let signal = match (ice, state) {
            (_, SessionState::Terminated | SessionState::Failed | SessionState::Idle) => None,
            (ice, SessionState::Pending | SessionState::Active)
                if ice.is_connected() && self.established_at().is_none() =>
            {
                let now = Utc::now();
                *self.established_at.write() = Some(now);
                self.set_state(SessionState::Active);
                let duration_ms = (now - self.created_at).num_milliseconds().max(0) as u64;
                info!(session_id = %self.id, kind = %self.kind, duration_ms, "Session established");
                self.context.analytics.send_event(AnalyticsEvent::SessionEstablished {
                    p2p: self.kind.is_p2p(),
                    duration_ms,
                });
                Some(SessionSignal::Established)
            }
            (ice, SessionState::Interrupted) if ice.is_connected() => {
                self.set_state(SessionState::Active);
                Some(SessionSignal::Restored)
            }
            (IceConnectionState::Disconnected, SessionState::Active) => {
                self.set_state(SessionState::Interrupted);
                Some(SessionSignal::Interrupted)
            }
            (IceConnectionState::Failed, _) => {
                if state == SessionState::Active {
                    self.set_state(SessionState::Interrupted);
                }
                Some(SessionSignal::IceFailed)
            }
            _ => None,
        };
        if let Some(signal) = signal {
            debug!(session_id = %self.id, kind = %self.kind, ice = ?ice, signal = ?signal, "ICE state mapped");
        }
        signal
    }

    /// Recovery gave up on this session
    pub fn mark_failed(&self) {
        if !self.is_terminated() {
            self.set_state(SessionState::Failed);
        }
    }

    /// Tear the session down; calling it again is a no-op
    pub async fn terminate(&self, options: TerminateOptions) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state == SessionState::Terminated {
                return Ok(());
            }
            *state = SessionState::Terminated;
        }
        self.invite_cancel.cancel();
        self.pending_answer.lock().take();
        info!(
            session_id = %self.id,
            kind = %self.kind,
            reason = %options.reason,
            send = options.send_session_terminate,
            "Terminating session"
        );

        let sent = if options.send_session_terminate {
            self.context
                .signaling
                .send_session_terminate(&self.remote, &self.id, &options.reason)
                .await
        } else {
            Ok(())
        };

        for track in self.local_tracks.write().drain(..) {
            if track.binding().as_ref() == Some(&self.id) {
                track.detach();
            }
        }
        for track in self.remote_tracks.write().drain(..) {
            track.dispose();
        }
        self.transport.close().await;
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        answer_with, audio_source, local_track, offer_with, FakeSignaling, FakeTransport,
        RecordingAnalytics, SignalingCall, TransportCall,
    };
    use crate::track::MediaKind;
    use crate::transport::SdpSemantics;

    struct Fixture {
        session: Arc<MediaSession>,
        transport: Arc<FakeTransport>,
        signaling: Arc<FakeSignaling>,
        analytics: Arc<RecordingAnalytics>,
    }

    fn fixture(kind: SessionKind) -> Fixture {
        let transport = Arc::new(FakeTransport::new(SdpSemantics::UnifiedPlan));
        let signaling = Arc::new(FakeSignaling::default());
        let analytics = Arc::new(RecordingAnalytics::default());
        let context = SessionContext {
            local_id: ParticipantId::from("me"),
            signaling: signaling.clone(),
            analytics: analytics.clone(),
            answer_timeout: Duration::from_secs(15),
        };
        let session = Arc::new(MediaSession::new(
            SessionId::generate(),
            kind,
            Jid::from("room@conference.example.com/peer"),
            transport.clone(),
            context,
        ));
        Fixture {
            session,
            transport,
            signaling,
            analytics,
        }
    }

    async fn accepted(kind: SessionKind) -> Fixture {
        let f = fixture(kind);
        f.session
            .accept_offer(&offer_with(vec![audio_source("peer", 0)]), Vec::new())
            .await
            .unwrap();
        f
    }

    #[tokio::test]
    async fn test_accept_offer_creates_remote_tracks() {
        let f = fixture(SessionKind::Bridge);
        let remote = f
            .session
            .accept_offer(&offer_with(vec![audio_source("peer", 0)]), vec![local_track(MediaKind::Audio, "me-a0")])
            .await
            .unwrap();

        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].owner(), Some(&ParticipantId::from("peer")));
        assert_eq!(f.session.state(), SessionState::Pending);
        assert_eq!(f.session.role(), Some(SessionRole::Responder));
        assert!(f
            .signaling
            .calls()
            .iter()
            .any(|c| matches!(c, SignalingCall::SessionAccept { .. })));
    }

    #[tokio::test]
    async fn test_accept_offer_rejects_malformed_and_mismatched() {
        let f = fixture(SessionKind::PeerToPeer);
        let mut empty = offer_with(Vec::new());
        empty.sdp = String::new();
        assert!(matches!(
            f.session.accept_offer(&empty, Vec::new()).await,
            Err(Error::Negotiation(_))
        ));

        let mut plan_b = offer_with(Vec::new());
        plan_b.semantics = SdpSemantics::PlanB;
        assert!(matches!(
            f.session.accept_offer(&plan_b, Vec::new()).await,
            Err(Error::SemanticsMismatch { .. })
        ));
        assert_eq!(f.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_transport_error_fails_session() {
        let f = fixture(SessionKind::Bridge);
        f.transport.fail_answers(true);
        let result = f.session.accept_offer(&offer_with(Vec::new()), Vec::new()).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(f.session.state(), SessionState::Failed);
        assert_eq!(f.analytics.count(|e| matches!(e, AnalyticsEvent::SessionFailed { .. })), 1);
    }

    #[tokio::test]
    async fn test_invite_completes_when_answer_delivered() {
        let f = fixture(SessionKind::PeerToPeer);
        let session = Arc::clone(&f.session);
        let invite = tokio::spawn(async move {
            session
                .invite(vec![local_track(MediaKind::Audio, "me-a0")])
                .await
        });
        tokio::task::yield_now().await;
        while !f.session.is_awaiting_answer() {
            tokio::task::yield_now().await;
        }

        f.session
            .deliver_answer(answer_with(vec![audio_source("peer", 0)]))
            .unwrap();
        let remote = invite.await.unwrap().unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(f.session.role(), Some(SessionRole::Initiator));
        assert!(f
            .transport
            .calls()
            .contains(&TransportCall::SetRemoteAnswer));
        // Nothing waits any more
        assert!(f.session.deliver_answer(answer_with(Vec::new())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invite_times_out_and_stays_pending() {
        let f = fixture(SessionKind::PeerToPeer);
        let result = f.session.invite(Vec::new()).await;
        assert!(matches!(result, Err(Error::AnswerTimeout(_))));
        assert_eq!(f.session.state(), SessionState::Pending);
        assert_eq!(f.analytics.count(|e| matches!(e, AnalyticsEvent::AnswerTimeout { p2p: true })), 1);
    }

    #[tokio::test]
    async fn test_idle_renegotiation_only_records() {
        let f = fixture(SessionKind::Bridge);
        f.session
            .add_tracks(&[local_track(MediaKind::Audio, "me-a0")])
            .await
            .unwrap();
        assert_eq!(f.session.local_tracks().len(), 1);
        assert!(f.transport.calls().is_empty());
        assert!(f.signaling.calls().is_empty());
    }

    #[tokio::test]
    async fn test_renegotiation_announces_source_changes() {
        let f = accepted(SessionKind::Bridge).await;
        let audio = local_track(MediaKind::Audio, "me-a0");
        f.session.add_tracks(&[audio.clone()]).await.unwrap();
        f.session.remove_track(&audio).await.unwrap();

        let calls = f.signaling.calls();
        assert!(calls.iter().any(|c| matches!(c, SignalingCall::SourceAdd { sources, .. } if sources.len() == 1)));
        assert!(calls.iter().any(|c| matches!(c, SignalingCall::SourceRemove { sources, .. } if sources == &vec![SourceName::from("me-a0")])));
        assert!(f.session.local_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_failed_renegotiation_keeps_previous_set() {
        let f = accepted(SessionKind::Bridge).await;
        let audio = local_track(MediaKind::Audio, "me-a0");
        f.session.add_tracks(&[audio.clone()]).await.unwrap();

        f.transport.fail_local_sources(true);
        let video = local_track(MediaKind::Video, "me-v0");
        assert!(f.session.add_tracks(&[video]).await.is_err());
        let tracks = f.session.local_tracks();
        assert_eq!(tracks.len(), 1);
        assert!(Arc::ptr_eq(&tracks[0], &audio));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_track_cycles_are_serialized() {
        let f = accepted(SessionKind::Bridge).await;
        let first = local_track(MediaKind::Video, "me-v0");
        f.session.add_tracks(&[first.clone()]).await.unwrap();
        f.transport.set_apply_delay(Some(Duration::from_millis(50)));

        let second = local_track(MediaKind::Video, "me-v0");
        let third = local_track(MediaKind::Video, "me-v0");
        let (a, b) = futures::join!(
            f.session.replace_track(Some(&first), Some(&second)),
            f.session.replace_track(Some(&second), Some(&third)),
        );
        a.unwrap();
        b.unwrap();

        // One application for the add, then exactly two for the replaces
        assert_eq!(f.transport.local_applications(), 3);
        assert_eq!(f.transport.max_concurrent_applications(), 1);
        let tracks = f.session.local_tracks();
        assert_eq!(tracks.len(), 1);
        assert!(Arc::ptr_eq(&tracks[0], &third));
    }

    #[tokio::test]
    async fn test_ice_state_mapping() {
        let f = accepted(SessionKind::Bridge).await;
        assert_eq!(f.session.on_ice_state(IceConnectionState::Checking), None);
        assert_eq!(
            f.session.on_ice_state(IceConnectionState::Connected),
            Some(SessionSignal::Established)
        );
        assert!(f.session.established_at().is_some());
        assert_eq!(f.session.state(), SessionState::Active);
        assert_eq!(
            f.session.on_ice_state(IceConnectionState::Disconnected),
            Some(SessionSignal::Interrupted)
        );
        assert_eq!(
            f.session.on_ice_state(IceConnectionState::Connected),
            Some(SessionSignal::Restored)
        );
        assert_eq!(
            f.session.on_ice_state(IceConnectionState::Failed),
            Some(SessionSignal::IceFailed)
        );
        assert_eq!(f.session.state(), SessionState::Interrupted);
        assert_eq!(
            f.analytics.count(|e| matches!(e, AnalyticsEvent::SessionEstablished { p2p: false, .. })),
            1
        );

        f.session.mark_failed();
        assert_eq!(f.session.on_ice_state(IceConnectionState::Connected), None);
    }

    #[tokio::test]
    async fn test_media_transfer_toggle_is_idempotent() {
        let f = accepted(SessionKind::Bridge).await;
        f.session.set_media_transfer_active(false).await.unwrap();
        f.session.set_media_transfer_active(false).await.unwrap();
        f.session.set_video_transfer_active(false).await.unwrap();
        f.session.set_media_transfer_active(true).await.unwrap();

        let toggles: Vec<_> = f
            .transport
            .calls()
            .into_iter()
            .filter(|c| matches!(c, TransportCall::SetMediaTransfer { .. }))
            .collect();
        assert_eq!(
            toggles,
            vec![
                TransportCall::SetMediaTransfer { audio: false, video: false },
                TransportCall::SetMediaTransfer { audio: true, video: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_source_updates() {
        let f = accepted(SessionKind::Bridge).await;
        let change = f
            .session
            .update_remote_sources(&[audio_source("other", 0), audio_source("peer", 0)], &[])
            .await
            .unwrap();
        // peer-a0 came with the offer already
        assert_eq!(change.added.len(), 1);
        assert_eq!(f.session.remote_tracks().len(), 2);

        let change = f
            .session
            .update_remote_sources(&[], &[SourceName::from("peer-a0")])
            .await
            .unwrap();
        assert_eq!(change.removed.len(), 1);
        assert!(change.removed[0].is_disposed());
        assert_eq!(f.session.remote_tracks().len(), 1);

        let other = f.session.remote_tracks()[0].clone();
        let forgotten = f.session.forget_remote_track(&other.id).unwrap();
        assert!(Arc::ptr_eq(&forgotten, &other));
        assert!(other.is_disposed());
        assert!(f.session.remote_tracks().is_empty());
        assert!(f.session.forget_remote_track(&other.id).is_none());
    }

    #[tokio::test]
    async fn test_terminate_is_terminal_and_idempotent() {
        let f = accepted(SessionKind::PeerToPeer).await;
        let audio = local_track(MediaKind::Audio, "me-a0");
        audio.attach(&f.session.id);
        f.session.add_tracks(&[audio.clone()]).await.unwrap();

        f.session.terminate(TerminateOptions::default()).await.unwrap();
        f.session.terminate(TerminateOptions::default()).await.unwrap();

        assert!(f.session.is_terminated());
        assert!(audio.binding().is_none());
        assert!(f.session.remote_tracks().is_empty());
        assert_eq!(
            f.signaling
                .calls()
                .iter()
                .filter(|c| matches!(c, SignalingCall::SessionTerminate { .. }))
                .count(),
            1
        );
        assert_eq!(
            f.transport.calls().iter().filter(|c| **c == TransportCall::Close).count(),
            1
        );
        assert!(matches!(
            f.session.restart_ice().await,
            Err(Error::SessionTerminated(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_offer_creation_sends_nothing() {
        let f = fixture(SessionKind::PeerToPeer);
        f.transport.set_offer_delay(Some(Duration::from_millis(100)));
        let session = Arc::clone(&f.session);
        let invite = tokio::spawn(async move { session.invite(Vec::new()).await });
        while f.transport.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        let started = tokio::time::Instant::now();
        assert!(!f.session.abort_invite());
        assert!(matches!(
            invite.await.unwrap(),
            Err(Error::SessionTerminated(_))
        ));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(f.session.state(), SessionState::Idle);
        assert!(!f
            .signaling
            .calls()
            .iter()
            .any(|c| matches!(c, SignalingCall::SessionInitiate { .. })));
    }

    #[tokio::test]
    async fn test_aborted_session_refuses_later_invite() {
        let f = fixture(SessionKind::PeerToPeer);
        f.session.abort_invite();
        assert!(matches!(
            f.session.invite(Vec::new()).await,
            Err(Error::SessionTerminated(_))
        ));
        assert!(f.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_releases_waiting_invite() {
        let f = fixture(SessionKind::PeerToPeer);
        let session = Arc::clone(&f.session);
        let invite = tokio::spawn(async move { session.invite(Vec::new()).await });
        while !f.session.is_awaiting_answer() {
            tokio::task::yield_now().await;
        }
        f.session
            .terminate(TerminateOptions {
                send_session_terminate: false,
                ..TerminateOptions::default()
            })
            .await
            .unwrap();
        assert!(matches!(
            invite.await.unwrap(),
            Err(Error::SessionTerminated(_))
        ));
    }
}
