//! Recording fakes for the external collaborators
//!
//! Every fake records what it was asked to do so tests can assert on the
//! outbound side without a signaling server or a real peer connection.

use crate::error::{Error, Result};
use crate::events::{AnalyticsEvent, ConferenceEvent, TerminationReason};
use crate::external::AnalyticsSink;
use crate::session::SessionKind;
use crate::signaling::{PresenceUpdate, SignalingChannel};
use crate::track::{MediaKind, MediaTrack, VideoType};
use crate::transport::{
    PeerTransport, SdpSemantics, SessionDescription, SourceDescriptor, TransportFactory,
};
use crate::types::{Jid, ParticipantId, SessionId, SourceName};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const FOCUS_JID: &str = "room@conference.example.com/focus";

pub fn member_jid(id: &str) -> Jid {
    Jid::new(format!("room@conference.example.com/{id}"))
}

pub fn audio_source(owner: &str, index: usize) -> SourceDescriptor {
    let owner = ParticipantId::from(owner);
    SourceDescriptor {
        name: SourceName::for_track(&owner, MediaKind::Audio, index),
        owner,
        kind: MediaKind::Audio,
        video_type: None,
        muted: false,
    }
}

pub fn video_source(owner: &str, index: usize) -> SourceDescriptor {
    let owner = ParticipantId::from(owner);
    SourceDescriptor {
        name: SourceName::for_track(&owner, MediaKind::Video, index),
        owner,
        kind: MediaKind::Video,
        video_type: Some(VideoType::Camera),
        muted: false,
    }
}

pub fn offer_with(sources: Vec<SourceDescriptor>) -> SessionDescription {
    SessionDescription {
        sdp: "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\n".to_string(),
        semantics: SdpSemantics::UnifiedPlan,
        sources,
    }
}

pub fn answer_with(sources: Vec<SourceDescriptor>) -> SessionDescription {
    offer_with(sources)
}

/// Local track with its source name already assigned
pub fn local_track(kind: MediaKind, name: &str) -> Arc<MediaTrack> {
    let track = Arc::new(MediaTrack::local(kind, None));
    track
        .assign_source_name(SourceName::from(name))
        .expect("fresh track has no source name");
    track
}

/// Let spawned tasks run without advancing a paused clock
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Drain everything currently buffered in an event receiver
pub fn drain_events(rx: &mut broadcast::Receiver<ConferenceEvent>) -> Vec<ConferenceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    CreateOffer(Vec<SourceName>),
    CreateAnswer(Vec<SourceName>),
    SetRemoteAnswer,
    SetLocalSources(Vec<SourceName>),
    UpdateRemoteSources {
        added: Vec<SourceName>,
        removed: Vec<SourceName>,
    },
    AddRemoteCandidates(usize),
    RestartIce,
    SetMediaTransfer {
        audio: bool,
        video: bool,
    },
    Close,
}

fn names(sources: &[SourceDescriptor]) -> Vec<SourceName> {
    sources.iter().map(|s| s.name.clone()).collect()
}

pub struct FakeTransport {
    semantics: SdpSemantics,
    calls: Mutex<Vec<TransportCall>>,
    fail_answers: AtomicBool,
    fail_local_sources: AtomicBool,
    fail_restarts: AtomicBool,
    apply_delay: Mutex<Option<Duration>>,
    offer_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransport {
    pub fn new(semantics: SdpSemantics) -> Self {
        Self {
            semantics,
            calls: Mutex::new(Vec::new()),
            fail_answers: AtomicBool::new(false),
            fail_local_sources: AtomicBool::new(false),
            fail_restarts: AtomicBool::new(false),
            apply_delay: Mutex::new(None),
            offer_delay: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }

    pub fn fail_answers(&self, fail: bool) {
        self.fail_answers.store(fail, Ordering::SeqCst);
    }

    pub fn fail_local_sources(&self, fail: bool) {
        self.fail_local_sources.store(fail, Ordering::SeqCst);
    }

    pub fn fail_restarts(&self, fail: bool) {
        self.fail_restarts.store(fail, Ordering::SeqCst);
    }

    /// Make every local description application take `delay`
    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        *self.apply_delay.lock() = delay;
    }

    /// Make offer creation take `delay`
    pub fn set_offer_delay(&self, delay: Option<Duration>) {
        *self.offer_delay.lock() = delay;
    }

    pub fn local_applications(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, TransportCall::SetLocalSources(_)))
            .count()
    }

    pub fn max_concurrent_applications(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| **c == TransportCall::RestartIce)
            .count()
    }

    /// Most recent media transfer toggle as `(audio, video)`
    pub fn last_media_transfer(&self) -> Option<(bool, bool)> {
        self.calls.lock().iter().rev().find_map(|c| match c {
            TransportCall::SetMediaTransfer { audio, video } => Some((*audio, *video)),
            _ => None,
        })
    }

    pub fn last_local_sources(&self) -> Option<Vec<SourceName>> {
        self.calls.lock().iter().rev().find_map(|c| match c {
            TransportCall::SetLocalSources(sources) => Some(sources.clone()),
            _ => None,
        })
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    fn semantics(&self) -> SdpSemantics {
        self.semantics
    }

    async fn create_offer(&self, local: &[SourceDescriptor]) -> Result<SessionDescription> {
        self.record(TransportCall::CreateOffer(names(local)));
        let delay = *self.offer_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(SessionDescription {
            semantics: self.semantics,
            ..offer_with(local.to_vec())
        })
    }

    async fn create_answer(
        &self,
        _offer: &SessionDescription,
        local: &[SourceDescriptor],
    ) -> Result<SessionDescription> {
        self.record(TransportCall::CreateAnswer(names(local)));
        if self.fail_answers.load(Ordering::SeqCst) {
            return Err(Error::Transport("setRemoteDescription failed".to_string()));
        }
        Ok(SessionDescription {
            semantics: self.semantics,
            ..offer_with(local.to_vec())
        })
    }

    async fn set_remote_answer(&self, _answer: &SessionDescription) -> Result<()> {
        self.record(TransportCall::SetRemoteAnswer);
        Ok(())
    }

    async fn set_local_sources(&self, local: &[SourceDescriptor]) -> Result<SessionDescription> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.apply_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_local_sources.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("setLocalDescription failed".to_string()));
        }
        self.record(TransportCall::SetLocalSources(names(local)));
        Ok(offer_with(local.to_vec()))
    }

    async fn update_remote_sources(
        &self,
        added: &[SourceDescriptor],
        removed: &[SourceName],
    ) -> Result<()> {
        self.record(TransportCall::UpdateRemoteSources {
            added: names(added),
            removed: removed.to_vec(),
        });
        Ok(())
    }

    async fn add_remote_candidates(&self, candidates: &[String]) -> Result<()> {
        self.record(TransportCall::AddRemoteCandidates(candidates.len()));
        Ok(())
    }

    async fn restart_ice(&self) -> Result<()> {
        self.record(TransportCall::RestartIce);
        if self.fail_restarts.load(Ordering::SeqCst) {
            return Err(Error::Transport("ICE restart failed".to_string()));
        }
        Ok(())
    }

    async fn set_media_transfer_active(&self, audio: bool, video: bool) -> Result<()> {
        self.record(TransportCall::SetMediaTransfer { audio, video });
        Ok(())
    }

    async fn close(&self) {
        self.record(TransportCall::Close);
    }
}

/// Hands out [`FakeTransport`]s and keeps them for inspection
pub struct FakeTransportFactory {
    semantics: SdpSemantics,
    created: Mutex<Vec<(SessionKind, Arc<FakeTransport>)>>,
    offer_delay: Mutex<Option<Duration>>,
}

impl Default for FakeTransportFactory {
    fn default() -> Self {
        Self::with_semantics(SdpSemantics::UnifiedPlan)
    }
}

impl FakeTransportFactory {
    pub fn with_semantics(semantics: SdpSemantics) -> Self {
        Self {
            semantics,
            created: Mutex::new(Vec::new()),
            offer_delay: Mutex::new(None),
        }
    }

    /// Offer creation delay for transports created from now on
    pub fn set_offer_delay(&self, delay: Option<Duration>) {
        *self.offer_delay.lock() = delay;
    }

    /// Most recently created transport of `kind`
    pub fn last(&self, kind: SessionKind) -> Option<Arc<FakeTransport>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(k, _)| *k == kind)
            .map(|(_, t)| Arc::clone(t))
    }

    pub fn count(&self, kind: SessionKind) -> usize {
        self.created.lock().iter().filter(|(k, _)| *k == kind).count()
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create(&self, kind: SessionKind) -> Arc<dyn PeerTransport> {
        let transport = Arc::new(FakeTransport::new(self.semantics));
        transport.set_offer_delay(*self.offer_delay.lock());
        self.created.lock().push((kind, Arc::clone(&transport)));
        transport
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingCall {
    JoinRoom {
        password: Option<String>,
        replace_participant: bool,
    },
    LeaveRoom {
        reason: Option<String>,
    },
    Presence(PresenceUpdate),
    SessionInitiate {
        to: Jid,
        sid: SessionId,
    },
    SessionAccept {
        to: Jid,
        sid: SessionId,
    },
    SessionTerminate {
        to: Jid,
        sid: SessionId,
        reason: TerminationReason,
    },
    SourceAdd {
        to: Jid,
        sources: Vec<SourceDescriptor>,
    },
    SourceRemove {
        to: Jid,
        sources: Vec<SourceName>,
    },
    TransportInfo {
        to: Jid,
        candidates: Vec<String>,
    },
    MuteRequest {
        to: Jid,
        kind: MediaKind,
    },
    LastN(i32),
}

pub struct FakeSignaling {
    focus: Jid,
    calls: Mutex<Vec<SignalingCall>>,
}

impl Default for FakeSignaling {
    fn default() -> Self {
        Self {
            focus: Jid::from(FOCUS_JID),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeSignaling {
    pub fn calls(&self) -> Vec<SignalingCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: SignalingCall) {
        self.calls.lock().push(call);
    }

    pub fn initiates(&self) -> Vec<(Jid, SessionId)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SignalingCall::SessionInitiate { to, sid } => Some((to.clone(), sid.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn terminates(&self) -> Vec<(Jid, TerminationReason)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SignalingCall::SessionTerminate { to, reason, .. } => {
                    Some((to.clone(), reason.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn presences(&self) -> Vec<PresenceUpdate> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SignalingCall::Presence(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn join_room(&self, password: Option<&str>, replace_participant: bool) -> Result<()> {
        self.record(SignalingCall::JoinRoom {
            password: password.map(str::to_string),
            replace_participant,
        });
        Ok(())
    }

    async fn leave_room(&self, reason: Option<&str>) -> Result<()> {
        self.record(SignalingCall::LeaveRoom {
            reason: reason.map(str::to_string),
        });
        Ok(())
    }

    async fn send_presence(&self, presence: &PresenceUpdate) -> Result<()> {
        self.record(SignalingCall::Presence(presence.clone()));
        Ok(())
    }

    async fn send_session_initiate(
        &self,
        to: &Jid,
        sid: &SessionId,
        _offer: &SessionDescription,
    ) -> Result<()> {
        self.record(SignalingCall::SessionInitiate {
            to: to.clone(),
            sid: sid.clone(),
        });
        Ok(())
    }

    async fn send_session_accept(
        &self,
        to: &Jid,
        sid: &SessionId,
        _answer: &SessionDescription,
    ) -> Result<()> {
        self.record(SignalingCall::SessionAccept {
            to: to.clone(),
            sid: sid.clone(),
        });
        Ok(())
    }

    async fn send_session_terminate(
        &self,
        to: &Jid,
        sid: &SessionId,
        reason: &TerminationReason,
    ) -> Result<()> {
        self.record(SignalingCall::SessionTerminate {
            to: to.clone(),
            sid: sid.clone(),
            reason: reason.clone(),
        });
        Ok(())
    }

    async fn send_source_add(
        &self,
        to: &Jid,
        _sid: &SessionId,
        sources: &[SourceDescriptor],
    ) -> Result<()> {
        self.record(SignalingCall::SourceAdd {
            to: to.clone(),
            sources: sources.to_vec(),
        });
        Ok(())
    }

    async fn send_source_remove(&self, to: &Jid, _sid: &SessionId, sources: &[SourceName]) -> Result<()> {
        self.record(SignalingCall::SourceRemove {
            to: to.clone(),
            sources: sources.to_vec(),
        });
        Ok(())
    }

    async fn send_transport_info(&self, to: &Jid, _sid: &SessionId, candidates: &[String]) -> Result<()> {
        self.record(SignalingCall::TransportInfo {
            to: to.clone(),
            candidates: candidates.to_vec(),
        });
        Ok(())
    }

    async fn send_mute_request(&self, to: &Jid, kind: MediaKind) -> Result<()> {
        self.record(SignalingCall::MuteRequest { to: to.clone(), kind });
        Ok(())
    }

    async fn send_last_n(&self, last_n: i32) -> Result<()> {
        self.record(SignalingCall::LastN(last_n));
        Ok(())
    }

    fn is_focus(&self, jid: &Jid) -> bool {
        *jid == self.focus
    }
}

#[derive(Default)]
pub struct RecordingAnalytics {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl RecordingAnalytics {
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&AnalyticsEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl AnalyticsSink for RecordingAnalytics {
    fn send_event(&self, event: AnalyticsEvent) {
        self.events.lock().push(event);
    }
}
