//! Topology decisions: peer-to-peer or bridge
//!
//! This module handles:
//! - The two-party eligibility rule
//! - Deterministic leader election between the two endpoints
//! - Topology state (active path, visitors, transcription, mode switches)
//! - The single deferred switch-back timer
//!
//! The conference facade executes the switches; everything here is
//! synchronous and lock-scoped.

use crate::events::P2pStopCause;
use crate::roster::Roster;
use crate::types::ParticipantId;
use confab_core::config::P2pConfig;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Outcome of the two-peer leader election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiation {
    /// Local endpoint sends the offer
    Initiate,
    /// Remote endpoint is expected to send the offer
    AwaitRemote,
    /// Both ids are equal; nobody initiates
    Conflict,
}

/// The endpoint with the lexicographically smaller id initiates
#[must_use]
pub fn p2p_initiation(local: &ParticipantId, remote: &ParticipantId) -> Initiation {
    match local.cmp(remote) {
        std::cmp::Ordering::Less => Initiation::Initiate,
        std::cmp::Ordering::Greater => Initiation::AwaitRemote,
        std::cmp::Ordering::Equal => Initiation::Conflict,
    }
}

/// Inputs of the eligibility rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct P2pConditions {
    /// Remote participants in the roster
    pub participant_count: usize,
    pub has_bot: bool,
    pub visitor_count: u32,
    pub transcription_active: bool,
}

/// Exactly one non-bot peer, no visitors, no transcription
#[must_use]
pub fn should_be_in_p2p(conditions: &P2pConditions) -> bool {
    conditions.participant_count == 1
        && !conditions.has_bot
        && conditions.visitor_count == 0
        && !conditions.transcription_active
}

/// Why an existing peer-to-peer session has to go, if it does
#[must_use]
pub fn stop_cause(conditions: &P2pConditions) -> Option<P2pStopCause> {
    if conditions.participant_count == 0 {
        Some(P2pStopCause::PeerLeft)
    } else if conditions.participant_count > 1 {
        Some(P2pStopCause::ThirdParticipantJoined)
    } else if conditions.has_bot {
        Some(P2pStopCause::BotJoined)
    } else if conditions.visitor_count > 0 {
        Some(P2pStopCause::VisitorsJoined)
    } else if conditions.transcription_active {
        Some(P2pStopCause::TranscriptionEnabled)
    } else {
        None
    }
}

pub struct Topology {
    config: P2pConfig,
    p2p_active: RwLock<bool>,
    visitor_count: RwLock<u32>,
    transcription_active: RwLock<bool>,
    deferred_start: Mutex<Option<JoinHandle<()>>>,
    mode_switches: AtomicU64,
}

impl Topology {
    #[must_use]
    pub fn new(config: P2pConfig) -> Self {
        Self {
            config,
            p2p_active: RwLock::new(false),
            visitor_count: RwLock::new(0),
            transcription_active: RwLock::new(false),
            deferred_start: Mutex::new(None),
            mode_switches: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &P2pConfig {
        &self.config
    }

    #[must_use]
    pub fn conditions(&self, roster: &Roster) -> P2pConditions {
        P2pConditions {
            participant_count: roster.len(),
            has_bot: roster.has_bot(),
            visitor_count: *self.visitor_count.read(),
            transcription_active: *self.transcription_active.read(),
        }
    }

    #[must_use]
    pub fn should_be_in_p2p(&self, roster: &Roster) -> bool {
        should_be_in_p2p(&self.conditions(roster))
    }

    #[must_use]
    pub fn is_p2p_active(&self) -> bool {
        *self.p2p_active.read()
    }

    /// Returns true when the flag changed; each change counts as a mode switch
    pub fn set_p2p_active(&self, active: bool) -> bool {
        let mut current = self.p2p_active.write();
        if *current == active {
            return false;
        }
        *current = active;
        self.mode_switches.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drop all state on leave; not counted as a mode switch
    pub fn reset(&self) {
        self.cancel_deferred();
        *self.p2p_active.write() = false;
        *self.visitor_count.write() = 0;
        *self.transcription_active.write() = false;
    }

    #[must_use]
    pub fn mode_switches(&self) -> u64 {
        self.mode_switches.load(Ordering::Relaxed)
    }

    /// Returns true when the count changed
    pub fn set_visitor_count(&self, count: u32) -> bool {
        let mut current = self.visitor_count.write();
        let changed = *current != count;
        *current = count;
        changed
    }

    /// Returns true when the flag changed
    pub fn set_transcription_active(&self, active: bool) -> bool {
        let mut current = self.transcription_active.write();
        let changed = *current != active;
        *current = active;
        changed
    }

    /// Arm the deferred switch-back timer with the task `spawn` returns
    ///
    /// Only one timer may be pending; a second request is logged and dropped.
    pub fn schedule_deferred<F>(&self, spawn: F) -> bool
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut deferred = self.deferred_start.lock();
        if deferred.as_ref().is_some_and(|handle| !handle.is_finished()) {
            error!("Deferred P2P start already scheduled");
            return false;
        }
        *deferred = Some(spawn());
        debug!(delay_ms = self.config.back_to_p2p_delay_ms, "Deferred P2P start scheduled");
        true
    }

    #[must_use]
    pub fn has_deferred(&self) -> bool {
        self.deferred_start
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Called by the timer task itself when it fires
    pub fn deferred_fired(&self) {
        self.deferred_start.lock().take();
    }

    /// Returns true if a pending timer was cancelled
    pub fn cancel_deferred(&self) -> bool {
        match self.deferred_start.lock().take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                debug!("Deferred P2P start cancelled");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::{BotType, ParticipantInfo};
    use crate::types::Jid;
    use std::time::Duration;

    fn eligible() -> P2pConditions {
        P2pConditions {
            participant_count: 1,
            ..P2pConditions::default()
        }
    }

    #[test]
    fn test_leader_election() {
        let a = ParticipantId::from("aaa1111");
        let b = ParticipantId::from("bbb2222");
        assert_eq!(p2p_initiation(&a, &b), Initiation::Initiate);
        assert_eq!(p2p_initiation(&b, &a), Initiation::AwaitRemote);
        assert_eq!(p2p_initiation(&a, &a), Initiation::Conflict);
    }

    #[test]
    fn test_eligibility_rule() {
        assert!(should_be_in_p2p(&eligible()));
        assert!(!should_be_in_p2p(&P2pConditions::default()));
        assert!(!should_be_in_p2p(&P2pConditions {
            participant_count: 2,
            ..eligible()
        }));
        assert!(!should_be_in_p2p(&P2pConditions {
            has_bot: true,
            ..eligible()
        }));
        assert!(!should_be_in_p2p(&P2pConditions {
            visitor_count: 3,
            ..eligible()
        }));
        assert!(!should_be_in_p2p(&P2pConditions {
            transcription_active: true,
            ..eligible()
        }));
    }

    #[test]
    fn test_stop_cause_priority() {
        assert_eq!(stop_cause(&eligible()), None);
        assert_eq!(
            stop_cause(&P2pConditions::default()),
            Some(P2pStopCause::PeerLeft)
        );
        assert_eq!(
            stop_cause(&P2pConditions {
                participant_count: 2,
                has_bot: true,
                ..eligible()
            }),
            Some(P2pStopCause::ThirdParticipantJoined)
        );
        assert_eq!(
            stop_cause(&P2pConditions {
                has_bot: true,
                ..eligible()
            }),
            Some(P2pStopCause::BotJoined)
        );
        assert_eq!(
            stop_cause(&P2pConditions {
                visitor_count: 1,
                transcription_active: true,
                ..eligible()
            }),
            Some(P2pStopCause::VisitorsJoined)
        );
    }

    #[test]
    fn test_conditions_follow_roster() {
        let topology = Topology::new(P2pConfig::default());
        let roster = Roster::new();
        roster.add(
            ParticipantId::from("bot"),
            Jid::from("room@conference.example.com/bot"),
            ParticipantInfo {
                bot_type: Some(BotType::Poltergeist),
                ..ParticipantInfo::default()
            },
        );
        assert!(!topology.should_be_in_p2p(&roster));

        roster.clear();
        roster.add(
            ParticipantId::from("peer"),
            Jid::from("room@conference.example.com/peer"),
            ParticipantInfo::default(),
        );
        assert!(topology.should_be_in_p2p(&roster));
        assert!(topology.set_transcription_active(true));
        assert!(!topology.set_transcription_active(true));
        assert!(!topology.should_be_in_p2p(&roster));
    }

    #[test]
    fn test_mode_switch_counter() {
        let topology = Topology::new(P2pConfig::default());
        assert!(topology.set_p2p_active(true));
        assert!(!topology.set_p2p_active(true));
        assert!(topology.set_p2p_active(false));
        assert_eq!(topology.mode_switches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_deferred_timer() {
        let topology = Topology::new(P2pConfig::default());
        let sleeper = || tokio::spawn(tokio::time::sleep(Duration::from_secs(5)));

        assert!(topology.schedule_deferred(sleeper));
        assert!(!topology.schedule_deferred(sleeper));
        assert!(topology.has_deferred());

        assert!(topology.cancel_deferred());
        assert!(!topology.cancel_deferred());
        assert!(!topology.has_deferred());
        assert!(topology.schedule_deferred(sleeper));
    }
}
