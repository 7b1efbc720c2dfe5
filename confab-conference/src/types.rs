//! Common identifier types used throughout the conference implementation

use crate::track::MediaKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque endpoint id of a conference participant
///
/// Ordering is plain lexicographic on the underlying string; the two-party
/// leader election relies on it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Full signaling address of an endpoint (room@domain/resource)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(String);

impl Jid {
    pub fn new(jid: impl Into<String>) -> Self {
        Self(jid.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resource part of the address, if any
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, resource)| resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Jid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stable name of a media source: `<endpoint>-<a|v><index>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceName(String);

impl SourceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Name for the `index`-th source of `kind` owned by `owner`
    #[must_use]
    pub fn for_track(owner: &ParticipantId, kind: MediaKind, index: usize) -> Self {
        Self(format!("{owner}-{}{index}", kind.short_name()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Endpoint id encoded in the name
    #[must_use]
    pub fn owner_hint(&self) -> Option<ParticipantId> {
        self.0
            .rsplit_once('-')
            .map(|(owner, _)| ParticipantId::from(owner))
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one media session (bridge or peer-to-peer)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(sid: impl Into<String>) -> Self {
        Self(sid.into())
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a local or remote track object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_name_format() {
        let owner = ParticipantId::from("abcd1234");
        assert_eq!(
            SourceName::for_track(&owner, MediaKind::Audio, 0).as_str(),
            "abcd1234-a0"
        );
        assert_eq!(
            SourceName::for_track(&owner, MediaKind::Video, 1).as_str(),
            "abcd1234-v1"
        );
        assert_eq!(
            SourceName::for_track(&owner, MediaKind::Video, 1).owner_hint(),
            Some(owner)
        );
    }

    #[test]
    fn test_participant_ordering_is_lexicographic() {
        assert!(ParticipantId::from("aaa1111") < ParticipantId::from("bbb2222"));
        assert!(ParticipantId::from("b") > ParticipantId::from("abc"));
    }

    #[test]
    fn test_jid_resource() {
        let jid = Jid::from("room@conference.example.com/abcd1234");
        assert_eq!(jid.resource(), Some("abcd1234"));
        assert_eq!(Jid::from("focus.example.com").resource(), None);
    }

    #[test]
    fn test_generated_session_ids_differ() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
