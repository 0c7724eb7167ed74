//! Session and peer identity types.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Longest accepted session identifier.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Prefix shared by every peer identifier this crate derives.
const PEER_PREFIX: &str = "syncroom";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("session id is empty")]
    Empty,

    #[error("session id is longer than {MAX_SESSION_ID_LEN} characters")]
    TooLong,

    #[error("session id contains whitespace or control characters")]
    InvalidCharacter,
}

/// Identifier of a shared session (room).
///
/// Both roles derive the host's address from it, so it must be stable and
/// printable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(raw: impl Into<String>) -> Result<Self, IdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(IdError::Empty);
        }
        if raw.chars().count() > MAX_SESSION_ID_LEN {
            return Err(IdError::TooLong);
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(IdError::InvalidCharacter);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl std::str::FromStr for SessionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of a participant as known to the peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The well-known identifier the host of `session` claims.
    ///
    /// Deterministic: every participant computes the same value.
    #[must_use]
    pub fn host_for(session: &SessionId) -> Self {
        Self(format!("{PEER_PREFIX}-{session}-host"))
    }

    /// A fresh follower identifier scoped to `session`.
    #[must_use]
    pub fn follower_for(session: &SessionId) -> Self {
        Self(format!("{PEER_PREFIX}-{session}-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the star topology a participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Follower,
}

impl Role {
    pub fn is_host(self) -> bool {
        self == Self::Host
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Follower => write!(f, "follower"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_rejects_empty_and_whitespace() {
        assert_eq!(SessionId::new(""), Err(IdError::Empty));
        assert_eq!(SessionId::new("room 1"), Err(IdError::InvalidCharacter));
        assert_eq!(
            SessionId::new("x".repeat(MAX_SESSION_ID_LEN + 1)),
            Err(IdError::TooLong)
        );
        assert!(SessionId::new("room-1").is_ok());
    }

    #[test]
    fn host_id_is_deterministic() {
        let session = SessionId::new("party").unwrap();
        assert_eq!(PeerId::host_for(&session), PeerId::host_for(&session));
        assert_eq!(PeerId::host_for(&session).as_str(), "syncroom-party-host");
    }

    #[test]
    fn follower_ids_are_unique_and_scoped() {
        let session = SessionId::new("party").unwrap();
        let a = PeerId::follower_for(&session);
        let b = PeerId::follower_for(&session);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("syncroom-party-"));
    }

    #[test]
    fn session_id_deserialize_validates() {
        let ok: SessionId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(ok.as_str(), "abc");
        assert!(serde_json::from_str::<SessionId>("\"\"").is_err());
    }
}
