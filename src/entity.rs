use std::fmt;

use serde::{Deserialize, Serialize};

/// Chat-protocol user identifier, e.g. `@alice:example.org`. Opaque to the
/// SFU; it only ever round-trips back into outbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device identifier within a user account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one group call. Conferences are keyed by this in the router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConferenceId(String);

impl ConferenceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What we assume identifies a participant in a call. No two participants of
/// one conference may share this triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantId {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub call_id: String,
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.device_id, self.call_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_id_display_joins_the_triple() {
        let id = ParticipantId {
            user_id: UserId::new("@alice:example.org"),
            device_id: DeviceId::new("DEVICE"),
            call_id: "call1".to_string(),
        };
        assert_eq!(id.to_string(), "@alice:example.org/DEVICE/call1");
    }

    #[test]
    fn ids_serialize_transparently() {
        let user: UserId = serde_json::from_str("\"@bob:example.org\"").unwrap();
        assert_eq!(user.as_str(), "@bob:example.org");
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"@bob:example.org\"");
    }
}
