//! Core identifier and session types.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Length of an identity in bytes.
pub const IDENTITY_LEN: usize = 32;

/// Opaque stable subject identifier assigned by the remote source.
///
/// Rendered as lowercase hex on the wire and in logs. Two sessions opened
/// by the same subject carry the same identity but distinct connection ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from a lowercase or uppercase hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != IDENTITY_LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; IDENTITY_LEN];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(Self(bytes))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        use fmt::Write;
        let mut s = String::with_capacity(IDENTITY_LEN * 2);
        for b in &self.0 {
            // write! to a String cannot fail
            let _ = write!(s, "{b:02x}");
        }
        s
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdentityVisitor;

        impl Visitor<'_> for IdentityVisitor {
            type Value = Identity;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a {}-character hex string", IDENTITY_LEN * 2)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Identity, E> {
                Identity::from_hex(v)
                    .ok_or_else(|| E::custom(format!("invalid identity hex: {v:?}")))
            }
        }

        deserializer.deserialize_str(IdentityVisitor)
    }
}

/// Per-session connection identifier minted by the server at handshake.
///
/// Distinguishes concurrent sessions of the same subject (e.g. two browser
/// tabs); presence entries are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Mint a fresh random id (used by tests and in-process fakes).
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session details captured from the server's handshake message.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Subject identity for this session.
    pub identity: Identity,
    /// Auth token, reusable to resume the same identity on reconnect.
    pub token: String,
    /// Server-minted id for this connection.
    pub connection_id: ConnectionId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity(fill: u8) -> Identity {
        Identity::from_bytes([fill; IDENTITY_LEN])
    }

    #[test]
    fn test_identity_hex_round_trip() {
        let id = test_identity(0xab);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Identity::from_hex(&hex), Some(id));
    }

    #[test]
    fn test_identity_rejects_bad_length() {
        assert!(Identity::from_hex("abcd").is_none());
        assert!(Identity::from_hex(&"a".repeat(63)).is_none());
        assert!(Identity::from_hex(&"a".repeat(65)).is_none());
    }

    #[test]
    fn test_identity_rejects_non_hex() {
        let s = "zz".repeat(IDENTITY_LEN);
        assert!(Identity::from_hex(&s).is_none());
    }

    #[test]
    fn test_identity_serde_as_hex_string() {
        let id = test_identity(0x01);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(IDENTITY_LEN)));

        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_identity_accepts_uppercase_hex() {
        let id = test_identity(0xab);
        let upper = id.to_hex().to_uppercase();
        assert_eq!(Identity::from_hex(&upper), Some(id));
    }

    #[test]
    fn test_connection_id_display_matches_uuid() {
        let uuid = Uuid::new_v4();
        let id = ConnectionId::from_uuid(uuid);
        assert_eq!(id.to_string(), uuid.to_string());
    }

    #[test]
    fn test_connection_ids_distinct() {
        assert_ne!(ConnectionId::random(), ConnectionId::random());
    }
}
