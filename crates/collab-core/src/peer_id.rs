//! PeerId: identity of one editing participant.
//!
//! The same value is the Loro peer of the local document, the key of the
//! awareness map, and the `peerId` of presence messages. It prints as 16
//! lowercase hex chars in logs and on every wire.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("invalid peer ID {0:?}: expected 16 hex chars")]
    InvalidFormat(String),
    #[error("peer ID must be non-zero")]
    Zero,
}

/// Identity of a participant, ordered numerically.
///
/// # Examples
/// ```
/// use collab_core::PeerId;
///
/// let parsed: PeerId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// assert_eq!(parsed.to_string(), "a1b2c3d4e5f67890");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Generate a new random peer ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PeerIdError::InvalidFormat(s.to_string()));
        }
        let id = u64::from_str_radix(s, 16)
            .map_err(|_| PeerIdError::InvalidFormat(s.to_string()))?;
        if id == 0 {
            return Err(PeerIdError::Zero);
        }
        Ok(Self(id))
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<PeerId> for u64 {
    fn from(peer_id: PeerId) -> u64 {
        peer_id.0
    }
}

// Hex string on every wire, so JSON readers without 64-bit integers keep it exact.
impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_zero_padded() {
        assert_eq!(PeerId(0xff).to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_uppercase_hex() {
        let peer_id: PeerId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(peer_id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_reject_wrong_length_and_non_hex() {
        assert!("a1b2c3d4e5f6789".parse::<PeerId>().is_err());
        assert!("a1b2c3d4e5f678901".parse::<PeerId>().is_err());
        assert!("ghijklmnopqrstuv".parse::<PeerId>().is_err());
        assert!("".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_reject_zero() {
        assert_eq!(
            "0000000000000000".parse::<PeerId>(),
            Err(PeerIdError::Zero)
        );
    }

    #[test]
    fn test_generate_not_zero() {
        for _ in 0..1000 {
            assert_ne!(PeerId::generate().as_u64(), 0);
        }
    }

    #[test]
    fn test_ordering_is_numeric() {
        assert!(PeerId::from(2) < PeerId::from(10));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let peer_id = PeerId::from(0x1234);
        let json = serde_json::to_string(&peer_id).unwrap();
        assert_eq!(json, "\"0000000000001234\"");
        let parsed: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, peer_id);
    }
}
