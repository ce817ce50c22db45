//! Node identity: an opaque 128-bit value rendered as hex.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;

/// A process-unique node identifier.
///
/// Ordered lexicographically on its hex rendering, which is what the
/// routing table's tie-break (§4.1) relies on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; 16]);

impl NodeId {
    pub fn generate() -> NodeId {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> NodeId {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl serde::Serialize for NodeId {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D>(d: D) -> Result<NodeId, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        NodeId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug)]
pub struct ParseNodeIdError;

impl fmt::Display for ParseNodeIdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid node id: expected 32 hex characters")
    }
}

impl std::error::Error for ParseNodeIdError {}

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    fn from_str(s: &str) -> Result<NodeId, ParseNodeIdError> {
        if s.len() != 32 {
            return Err(ParseNodeIdError);
        }
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            let hi = s.as_bytes()[i * 2];
            let lo = s.as_bytes()[i * 2 + 1];
            let hi = (hi as char).to_digit(16).ok_or(ParseNodeIdError)?;
            let lo = (lo as char).to_digit(16).ok_or(ParseNodeIdError)?;
            *b = ((hi << 4) | lo) as u8;
        }
        Ok(NodeId(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_hex() {
        let id = NodeId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert_eq!(NodeId::from_str(&s).unwrap(), id);
    }

    #[test]
    fn rejects_short_strings() {
        assert!(NodeId::from_str("abcd").is_err());
    }
}
