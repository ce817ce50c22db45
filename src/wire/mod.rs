//! Control-plane wire protocol (§6): a tagged, self-describing payload
//! carried by the framed connection in `wire::control`.

pub mod control;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::flow::FlowKey;
use crate::id::NodeId;
use crate::routing::Cost;

#[derive(Debug)]
pub enum WireError {
    Io(std::io::Error),
    UnknownTag(u16),
    Malformed(bincode::Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::Io(e) => write!(f, "i/o error: {}", e),
            WireError::UnknownTag(t) => write!(f, "unknown frame tag: {}", t),
            WireError::Malformed(e) => write!(f, "malformed payload: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> WireError {
        WireError::Io(e)
    }
}

impl From<bincode::Error> for WireError {
    fn from(e: bincode::Error) -> WireError {
        WireError::Malformed(e)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Tag {
    Authentication = 0,
    AuthenticationRequired = 10,
    DistanceVector = 100,
    FlowCollection = 210,
    FlowAnnounce = 220,
    FlowRequest = 230,
    FlowCancel = 240,
    FlowWithdraw = 250,
    PingRequest = 300,
    PingResponse = 310,
}

impl Tag {
    fn from_u16(v: u16) -> Option<Tag> {
        Some(match v {
            0 => Tag::Authentication,
            10 => Tag::AuthenticationRequired,
            100 => Tag::DistanceVector,
            210 => Tag::FlowCollection,
            220 => Tag::FlowAnnounce,
            230 => Tag::FlowRequest,
            240 => Tag::FlowCancel,
            250 => Tag::FlowWithdraw,
            300 => Tag::PingRequest,
            310 => Tag::PingResponse,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Authentication {
    pub node_id: NodeId,
    pub flow_addr: SocketAddr,
    pub name: Option<String>,
}

/// A closed enumeration of every control-plane payload (§6's tag table).
#[derive(Clone, Debug)]
pub enum Message {
    Authentication(Authentication),
    AuthenticationRequired,
    DistanceVector(HashMap<NodeId, Cost>),
    FlowCollection(HashSet<FlowKey>),
    FlowAnnounce(FlowKey),
    FlowRequest(FlowKey, NodeId),
    FlowCancel(FlowKey, NodeId),
    FlowWithdraw(FlowKey),
    PingRequest,
    PingResponse,
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::Authentication(_) => Tag::Authentication,
            Message::AuthenticationRequired => Tag::AuthenticationRequired,
            Message::DistanceVector(_) => Tag::DistanceVector,
            Message::FlowCollection(_) => Tag::FlowCollection,
            Message::FlowAnnounce(_) => Tag::FlowAnnounce,
            Message::FlowRequest(..) => Tag::FlowRequest,
            Message::FlowCancel(..) => Tag::FlowCancel,
            Message::FlowWithdraw(_) => Tag::FlowWithdraw,
            Message::PingRequest => Tag::PingRequest,
            Message::PingResponse => Tag::PingResponse,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let tag = self.tag() as u16;
        let mut out = tag.to_le_bytes().to_vec();
        let body: Vec<u8> = match self {
            Message::Authentication(a) => bincode::serialize(a).expect("serializable"),
            Message::AuthenticationRequired => Vec::new(),
            Message::DistanceVector(v) => bincode::serialize(v).expect("serializable"),
            Message::FlowCollection(s) => bincode::serialize(s).expect("serializable"),
            Message::FlowAnnounce(k) => bincode::serialize(k).expect("serializable"),
            Message::FlowRequest(k, d) => bincode::serialize(&(k, d)).expect("serializable"),
            Message::FlowCancel(k, d) => bincode::serialize(&(k, d)).expect("serializable"),
            Message::FlowWithdraw(k) => bincode::serialize(k).expect("serializable"),
            Message::PingRequest => Vec::new(),
            Message::PingResponse => Vec::new(),
        };
        out.extend(body);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Message, WireError> {
        if buf.len() < 2 {
            return Err(WireError::Malformed(Box::new(bincode::ErrorKind::SizeLimit).into()));
        }
        let tag_val = u16::from_le_bytes([buf[0], buf[1]]);
        let tag = Tag::from_u16(tag_val).ok_or(WireError::UnknownTag(tag_val))?;
        let body = &buf[2..];
        Ok(match tag {
            Tag::Authentication => Message::Authentication(bincode::deserialize(body)?),
            Tag::AuthenticationRequired => Message::AuthenticationRequired,
            Tag::DistanceVector => Message::DistanceVector(bincode::deserialize(body)?),
            Tag::FlowCollection => Message::FlowCollection(bincode::deserialize(body)?),
            Tag::FlowAnnounce => Message::FlowAnnounce(bincode::deserialize(body)?),
            Tag::FlowRequest => {
                let (k, d) = bincode::deserialize(body)?;
                Message::FlowRequest(k, d)
            }
            Tag::FlowCancel => {
                let (k, d) = bincode::deserialize(body)?;
                Message::FlowCancel(k, d)
            }
            Tag::FlowWithdraw => Message::FlowWithdraw(bincode::deserialize(body)?),
            Tag::PingRequest => Message::PingRequest,
            Tag::PingResponse => Message::PingResponse,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_distance_vector() {
        let mut v = HashMap::new();
        v.insert(NodeId::from_bytes([1; 16]), 4u32);
        let msg = Message::DistanceVector(v.clone());
        let encoded = msg.encode();
        match Message::decode(&encoded).unwrap() {
            Message::DistanceVector(v2) => assert_eq!(v, v2),
            _ => panic!("wrong tag decoded"),
        }
    }

    #[test]
    fn round_trips_flow_announce() {
        let key = FlowKey {
            flow_id: "movie.Mjpeg".into(),
            origin: NodeId::from_bytes([7; 16]),
        };
        let msg = Message::FlowAnnounce(key.clone());
        let encoded = msg.encode();
        match Message::decode(&encoded).unwrap() {
            Message::FlowAnnounce(k2) => assert_eq!(key, k2),
            _ => panic!("wrong tag decoded"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = 42u16.to_le_bytes().to_vec();
        buf.extend([0, 0, 0]);
        assert!(matches!(Message::decode(&buf), Err(WireError::UnknownTag(42))));
    }
}
