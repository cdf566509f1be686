use std::fmt::{Debug, Display, Formatter};

use bytes::{Buf, BufMut};

use crate::util::buf::{put_string, try_get_string};


/// Connection ids below this value are never assigned to a transport instance
pub const RESERVED_CONN_ID_MAX: u32 = 16;
/// Well-known connection id that every endpoint listens on in addition to its own
pub const DISCOVERY_CONN_ID: u32 = 0;

/// The address of one transport instance. `conn_id` is chosen randomly whenever a transport is
///  created, so a restarted endpoint with the same group and peer id is a different endpoint -
///  stale messages addressed to its predecessor are recognized by their conn id.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EndpointIdentity {
    pub group_id: String,
    pub peer_id: String,
    pub conn_id: u32,
}

impl Debug for EndpointIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}@{}]", self.group_id, self.peer_id, self.conn_id)
    }
}

impl Display for EndpointIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl EndpointIdentity {
    pub fn new(group_id: impl Into<String>, peer_id: impl Into<String>, conn_id: u32) -> EndpointIdentity {
        EndpointIdentity {
            group_id: group_id.into(),
            peer_id: peer_id.into(),
            conn_id,
        }
    }

    /// the identity that reaches any transport of the given group and peer, regardless of its
    ///  conn id
    pub fn discovery(group_id: impl Into<String>, peer_id: impl Into<String>) -> EndpointIdentity {
        Self::new(group_id, peer_id, DISCOVERY_CONN_ID)
    }

    pub fn has_reserved_conn_id(&self) -> bool {
        self.conn_id < RESERVED_CONN_ID_MAX
    }

    pub fn is_same_peer(&self, group_id: &str, peer_id: &str) -> bool {
        self.group_id == group_id && self.peer_id == peer_id
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.group_id);
        put_string(buf, &self.peer_id);
        buf.put_u32(self.conn_id);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<EndpointIdentity> {
        let group_id = try_get_string(buf)?;
        let peer_id = try_get_string(buf)?;
        let conn_id = buf.try_get_u32()?;
        Ok(EndpointIdentity {
            group_id,
            peer_id,
            conn_id,
        })
    }
}

/// What a transport tells the relay about itself when polling
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EndpointInfo {
    pub identity: EndpointIdentity,
    /// also receive messages addressed to [DISCOVERY_CONN_ID]
    pub enable_discovery: bool,
}
