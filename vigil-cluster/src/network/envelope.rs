//! Wire format shared by the RPC client and server.
//!
//! Every request is a `{"type", "value"}` envelope. The type is checked
//! against [`MessageType`] before the value is decoded, so a peer cannot make
//! the server instantiate anything outside the allow-list.

use crate::error::{ClusterError, ClusterResult};
use crate::types::ClusterNodeId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Path handled by the receiving node.
pub const RPC_PATH: &str = "/cluster/rpc";

/// Path that is forwarded to the current leader when received by a follower.
pub const LEADER_RPC_PATH: &str = "/cluster/rpc/leader";

/// Allow-listed message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Raft log replication.
    AppendEntries,
    /// Raft election.
    Vote,
    /// Raft snapshot transfer.
    InstallSnapshot,
    /// Propose a command to the log.
    Propose,
    /// Ask to be admitted to the membership.
    Join,
    /// Ask to be removed from the membership.
    Leave,
    /// Liveness and load probe.
    Probe,
    /// Node status query.
    Status,
}

impl MessageType {
    /// Every accepted message type.
    pub const ALL: [MessageType; 8] = [
        MessageType::AppendEntries,
        MessageType::Vote,
        MessageType::InstallSnapshot,
        MessageType::Propose,
        MessageType::Join,
        MessageType::Leave,
        MessageType::Probe,
        MessageType::Status,
    ];

    /// Tag used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::AppendEntries => "AppendEntries",
            MessageType::Vote => "Vote",
            MessageType::InstallSnapshot => "InstallSnapshot",
            MessageType::Propose => "Propose",
            MessageType::Join => "Join",
            MessageType::Leave => "Leave",
            MessageType::Probe => "Probe",
            MessageType::Status => "Status",
        }
    }

    /// Whether the `/leader` path forwards this type.
    pub fn is_leader_bound(self) -> bool {
        matches!(
            self,
            MessageType::Propose | MessageType::Join | MessageType::Leave
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ClusterError::UnknownMessageType(s.to_string()))
    }
}

/// A type-tagged request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload, decoded only after the tag is accepted.
    #[serde(default)]
    pub value: Value,
}

impl Envelope {
    /// Wrap a payload.
    pub fn new<T: Serialize + ?Sized>(kind: MessageType, value: &T) -> ClusterResult<Self> {
        Ok(Self {
            kind: kind.as_str().to_string(),
            value: serde_json::to_value(value)?,
        })
    }

    /// Checked message type.
    pub fn message_type(&self) -> ClusterResult<MessageType> {
        self.kind.parse()
    }

    /// Decode the payload.
    pub fn decode<T: DeserializeOwned>(self) -> ClusterResult<T> {
        Ok(serde_json::from_value(self.value)?)
    }
}

/// Error as carried in a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Machine-readable kind, see [`ClusterError::kind`].
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Leader hint for `not_leader`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<ClusterNodeId>,
}

/// Response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    /// Whether the call succeeded.
    pub ok: bool,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl RpcReply {
    /// Successful reply carrying `value`.
    pub fn success<T: Serialize>(value: &T) -> ClusterResult<Self> {
        Ok(Self {
            ok: true,
            value: Some(serde_json::to_value(value)?),
            error: None,
        })
    }

    /// Failed reply.
    pub fn failure(err: &ClusterError) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(WireError {
                kind: err.kind().to_string(),
                message: err.to_string(),
                leader: err.leader_hint(),
            }),
        }
    }

    /// Decode into the caller's result type.
    pub fn into_result<T: DeserializeOwned>(self) -> ClusterResult<T> {
        if self.ok {
            return Ok(serde_json::from_value(self.value.unwrap_or(Value::Null))?);
        }
        let err = self.error.unwrap_or(WireError {
            kind: "network".to_string(),
            message: "reply without error details".to_string(),
            leader: None,
        });
        Err(ClusterError::from_wire(&err.kind, err.message, err.leader))
    }
}

/// Payload of [`MessageType::Join`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Stable id of the joining node.
    pub node_id: ClusterNodeId,
    /// Its public endpoint.
    pub addr: String,
    /// Its tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Answer to [`MessageType::Join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReply {
    /// Leader that admitted the node.
    pub leader: ClusterNodeId,
    /// Log index the joiner must apply before it is operational.
    pub catch_up_index: Option<u64>,
}

/// Payload of [`MessageType::Leave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    /// Node to remove.
    pub node_id: ClusterNodeId,
}

/// Payload of [`MessageType::Probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRequest {
    /// Probing node.
    pub from: ClusterNodeId,
}

/// Answer to [`MessageType::Probe`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeReply {
    /// Probed node.
    pub node_id: ClusterNodeId,
    /// One-minute load average, `0.0` where unavailable.
    pub load: f64,
    /// Whether the node has caught up and runs work.
    pub operational: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_parses_from_its_tag() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
        let err = "System.Diagnostics.Process".parse::<MessageType>().unwrap_err();
        assert!(matches!(err, ClusterError::UnknownMessageType(_)));
    }

    #[test]
    fn envelope_uses_type_and_value_keys() {
        let env = Envelope::new(MessageType::Leave, &LeaveRequest { node_id: 4 }).unwrap();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "Leave");
        assert_eq!(json["value"]["node_id"], 4);

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.message_type().unwrap(), MessageType::Leave);
        assert_eq!(back.decode::<LeaveRequest>().unwrap().node_id, 4);
    }

    #[test]
    fn failure_reply_keeps_leader_hint() {
        let reply = RpcReply::failure(&ClusterError::NotLeader { leader: Some(2) });
        let wire = serde_json::to_string(&reply).unwrap();
        let back: RpcReply = serde_json::from_str(&wire).unwrap();
        let err = back.into_result::<()>().unwrap_err();
        assert_eq!(err.leader_hint(), Some(2));
        assert!(err.is_transient());
    }

    #[test]
    fn unit_success_decodes() {
        let reply = RpcReply::success(&()).unwrap();
        assert!(reply.into_result::<()>().is_ok());
    }
}
