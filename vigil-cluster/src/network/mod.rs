//! Network layer for cluster RPC.
//!
//! JSON envelopes over HTTP/1.1: a hyper server on every node and a reqwest
//! client for outbound calls. Raft replication, forwarded proposals,
//! membership requests and liveness probes share the same transport.

mod client;
mod envelope;
mod server;

pub use client::{NetworkFactory, PeerClient, PeerConnection};
pub use envelope::{
    Envelope, JoinReply, JoinRequest, LeaveRequest, MessageType, ProbeReply, ProbeRequest,
    RpcReply, WireError, LEADER_RPC_PATH, RPC_PATH,
};
pub use server::{RpcServer, ServerHandle, TaskReport};
