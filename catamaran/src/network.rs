//! The transport interfaces a catamaran server depends on.

use anyhow::Result;
use async_trait::async_trait;

use crate::error::ClientError;
use crate::protocol::AppendRequest;
use crate::protocol::AppendResponse;
use crate::protocol::ConfigurationResponse;
use crate::protocol::JoinRequest;
use crate::protocol::LeaveRequest;
use crate::protocol::PollRequest;
use crate::protocol::PollResponse;
use crate::protocol::PromoteRequest;
use crate::protocol::PublishRequest;
use crate::protocol::PublishResponse;
use crate::protocol::SyncRequest;
use crate::protocol::VoteRequest;
use crate::protocol::VoteResponse;
use crate::AppData;
use crate::AppEvent;
use crate::NodeId;

/// A trait defining the interface for sending RPCs to peer servers.
///
/// The transport resolves node ids to addresses itself (the member addresses
/// travel in Configuration entries and reconfiguration responses). An `Err`
/// from the replication and election methods means the peer was unreachable;
/// the typed redirect errors of the reconfiguration methods flow through
/// [`ClientError`] so callers can follow leader hints.
#[async_trait]
pub trait Transport<D: AppData>: Send + Sync + 'static {
    /// Send an Append RPC to the target active member.
    async fn append(&self, target: NodeId, rpc: AppendRequest<D>) -> Result<AppendResponse>;

    /// Send a Sync RPC to the target passive member.
    async fn sync(&self, target: NodeId, rpc: SyncRequest<D>) -> Result<AppendResponse>;

    /// Send a Vote RPC to the target member.
    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send a pre-vote Poll RPC to the target member.
    async fn poll(&self, target: NodeId, rpc: PollRequest) -> Result<PollResponse>;

    /// Ask the target member to admit this server to the cluster.
    async fn join(&self, target: NodeId, rpc: JoinRequest) -> Result<ConfigurationResponse, ClientError>;

    /// Ask the target member to remove this server from the cluster.
    async fn leave(&self, target: NodeId, rpc: LeaveRequest) -> Result<ConfigurationResponse, ClientError>;

    /// Ask the target member to promote this server to the active set.
    async fn promote(&self, target: NodeId, rpc: PromoteRequest) -> Result<ConfigurationResponse, ClientError>;
}

/// A trait defining the interface for pushing session events to clients.
///
/// `connection` is the client chosen connection id carried in its Register.
#[async_trait]
pub trait EventTransport<E: AppEvent>: Send + Sync + 'static {
    /// Push one session event to the client owning `connection`.
    async fn publish(&self, connection: u64, rpc: PublishRequest<E>) -> Result<PublishResponse>;
}
