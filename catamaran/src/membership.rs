//! Cluster membership: members, the active/passive sets, and quorum math.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::quorum;
use crate::MessageSummary;
use crate::NodeId;

/// The kind of a cluster member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    /// A voting member: counted in quorum, eligible for election.
    Active,
    /// A replicating, non-voting member.
    Passive,
}

/// The liveness of a member as observed by the leader's replication streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Dead,
}

/// A single cluster member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    /// The member's transport address, resolved by the `Transport` impl.
    pub address: String,
}

impl Member {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}

/// The membership configuration of the cluster.
///
/// The `version` equals the index of the Configuration entry which produced
/// this view; the seed configuration a server boots with carries version 0.
/// Active members vote and count toward quorum; passive members replicate
/// through Sync but are never counted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub version: u64,
    pub active: BTreeMap<NodeId, Member>,
    pub passive: BTreeMap<NodeId, Member>,
}

impl Membership {
    /// Build a seed configuration (version 0) from initial active members.
    pub fn seed(active: impl IntoIterator<Item = Member>) -> Self {
        Self {
            version: 0,
            active: active.into_iter().map(|m| (m.id, m)).collect(),
            passive: BTreeMap::new(),
        }
    }

    /// The quorum size of the active set.
    pub fn quorum(&self) -> usize {
        quorum::majority_of(self.active.len())
    }

    /// Check if the given node is a member, active or passive.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.active.contains_key(id) || self.passive.contains_key(id)
    }

    pub fn is_active(&self, id: &NodeId) -> bool {
        self.active.contains_key(id)
    }

    pub fn is_passive(&self, id: &NodeId) -> bool {
        self.passive.contains_key(id)
    }

    /// The kind of the given member, if it is one.
    pub fn kind_of(&self, id: &NodeId) -> Option<MemberKind> {
        if self.is_active(id) {
            Some(MemberKind::Active)
        } else if self.is_passive(id) {
            Some(MemberKind::Passive)
        } else {
            None
        }
    }

    /// All member IDs, active and passive.
    pub fn all_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.active.keys().chain(self.passive.keys()).copied()
    }

    /// All members except the given node, with their kinds.
    pub fn peers_of(&self, id: NodeId) -> Vec<(Member, MemberKind)> {
        let active = self
            .active
            .values()
            .filter(|m| m.id != id)
            .map(|m| (m.clone(), MemberKind::Active));
        let passive = self
            .passive
            .values()
            .filter(|m| m.id != id)
            .map(|m| (m.clone(), MemberKind::Passive));
        active.chain(passive).collect()
    }

    /// A copy with `member` added to the given set, at the given version.
    pub fn with_member(&self, member: Member, kind: MemberKind, version: u64) -> Self {
        let mut next = self.clone();
        next.version = version;
        next.active.remove(&member.id);
        next.passive.remove(&member.id);
        match kind {
            MemberKind::Active => next.active.insert(member.id, member),
            MemberKind::Passive => next.passive.insert(member.id, member),
        };
        next
    }

    /// A copy with the given node removed from both sets.
    pub fn without_member(&self, id: NodeId, version: u64) -> Self {
        let mut next = self.clone();
        next.version = version;
        next.active.remove(&id);
        next.passive.remove(&id);
        next
    }
}

impl MessageSummary for Membership {
    fn summary(&self) -> String {
        format!(
            "v{}, active: {:?}, passive: {:?}",
            self.version,
            self.active.keys().collect::<Vec<_>>(),
            self.passive.keys().collect::<Vec<_>>()
        )
    }
}
