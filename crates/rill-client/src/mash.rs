//! Immutable routing snapshots.

use rill_client_api::MashDescription;
use rill_client_api::MashMember;
use uuid::Uuid;

/// An immutable snapshot of cluster routing state.
///
/// A mash maps every stream id to the node that owns it. Each member owns a
/// contiguous slice `[start, end)` of the 32-bit placement space; a stream id
/// lands in the space at the big-endian value of its first four bytes. The
/// snapshot is a pure value: once installed it never changes, and a routing
/// decision is deterministic in `(stream id, snapshot)`.
///
/// Slices left without an up member are unmapped. That is a first-class
/// outcome (the cluster is degraded for those keys), reported immediately and
/// never waited on at this layer.
#[derive(Debug, Clone)]
pub struct Mash {
    description: MashDescription,
}

impl Mash {
    /// Wrap a server-supplied snapshot.
    pub fn from_description(description: MashDescription) -> Self {
        Self { description }
    }

    /// Monotonic revision of this snapshot.
    pub fn revision(&self) -> u64 {
        self.description.revision
    }

    /// Position of a stream id in the placement space.
    fn placement_key(stream: &Uuid) -> u32 {
        let bytes = stream.as_bytes();
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Resolve the owner of a stream id.
    ///
    /// Returns the owner's routing hash and its dialable addresses, or `None`
    /// when no up member owns the id's slice of the placement space.
    pub fn endpoint_for(&self, stream: &Uuid) -> Option<(u32, &[String])> {
        let key = u64::from(Self::placement_key(stream));
        self.description
            .members
            .iter()
            .find(|member| member.up && member.start <= key && key < member.end)
            .map(|member| (member.hash, member.addresses.as_slice()))
    }

    /// Dialable addresses for a member, looked up by routing hash.
    pub fn addresses_for_hash(&self, hash: u32) -> Option<&[String]> {
        self.description
            .members
            .iter()
            .find(|member| member.hash == hash)
            .map(|member| member.addresses.as_slice())
    }

    /// Iterate every member in the snapshot, up or not.
    pub fn members(&self) -> impl Iterator<Item = &MashMember> {
        self.description.members.iter()
    }
}
