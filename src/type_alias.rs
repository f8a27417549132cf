//! Type aliases used in this library.

/// [`u32`]: Application-level operation code.
/// Carried inside the common request header, never at the wire-id level.
pub type Opcode = u32;

/// [`u32`]: Rank of a process inside a group.
pub type Rank = u32;

/// [`u32`]: Tag selecting a context of a remote rank.
pub type Tag = u32;

/// [`u16`]: Group identifier carried in the common request header.
pub type GroupId = u16;

/// [`u32`]: Context index inside a [`Nexus`](crate::Nexus).
pub type ContextIdx = u32;

/// [`u64`]: Process-unique request identifier.
pub type ReqId = u64;

/// [`u64`]: Identifier of an in-flight bulk transfer.
pub type BulkOpId = crate::transport::OpId;
