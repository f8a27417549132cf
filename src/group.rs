//! Group membership and endpoint resolution.

use std::collections::HashMap;

use ahash::RandomState;
use parking_lot::RwLock;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::transport::NaAddr;
use crate::type_alias::*;

/// Logical address of a context: a rank in the group and a tag selecting
/// one of its contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub rank: Rank,
    pub tag: Tag,
}

impl Endpoint {
    #[inline]
    pub const fn new(rank: Rank, tag: Tag) -> Self {
        Self { rank, tag }
    }
}

/// Translates logical endpoints into transport addresses.
pub trait AddressResolver: Send + Sync {
    /// Group ID stamped into outgoing request headers.
    fn id(&self) -> GroupId;

    /// Resolve `(rank, tag)` to the address of a remote context, using `ctx`
    /// to drive any lookup.
    fn resolve(&self, ctx: &Context, rank: Rank, tag: Tag) -> Result<NaAddr>;
}

/// A fixed rank table.
///
/// A rank maps to the address of its primary network class, whose contexts
/// are selected by tag. Ranks running private network classes per context
/// register each tagged address separately.
pub struct StaticGroup {
    id: GroupId,
    members: RwLock<HashMap<(Rank, Option<Tag>), String, RandomState>>,
}

impl StaticGroup {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            members: RwLock::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// Set the address of a rank's primary network class.
    pub fn insert(&self, rank: Rank, uri: impl Into<String>) {
        self.members.write().insert((rank, None), uri.into());
    }

    /// Set the address of a rank's context with a private network class.
    pub fn insert_tagged(&self, rank: Rank, tag: Tag, uri: impl Into<String>) {
        self.members.write().insert((rank, Some(tag)), uri.into());
    }

    /// Remove every address of a rank.
    pub fn remove(&self, rank: Rank) {
        self.members.write().retain(|(r, _), _| *r != rank);
    }

    /// Number of registered addresses.
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }
}

impl AddressResolver for StaticGroup {
    fn id(&self) -> GroupId {
        self.id
    }

    fn resolve(&self, ctx: &Context, rank: Rank, tag: Tag) -> Result<NaAddr> {
        if let Some(addr) = ctx.cached_addr(rank, tag) {
            return Ok(addr);
        }

        let (uri, target) = {
            let members = self.members.read();
            match members.get(&(rank, Some(tag))) {
                Some(uri) => (uri.clone(), 0),
                None => match members.get(&(rank, None)) {
                    Some(uri) => (uri.clone(), tag),
                    None => {
                        return Err(Error::inval(format!(
                            "rank {} is not a member of group {}",
                            rank, self.id
                        )))
                    }
                },
            }
        };

        let addr = ctx.lookup_address(&uri)?.with_target(target);
        ctx.cache_addr(rank, tag, addr.clone());
        Ok(addr)
    }
}
