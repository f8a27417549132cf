use std::sync::{Arc, Weak};

use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::context::{Context, ContextInner};
use crate::type_alias::*;

/// Maps transport context IDs to the contexts that own them.
///
/// Inbound dispatch only reads; context creation and destruction write.
/// A context index is reserved before its context is built and released
/// when the context is removed.
pub(crate) struct ContextRegistry {
    by_hg_id: DashMap<u64, (ContextIdx, Weak<ContextInner>), RandomState>,
    indices: DashMap<ContextIdx, (), RandomState>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self {
            by_hg_id: DashMap::with_hasher(RandomState::new()),
            indices: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Claim `idx`. Returns `false` if another context holds it.
    pub fn reserve(&self, idx: ContextIdx) -> bool {
        match self.indices.entry(idx) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(());
                true
            }
        }
    }

    pub fn release(&self, idx: ContextIdx) {
        self.indices.remove(&idx);
    }

    pub fn insert(&self, ctx: &Context) {
        let entry = (ctx.idx(), Arc::downgrade(ctx.inner()));
        self.by_hg_id.insert(ctx.hg_context().id(), entry);
    }

    pub fn remove(&self, hg_id: u64) -> bool {
        match self.by_hg_id.remove(&hg_id) {
            Some((_, (idx, _))) => {
                self.release(idx);
                true
            }
            None => false,
        }
    }

    /// Find the context owning a transport context.
    pub fn lookup(&self, hg_id: u64) -> Option<Context> {
        let weak = self.by_hg_id.get(&hg_id)?.1.clone();
        weak.upgrade().map(Context::from_inner)
    }

    pub fn len(&self) -> usize {
        self.by_hg_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hg_id.is_empty()
    }
}
