//! Progress and completion domains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::Mutex;
use quanta::Instant;

use crate::error::{Error, Result};
use crate::nexus::{NexusInner, TransportClass};
use crate::pool::WorkerPool;
use crate::transport::*;
use crate::type_alias::*;
use crate::util::hostname;

/// Upper bound of one progress wait while resolving an address.
const LOOKUP_MAX_PROG_MSEC: u64 = 512;

pub(crate) struct ContextInner {
    idx: ContextIdx,
    nexus: Arc<NexusInner>,

    hg_ctx: HgContext,
    /// Class pair owned by this context alone (multi-NA mode).
    private: Option<TransportClass>,
    pool: Option<Arc<dyn WorkerPool>>,

    /// Requests sent from this context and not completed yet.
    inflight: DashMap<ReqId, Opcode, RandomState>,
    addr_cache: DashMap<(Rank, Tag), NaAddr, RandomState>,
    destroyed: AtomicBool,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            log::warn!("context {}: dropped without context_fini", self.idx);
            self.nexus.contexts.remove(self.hg_ctx.id());
            if let Err(e) = self.hg_ctx.destroy() {
                log::warn!("context {}: transport context leaked: {}", self.idx, e);
            }
            if let Some(private) = &self.private {
                let _ = private.finalize();
            }
        }
    }
}

/// A progress and completion domain.
///
/// Every asynchronous operation started on a context (sends, replies, bulk
/// transfers, lookups) completes only from within [`Context::progress`] on
/// that context, which runs the completion callbacks on the calling thread.
#[derive(Clone)]
pub struct Context(Arc<ContextInner>);

impl Context {
    pub(crate) fn new(
        idx: ContextIdx,
        nexus: Arc<NexusInner>,
        hg_ctx: HgContext,
        private: Option<TransportClass>,
        pool: Option<Arc<dyn WorkerPool>>,
    ) -> Self {
        Self(Arc::new(ContextInner {
            idx,
            nexus,
            hg_ctx,
            private,
            pool,
            inflight: DashMap::with_hasher(RandomState::new()),
            addr_cache: DashMap::with_hasher(RandomState::new()),
            destroyed: AtomicBool::new(false),
        }))
    }

    #[inline]
    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self(inner)
    }

    #[inline]
    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.0
    }

    #[inline]
    pub(crate) fn nexus(&self) -> &Arc<NexusInner> {
        &self.0.nexus
    }

    /// Return the index of this context.
    #[inline]
    pub fn idx(&self) -> ContextIdx {
        self.0.idx
    }

    /// Return the RPC context.
    #[inline]
    pub fn hg_context(&self) -> &HgContext {
        &self.0.hg_ctx
    }

    /// Return the RPC class this context runs on.
    #[inline]
    pub fn hg_class(&self) -> &HgClass {
        self.0.hg_ctx.class()
    }

    /// Return the context bulk transfers are issued on; the RPC context.
    #[inline]
    pub fn bulk_context(&self) -> &HgContext {
        &self.0.hg_ctx
    }

    /// Return the class bulk handles are registered with; the RPC class.
    #[inline]
    pub fn bulk_class(&self) -> &HgClass {
        self.0.hg_ctx.class()
    }

    /// Return `true` if this context runs on the process-wide class pair.
    #[inline]
    pub fn is_shared_na(&self) -> bool {
        self.0.private.is_none()
    }

    /// Return the address peers look up to reach this context's class.
    pub fn self_uri(&self) -> String {
        self.hg_class().na_class().addr_self().uri().to_owned()
    }

    /// Return the address of this context.
    #[inline]
    pub fn self_addr(&self) -> NaAddr {
        self.0.hg_ctx.self_addr()
    }

    #[inline]
    pub(crate) fn pool(&self) -> Option<&Arc<dyn WorkerPool>> {
        self.0.pool.as_ref()
    }

    /// Return `true` once the context was destroyed.
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.0.destroyed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::inval(format!("context {} destroyed", self.0.idx)));
        }
        Ok(())
    }

    /// Number of requests sent from this context that have not completed.
    #[inline]
    pub fn inflight_count(&self) -> usize {
        self.0.inflight.len()
    }

    #[inline]
    pub(crate) fn track(&self, id: ReqId, opc: Opcode) {
        self.0.inflight.insert(id, opc);
    }

    #[inline]
    pub(crate) fn untrack(&self, id: ReqId) {
        self.0.inflight.remove(&id);
    }

    pub(crate) fn cached_addr(&self, rank: Rank, tag: Tag) -> Option<NaAddr> {
        self.0.addr_cache.get(&(rank, tag)).map(|a| a.value().clone())
    }

    pub(crate) fn cache_addr(&self, rank: Rank, tag: Tag, addr: NaAddr) {
        self.0.addr_cache.insert((rank, tag), addr);
    }

    /// Forget a cached address, e.g. after the peer restarted.
    pub fn evict_addr(&self, rank: Rank, tag: Tag) {
        self.0.addr_cache.remove(&(rank, tag));
    }

    /// Tear down this context. Called through `Nexus::context_fini`.
    ///
    /// Fails with `Transport(Busy)` while requests, lookups or bulk
    /// transfers are still pending; the caller must drain them first.
    pub(crate) fn destroy(&self) -> Result<()> {
        let inner = &self.0;
        if inner.destroyed.load(Ordering::Acquire) {
            return Err(Error::inval(format!("context {} already finalized", inner.idx)));
        }
        // Ready completions still see a live context.
        self.trigger_all()?;
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return Err(Error::inval(format!("context {} already finalized", inner.idx)));
        }

        if let Err(e) = inner.hg_ctx.destroy() {
            if e == HgError::Busy {
                log::warn!("context {}: operations still pending", inner.idx);
            } else {
                log::error!("context {}: HG_Context_destroy failed: {}", inner.idx, e);
            }
            inner.destroyed.store(false, Ordering::Release);
            return Err(e.into());
        }
        inner.nexus.contexts.remove(inner.hg_ctx.id());

        if !inner.inflight.is_empty() {
            log::debug!(
                "context {}: destroyed with {} requests in flight",
                inner.idx,
                inner.inflight.len()
            );
            inner.inflight.clear();
        }
        inner.addr_cache.clear();

        // The context is gone with its transport context; the private
        // class pair is torn down best-effort.
        if let Some(private) = &inner.private {
            if let Err(e) = private.finalize() {
                log::warn!("context {}: private class teardown failed: {}", inner.idx, e);
            }
        }
        log::debug!("context {}: destroyed", inner.idx);
        Ok(())
    }

    /// Run every ready completion callback.
    fn trigger_all(&self) -> Result<()> {
        loop {
            match self.0.hg_ctx.trigger(u32::MAX) {
                Ok(_) => continue,
                Err(HgError::Timeout) => return Ok(()),
                Err(e) => {
                    log::error!("context {}: HG_Trigger failed: {}", self.0.idx, e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Drive this context.
    ///
    /// Runs ready callbacks, yields once to the worker pool if one is
    /// attached, then waits up to `timeout` (`None` waits indefinitely, zero
    /// is raised to 1ms) for network activity and runs the callbacks it made
    /// ready. An expired wait is reported as [`Error::Timeout`]; callers are
    /// expected to call this in a loop.
    pub fn progress(&self, timeout: Option<Duration>) -> Result<()> {
        self.check_alive()?;
        self.trigger_all()?;

        if let Some(pool) = &self.0.pool {
            pool.yield_now();
        }

        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        match self.0.hg_ctx.progress(timeout) {
            Ok(()) => {}
            Err(HgError::Timeout) => {
                return Err(Error::Timeout(format!(
                    "context {}: no progress within {:?}",
                    self.0.idx, timeout
                )))
            }
            Err(e) => {
                log::error!("context {}: HG_Progress failed: {}", self.0.idx, e);
                return Err(e.into());
            }
        }
        self.trigger_all()
    }

    /// Resolve `name` with the configured connect timeout.
    pub fn lookup_address(&self, name: &str) -> Result<NaAddr> {
        self.lookup_address_timeout(name, self.0.nexus.config.connect_timeout)
    }

    /// Resolve `name` to an address, driving this context until the lookup
    /// completes or `timeout` elapses.
    ///
    /// Progress waits start at 1ms and double up to 512ms.
    pub fn lookup_address_timeout(&self, name: &str, timeout: Duration) -> Result<NaAddr> {
        self.check_alive()?;

        let slot: Arc<Mutex<Option<HgResult<NaAddr>>>> = Arc::new(Mutex::new(None));
        let op = self
            .0
            .hg_ctx
            .addr_lookup(name, {
                let slot = slot.clone();
                Box::new(move |ret| *slot.lock() = Some(ret))
            })
            .map_err(|e| {
                log::error!("context {}: HG_Addr_lookup({}) failed: {}", self.0.idx, name, e);
                Error::from(e)
            })?;

        let start = Instant::now();
        let mut prog_msec = 1;
        loop {
            self.trigger_all()?;
            if let Some(ret) = slot.lock().take() {
                return ret.map_err(Error::from);
            }

            match self
                .0
                .hg_ctx
                .progress(Some(Duration::from_millis(prog_msec)))
            {
                Ok(()) | Err(HgError::Timeout) => {}
                Err(e) => {
                    log::error!("context {}: HG_Progress failed: {}", self.0.idx, e);
                    let _ = self.0.hg_ctx.cancel_op(op);
                    return Err(e.into());
                }
            }

            if Instant::now().duration_since(start) > timeout {
                let _ = self.0.hg_ctx.cancel_op(op);
                let msg = format!(
                    "connecting to {} from rank {} on {} timed out after {:?}",
                    name,
                    self.0.nexus.config.self_rank,
                    hostname(),
                    timeout
                );
                log::error!("{}", msg);
                return Err(Error::Timeout(msg));
            }
            prog_msec = (prog_msec * 2).min(LOOKUP_MAX_PROG_MSEC);
        }
    }
}
