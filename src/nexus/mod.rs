mod registry;

use std::sync::Arc;

use parking_lot::RwLock;

pub(crate) use self::registry::*;
use crate::config::NexusConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::group::AddressResolver;
use crate::handler::rpc_handler_common;
use crate::opcode::OpcodeMap;
use crate::pool::WorkerPool;
use crate::proc::{proc_in_common, proc_out_common};
use crate::transport::*;
use crate::type_alias::*;

/// Wire-level RPC ID shared by every application request.
///
/// Application opcodes travel in the common request header instead.
pub const COMMON_RPC_ID: RpcId = 0x0100_0000;

/// A network class and the RPC class layered on it.
#[derive(Clone)]
pub(crate) struct TransportClass {
    pub na: Arc<NaClass>,
    pub hg: HgClass,
}

impl TransportClass {
    /// Initialize a class pair and register the shared RPC on it.
    /// Unwinds in reverse order on failure.
    pub fn create(nexus: &Arc<NexusInner>, info: &str, listen: bool) -> Result<Self> {
        let na = NaClass::initialize(&nexus.fabric, info, listen).map_err(|e| {
            log::error!("NA_Initialize({}) failed: {}", info, e);
            Error::from(e)
        })?;

        let hg = match HgClass::init_na(&na) {
            Ok(hg) => hg,
            Err(e) => {
                log::error!("HG_Init_na({}) failed: {}", info, e);
                if let Err(e) = na.finalize() {
                    log::warn!("NA_Finalize({}) failed during unwind: {}", info, e);
                }
                return Err(e.into());
            }
        };

        let weak = Arc::downgrade(nexus);
        let rpc_cb: RpcCb = Arc::new(move |handle| rpc_handler_common(&weak, handle));
        if let Err(e) = hg.register(COMMON_RPC_ID, proc_in_common, proc_out_common, rpc_cb) {
            log::error!("registering the common RPC on {} failed: {}", info, e);
            let this = Self { na, hg };
            if let Err(e) = this.finalize() {
                log::warn!("class teardown failed during unwind: {}", e);
            }
            return Err(e.into());
        }

        Ok(Self { na, hg })
    }

    /// Finalize the RPC class, then the network class. Both are attempted;
    /// the first failure is returned.
    pub fn finalize(&self) -> Result<()> {
        let hg_ret = self.hg.finalize();
        if let Err(e) = hg_ret {
            log::error!("HG_Finalize failed: {}", e);
        }
        let na_ret = self.na.finalize();
        if let Err(e) = na_ret {
            log::error!("NA_Finalize failed: {}", e);
        }
        hg_ret.and(na_ret).map_err(Error::from)
    }
}

/// State shared by a [`Nexus`] and every context created from it.
pub(crate) struct NexusInner {
    pub fabric: Arc<Fabric>,
    pub config: NexusConfig,
    pub opcodes: OpcodeMap,
    pub group: Arc<dyn AddressResolver>,

    /// The process-wide class pair, present while initialized.
    class: RwLock<Option<TransportClass>>,
    pub contexts: ContextRegistry,
}

/// A per-process singleton owning the transport class.
///
/// A `Nexus` starts uninitialized. [`Nexus::init`] binds the network class
/// and registers the shared RPC; contexts can then be created with
/// [`Nexus::context_init`]. Each `Nexus` stands for one process, so several
/// can coexist on one [`Fabric`].
pub struct Nexus {
    inner: Arc<NexusInner>,
}

impl Nexus {
    /// Create an uninitialized `Nexus`.
    pub fn new(
        fabric: &Arc<Fabric>,
        config: NexusConfig,
        opcodes: OpcodeMap,
        group: Arc<dyn AddressResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(NexusInner {
                fabric: fabric.clone(),
                config,
                opcodes,
                group,
                class: RwLock::new(None),
                contexts: ContextRegistry::new(),
            }),
        }
    }

    /// Initialize the transport class.
    ///
    /// Binds `listen_addr` if given, otherwise a fresh address of the
    /// configured protocol. Returns the bound address.
    pub fn init(&self, listen_addr: Option<&str>) -> Result<String> {
        let mut class = self.inner.class.write();
        if class.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let config = &self.inner.config;
        let info = listen_addr.unwrap_or(config.transport.info_string());
        let tc = TransportClass::create(&self.inner, info, config.is_server)?;
        let addr = match listen_addr {
            Some(addr) => addr.to_owned(),
            None => tc.na.addr_to_string(&tc.na.addr_self()),
        };

        log::debug!("Nexus: initialized on {} (rank {})", addr, config.self_rank);
        *class = Some(tc);
        Ok(addr)
    }

    /// Finalize the transport class.
    ///
    /// Fails if not initialized or while contexts are alive.
    pub fn finalize(&self) -> Result<()> {
        let mut class = self.inner.class.write();
        let tc = class.as_ref().ok_or(Error::NotInitialized)?;
        if !self.inner.contexts.is_empty() {
            return Err(Error::inval(format!(
                "{} contexts still alive",
                self.inner.contexts.len()
            )));
        }

        tc.finalize()?;
        *class = None;
        log::debug!("Nexus: finalized");
        Ok(())
    }

    /// Return `true` between a successful [`Nexus::init`] and
    /// [`Nexus::finalize`].
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.inner.class.read().is_some()
    }

    #[inline]
    pub fn config(&self) -> &NexusConfig {
        &self.inner.config
    }

    #[inline]
    pub fn opcodes(&self) -> &OpcodeMap {
        &self.inner.opcodes
    }

    #[inline]
    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.inner.fabric
    }

    /// Number of live contexts.
    #[inline]
    pub fn context_count(&self) -> usize {
        self.inner.contexts.len()
    }

    /// Create a context that runs request handlers inline.
    pub fn context_init(&self, idx: ContextIdx) -> Result<Context> {
        self.create_context(idx, None)
    }

    /// Create a context that dispatches request handlers to `pool`.
    pub fn context_init_with_pool(
        &self,
        idx: ContextIdx,
        pool: Arc<dyn WorkerPool>,
    ) -> Result<Context> {
        self.create_context(idx, Some(pool))
    }

    fn create_context(&self, idx: ContextIdx, pool: Option<Arc<dyn WorkerPool>>) -> Result<Context> {
        // The read guard keeps `finalize` out until the context is registered.
        let class = self.inner.class.read();
        let tc = class.as_ref().ok_or(Error::NotInitialized)?;
        if !self.inner.contexts.reserve(idx) {
            return Err(Error::inval(format!("context {} already exists", idx)));
        }
        let ctx = match self.build_context(tc, idx, pool) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.inner.contexts.release(idx);
                return Err(e);
            }
        };

        self.inner.contexts.insert(&ctx);
        log::debug!(
            "Nexus: context {} created on {} ({})",
            idx,
            ctx.self_uri(),
            if ctx.is_shared_na() { "shared" } else { "private" }
        );
        Ok(ctx)
    }

    fn build_context(
        &self,
        tc: &TransportClass,
        idx: ContextIdx,
        pool: Option<Arc<dyn WorkerPool>>,
    ) -> Result<Context> {
        let config = &self.inner.config;
        if idx == 0 || !config.multi_na {
            let hg_ctx = HgContext::create(&tc.hg, idx).map_err(|e| {
                log::error!("HG_Context_create({}) failed: {}", idx, e);
                Error::from(e)
            })?;
            return Ok(Context::new(idx, self.inner.clone(), hg_ctx, None, pool));
        }

        let private = TransportClass::create(
            &self.inner,
            config.transport.info_string(),
            config.is_server,
        )?;
        match HgContext::create(&private.hg, 0) {
            Ok(hg_ctx) => Ok(Context::new(idx, self.inner.clone(), hg_ctx, Some(private), pool)),
            Err(e) => {
                log::error!("HG_Context_create({}) failed: {}", idx, e);
                if let Err(e) = private.finalize() {
                    log::warn!("private class teardown failed during unwind: {}", e);
                }
                Err(e.into())
            }
        }
    }

    /// Destroy a context.
    ///
    /// The context counts as destroyed once its transport context is gone;
    /// failures tearing down a private class pair afterwards are only logged.
    pub fn context_fini(&self, ctx: &Context) -> Result<()> {
        if !Arc::ptr_eq(ctx.nexus(), &self.inner) {
            return Err(Error::inval("context belongs to another Nexus"));
        }
        ctx.destroy()
    }
}
