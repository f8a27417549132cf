//! RPC classes, contexts and handles.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::queue::SegQueue;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::*;

/// Wire-level RPC identifier.
pub type RpcId = u32;

/// Process-unique handle identifier.
pub type HandleId = u64;

/// Payload check run before a payload is handed out of a handle.
pub type ProcCb = fn(&[u8]) -> HgResult<()>;

/// Callback invoked at trigger time for every inbound request.
/// Returning an error answers the originator with that error.
pub type RpcCb = Arc<dyn Fn(HgHandle) -> HgResult<()> + Send + Sync>;

/// Completion callback of a forward, respond or bulk operation.
pub type OpCb = Box<dyn FnOnce(HgResult<()>) + Send>;

/// Completion callback of an address lookup.
pub type LookupCb = Box<dyn FnOnce(HgResult<NaAddr>) + Send>;

pub(super) type Completion = Box<dyn FnOnce() + Send>;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

struct RpcRegistration {
    proc_in: ProcCb,
    proc_out: ProcCb,
    rpc_cb: RpcCb,
}

struct HgClassInner {
    na: Arc<NaClass>,
    rpcs: DashMap<RpcId, Arc<RpcRegistration>, RandomState>,
    contexts: AtomicUsize,
    finalized: AtomicBool,
}

/// An RPC class layered on a network class.
#[derive(Clone)]
pub struct HgClass(Arc<HgClassInner>);

impl HgClass {
    /// Initialize an RPC class on top of the given network class.
    pub fn init_na(na: &Arc<NaClass>) -> HgResult<Self> {
        if na.is_finalized() {
            return Err(HgError::InvalidArg);
        }
        Ok(Self(Arc::new(HgClassInner {
            na: na.clone(),
            rpcs: DashMap::with_hasher(RandomState::new()),
            contexts: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
        })))
    }

    /// Return the underlying network class.
    #[inline]
    pub fn na_class(&self) -> &Arc<NaClass> {
        &self.0.na
    }

    /// Register a wire-level RPC with its payload checks and callback.
    /// Registering an ID again replaces the previous registration.
    pub fn register(
        &self,
        id: RpcId,
        proc_in: ProcCb,
        proc_out: ProcCb,
        rpc_cb: RpcCb,
    ) -> HgResult<()> {
        if self.0.finalized.load(Ordering::Acquire) {
            return Err(HgError::InvalidArg);
        }
        let reg = Arc::new(RpcRegistration {
            proc_in,
            proc_out,
            rpc_cb,
        });
        if self.0.rpcs.insert(id, reg).is_some() {
            log::debug!("HG class: RPC id {:#x} re-registered", id);
        }
        Ok(())
    }

    /// Return `true` if the given RPC ID is registered.
    #[inline]
    pub fn is_registered(&self, id: RpcId) -> bool {
        self.0.rpcs.contains_key(&id)
    }

    /// Finalize this class.
    ///
    /// Fails with [`HgError::Busy`] while contexts created on it are alive,
    /// and with [`HgError::InvalidArg`] if already finalized.
    pub fn finalize(&self) -> HgResult<()> {
        if self.0.contexts.load(Ordering::Acquire) > 0 {
            return Err(HgError::Busy);
        }
        if self.0.finalized.swap(true, Ordering::AcqRel) {
            return Err(HgError::InvalidArg);
        }
        self.0.rpcs.clear();
        Ok(())
    }

    fn registration(&self, id: RpcId) -> Option<Arc<RpcRegistration>> {
        self.0.rpcs.get(&id).map(|reg| reg.value().clone())
    }
}

struct PendingForward {
    handle: HgHandle,
    cb: OpCb,
}

struct PendingLookup {
    id: OpId,
    name: String,
    cb: LookupCb,
}

pub(super) struct HgContextInner {
    id: u64,
    target: u32,
    class: HgClass,

    tx: Sender<Event>,
    rx: Receiver<Event>,

    /// Ready callbacks, run by `trigger`.
    completions: SegQueue<Completion>,
    /// In-flight forwards waiting for a response.
    forwards: Mutex<HashMap<HandleId, PendingForward, RandomState>>,
    /// Unresolved address lookups.
    lookups: Mutex<Vec<PendingLookup>>,
    /// Submitted, not yet executed bulk transfers.
    pub(super) bulk_ops: Mutex<VecDeque<PendingBulk>>,

    destroyed: AtomicBool,
}

/// A progress and completion domain of an RPC class.
#[derive(Clone)]
pub struct HgContext(pub(super) Arc<HgContextInner>);

impl HgContext {
    /// Create a context on the given class, reachable as target `target`.
    pub fn create(class: &HgClass, target: u32) -> HgResult<Self> {
        if class.0.finalized.load(Ordering::Acquire) {
            return Err(HgError::InvalidArg);
        }

        let (tx, rx) = channel::unbounded();
        match class.0.na.endpoint().targets.entry(target) {
            Entry::Occupied(_) => return Err(HgError::AddrInUse),
            Entry::Vacant(v) => {
                v.insert(tx.clone());
            }
        }
        class.0.contexts.fetch_add(1, Ordering::AcqRel);

        Ok(Self(Arc::new(HgContextInner {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            target,
            class: class.clone(),
            tx,
            rx,
            completions: SegQueue::new(),
            forwards: Mutex::new(HashMap::with_hasher(RandomState::new())),
            lookups: Mutex::new(Vec::new()),
            bulk_ops: Mutex::new(VecDeque::new()),
            destroyed: AtomicBool::new(false),
        })))
    }

    /// Return the process-unique ID of this context.
    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Return the target ID of this context within its class.
    #[inline]
    pub fn target_id(&self) -> u32 {
        self.0.target
    }

    /// Return the class this context belongs to.
    #[inline]
    pub fn class(&self) -> &HgClass {
        &self.0.class
    }

    /// Return the address peers use to reach this context.
    #[inline]
    pub fn self_addr(&self) -> NaAddr {
        self.0.class.0.na.addr_self().with_target(self.0.target)
    }

    #[inline]
    pub(super) fn fabric(&self) -> &Arc<Fabric> {
        self.0.class.0.na.fabric()
    }

    #[inline]
    pub(super) fn check_alive(&self) -> HgResult<()> {
        if self.0.destroyed.load(Ordering::Acquire) {
            Err(HgError::InvalidArg)
        } else {
            Ok(())
        }
    }

    /// Queue a ready callback and wake a blocked progress call.
    pub(super) fn post(&self, completion: Completion) {
        self.0.completions.push(completion);
        let _ = self.0.tx.send(Event::Wake);
    }

    /// Wake a blocked progress call.
    #[inline]
    pub(super) fn wake(&self) {
        let _ = self.0.tx.send(Event::Wake);
    }

    /// Destroy this context.
    ///
    /// Fails with [`HgError::Busy`] while forwards, lookups or bulk transfers
    /// are pending. Callbacks already queued are run before teardown, and
    /// requests that arrived but were never processed are answered with
    /// [`HgError::Unreachable`].
    pub fn destroy(&self) -> HgResult<()> {
        {
            let forwards = self.0.forwards.lock();
            let lookups = self.0.lookups.lock();
            let bulk_ops = self.0.bulk_ops.lock();
            if self.0.destroyed.load(Ordering::Acquire) {
                return Err(HgError::InvalidArg);
            }
            let pending = forwards.len() + lookups.len() + bulk_ops.len();
            if pending > 0 {
                log::debug!(
                    "HG context {}: {} operations pending, refusing to destroy",
                    self.0.id,
                    pending
                );
                return Err(HgError::Busy);
            }
            self.0.destroyed.store(true, Ordering::Release);
        }
        self.0
            .class
            .0
            .na
            .endpoint()
            .targets
            .remove(&self.0.target);

        while let Ok(event) = self.0.rx.try_recv() {
            if let Event::Request { src, origin, .. } = event {
                let event = Event::Response {
                    handle: origin,
                    ret: Err(HgError::Unreachable),
                    payload: Vec::new(),
                };
                let _ = self.fabric().deliver(&src, event);
            }
        }
        let _ = self.trigger(u32::MAX);

        self.0.class.0.contexts.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Start an asynchronous address lookup.
    ///
    /// The callback runs from `trigger` once a listening class with that
    /// address exists on the fabric.
    pub fn addr_lookup(&self, name: &str, cb: LookupCb) -> HgResult<OpId> {
        self.check_alive()?;
        if !name.contains("://") {
            return Err(HgError::InvalidArg);
        }
        let id = next_op_id();
        let mut lookups = self.0.lookups.lock();
        self.check_alive()?;
        lookups.push(PendingLookup {
            id,
            name: name.to_owned(),
            cb,
        });
        drop(lookups);
        self.wake();
        Ok(id)
    }

    /// Cancel a pending lookup or bulk transfer.
    ///
    /// The operation completes with [`HgError::Canceled`]. Canceling an
    /// operation that already completed is a no-op.
    pub fn cancel_op(&self, id: OpId) -> HgResult<()> {
        let lookup = {
            let mut lookups = self.0.lookups.lock();
            lookups
                .iter()
                .position(|p| p.id == id)
                .map(|i| lookups.swap_remove(i))
        };
        if let Some(p) = lookup {
            self.post(Box::new(move || (p.cb)(Err(HgError::Canceled))));
            return Ok(());
        }

        let bulk = {
            let mut ops = self.0.bulk_ops.lock();
            ops.iter()
                .position(|op| op.id == id)
                .and_then(|i| ops.remove(i))
        };
        if let Some(op) = bulk {
            self.post(Box::new(move || (op.cb)(Err(HgError::Canceled))));
        }
        Ok(())
    }

    /// Run up to `max` ready callbacks.
    ///
    /// Returns the number of callbacks run, or [`HgError::Timeout`] if none
    /// was ready.
    pub fn trigger(&self, max: u32) -> HgResult<u32> {
        let mut count = 0;
        while count < max {
            let Some(completion) = self.0.completions.pop() else {
                break;
            };
            completion();
            count += 1;
        }
        if count == 0 {
            Err(HgError::Timeout)
        } else {
            Ok(count)
        }
    }

    /// Advance the network, waiting up to `timeout` (`None` = forever) for
    /// activity if nothing is immediately available.
    ///
    /// Returns [`HgError::Timeout`] if the wait expired without progress.
    pub fn progress(&self, timeout: Option<Duration>) -> HgResult<()> {
        self.check_alive()?;
        let mut progressed = self.poll_local();
        progressed |= self.drain_events();
        if progressed {
            return Ok(());
        }

        let event = match timeout {
            Some(t) => match self.0.rx.recv_timeout(t) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    return if self.poll_local() {
                        Ok(())
                    } else {
                        Err(HgError::Timeout)
                    };
                }
                Err(RecvTimeoutError::Disconnected) => return Err(HgError::Protocol),
            },
            None => self.0.rx.recv().map_err(|_| HgError::Protocol)?,
        };
        self.process(event);
        self.drain_events();
        self.poll_local();
        Ok(())
    }

    /// Process all queued events without blocking.
    fn drain_events(&self) -> bool {
        let mut any = false;
        while let Ok(event) = self.0.rx.try_recv() {
            self.process(event);
            any = true;
        }
        any
    }

    /// Resolve lookups and execute bulk transfers.
    fn poll_local(&self) -> bool {
        let mut progressed = false;

        let ready = {
            let mut lookups = self.0.lookups.lock();
            let mut ready = Vec::new();
            let mut i = 0;
            while i < lookups.len() {
                match self.fabric().endpoint(&lookups[i].name) {
                    Some(ep) if ep.listening => ready.push((lookups.swap_remove(i), ep.uri.clone())),
                    _ => i += 1,
                }
            }
            ready
        };
        for (lookup, uri) in ready {
            let addr = NaAddr { uri, target: 0 };
            self.0
                .completions
                .push(Box::new(move || (lookup.cb)(Ok(addr))));
            progressed = true;
        }

        let ops = mem::take(&mut *self.0.bulk_ops.lock());
        for op in ops {
            let ret = op.execute();
            let cb = op.cb;
            self.0.completions.push(Box::new(move || cb(ret)));
            progressed = true;
        }
        progressed
    }

    fn process(&self, event: Event) {
        match event {
            Event::Wake => {}
            Event::Request {
                src,
                origin,
                rpc_id,
                payload,
            } => {
                let Some(reg) = self.0.class.registration(rpc_id) else {
                    log::warn!(
                        "HG context {}: no RPC registered for id {:#x}, from {}",
                        self.0.id,
                        rpc_id,
                        src
                    );
                    let event = Event::Response {
                        handle: origin,
                        ret: Err(HgError::NoMatch),
                        payload: Vec::new(),
                    };
                    let _ = self.fabric().deliver(&src, event);
                    return;
                };

                let handle = HgHandle::inbound(self.clone(), src, rpc_id, origin, payload, &reg);
                self.0.completions.push(Box::new(move || {
                    if let Err(e) = (reg.rpc_cb)(handle.clone()) {
                        log::debug!("HG handle {}: RPC callback failed: {}", handle.id(), e);
                        handle.respond_error(e);
                    }
                }));
            }
            Event::Response {
                handle,
                ret,
                payload,
            } => {
                let fwd = self.0.forwards.lock().remove(&handle);
                match fwd {
                    Some(fwd) => {
                        if ret.is_ok() {
                            *fwd.handle.0.output.lock() = Some(payload);
                        }
                        let cb = fwd.cb;
                        self.0.completions.push(Box::new(move || cb(ret)));
                    }
                    None => log::debug!(
                        "HG context {}: dropping response for handle {} not in flight",
                        self.0.id,
                        handle
                    ),
                }
            }
        }
    }
}

struct HandleInner {
    id: HandleId,
    ctx: HgContext,
    addr: NaAddr,
    rpc_id: RpcId,

    /// Originator's handle ID; set only on inbound handles.
    origin: Option<HandleId>,
    proc_in: ProcCb,
    proc_out: ProcCb,

    input: Mutex<Option<Vec<u8>>>,
    output: Mutex<Option<Vec<u8>>>,
    input_got: AtomicBool,
    output_got: AtomicBool,
    responded: AtomicBool,
}

/// Information about a handle.
#[derive(Debug, Clone)]
pub struct HgInfo {
    /// Peer address: target on the originator, sender on the target.
    pub addr: NaAddr,
    /// ID of the context the handle belongs to.
    pub context_id: u64,
    /// Wire-level RPC ID.
    pub rpc_id: RpcId,
}

/// An RPC handle. The handle is released when the last clone is dropped.
#[derive(Clone)]
pub struct HgHandle(Arc<HandleInner>);

impl HgHandle {
    /// Create a handle for sending RPC `rpc_id` to `addr`.
    pub fn create(ctx: &HgContext, addr: NaAddr, rpc_id: RpcId) -> HgResult<Self> {
        ctx.check_alive()?;
        let reg = ctx.0.class.registration(rpc_id).ok_or(HgError::NoMatch)?;
        Ok(Self::new(ctx.clone(), addr, rpc_id, None, None, &reg))
    }

    fn inbound(
        ctx: HgContext,
        src: NaAddr,
        rpc_id: RpcId,
        origin: HandleId,
        payload: Vec<u8>,
        reg: &RpcRegistration,
    ) -> Self {
        Self::new(ctx, src, rpc_id, Some(origin), Some(payload), reg)
    }

    fn new(
        ctx: HgContext,
        addr: NaAddr,
        rpc_id: RpcId,
        origin: Option<HandleId>,
        input: Option<Vec<u8>>,
        reg: &RpcRegistration,
    ) -> Self {
        Self(Arc::new(HandleInner {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            ctx,
            addr,
            rpc_id,
            origin,
            proc_in: reg.proc_in,
            proc_out: reg.proc_out,
            input: Mutex::new(input),
            output: Mutex::new(None),
            input_got: AtomicBool::new(false),
            output_got: AtomicBool::new(false),
            responded: AtomicBool::new(false),
        }))
    }

    /// Return the ID of this handle.
    #[inline]
    pub fn id(&self) -> HandleId {
        self.0.id
    }

    /// Return the context this handle belongs to.
    #[inline]
    pub fn context(&self) -> &HgContext {
        &self.0.ctx
    }

    /// Return information about this handle.
    pub fn info(&self) -> HgInfo {
        HgInfo {
            addr: self.0.addr.clone(),
            context_id: self.0.ctx.id(),
            rpc_id: self.0.rpc_id,
        }
    }

    /// Send `input` to the target. `cb` runs from `trigger` once the response
    /// arrived, the operation was canceled, or delivery failed.
    pub fn forward(&self, input: Vec<u8>, cb: OpCb) -> HgResult<()> {
        let ctx = &self.0.ctx;
        ctx.check_alive()?;
        if self.0.origin.is_some() {
            return Err(HgError::InvalidArg);
        }
        {
            let mut forwards = ctx.0.forwards.lock();
            ctx.check_alive()?;
            if forwards.contains_key(&self.0.id) {
                return Err(HgError::Busy);
            }
            forwards.insert(
                self.0.id,
                PendingForward {
                    handle: self.clone(),
                    cb,
                },
            );
        }

        let event = Event::Request {
            src: ctx.self_addr(),
            origin: self.0.id,
            rpc_id: self.0.rpc_id,
            payload: input,
        };
        if let Err(e) = ctx.fabric().deliver(&self.0.addr, event) {
            // Delivery failures complete through the queue like any other.
            let fwd = ctx.0.forwards.lock().remove(&self.0.id);
            if let Some(fwd) = fwd {
                let cb = fwd.cb;
                ctx.post(Box::new(move || cb(Err(e))));
            }
        }
        Ok(())
    }

    /// Send `output` back to the originator of an inbound handle.
    pub fn respond(&self, output: Vec<u8>, cb: OpCb) -> HgResult<()> {
        let origin = self.0.origin.ok_or(HgError::InvalidArg)?;
        let ctx = &self.0.ctx;
        ctx.check_alive()?;
        if self.0.responded.swap(true, Ordering::AcqRel) {
            return Err(HgError::InvalidArg);
        }

        let event = Event::Response {
            handle: origin,
            ret: Ok(()),
            payload: output,
        };
        let ret = ctx.fabric().deliver(&self.0.addr, event);
        ctx.post(Box::new(move || cb(ret)));
        Ok(())
    }

    /// Answer an inbound handle with an error, unless already answered.
    pub(crate) fn respond_error(&self, err: HgError) {
        let Some(origin) = self.0.origin else {
            return;
        };
        if self.0.responded.swap(true, Ordering::AcqRel) {
            return;
        }
        let event = Event::Response {
            handle: origin,
            ret: Err(err),
            payload: Vec::new(),
        };
        if let Err(e) = self.0.ctx.fabric().deliver(&self.0.addr, event) {
            log::debug!("HG handle {}: error response lost: {}", self.0.id, e);
        }
    }

    /// Return `true` if an inbound handle has been answered.
    #[inline]
    pub fn is_responded(&self) -> bool {
        self.0.responded.load(Ordering::Acquire)
    }

    /// Cancel an in-flight forward. The forward completes with
    /// [`HgError::Canceled`]; a handle not in flight is left untouched.
    pub fn cancel(&self) -> HgResult<()> {
        let ctx = &self.0.ctx;
        let fwd = ctx.0.forwards.lock().remove(&self.0.id);
        if let Some(fwd) = fwd {
            let cb = fwd.cb;
            ctx.post(Box::new(move || cb(Err(HgError::Canceled))));
        }
        Ok(())
    }

    /// Retrieve the request payload of an inbound handle.
    pub fn get_input(&self) -> HgResult<Vec<u8>> {
        let input = self.0.input.lock();
        let raw = input.as_ref().ok_or(HgError::NoEntry)?;
        (self.0.proc_in)(raw)?;
        self.0.input_got.store(true, Ordering::Release);
        Ok(raw.clone())
    }

    /// Release the request payload retrieved by [`HgHandle::get_input`].
    pub fn free_input(&self) -> HgResult<()> {
        if !self.0.input_got.swap(false, Ordering::AcqRel) {
            return Err(HgError::InvalidArg);
        }
        self.0.input.lock().take();
        Ok(())
    }

    /// Retrieve the response payload of a completed forward.
    pub fn get_output(&self) -> HgResult<Vec<u8>> {
        let output = self.0.output.lock();
        let raw = output.as_ref().ok_or(HgError::NoEntry)?;
        (self.0.proc_out)(raw)?;
        self.0.output_got.store(true, Ordering::Release);
        Ok(raw.clone())
    }

    /// Release the response payload retrieved by [`HgHandle::get_output`].
    pub fn free_output(&self) -> HgResult<()> {
        if !self.0.output_got.swap(false, Ordering::AcqRel) {
            return Err(HgError::InvalidArg);
        }
        self.0.output.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_all(_: &[u8]) -> HgResult<()> {
        Ok(())
    }

    fn echo_class(fabric: &Arc<Fabric>) -> HgClass {
        let na = NaClass::initialize(fabric, "ofi+tcp://", true).unwrap();
        let hg = HgClass::init_na(&na).unwrap();
        let echo: RpcCb = Arc::new(|handle: HgHandle| {
            let input = handle.get_input()?;
            handle.respond(input, Box::new(|ret| assert!(ret.is_ok())))
        });
        hg.register(1, accept_all, accept_all, echo).unwrap();
        hg
    }

    fn spin(ctxs: &[&HgContext]) {
        for ctx in ctxs {
            let _ = ctx.progress(Some(Duration::from_millis(1)));
            while let Ok(n) = ctx.trigger(u32::MAX) {
                assert!(n > 0);
            }
        }
    }

    #[test]
    fn forward_and_respond() {
        let fabric = Fabric::new();
        let svr = HgContext::create(&echo_class(&fabric), 0).unwrap();
        let cli = HgContext::create(&echo_class(&fabric), 0).unwrap();

        let handle = HgHandle::create(&cli, svr.self_addr(), 1).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        handle
            .forward(b"ping".to_vec(), {
                let done = done.clone();
                Box::new(move |ret| {
                    assert!(ret.is_ok());
                    done.store(true, Ordering::SeqCst);
                })
            })
            .unwrap();

        for _ in 0..100 {
            if done.load(Ordering::SeqCst) {
                break;
            }
            spin(&[&svr, &cli]);
        }
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(handle.get_output().unwrap(), b"ping");
        handle.free_output().unwrap();
        assert_eq!(handle.free_output(), Err(HgError::InvalidArg));
    }

    #[test]
    fn trigger_reports_idle_as_timeout() {
        let fabric = Fabric::new();
        let ctx = HgContext::create(&echo_class(&fabric), 0).unwrap();
        assert_eq!(ctx.trigger(u32::MAX), Err(HgError::Timeout));
        assert_eq!(
            ctx.progress(Some(Duration::from_millis(1))),
            Err(HgError::Timeout)
        );
    }

    #[test]
    fn class_outlives_contexts() {
        let fabric = Fabric::new();
        let hg = echo_class(&fabric);
        let ctx = HgContext::create(&hg, 3).unwrap();
        assert_eq!(HgContext::create(&hg, 3).err().map(|_| ()), Some(()));
        assert_eq!(hg.finalize(), Err(HgError::Busy));
        ctx.destroy().unwrap();
        assert_eq!(ctx.destroy(), Err(HgError::InvalidArg));
        hg.finalize().unwrap();
    }

    #[test]
    fn unreachable_target_fails_forward() {
        let fabric = Fabric::new();
        let cli = HgContext::create(&echo_class(&fabric), 0).unwrap();
        let handle = HgHandle::create(&cli, cli.self_addr().with_target(9), 1).unwrap();
        let ret = Arc::new(Mutex::new(None));
        handle
            .forward(Vec::new(), {
                let ret = ret.clone();
                Box::new(move |r| *ret.lock() = Some(r))
            })
            .unwrap();
        spin(&[&cli]);
        assert_eq!(*ret.lock(), Some(Err(HgError::Unreachable)));
    }
}
