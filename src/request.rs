//! RPC requests and their state machine.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::group::Endpoint;
use crate::nexus::COMMON_RPC_ID;
use crate::opcode::OpcInfo;
use crate::proc::{self, RequestHeader};
use crate::transport::*;
use crate::type_alias::*;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// State of a request.
///
/// Originator requests move `Initialized → Sent → ReplyReceived →
/// Completed`, or end in `Canceled`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcState {
    Initialized = 0,
    Sent = 1,
    ReplyReceived = 2,
    Completed = 3,
    Canceled = 4,
}

impl From<u8> for RpcState {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Initialized,
            1 => Self::Sent,
            2 => Self::ReplyReceived,
            3 => Self::Completed,
            _ => Self::Canceled,
        }
    }
}

/// Which side of an RPC a request stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Originator,
    Target,
}

/// Argument of a send completion callback.
pub struct CbInfo<'a> {
    /// Outcome of the RPC; [`Error::Canceled`] if it was canceled.
    pub rc: Result<()>,
    pub req: &'a Request,
}

/// Send completion callback.
pub type CompletionCb = Box<dyn FnOnce(CbInfo<'_>) + Send + 'static>;

pub(crate) struct RequestInner {
    id: ReqId,
    info: Arc<OpcInfo>,
    ctx: Context,
    role: Role,
    addr: NaAddr,

    handle: Mutex<Option<HgHandle>>,
    state: AtomicU8,

    input: Mutex<Vec<u8>>,
    output: Mutex<Vec<u8>>,
    /// Whether the raw input/output is still held by the handle.
    input_got: AtomicBool,
    output_got: AtomicBool,

    /// Sender's rank and group; target requests only.
    src: Option<(Rank, GroupId)>,
    replied: AtomicBool,
}

impl Drop for RequestInner {
    fn drop(&mut self) {
        let Some(handle) = self.handle.get_mut().take() else {
            return;
        };

        if self.role == Role::Target && !self.replied.load(Ordering::Acquire) {
            log::warn!(
                "request {} (opc {:#x}): dropped without a reply",
                self.id,
                self.info.opc()
            );
            handle.respond_error(HgError::Other);
        }
        if self.input_got.load(Ordering::Acquire) {
            if let Err(e) = handle.free_input() {
                log::warn!("request {}: HG_Free_input failed: {}", self.id, e);
            }
        }
        if self.output_got.load(Ordering::Acquire) {
            if let Err(e) = handle.free_output() {
                log::warn!("request {}: HG_Free_output failed: {}", self.id, e);
            }
        }
        log::trace!("request {}: destroyed", self.id);
    }
}

/// An RPC request.
///
/// Clones share one request; it is destroyed when the last clone is
/// dropped. Every asynchronous operation on a request holds a clone until
/// its completion callback has run.
#[derive(Clone)]
pub struct Request(Arc<RequestInner>);

impl Request {
    fn new(
        ctx: Context,
        info: Arc<OpcInfo>,
        role: Role,
        addr: NaAddr,
        handle: HgHandle,
        src: Option<(Rank, GroupId)>,
    ) -> Self {
        Self(Arc::new(RequestInner {
            id: NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed),
            info,
            ctx,
            role,
            addr,
            handle: Mutex::new(Some(handle)),
            state: AtomicU8::new(RpcState::Initialized as u8),
            input: Mutex::new(Vec::new()),
            output: Mutex::new(Vec::new()),
            input_got: AtomicBool::new(false),
            output_got: AtomicBool::new(false),
            src,
            replied: AtomicBool::new(false),
        }))
    }

    /// Create a request for opcode `opc` to the context at `ep`.
    ///
    /// The opcode must be registered. Resolving `ep` may drive `ctx` until
    /// the address lookup completes.
    pub fn create(ctx: &Context, ep: Endpoint, opc: Opcode) -> Result<Self> {
        ctx.check_alive()?;
        let nexus = ctx.nexus();
        let info = nexus.opcodes.lookup(opc).cloned().ok_or_else(|| {
            log::debug!("opcode {:#x} is not registered", opc);
            Error::NoMatch
        })?;

        let addr = nexus.group.resolve(ctx, ep.rank, ep.tag)?;
        let handle = HgHandle::create(ctx.hg_context(), addr.clone(), COMMON_RPC_ID).map_err(|e| {
            log::error!("HG_Create({}) failed: {}", addr, e);
            Error::from(e)
        })?;

        let req = Self::new(ctx.clone(), info, Role::Originator, addr, handle, None);
        log::trace!("request {}: created, opc {:#x} to {:?}", req.id(), opc, ep);
        Ok(req)
    }

    /// Build the target side of an inbound request.
    pub(crate) fn inbound(
        ctx: Context,
        info: Arc<OpcInfo>,
        handle: HgHandle,
        hdr: &RequestHeader,
        body: Vec<u8>,
    ) -> Self {
        let addr = handle.info().addr;
        let req = Self::new(
            ctx,
            info,
            Role::Target,
            addr,
            handle,
            Some((hdr.src_rank(), hdr.grp_id())),
        );
        // The raw input was retrieved from the handle by dispatch.
        req.0.input_got.store(true, Ordering::Release);
        *req.0.input.lock() = body;
        req
    }

    #[inline]
    pub fn id(&self) -> ReqId {
        self.0.id
    }

    #[inline]
    pub fn opc(&self) -> Opcode {
        self.0.info.opc()
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.0.role
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.0.ctx
    }

    /// Return the peer address: the target on the originator side, the
    /// sender on the target side.
    #[inline]
    pub fn addr(&self) -> &NaAddr {
        &self.0.addr
    }

    #[inline]
    pub fn state(&self) -> RpcState {
        self.0.state.load(Ordering::Acquire).into()
    }

    /// Rank of the sender; target requests only.
    #[inline]
    pub fn src_rank(&self) -> Option<Rank> {
        self.0.src.map(|(rank, _)| rank)
    }

    /// Group of the sender; target requests only.
    #[inline]
    pub fn src_group(&self) -> Option<GroupId> {
        self.0.src.map(|(_, grp)| grp)
    }

    /// Number of live references to this request.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Return `true` once a reply was submitted.
    #[inline]
    pub fn is_replied(&self) -> bool {
        self.0.replied.load(Ordering::Acquire)
    }

    #[inline]
    fn set_state(&self, state: RpcState) {
        self.0.state.store(state as u8, Ordering::Release);
    }

    fn handle(&self) -> Result<HgHandle> {
        self.0
            .handle
            .lock()
            .clone()
            .ok_or_else(|| Error::inval(format!("request {} has no handle", self.0.id)))
    }
}

/// Payload access.
impl Request {
    /// Serialize `val` as the input body.
    pub fn set_input<T: Serialize + ?Sized>(&self, val: &T) -> Result<()> {
        self.set_input_bytes(rmp_serde::to_vec(val)?)
    }

    /// Set the serialized input body.
    pub fn set_input_bytes(&self, body: Vec<u8>) -> Result<()> {
        if self.0.role != Role::Originator || self.state() != RpcState::Initialized {
            return Err(Error::inval("input can only be set before sending"));
        }
        let limit = self.0.info.format().input_size;
        if body.len() > limit {
            return Err(Error::inval(format!(
                "input body of {} bytes exceeds {} declared by opcode {:#x}",
                body.len(),
                limit,
                self.opc()
            )));
        }
        *self.0.input.lock() = body;
        Ok(())
    }

    /// Deserialize the input body.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(rmp_serde::from_slice(&self.0.input.lock())?)
    }

    /// Return a copy of the serialized input body.
    pub fn input_bytes(&self) -> Vec<u8> {
        self.0.input.lock().clone()
    }

    /// Serialize `val` as the output body.
    pub fn set_output<T: Serialize + ?Sized>(&self, val: &T) -> Result<()> {
        self.set_output_bytes(rmp_serde::to_vec(val)?)
    }

    /// Set the serialized output body.
    pub fn set_output_bytes(&self, body: Vec<u8>) -> Result<()> {
        if self.0.role != Role::Target || self.is_replied() {
            return Err(Error::inval("output can only be set before replying"));
        }
        let limit = self.0.info.format().output_size;
        if body.len() > limit {
            return Err(Error::inval(format!(
                "output body of {} bytes exceeds {} declared by opcode {:#x}",
                body.len(),
                limit,
                self.opc()
            )));
        }
        *self.0.output.lock() = body;
        Ok(())
    }

    /// Deserialize the output body.
    pub fn output<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(rmp_serde::from_slice(&self.0.output.lock())?)
    }

    /// Return a copy of the serialized output body.
    pub fn output_bytes(&self) -> Vec<u8> {
        self.0.output.lock().clone()
    }
}

/// State machine.
impl Request {
    /// Send this request.
    ///
    /// `cb`, if given, runs from `progress` exactly once: with `Ok` after the
    /// reply arrived, [`Error::Canceled`] after [`Request::cancel`], or the
    /// failure. The request stays alive until then.
    pub fn send(&self, cb: Option<CompletionCb>) -> Result<()> {
        if self.0.role != Role::Originator {
            return Err(Error::inval("only originator requests can be sent"));
        }
        let handle = self.handle()?;
        if self
            .0
            .state
            .compare_exchange(
                RpcState::Initialized as u8,
                RpcState::Sent as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::inval(format!(
                "request {} already sent ({:?})",
                self.0.id,
                self.state()
            )));
        }

        let nexus = self.0.ctx.nexus();
        let raw = proc::pack_request(
            nexus.group.id(),
            self.opc(),
            nexus.config.self_rank,
            &self.0.input.lock(),
        );
        self.0.ctx.track(self.0.id, self.opc());

        let req = self.clone();
        let ret = handle.forward(raw, Box::new(move |ret| req.send_complete(ret, cb)));
        if let Err(e) = ret {
            // The closure and its reference were dropped by the failed submit.
            log::error!("request {}: HG_Forward failed: {}", self.0.id, e);
            self.0.ctx.untrack(self.0.id);
            self.set_state(RpcState::Initialized);
            return Err(e.into());
        }
        log::trace!("request {}: sent to {}", self.0.id, self.0.addr);
        Ok(())
    }

    /// Completion of `send`; consumes the reference taken by it.
    fn send_complete(self, ret: HgResult<()>, cb: Option<CompletionCb>) {
        let rc = match ret {
            Ok(()) => {
                self.set_state(RpcState::ReplyReceived);
                self.fetch_output()
            }
            Err(e) => Err(Error::from(e)),
        };
        let canceled = matches!(rc, Err(Error::Canceled));

        match cb {
            Some(cb) => cb(CbInfo { rc, req: &self }),
            None => {
                if let Err(e) = rc {
                    log::debug!("request {}: unwatched send failed: {}", self.0.id, e);
                }
            }
        }

        self.set_state(if canceled {
            RpcState::Canceled
        } else {
            RpcState::Completed
        });
        self.0.ctx.untrack(self.0.id);
        log::trace!("request {}: completed ({:?})", self.0.id, self.state());
    }

    /// Retrieve the reply body from the handle.
    fn fetch_output(&self) -> Result<()> {
        let handle = self.handle()?;
        let raw = handle.get_output()?;
        self.0.output_got.store(true, Ordering::Release);
        let body = proc::unpack_reply(&raw)?;
        *self.0.output.lock() = body.to_vec();
        Ok(())
    }

    /// Ask the transport to cancel this request.
    ///
    /// The completion callback still runs, from `progress`, with
    /// [`Error::Canceled`].
    pub fn cancel(&self) -> Result<()> {
        if self.state() != RpcState::Sent {
            return Err(Error::inval(format!(
                "request {} cannot be canceled in state {:?}",
                self.0.id,
                self.state()
            )));
        }
        self.handle()?.cancel()?;
        log::debug!("request {}: cancel requested", self.0.id);
        Ok(())
    }

    /// Send the output body back to the originator of a target request.
    pub fn reply_send(&self) -> Result<()> {
        if self.0.role != Role::Target {
            return Err(Error::inval("only target requests can be replied to"));
        }
        let handle = self.handle()?;
        let raw = proc::pack_reply(&self.0.output.lock());

        // Keep the request alive until the reply is on the wire.
        let req = self.clone();
        handle
            .respond(
                raw,
                Box::new(move |ret| {
                    if let Err(e) = ret {
                        log::error!("request {}: reply failed: {}", req.id(), e);
                    }
                    drop(req);
                }),
            )
            .map_err(|e| {
                log::error!("request {}: HG_Respond failed: {}", self.0.id, e);
                Error::from(e)
            })?;

        self.0.replied.store(true, Ordering::Release);
        log::trace!("request {}: replied to {}", self.0.id, self.0.addr);
        Ok(())
    }

    /// Answer a target request with an error instead of a reply.
    pub(crate) fn reply_error(&self, err: HgError) {
        if let Ok(handle) = self.handle() {
            handle.respond_error(err);
            self.0.replied.store(true, Ordering::Release);
        }
    }

    /// Send this request and return a future resolving to its outcome.
    ///
    /// Polling the future drives the request's context.
    pub fn send_async(&self) -> ReplyFuture {
        let slot = Arc::new(Mutex::new(None));
        let submit = self
            .send(Some({
                let slot = slot.clone();
                Box::new(move |info: CbInfo<'_>| *slot.lock() = Some(info.rc))
            }))
            .err();
        ReplyFuture {
            req: self.clone(),
            slot,
            submit,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.0.id)
            .field("opc", &format_args!("{:#x}", self.opc()))
            .field("role", &self.0.role)
            .field("state", &self.state())
            .field("addr", &self.0.addr)
            .finish()
    }
}

/// Reply awaitable returned by [`Request::send_async`].
pub struct ReplyFuture {
    req: Request,
    slot: Arc<Mutex<Option<Result<()>>>>,
    submit: Option<Error>,
}

impl Future for ReplyFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(e) = this.submit.take() {
            return Poll::Ready(Err(e));
        }
        if let Some(rc) = this.slot.lock().take() {
            return Poll::Ready(rc);
        }

        match this.req.context().progress(Some(Duration::ZERO)) {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {}
            Err(e) => return Poll::Ready(Err(e)),
        }
        if let Some(rc) = this.slot.lock().take() {
            return Poll::Ready(rc);
        }
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
