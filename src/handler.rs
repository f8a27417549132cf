//! Request handlers and inbound dispatch.

use std::sync::{Arc, Weak};

use crate::context::Context;
use crate::error::Result;
use crate::nexus::NexusInner;
use crate::opcode::{MAX_INPUT_SIZE, MAX_OUTPUT_SIZE};
use crate::proc;
use crate::request::Request;
use crate::transport::{HgError, HgHandle, HgResult};

/// Handler of one application opcode.
///
/// A handler typically reads the input, sets the output and calls
/// [`Request::reply_send`]; it may also keep a clone of the request and
/// reply later. Returning an error without replying answers the originator
/// with a failure.
pub trait RpcHandler: Send + Sync {
    fn handle(&self, req: &Request) -> Result<()>;
}

impl<F> RpcHandler for F
where
    F: Fn(&Request) -> Result<()> + Send + Sync,
{
    #[inline]
    fn handle(&self, req: &Request) -> Result<()> {
        self(req)
    }
}

/// Entry point of every request arriving on the shared wire RPC.
///
/// Errors returned here are sent back to the originator by the transport.
pub(crate) fn rpc_handler_common(nexus: &Weak<NexusInner>, handle: HgHandle) -> HgResult<()> {
    let Some(nexus) = nexus.upgrade() else {
        log::warn!("dropping request for a destroyed Nexus");
        return Err(HgError::Protocol);
    };

    let hg_id = handle.context().id();
    let Some(ctx) = nexus.contexts.lookup(hg_id) else {
        log::warn!("dropping request for unregistered HG context {}", hg_id);
        return Err(HgError::Protocol);
    };

    let raw = handle.get_input().map_err(|e| {
        log::warn!("context {}: HG_Get_input failed: {}", ctx.idx(), e);
        e
    })?;
    let (hdr, body) = proc::unpack_request(&raw)?;

    let opc = hdr.opc();
    let Some(info) = nexus.opcodes.lookup(opc).cloned() else {
        log::warn!("context {}: no handler for opcode {:#x}", ctx.idx(), opc);
        let _ = handle.free_input();
        return Err(HgError::NoMatch);
    };
    let Some(handler) = info.handler().cloned() else {
        log::warn!("context {}: opcode {:#x} is client-only", ctx.idx(), opc);
        let _ = handle.free_input();
        return Err(HgError::NoMatch);
    };

    let format = info.format();
    if format.input_size > MAX_INPUT_SIZE
        || format.output_size > MAX_OUTPUT_SIZE
        || body.len() > format.input_size
    {
        log::warn!(
            "context {}: opcode {:#x} body of {} bytes does not fit {:?}",
            ctx.idx(),
            opc,
            body.len(),
            format
        );
        let _ = handle.free_input();
        return Err(HgError::InvalidArg);
    }

    let body = if format.input_size > 0 {
        body.to_vec()
    } else {
        Vec::new()
    };
    let req = Request::inbound(ctx.clone(), info, handle, &hdr, body);
    log::trace!(
        "context {}: request {} (opc {:#x}) from rank {}",
        ctx.idx(),
        req.id(),
        opc,
        hdr.src_rank()
    );
    dispatch(&ctx, handler, req);
    Ok(())
}

/// Run the handler inline, or on the context's worker pool if it has one.
fn dispatch(ctx: &Context, handler: Arc<dyn RpcHandler>, req: Request) {
    match ctx.pool() {
        Some(pool) => {
            let job_req = req.clone();
            if let Err(e) = pool.submit(Box::new(move || run_handler(&*handler, job_req))) {
                log::error!("context {}: worker pool rejected request {}: {}", ctx.idx(), req.id(), e);
                req.reply_error(HgError::Busy);
            }
        }
        None => run_handler(&*handler, req),
    }
}

fn run_handler(handler: &dyn RpcHandler, req: Request) {
    if let Err(e) = handler.handle(&req) {
        log::debug!(
            "request {} (opc {:#x}): handler failed: {}",
            req.id(),
            req.opc(),
            e
        );
        if !req.is_replied() {
            req.reply_error(HgError::Other);
        }
    }
}
