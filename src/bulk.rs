//! Bulk data transfer.
//!
//! Bulk handles register memory so that a peer can read or write it without
//! the data travelling in RPC bodies. A handle is typically created by the
//! side owning the data, its [`BulkKey`] is carried in a request body, and
//! the other side imports it and pulls or pushes with [`transfer`].

use std::ptr;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::transport::{BulkAccess, BulkKey, BulkXfer, HgBulk};
use crate::type_alias::*;

/// Segment lists up to this length are described without allocating.
const IOVN_STACK: usize = 8;

/// One memory segment.
#[derive(Debug, Clone, Copy)]
pub struct Iov {
    /// Start of the segment.
    pub buf: *mut u8,
    /// Capacity of the segment.
    pub buf_len: usize,
    /// Bytes of valid data.
    pub len: usize,
}

impl Iov {
    pub fn new(buf: *mut u8, len: usize) -> Self {
        Self {
            buf,
            buf_len: len,
            len,
        }
    }

    /// A segment without memory; a handle created from these gets its
    /// storage allocated by the transport.
    pub fn unbacked(len: usize) -> Self {
        Self {
            buf: ptr::null_mut(),
            buf_len: len,
            len,
        }
    }
}

impl Default for Iov {
    fn default() -> Self {
        Self::new(ptr::null_mut(), 0)
    }
}

/// A scatter-gather list.
#[derive(Debug, Clone, Default)]
pub struct SgList {
    pub iovs: Vec<Iov>,
    /// Number of entries filled in by [`BulkHandle::access`], or required
    /// if the list was too short.
    pub nr_out: usize,
}

impl SgList {
    pub fn new(iovs: Vec<Iov>) -> Self {
        Self { iovs, nr_out: 0 }
    }

    /// A list of `n` empty entries, to be filled by [`BulkHandle::access`].
    pub fn with_capacity(n: usize) -> Self {
        Self::new(vec![Iov::default(); n])
    }
}

/// Access a peer is granted to a bulk handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkPerm {
    ReadOnly,
    ReadWrite,
}

impl From<BulkPerm> for BulkAccess {
    fn from(perm: BulkPerm) -> Self {
        match perm {
            BulkPerm::ReadOnly => BulkAccess::ReadOnly,
            BulkPerm::ReadWrite => BulkAccess::ReadWrite,
        }
    }
}

/// Direction of a transfer, seen from the side calling [`transfer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOp {
    /// Write local memory into the remote handle.
    Put,
    /// Read the remote handle into local memory.
    Get,
}

/// A registered memory region.
#[derive(Clone)]
pub struct BulkHandle(HgBulk);

impl BulkHandle {
    /// Register the segments of `sgl`.
    ///
    /// If every segment pointer is null, the transport allocates zeroed
    /// memory of the given lengths.
    ///
    /// # Safety
    ///
    /// Non-null segments must stay valid for reads, and for writes with
    /// [`BulkPerm::ReadWrite`], until every clone and import of the handle
    /// and every transfer using it is gone.
    pub unsafe fn create(ctx: &Context, sgl: &SgList, perm: BulkPerm) -> Result<Self> {
        ctx.check_alive()?;
        let n = sgl.iovs.len();
        if n == 0 {
            return Err(Error::inval("empty scatter-gather list"));
        }
        let allocate = sgl.iovs.iter().all(|iov| iov.buf.is_null());

        let ret = if n <= IOVN_STACK {
            let mut ptrs = [ptr::null_mut(); IOVN_STACK];
            let mut sizes = [0; IOVN_STACK];
            for (i, iov) in sgl.iovs.iter().enumerate() {
                ptrs[i] = iov.buf;
                sizes[i] = iov.buf_len;
            }
            let ptrs = (!allocate).then_some(&ptrs[..n]);
            HgBulk::create(ctx.bulk_class(), ptrs, &sizes[..n], perm.into())
        } else {
            let ptrs: Vec<*mut u8> = sgl.iovs.iter().map(|iov| iov.buf).collect();
            let sizes: Vec<usize> = sgl.iovs.iter().map(|iov| iov.buf_len).collect();
            let ptrs = (!allocate).then_some(&ptrs[..]);
            HgBulk::create(ctx.bulk_class(), ptrs, &sizes, perm.into())
        };

        ret.map(Self).map_err(|e| {
            log::error!("context {}: HG_Bulk_create({} segments) failed: {}", ctx.idx(), n, e);
            e.into()
        })
    }

    /// Import a handle registered by a peer.
    pub fn import(ctx: &Context, key: &BulkKey) -> Result<Self> {
        ctx.check_alive()?;
        HgBulk::import(ctx.bulk_class(), key)
            .map(Self)
            .map_err(Error::from)
    }

    /// Return the key a peer imports this handle with.
    #[inline]
    pub fn key(&self) -> BulkKey {
        self.0.key()
    }

    /// Total registered length.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.size() == 0
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.0.segment_count()
    }

    #[inline]
    pub fn perm(&self) -> BulkPerm {
        match self.0.access_mode() {
            BulkAccess::ReadOnly => BulkPerm::ReadOnly,
            BulkAccess::ReadWrite => BulkPerm::ReadWrite,
        }
    }

    /// Describe the registered segments in `sgl`.
    ///
    /// If `sgl` has fewer entries than the handle has segments, nothing is
    /// written, `sgl.nr_out` is set to the required count and
    /// [`Error::Truncated`] is returned.
    pub fn access(&self, sgl: &mut SgList) -> Result<()> {
        let count = self.0.segment_count();
        if sgl.iovs.len() < count {
            sgl.nr_out = count;
            return Err(Error::Truncated { required: count });
        }

        let mut ptrs = vec![ptr::null_mut(); count];
        let mut sizes = vec![0; count];
        self.0.segments(&mut ptrs, &mut sizes);
        for (iov, (&buf, &len)) in sgl.iovs.iter_mut().zip(ptrs.iter().zip(&sizes)) {
            *iov = Iov::new(buf, len);
        }
        sgl.nr_out = count;
        Ok(())
    }
}

/// A bulk transfer, issued in the scope of a request.
#[derive(Clone)]
pub struct BulkDesc {
    /// Request whose peer owns `remote`.
    pub rpc: Request,
    pub op: BulkOp,
    pub remote: BulkHandle,
    pub remote_off: usize,
    pub local: BulkHandle,
    pub local_off: usize,
    pub len: usize,
}

/// Argument of a bulk completion callback.
pub struct BulkCbInfo<'a> {
    /// Outcome; [`Error::Canceled`] if the transfer was canceled.
    pub rc: Result<()>,
    pub desc: &'a BulkDesc,
}

/// Bulk completion callback.
pub type BulkCallback = Box<dyn FnOnce(BulkCbInfo<'_>) + Send + 'static>;

/// Start a transfer.
///
/// The descriptor is copied; the copy holds a reference to the request
/// until `cb` has run from `progress` on the request's context.
pub fn transfer(desc: &BulkDesc, cb: Option<BulkCallback>) -> Result<BulkOpId> {
    let ctx = desc.rpc.context().clone();
    ctx.check_alive()?;

    let dup = desc.clone();
    let origin = dup.rpc.addr().clone();
    let (remote, local) = (dup.remote.0.clone(), dup.local.0.clone());
    let (remote_off, local_off, len) = (dup.remote_off, dup.local_off, dup.len);
    let xfer = match dup.op {
        BulkOp::Put => BulkXfer::Push,
        BulkOp::Get => BulkXfer::Pull,
    };

    let id = ctx
        .bulk_context()
        .bulk_transfer(
            xfer,
            &origin,
            &remote,
            remote_off,
            &local,
            local_off,
            len,
            Box::new(move |ret| {
                let rc = ret.map_err(Error::from);
                match cb {
                    Some(cb) => cb(BulkCbInfo { rc, desc: &dup }),
                    None => {
                        if let Err(e) = rc {
                            log::debug!("request {}: unwatched bulk transfer failed: {}", dup.rpc.id(), e);
                        }
                    }
                }
            }),
        )
        .map_err(|e| {
            log::error!("request {}: HG_Bulk_transfer failed: {}", desc.rpc.id(), e);
            Error::from(e)
        })?;

    log::trace!(
        "request {}: bulk {:?} of {} bytes submitted as op {}",
        desc.rpc.id(),
        desc.op,
        desc.len,
        id
    );
    Ok(id)
}

/// Cancel a transfer started on `ctx`. Its callback runs with
/// [`Error::Canceled`] unless the transfer already completed.
pub fn cancel(ctx: &Context, op: BulkOpId) -> Result<()> {
    ctx.bulk_context().bulk_cancel(op)?;
    log::debug!("context {}: bulk op {} cancel requested", ctx.idx(), op);
    Ok(())
}
