//! Bulk handles and one-sided transfers.

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use super::*;

static NEXT_BULK_ID: AtomicU64 = AtomicU64::new(1);

/// Access mode of a bulk handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAccess {
    ReadOnly,
    ReadWrite,
}

/// Direction of a bulk transfer, seen from the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkXfer {
    /// Local to remote.
    Push,
    /// Remote to local.
    Pull,
}

/// A contiguous memory segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Segment {
    addr: usize,
    len: usize,
}

pub(crate) struct BulkInner {
    id: u64,
    owner: Arc<str>,
    segs: Vec<Segment>,
    access: BulkAccess,

    /// Storage allocated by the substrate when the creator gave no buffers.
    _owned: Vec<Box<[u8]>>,
    endpoint: Weak<Endpoint>,
}

impl BulkInner {
    fn size(&self) -> usize {
        self.segs.iter().map(|s| s.len).sum()
    }
}

impl Drop for BulkInner {
    fn drop(&mut self) {
        if let Some(ep) = self.endpoint.upgrade() {
            ep.bulks.remove(&self.id);
        }
    }
}

/// Portable key of a bulk handle, sent to peers so they can import it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkKey {
    pub uri: String,
    pub id: u64,
}

/// A registered list of memory segments.
///
/// The registration is released when the last clone is dropped.
#[derive(Clone)]
pub struct HgBulk(Arc<BulkInner>);

impl HgBulk {
    /// Register a segment list.
    ///
    /// With `ptrs == None` the substrate allocates zeroed storage of the
    /// given sizes itself.
    ///
    /// # Safety
    ///
    /// Caller-provided segments must be valid for reads (and for writes if
    /// `access` is [`BulkAccess::ReadWrite`]) of their sizes for as long as
    /// the handle, any clone or import of it, or any transfer involving it
    /// is alive.
    pub unsafe fn create(
        class: &HgClass,
        ptrs: Option<&[*mut u8]>,
        sizes: &[usize],
        access: BulkAccess,
    ) -> HgResult<Self> {
        let na = class.na_class();
        if sizes.is_empty() || na.is_finalized() {
            return Err(HgError::InvalidArg);
        }

        let mut owned = Vec::new();
        let segs = match ptrs {
            Some(ptrs) => {
                if ptrs.len() != sizes.len() {
                    return Err(HgError::InvalidArg);
                }
                let mut segs = Vec::with_capacity(sizes.len());
                for (&p, &len) in ptrs.iter().zip(sizes) {
                    if p.is_null() && len > 0 {
                        return Err(HgError::InvalidArg);
                    }
                    segs.push(Segment {
                        addr: p as usize,
                        len,
                    });
                }
                segs
            }
            None => sizes
                .iter()
                .map(|&len| {
                    let mut buf = vec![0u8; len].into_boxed_slice();
                    let addr = buf.as_mut_ptr() as usize;
                    owned.push(buf);
                    Segment { addr, len }
                })
                .collect(),
        };

        let ep = na.endpoint();
        let inner = Arc::new(BulkInner {
            id: NEXT_BULK_ID.fetch_add(1, Ordering::Relaxed),
            owner: ep.uri.clone(),
            segs,
            access,
            _owned: owned,
            endpoint: Arc::downgrade(ep),
        });
        ep.bulks.insert(inner.id, Arc::downgrade(&inner));
        Ok(Self(inner))
    }

    /// Return the number of segments.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.0.segs.len()
    }

    /// Return the total size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Return the access mode the handle was registered with.
    #[inline]
    pub fn access_mode(&self) -> BulkAccess {
        self.0.access
    }

    /// Return the address of the class owning the memory.
    #[inline]
    pub fn owner(&self) -> &str {
        &self.0.owner
    }

    /// Expose every segment, zero-length ones included, in registration
    /// order.
    ///
    /// Fills as many entries of `ptrs`/`sizes` as fit and returns the
    /// segment count, which may exceed the slice lengths.
    pub fn segments(&self, ptrs: &mut [*mut u8], sizes: &mut [usize]) -> usize {
        for ((p, n), seg) in ptrs.iter_mut().zip(sizes.iter_mut()).zip(&self.0.segs) {
            *p = seg.addr as *mut u8;
            *n = seg.len;
        }
        self.0.segs.len()
    }

    /// Expose the segments covering `[offset, offset + len)`.
    ///
    /// Fills as many entries of `ptrs`/`sizes` as fit and returns the number
    /// of segments the range spans, which may exceed the slice lengths.
    /// Zero-length segments hold no byte of the range and are skipped.
    pub fn access(
        &self,
        offset: usize,
        len: usize,
        access: BulkAccess,
        ptrs: &mut [*mut u8],
        sizes: &mut [usize],
    ) -> HgResult<usize> {
        if access == BulkAccess::ReadWrite && self.0.access == BulkAccess::ReadOnly {
            return Err(HgError::Permission);
        }
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.size())
            .ok_or(HgError::InvalidArg)?;

        let room = ptrs.len().min(sizes.len());
        let mut count = 0;
        let mut pos = 0;
        for seg in &self.0.segs {
            let (start, stop) = (pos, pos + seg.len);
            pos = stop;
            if seg.len == 0 || stop <= offset {
                continue;
            }
            if start >= end {
                break;
            }
            let lo = offset.max(start);
            let hi = end.min(stop);
            if count < room {
                ptrs[count] = (seg.addr + (lo - start)) as *mut u8;
                sizes[count] = hi - lo;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Return the key peers use to import this handle.
    pub fn key(&self) -> BulkKey {
        BulkKey {
            uri: self.0.owner.to_string(),
            id: self.0.id,
        }
    }

    /// Import a handle exported by a class on the same fabric.
    pub fn import(class: &HgClass, key: &BulkKey) -> HgResult<Self> {
        let ep = class
            .na_class()
            .fabric()
            .endpoint(&key.uri)
            .ok_or(HgError::NoEntry)?;
        let inner = ep
            .bulks
            .get(&key.id)
            .and_then(|weak| weak.upgrade())
            .ok_or(HgError::NoEntry)?;
        Ok(Self(inner))
    }
}

/// A bulk transfer waiting for progress.
pub(crate) struct PendingBulk {
    pub(super) id: OpId,
    op: BulkXfer,
    remote: HgBulk,
    remote_offset: usize,
    local: HgBulk,
    local_offset: usize,
    len: usize,
    pub(super) cb: OpCb,
}

impl PendingBulk {
    pub(super) fn execute(&self) -> HgResult<()> {
        let (src, src_off, dst, dst_off) = match self.op {
            BulkXfer::Push => {
                if self.remote.0.access != BulkAccess::ReadWrite {
                    return Err(HgError::Permission);
                }
                (&self.local, self.local_offset, &self.remote, self.remote_offset)
            }
            BulkXfer::Pull => {
                if self.local.0.access != BulkAccess::ReadWrite {
                    return Err(HgError::Permission);
                }
                (&self.remote, self.remote_offset, &self.local, self.local_offset)
            }
        };

        // SAFETY: bounds were checked at submission, and segment validity
        // is guaranteed by the creators of both handles.
        unsafe { copy_segments(&src.0.segs, src_off, &dst.0.segs, dst_off, self.len) };
        Ok(())
    }
}

/// Find the segment index and in-segment offset of a byte offset.
fn locate(segs: &[Segment], mut off: usize) -> (usize, usize) {
    for (i, seg) in segs.iter().enumerate() {
        if off < seg.len {
            return (i, off);
        }
        off -= seg.len;
    }
    (segs.len(), 0)
}

/// Copy `len` bytes between two segment lists.
unsafe fn copy_segments(
    src: &[Segment],
    src_off: usize,
    dst: &[Segment],
    dst_off: usize,
    mut len: usize,
) {
    let (mut si, mut soff) = locate(src, src_off);
    let (mut di, mut doff) = locate(dst, dst_off);
    while len > 0 {
        let (s, d) = (&src[si], &dst[di]);
        let n = len.min(s.len - soff).min(d.len - doff);
        ptr::copy((s.addr + soff) as *const u8, (d.addr + doff) as *mut u8, n);

        len -= n;
        soff += n;
        doff += n;
        if soff == s.len {
            si += 1;
            soff = 0;
        }
        if doff == d.len {
            di += 1;
            doff = 0;
        }
    }
}

impl HgContext {
    /// Submit a one-sided transfer between a local and a remote handle.
    ///
    /// `origin` must be the address of the class owning `remote`. The
    /// transfer executes during progress; `cb` runs from `trigger`.
    #[allow(clippy::too_many_arguments)]
    pub fn bulk_transfer(
        &self,
        op: BulkXfer,
        origin: &NaAddr,
        remote: &HgBulk,
        remote_offset: usize,
        local: &HgBulk,
        local_offset: usize,
        len: usize,
        cb: OpCb,
    ) -> HgResult<OpId> {
        self.check_alive()?;
        if *remote.0.owner != *origin.uri {
            return Err(HgError::InvalidArg);
        }
        let fits = |offset: usize, bulk: &HgBulk| {
            offset
                .checked_add(len)
                .map_or(false, |end| end <= bulk.size())
        };
        if !fits(remote_offset, remote) || !fits(local_offset, local) {
            return Err(HgError::InvalidArg);
        }

        let id = next_op_id();
        let mut ops = self.0.bulk_ops.lock();
        self.check_alive()?;
        ops.push_back(PendingBulk {
            id,
            op,
            remote: remote.clone(),
            remote_offset,
            local: local.clone(),
            local_offset,
            len,
            cb,
        });
        drop(ops);
        self.wake();
        Ok(id)
    }

    /// Cancel a submitted bulk transfer.
    #[inline]
    pub fn bulk_cancel(&self, id: OpId) -> HgResult<()> {
        self.cancel_op(id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    fn class(fabric: &Arc<Fabric>) -> HgClass {
        let na = NaClass::initialize(fabric, "ofi+tcp://", true).unwrap();
        HgClass::init_na(&na).unwrap()
    }

    fn transfer(
        ctx: &HgContext,
        op: BulkXfer,
        origin: &NaAddr,
        remote: &HgBulk,
        local: &HgBulk,
        len: usize,
    ) -> HgResult<()> {
        let ret = Arc::new(Mutex::new(None));
        ctx.bulk_transfer(op, origin, remote, 0, local, 0, len, {
            let ret = ret.clone();
            Box::new(move |r| *ret.lock() = Some(r))
        })
        .unwrap();
        for _ in 0..10 {
            let _ = ctx.progress(Some(Duration::from_millis(1)));
            let _ = ctx.trigger(u32::MAX);
            if let Some(r) = *ret.lock() {
                return r;
            }
        }
        panic!("bulk transfer did not complete");
    }

    #[test]
    fn pull_across_segments() {
        let fabric = Fabric::new();
        let (a, b) = (class(&fabric), class(&fabric));
        let ctx = HgContext::create(&b, 0).unwrap();

        let mut x = *b"hello, ";
        let mut y = *b"world";
        let ptrs = [x.as_mut_ptr(), y.as_mut_ptr()];
        let remote = unsafe { HgBulk::create(&a, Some(&ptrs), &[7, 5], BulkAccess::ReadOnly) }.unwrap();
        let local = unsafe { HgBulk::create(&b, None, &[4, 4, 4], BulkAccess::ReadWrite) }.unwrap();
        assert_eq!(local.size(), 12);

        let origin = a.na_class().addr_self();
        transfer(&ctx, BulkXfer::Pull, &origin, &remote, &local, 12).unwrap();

        let mut ptrs = [ptr::null_mut(); 3];
        let mut sizes = [0; 3];
        assert_eq!(local.access(0, 12, BulkAccess::ReadOnly, &mut ptrs, &mut sizes).unwrap(), 3);
        let mut got = Vec::new();
        for (p, n) in ptrs.iter().zip(sizes) {
            got.extend_from_slice(unsafe { std::slice::from_raw_parts(*p, n) });
        }
        assert_eq!(got, b"hello, world");
        ctx.destroy().unwrap();
    }

    #[test]
    fn push_needs_writable_remote() {
        let fabric = Fabric::new();
        let (a, b) = (class(&fabric), class(&fabric));
        let ctx = HgContext::create(&b, 0).unwrap();
        let remote = unsafe { HgBulk::create(&a, None, &[8], BulkAccess::ReadOnly) }.unwrap();
        let local = unsafe { HgBulk::create(&b, None, &[8], BulkAccess::ReadWrite) }.unwrap();
        let origin = a.na_class().addr_self();
        assert_eq!(
            transfer(&ctx, BulkXfer::Push, &origin, &remote, &local, 8),
            Err(HgError::Permission)
        );
        ctx.destroy().unwrap();
    }

    #[test]
    fn access_reports_required_count() {
        let fabric = Fabric::new();
        let a = class(&fabric);
        let bulk = unsafe { HgBulk::create(&a, None, &[2, 2, 2, 2], BulkAccess::ReadOnly) }.unwrap();

        let mut ptrs = [ptr::null_mut(); 1];
        let mut sizes = [0; 1];
        assert_eq!(bulk.access(1, 4, BulkAccess::ReadOnly, &mut ptrs, &mut sizes).unwrap(), 3);
        assert_eq!(sizes[0], 1);
        assert_eq!(
            bulk.access(0, 8, BulkAccess::ReadWrite, &mut ptrs, &mut sizes),
            Err(HgError::Permission)
        );
        assert_eq!(
            bulk.access(4, 5, BulkAccess::ReadOnly, &mut ptrs, &mut sizes),
            Err(HgError::InvalidArg)
        );
    }

    #[test]
    fn segments_include_empty_ones() {
        let fabric = Fabric::new();
        let a = class(&fabric);
        let bulk = unsafe { HgBulk::create(&a, None, &[3, 0, 5], BulkAccess::ReadOnly) }.unwrap();

        let mut ptrs = [ptr::null_mut(); 3];
        let mut sizes = [usize::MAX; 3];
        assert_eq!(bulk.segments(&mut ptrs, &mut sizes), 3);
        assert_eq!(sizes, [3, 0, 5]);

        // A short output still reports the full count.
        let mut sizes = [0; 1];
        assert_eq!(bulk.segments(&mut ptrs[..1], &mut sizes), 3);
        assert_eq!(sizes, [3]);
    }

    #[test]
    fn import_by_key() {
        let fabric = Fabric::new();
        let (a, b) = (class(&fabric), class(&fabric));
        let bulk = unsafe { HgBulk::create(&a, None, &[16], BulkAccess::ReadWrite) }.unwrap();
        let key = bulk.key();

        let imported = HgBulk::import(&b, &key).unwrap();
        assert_eq!(imported.size(), 16);
        assert_eq!(imported.owner(), a.na_class().addr_self().uri());

        drop((bulk, imported));
        assert_eq!(HgBulk::import(&b, &key).err(), Some(HgError::NoEntry));
    }
}
