//! Bulk handles and transfers.

use std::slice;

use rand::RngCore;

use super::*;
use crate::bulk::{self, *};
use crate::transport::BulkKey;

const RPC_BULK: Opcode = 0x400;
const RPC_SUM: Opcode = 0x401;

fn on_bulk(f: impl FnOnce(BulkCbInfo<'_>) + Send + 'static) -> Option<BulkCallback> {
    Some(Box::new(f))
}

/// Two Nexus instances on one thread; `b` holds a request addressed to `a`.
struct Pair {
    a: Nexus,
    a_ctx: Context,
    b: Nexus,
    b_ctx: Context,
    req: Request,
}

impl Pair {
    fn new(fabric: &Arc<Fabric>) -> Self {
        let opcodes = || {
            OpcodeMap::builder()
                .register_client(RPC_BULK, FMT)
                .unwrap()
                .build()
        };
        let a = Nexus::new(
            fabric,
            NexusConfig::new(),
            opcodes(),
            Arc::new(StaticGroup::new(GROUP_ID)),
        );
        a.init(None).unwrap();
        let a_ctx = a.context_init(0).unwrap();

        let group = Arc::new(StaticGroup::new(GROUP_ID));
        group.insert(0, a_ctx.self_uri());
        let b = Nexus::new(fabric, NexusConfig::new().with_rank(1), opcodes(), group);
        b.init(None).unwrap();
        let b_ctx = b.context_init(0).unwrap();

        let req = Request::create(&b_ctx, Endpoint::new(0, 0), RPC_BULK).unwrap();
        Self {
            a,
            a_ctx,
            b,
            b_ctx,
            req,
        }
    }

    fn desc(&self, op: BulkOp, remote: &BulkHandle, local: &BulkHandle, len: usize) -> BulkDesc {
        BulkDesc {
            rpc: self.req.clone(),
            op,
            remote: BulkHandle::import(&self.b_ctx, &remote.key()).unwrap(),
            remote_off: 0,
            local: local.clone(),
            local_off: 0,
            len,
        }
    }

    fn shutdown(self) {
        drop(self.req);
        self.a.context_fini(&self.a_ctx).unwrap();
        self.b.context_fini(&self.b_ctx).unwrap();
        self.a.finalize().unwrap();
        self.b.finalize().unwrap();
    }
}

fn sgl_of(bufs: &mut [Vec<u8>]) -> SgList {
    SgList::new(
        bufs.iter_mut()
            .map(|b| Iov::new(b.as_mut_ptr(), b.len()))
            .collect(),
    )
}

/// Short segment lists live on the stack, long ones on the heap; both must
/// describe their segments identically, from any thread.
#[test]
fn create_from_many_threads() {
    init_logger();
    let fabric = Fabric::new();
    let nx = Nexus::new(
        &fabric,
        NexusConfig::new(),
        OpcodeMap::default(),
        Arc::new(StaticGroup::new(GROUP_ID)),
    );
    nx.init(None).unwrap();
    let ctx = nx.context_init(0).unwrap();

    let workers: Vec<_> = [4usize, 20]
        .into_iter()
        .map(|n| {
            let ctx = ctx.clone();
            thread::spawn(move || {
                let mut bufs: Vec<Vec<u8>> = (0..n).map(|i| vec![i as u8; 64 + i]).collect();
                let sgl = sgl_of(&mut bufs);
                let bulk = unsafe { BulkHandle::create(&ctx, &sgl, BulkPerm::ReadWrite) }.unwrap();
                assert_eq!(bulk.segment_count(), n);
                assert_eq!(bulk.len(), bufs.iter().map(Vec::len).sum::<usize>());
                assert_eq!(bulk.perm(), BulkPerm::ReadWrite);

                let mut out = SgList::with_capacity(n);
                bulk.access(&mut out).unwrap();
                assert_eq!(out.nr_out, n);
                for (iov, buf) in out.iovs.iter().zip(&bufs) {
                    assert_eq!(iov.buf as *const u8, buf.as_ptr());
                    assert_eq!(iov.len, buf.len());
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    nx.context_fini(&ctx).unwrap();
    nx.finalize().unwrap();
}

#[test]
fn access_reports_required_length() {
    init_logger();
    let fabric = Fabric::new();
    let pair = Pair::new(&fabric);

    let mut bufs: Vec<Vec<u8>> = (0..20).map(|_| vec![0; 16]).collect();
    let bulk =
        unsafe { BulkHandle::create(&pair.a_ctx, &sgl_of(&mut bufs), BulkPerm::ReadOnly) }.unwrap();

    let mut out = SgList::with_capacity(3);
    assert!(matches!(
        bulk.access(&mut out),
        Err(Error::Truncated { required: 20 })
    ));
    assert_eq!(out.nr_out, 20);
    assert!(out.iovs.iter().all(|iov| iov.buf.is_null()));

    // Transport-allocated storage.
    let sgl = SgList::new(vec![Iov::unbacked(32), Iov::unbacked(32)]);
    let owned = unsafe { BulkHandle::create(&pair.a_ctx, &sgl, BulkPerm::ReadWrite) }.unwrap();
    assert_eq!(owned.len(), 64);
    let mut out = SgList::with_capacity(4);
    owned.access(&mut out).unwrap();
    assert_eq!(out.nr_out, 2);
    assert!(out.iovs[..2].iter().all(|iov| !iov.buf.is_null() && iov.len == 32));

    drop((bulk, owned));
    pair.shutdown();
}

#[test]
fn access_keeps_empty_segments_in_place() {
    init_logger();
    let fabric = Fabric::new();
    let pair = Pair::new(&fabric);

    let mut bufs = vec![vec![1u8; 4], Vec::new(), vec![2u8; 4]];
    let bulk =
        unsafe { BulkHandle::create(&pair.a_ctx, &sgl_of(&mut bufs), BulkPerm::ReadOnly) }.unwrap();
    assert_eq!(bulk.segment_count(), 3);
    assert_eq!(bulk.len(), 8);

    let mut out = SgList::with_capacity(3);
    bulk.access(&mut out).unwrap();
    assert_eq!(out.nr_out, 3);
    let lens: Vec<_> = out.iovs.iter().map(|iov| iov.len).collect();
    assert_eq!(lens, [4, 0, 4]);
    assert_eq!(out.iovs[0].buf, bufs[0].as_mut_ptr());
    assert_eq!(out.iovs[2].buf, bufs[2].as_mut_ptr());

    drop(bulk);
    pair.shutdown();
}

#[test]
fn get_and_put_across_segments() {
    init_logger();
    let fabric = Fabric::new();
    let pair = Pair::new(&fabric);

    let mut remote_bufs = vec![b"0123456789".to_vec(), b"abcdef".to_vec()];
    let remote = unsafe {
        BulkHandle::create(&pair.a_ctx, &sgl_of(&mut remote_bufs), BulkPerm::ReadWrite)
    }
    .unwrap();
    let mut local_bufs = vec![vec![0u8; 4], vec![0u8; 12]];
    let local = unsafe {
        BulkHandle::create(&pair.b_ctx, &sgl_of(&mut local_bufs), BulkPerm::ReadWrite)
    }
    .unwrap();

    let desc = pair.desc(BulkOp::Get, &remote, &local, 16);
    let done = Arc::new(AtomicBool::new(false));
    bulk::transfer(
        &desc,
        on_bulk({
            let done = done.clone();
            move |info| {
                assert!(info.rc.is_ok());
                assert_eq!(info.desc.op, BulkOp::Get);
                done.store(true, Ordering::SeqCst);
            }
        }),
    )
    .unwrap();
    // Held by the pair, the descriptor and its in-flight copy.
    assert_eq!(pair.req.ref_count(), 3);
    drive_until(&pair.b_ctx, || done.load(Ordering::SeqCst));
    assert_eq!(local_bufs.concat(), b"0123456789abcdef");
    drop(desc);
    assert_eq!(pair.req.ref_count(), 1);

    local_bufs[1].copy_from_slice(b"ZYXWVUTSRQPO");
    let desc = pair.desc(BulkOp::Put, &remote, &local, 16);
    let done = Arc::new(AtomicBool::new(false));
    bulk::transfer(
        &desc,
        on_bulk({
            let done = done.clone();
            move |info| done.store(info.rc.is_ok(), Ordering::SeqCst)
        }),
    )
    .unwrap();
    drive_until(&pair.b_ctx, || done.load(Ordering::SeqCst));
    assert_eq!(remote_bufs.concat(), b"0123ZYXWVUTSRQPO");

    drop((desc, remote, local));
    pair.shutdown();
}

#[test]
fn put_into_read_only_is_denied() {
    init_logger();
    let fabric = Fabric::new();
    let pair = Pair::new(&fabric);

    let mut remote_bufs = vec![vec![7u8; 8]];
    let remote = unsafe {
        BulkHandle::create(&pair.a_ctx, &sgl_of(&mut remote_bufs), BulkPerm::ReadOnly)
    }
    .unwrap();
    let local = unsafe {
        BulkHandle::create(
            &pair.b_ctx,
            &SgList::new(vec![Iov::unbacked(8)]),
            BulkPerm::ReadWrite,
        )
    }
    .unwrap();

    let desc = pair.desc(BulkOp::Put, &remote, &local, 8);
    let rc = Arc::new(Mutex::new(None));
    bulk::transfer(
        &desc,
        on_bulk({
            let rc = rc.clone();
            move |info| *rc.lock().unwrap() = Some(info.rc)
        }),
    )
    .unwrap();
    drive_until(&pair.b_ctx, || rc.lock().unwrap().is_some());
    assert!(matches!(
        rc.lock().unwrap().take(),
        Some(Err(Error::PermissionDenied))
    ));
    assert_eq!(remote_bufs[0], vec![7u8; 8]);

    drop((desc, remote, local));
    pair.shutdown();
}

#[test]
fn cancel_and_reject() {
    init_logger();
    let fabric = Fabric::new();
    let pair = Pair::new(&fabric);

    let mut remote_bufs = vec![vec![1u8; 8]];
    let remote = unsafe {
        BulkHandle::create(&pair.a_ctx, &sgl_of(&mut remote_bufs), BulkPerm::ReadOnly)
    }
    .unwrap();
    let local = unsafe {
        BulkHandle::create(
            &pair.b_ctx,
            &SgList::new(vec![Iov::unbacked(8)]),
            BulkPerm::ReadWrite,
        )
    }
    .unwrap();

    // Out of range: nothing is submitted and no reference is kept.
    let desc = pair.desc(BulkOp::Get, &remote, &local, 9);
    assert!(matches!(
        bulk::transfer(&desc, None),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(pair.req.ref_count(), 2);

    let desc = pair.desc(BulkOp::Get, &remote, &local, 8);
    let canceled = Arc::new(AtomicBool::new(false));
    let op = bulk::transfer(
        &desc,
        on_bulk({
            let canceled = canceled.clone();
            move |info| {
                canceled.store(matches!(info.rc, Err(Error::Canceled)), Ordering::SeqCst)
            }
        }),
    )
    .unwrap();
    bulk::cancel(&pair.b_ctx, op).unwrap();
    drive_until(&pair.b_ctx, || canceled.load(Ordering::SeqCst));

    let mut out = SgList::with_capacity(1);
    local.access(&mut out).unwrap();
    let data = unsafe { slice::from_raw_parts(out.iovs[0].buf, out.iovs[0].len) };
    assert_eq!(data, &[0u8; 8]);

    drop((desc, remote, local));
    pair.shutdown();
}

/// The owner of the data sends a key; the server pulls and answers with a
/// checksum from inside the transfer callback.
#[test]
fn server_pulls_from_client() {
    init_logger();
    let fabric = Fabric::new();
    let opcodes = OpcodeMap::builder()
        .register(RPC_SUM, FMT, |req| {
            let key: BulkKey = req.input()?;
            let ctx = req.context();
            let remote = BulkHandle::import(ctx, &key)?;
            let sgl = SgList::new(vec![Iov::unbacked(remote.len())]);
            let local = unsafe { BulkHandle::create(ctx, &sgl, BulkPerm::ReadWrite)? };
            let desc = BulkDesc {
                rpc: req.clone(),
                op: BulkOp::Get,
                len: remote.len(),
                remote,
                remote_off: 0,
                local,
                local_off: 0,
            };
            bulk::transfer(
                &desc,
                Some(Box::new(|info: BulkCbInfo<'_>| {
                    let req = &info.desc.rpc;
                    let sum = info.rc.and_then(|()| {
                        let mut out = SgList::with_capacity(1);
                        info.desc.local.access(&mut out)?;
                        let data = unsafe { slice::from_raw_parts(out.iovs[0].buf, out.iovs[0].len) };
                        Ok(data.iter().map(|&b| b as u64).sum::<u64>())
                    });
                    req.set_output(&sum.ok()).unwrap();
                    req.reply_send().unwrap();
                })),
            )?;
            Ok(())
        })
        .unwrap()
        .build();
    let svr = Server::spawn(&fabric, 1, opcodes, None);
    let cli = Client::new(
        &fabric,
        OpcodeMap::builder()
            .register_client(RPC_SUM, FMT)
            .unwrap()
            .build(),
        &[(1, &svr.uri)],
    );

    let mut data: Vec<Vec<u8>> = (0..12).map(|i| vec![0u8; 100 + i]).collect();
    for buf in data.iter_mut() {
        rand::thread_rng().fill_bytes(buf);
    }
    let bulk =
        unsafe { BulkHandle::create(&cli.ctx, &sgl_of(&mut data), BulkPerm::ReadOnly) }.unwrap();

    let req = cli.request(1, RPC_SUM);
    req.set_input(&bulk.key()).unwrap();
    block_on(req.send_async()).unwrap();
    let expected: u64 = data.iter().flatten().map(|&b| b as u64).sum();
    assert_eq!(req.output::<Option<u64>>().unwrap(), Some(expected));

    drop((req, bulk));
    cli.shutdown();
    svr.stop();
}
