#![allow(unused_imports)]

mod bulk;

use super::{type_alias::*, *};
use std::{
    sync::{atomic::*, *},
    thread,
    time::{Duration, Instant},
};

use futures::executor::block_on;
use simple_logger::SimpleLogger;

use crate::transport::HgError;

const GROUP_ID: GroupId = 1;
const CLIENT_RANK: Rank = 100;

const RPC_ECHO: Opcode = 0x100;
const RPC_PING: Opcode = 0x101;
const RPC_FAIL: Opcode = 0x102;
const RPC_UNKNOWN: Opcode = 0x103;

const FMT: RpcFormat = RpcFormat::new(256, 256);
const PING_FMT: RpcFormat = RpcFormat::new(0, 16);

fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = SimpleLogger::new().with_level(log::LevelFilter::Warn).init();
    });
}

/// Opcodes served by [`Server`]s unless a test brings its own.
fn server_opcodes() -> OpcodeMap {
    OpcodeMap::builder()
        .register(RPC_ECHO, FMT, |req| {
            let s: String = req.input()?;
            req.set_output(&s)?;
            req.reply_send()
        })
        .unwrap()
        .register(RPC_PING, PING_FMT, |req| {
            req.set_output(&req.src_rank().unwrap_or(Rank::MAX))?;
            req.reply_send()
        })
        .unwrap()
        .register(RPC_FAIL, FMT, |_| Err(Error::inval("refused")))
        .unwrap()
        .build()
}

fn client_opcodes() -> OpcodeMap {
    OpcodeMap::builder()
        .register_client(RPC_ECHO, FMT)
        .unwrap()
        .register_client(RPC_PING, PING_FMT)
        .unwrap()
        .register_client(RPC_FAIL, FMT)
        .unwrap()
        .register_client(RPC_UNKNOWN, FMT)
        .unwrap()
        .build()
}

fn on_complete(f: impl FnOnce(CbInfo<'_>) + Send + 'static) -> Option<CompletionCb> {
    Some(Box::new(f))
}

/// Drive `ctx` until `done` holds.
fn drive_until(ctx: &Context, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(
            Instant::now() < deadline,
            "context {} made no progress towards the condition",
            ctx.idx()
        );
        match ctx.progress(Some(Duration::from_millis(10))) {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {}
            Err(e) => panic!("progress failed: {}", e),
        }
    }
}

/// A Nexus serving requests from its own thread until stopped.
struct Server {
    uri: String,
    stop: mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl Server {
    fn spawn(
        fabric: &Arc<Fabric>,
        rank: Rank,
        opcodes: OpcodeMap,
        pool: Option<Arc<dyn WorkerPool>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();
        let fabric = fabric.clone();

        let handle = thread::spawn(move || {
            let config = NexusConfig::new().with_rank(rank);
            let nx = Nexus::new(&fabric, config, opcodes, Arc::new(StaticGroup::new(GROUP_ID)));
            let uri = nx.init(None).unwrap();
            let ctx = match pool {
                Some(pool) => nx.context_init_with_pool(0, pool),
                None => nx.context_init(0),
            }
            .unwrap();

            tx2.send(uri).unwrap();
            while rx.try_recv().is_err() {
                let _ = ctx.progress(Some(Duration::from_millis(1)));
            }
            nx.context_fini(&ctx).unwrap();
            nx.finalize().unwrap();
        });

        let uri = rx2.recv().unwrap();
        Self {
            uri,
            stop: tx,
            handle,
        }
    }

    fn stop(self) {
        self.stop.send(()).unwrap();
        self.handle.join().unwrap();
    }
}

/// A non-listening Nexus driven by the test thread.
struct Client {
    nexus: Nexus,
    ctx: Context,
}

impl Client {
    fn new(fabric: &Arc<Fabric>, opcodes: OpcodeMap, servers: &[(Rank, &str)]) -> Self {
        let group = Arc::new(StaticGroup::new(GROUP_ID));
        for (rank, uri) in servers {
            group.insert(*rank, *uri);
        }
        let config = NexusConfig::new()
            .with_rank(CLIENT_RANK)
            .with_server(false)
            .with_connect_timeout(Duration::from_secs(5));
        let nexus = Nexus::new(fabric, config, opcodes, group);
        nexus.init(None).unwrap();
        let ctx = nexus.context_init(0).unwrap();
        Self { nexus, ctx }
    }

    fn request(&self, rank: Rank, opc: Opcode) -> Request {
        Request::create(&self.ctx, Endpoint::new(rank, 0), opc).unwrap()
    }

    fn drive_until(&self, done: impl FnMut() -> bool) {
        drive_until(&self.ctx, done)
    }

    fn shutdown(self) {
        self.nexus.context_fini(&self.ctx).unwrap();
        self.nexus.finalize().unwrap();
    }
}
