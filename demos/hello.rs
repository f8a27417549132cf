use fabric_rpc::{type_alias::*, *};
use futures::executor::block_on;
use std::{
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

fn main() {
    const GROUP: GroupId = 7;
    const SVR_RANK: Rank = 0;
    const CLI_RANK: Rank = 1;

    const RPC_HELLO: Opcode = 42;
    const FMT: RpcFormat = RpcFormat::new(64, 64);

    let fabric = Fabric::new();
    let (finish_tx, finish_rx) = mpsc::channel();
    let (svr_ready_tx, svr_ready_rx) = mpsc::channel();

    // Server thread.
    let handle = thread::spawn({
        let fabric = fabric.clone();
        move || {
            let opcodes = OpcodeMap::builder()
                .register(RPC_HELLO, FMT, |req| {
                    let name: String = req.input()?;
                    req.set_output(&format!("Hello, {}!", name))?;
                    req.reply_send()
                })
                .unwrap()
                .build();
            let nx = Nexus::new(
                &fabric,
                NexusConfig::new().with_rank(SVR_RANK),
                opcodes,
                Arc::new(StaticGroup::new(GROUP)),
            );
            let uri = nx.init(None).unwrap();
            let ctx = nx.context_init(0).unwrap();

            svr_ready_tx.send(uri).unwrap();
            while let Err(_) = finish_rx.try_recv() {
                let _ = ctx.progress(Some(Duration::from_millis(1)));
            }
            nx.context_fini(&ctx).unwrap();
            nx.finalize().unwrap();
        }
    });

    // Client.
    let group = Arc::new(StaticGroup::new(GROUP));
    group.insert(SVR_RANK, svr_ready_rx.recv().unwrap());
    let nx = Nexus::new(
        &fabric,
        NexusConfig::from_env().with_rank(CLI_RANK).with_server(false),
        OpcodeMap::builder()
            .register_client(RPC_HELLO, FMT)
            .unwrap()
            .build(),
        group,
    );
    nx.init(None).unwrap();
    let ctx = nx.context_init(0).unwrap();

    let req = Request::create(&ctx, Endpoint::new(SVR_RANK, 0), RPC_HELLO).unwrap();
    req.set_input("world").unwrap();
    block_on(req.send_async()).unwrap();

    let reply: String = req.output().unwrap();
    assert_eq!(reply, "Hello, world!");
    println!("{}", reply);

    drop(req);
    nx.context_fini(&ctx).unwrap();
    nx.finalize().unwrap();
    finish_tx.send(()).unwrap();
    handle.join().unwrap();
}
