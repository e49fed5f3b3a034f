use nocrt::config::{
    RMEM_BLOCK_SIZE, SPAWN_SERVER_0_NAME, SPAWN_SERVER_0_NODE, SPAWN_SERVER_1_NAME,
    SPAWN_SERVER_1_NODE,
};
use nocrt::name::client::NameClient;
use nocrt::name::NameServer;
use nocrt::noc::{Fabric, Node};
use nocrt::rmem::cache::{PolicyKind, RCache};
use nocrt::rmem::client::RmemClient;
use nocrt::rmem::RmemServer;
use nocrt::sysv::client::{ShmSnooper, SysvClient};
use nocrt::sysv::{SysvServer, IPC_CREAT, O_CREAT};

use clap::Parser;
use log::info;
use std::sync::{Arc, Mutex};
use std::thread;

/// NoC node the demo client attaches to.
const DEMO_NODE: u32 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Page cache replacement policy used by the demo client.
    #[arg(long, default_value = "fifo")]
    cache_policy: String,

    /// Run a short end-to-end exercise against the freshly booted
    /// servers, then shut everything down.
    #[arg(long)]
    demo: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("INFO"))
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Millis))
        .init();

    let policy = match args.cache_policy.as_str() {
        "bypass" => PolicyKind::Bypass,
        "fifo" => PolicyKind::Fifo,
        "lru" => PolicyKind::Lru,
        other => return Err(format!("unknown cache policy {other:?}").into()),
    };

    let fabric = Fabric::global();

    // Boot order matters: the SysV server opens its RMem stub at startup.
    // The two spawner nodes host everything — name and SysV share spawner
    // 0's node, rmem lives on spawner 1's.
    info!("Booting name server...");
    let node0 = Arc::new(fabric.attach(SPAWN_SERVER_0_NODE)?);
    let mut name_server = NameServer::new(Arc::clone(&node0))?;
    let name_thread = thread::spawn(move || name_server.run());

    info!("Booting rmem server...");
    let node4 = Arc::new(fabric.attach(SPAWN_SERVER_1_NODE)?);
    let mut rmem_server = RmemServer::new(Arc::clone(&node4))?;
    let rmem_thread = thread::spawn(move || rmem_server.run());

    info!("Booting sysv server...");
    let mut sysv_server = SysvServer::new(Arc::clone(&node0))?;
    let sysv_thread = thread::spawn(move || sysv_server.run());

    info!("All servers alive");

    // The daemon is both spawners at once; announce them to the name
    // service so peers can resolve the spawner nodes like any process.
    register_spawner(&node0, SPAWN_SERVER_0_NAME)?;
    register_spawner(&node4, SPAWN_SERVER_1_NAME)?;

    if args.demo {
        run_demo(&fabric, policy)?;
        rmem_thread.join().expect("rmem server panicked");
        sysv_thread.join().expect("sysv server panicked");
        name_thread.join().expect("name server panicked");
        info!("Demo finished, all servers drained");
    } else {
        name_thread.join().expect("name server panicked");
        rmem_thread.join().expect("rmem server panicked");
        sysv_thread.join().expect("sysv server panicked");
    }

    Ok(())
}

/// Registers a spawner's name from its own node, the way any process
/// announces itself.
fn register_spawner(node: &Arc<Node>, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = NameClient::new(Arc::clone(node))?;
    let pid = client.setpid()?;
    client.link(pid, name)?;
    info!("Registered {name} on node {}", node.num());
    Ok(())
}

/// One pass over every service from a single client process, then an
/// orderly shutdown of the cluster.
fn run_demo(fabric: &Fabric, policy: PolicyKind) -> Result<(), Box<dyn std::error::Error>> {
    let node = Arc::new(fabric.attach(DEMO_NODE)?);

    // Name service: register, link, resolve.
    let names = NameClient::new(Arc::clone(&node))?;
    let pid = names.setpid()?;
    names.link(pid, "demo-client")?;
    let nodenum = names.lookup("demo-client")?;
    info!("demo: \"demo-client\" resolves to node {nodenum}");
    let spawner = names.lookup(SPAWN_SERVER_1_NAME)?;
    info!("demo: {SPAWN_SERVER_1_NAME} resolves to node {spawner}");
    names.heartbeat()?;

    // Remote memory through the page cache.
    let cache = Arc::new(Mutex::new(RCache::new(
        RmemClient::new(Arc::clone(&node))?,
        policy,
    )));
    let rmem = RmemClient::new(Arc::clone(&node))?;
    let block = rmem.alloc()?;
    {
        let mut cache = cache.lock().unwrap();
        cache.get(block)?.fill(0x42);
        cache.put(block)?;
        cache.flush_all()?;
    }
    let mut readback = vec![0u8; RMEM_BLOCK_SIZE];
    rmem.read(block, &mut readback)?;
    info!(
        "demo: wrote and read back block {block} ({} bytes, fill {:#04x})",
        readback.len(),
        readback[0]
    );

    // System V: a queue echo, a semaphore, a shared region with snooping.
    let sysv = SysvClient::new(Arc::clone(&node), pid)?;
    let msgid = sysv.msg_get(0xbeef, IPC_CREAT)?;
    sysv.msg_send(msgid, 1, b"hello over the portal", 0)?;
    let echoed = sysv.msg_receive(msgid, 21, 1, 0)?;
    info!("demo: queue echoed {:?}", String::from_utf8_lossy(&echoed));
    sysv.msg_close(msgid)?;

    let semid = sysv.sem_get(0xcafe, IPC_CREAT)?;
    sysv.sem_operate(semid, 0, 1, 0)?;
    sysv.sem_operate(semid, 0, -1, 0)?;
    sysv.sem_close(semid)?;

    let snooper = ShmSnooper::spawn(Arc::clone(&node), Arc::clone(&cache))?;
    let (shmid, _) = sysv.shm_create("demo-region", O_CREAT, 0o600)?;
    let page = sysv.shm_ftruncate(shmid, RMEM_BLOCK_SIZE as u64)?;
    cache.lock().unwrap().get(page)?;
    sysv.shm_inval(shmid, page)?;
    let notices = snooper.wait_for(1);
    info!("demo: snooper saw {} invalidation notice(s)", notices.len());
    snooper.stop();
    sysv.shm_close(shmid)?;
    sysv.shm_unlink("demo-region")?;

    names.unlink("demo-client")?;
    rmem.free(block)?;

    // Orderly shutdown. SysV goes first; it is an RMem client itself.
    sysv.shutdown()?;
    rmem.shutdown()?;
    names.shutdown()?;
    Ok(())
}
