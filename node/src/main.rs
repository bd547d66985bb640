extern crate stash_lib as stash;

use anyhow::{anyhow, Result};
use log::info;
use stash::{Node, NodeConfig};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(
    name = "stash-node",
    about = "A peer-to-peer content-addressed replication node"
)]
enum Command {
    /// Run a node and serve peers until interrupted
    Run {
        /// Endpoint to bind the transport to
        #[structopt(short, long, default_value = "0.0.0.0:13499")]
        listen: String,

        /// Directory under which content is materialized
        #[structopt(short, long, default_value = "stash_data", parse(from_os_str))]
        root: PathBuf,

        /// Peers to dial at startup, e.g. 10.0.0.2:13499
        #[structopt(short, long)]
        bootstrap: Vec<String>,

        /// Store this file into the mesh once connected, then keep
        /// serving
        #[structopt(short, long, parse(from_os_str))]
        put: Option<PathBuf>,
    },

    /// Spin up a local three node mesh and replicate a few files
    /// through it
    Demo {
        /// Directory for the demo nodes' storage roots
        #[structopt(short, long, default_value = "demo_data", parse(from_os_str))]
        root: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    match Command::from_args() {
        Command::Run {
            listen,
            root,
            bootstrap,
            put,
        } => run(listen, root, bootstrap, put),
        Command::Demo { root } => demo(root),
    }
}

/// Run a single node, optionally seeding it with one file
fn run(listen: String, root: PathBuf, bootstrap: Vec<String>, put: Option<PathBuf>) -> Result<()> {
    let node = Arc::new(Node::new(NodeConfig {
        listen_addr: listen,
        storage_root: root,
        bootstrap_nodes: bootstrap,
        ..Default::default()
    }));

    let path = match put {
        Some(path) => path,
        None => return Ok(node.start()?),
    };

    let runner = Arc::clone(&node);
    let handle = thread::spawn(move || runner.start());

    // Give the bootstrap dials a moment to land before replicating
    thread::sleep(Duration::from_secs(1));

    let key = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("bad file name: {:?}", path))?
        .to_string();
    let mut file = std::fs::File::open(&path)?;
    let size = node.store(key.as_bytes(), &mut file)?;
    info!("stored {} ({} bytes), serving replicas", key, size);

    handle
        .join()
        .map_err(|_| anyhow!("node thread panicked"))??;
    Ok(())
}

/// Start a node on a background thread and wait for its listener
fn spawn(listen: &str, root: PathBuf, bootstrap: Vec<String>) -> Result<Arc<Node>> {
    let node = Arc::new(Node::new(NodeConfig {
        listen_addr: listen.to_string(),
        storage_root: root,
        bootstrap_nodes: bootstrap,
        ..Default::default()
    }));

    let runner = Arc::clone(&node);
    thread::spawn(move || runner.start());

    let deadline = Instant::now() + Duration::from_secs(5);
    while node.local_addr().is_none() {
        if Instant::now() > deadline {
            return Err(anyhow!("node failed to bind"));
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(node)
}

/// Three nodes on loopback: the third stores a handful of values,
/// drops its local copies, and pulls them back off its peers
fn demo(root: PathBuf) -> Result<()> {
    let n1 = spawn("127.0.0.1:0", root.join("node1"), vec![])?;
    let n2 = spawn("127.0.0.1:0", root.join("node2"), vec![])?;
    let n3 = spawn(
        "127.0.0.1:0",
        root.join("node3"),
        vec![
            n1.local_addr().unwrap().to_string(),
            n2.local_addr().unwrap().to_string(),
        ],
    )?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while n3.peer_count() < 2 {
        if Instant::now() > deadline {
            return Err(anyhow!("mesh failed to form"));
        }
        thread::sleep(Duration::from_millis(10));
    }
    info!("mesh formed: {} peers on node 3", n3.peer_count());

    for i in 0..5 {
        let key = format!("picture_{}.png", i);
        let payload = format!("my big data file here! ({})", i);

        n3.store(key.as_bytes(), &mut payload.as_bytes())?;

        // Drop the local copy so the next read has to hit the mesh
        n3.delete(key.as_bytes())?;

        let (size, mut reader) = n3.get(key.as_bytes())?;
        let mut fetched = Vec::new();
        reader.read_to_end(&mut fetched)?;
        assert_eq!(fetched, payload.as_bytes());

        info!("recovered {} ({} bytes) from the mesh", key, size);
    }

    n3.stop();
    n2.stop();
    n1.stop();
    Ok(())
}
