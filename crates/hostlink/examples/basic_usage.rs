//! Basic usage example for hostlink
//!
//! Opens two local sessions under one key plus every host from
//! `~/.ssh/config` given on the command line, then:
//! - runs a command on each key
//! - writes and reads back a file through the pool
//! - prints the aggregate's persisted form
//!
//! ```text
//! RUST_LOG=hostlink=debug cargo run --example basic_usage -- build-01 build-02
//! ```

use futures::TryStreamExt;
use hostlink::{FactoryConfig, MultiConnection, RemoteOps, SessionFactory, SessionOptions};
use std::error::Error;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let factory = Arc::new(SessionFactory::from_config(FactoryConfig::default()).await?);
    println!("Configured hosts: {:?}", factory.available_hosts());

    let mut builder = MultiConnection::builder(Arc::clone(&factory))
        .host_with("localhost", SessionOptions::local())
        .host_with("localhost", SessionOptions::local());
    for host in std::env::args().skip(1) {
        builder = builder.host(host);
    }
    let multi = builder.build()?;
    println!("{} keys, {} sessions", multi.len(), multi.len_all());

    let outputs: Vec<_> = multi
        .run(vec!["uname -a".to_string()])
        .buffered(4)
        .try_collect()
        .await?;
    for (key, output) in outputs {
        println!("[{}] exit {}: {}", key, output.exit_code, output.stdout_lossy().trim());
    }

    // Two consecutive gets on a pool of two hit different sessions
    let dir = std::env::temp_dir().join("hostlink-example");
    let first = multi.get("localhost")?;
    let second = multi.get("localhost")?;
    first.create_dir_all(&dir).await?;
    second.write(&dir.join("greeting.txt"), "Hello from hostlink".into()).await?;
    println!("Read back: {}", first.read_to_string(&dir.join("greeting.txt")).await?);
    first.remove_dir_all(&dir).await?;

    println!("Descriptor: {}", multi);

    multi.close().await;
    Ok(())
}
