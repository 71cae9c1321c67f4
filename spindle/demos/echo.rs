//! Client and server instances in one process, talking over the loopback
//! fabric. The client forwards a few strings, the server echoes them back.
//!
//! ```text
//! RUST_LOG=spindle=debug cargo run --example echo
//! ```

use anyhow::Result;
use spindle::monitor::{CountingMonitor, EventKind};
use spindle::{Instance, Request};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

async fn echo(mut request: Request) {
    let res = match request.get_input::<String>() {
        Ok(input) => request.respond(&input).await,
        Err(e) => {
            tracing::warn!(error = %e, "undecodable input");
            request.respond("").await
        }
    };

    if let Err(e) = res {
        tracing::warn!(error = %e, "failed to respond");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = Instance::builder()
        .address("loopback://echo-server")
        .rpc_handler_pool_size(2)
        .enable_remote_shutdown(true)
        .build()?;
    let id = server.register("echo", echo)?;

    let counting = Arc::new(CountingMonitor::new());
    let client = Instance::builder()
        .address("loopback://echo-client")
        .monitor(counting.clone(), None)
        .build()?;

    let target = client.lookup("echo-server")?;
    for word in ["hello", "from", "spindle"] {
        let out: String = client.block_on(client.forward(&target, id, word))?;
        println!("{word} -> {out}");
    }

    client.block_on(client.shutdown_remote_instance(&target))?;
    server.wait_for_finalize()?;
    client.finalize()?;

    for kind in [EventKind::Forward, EventKind::ForwardCb, EventKind::Wait] {
        println!("{kind}: {} start / {} end", counting.starts(kind), counting.ends(kind));
    }
    Ok(())
}
