//! Four tasks sleep concurrently on a single worker. The worker is never
//! blocked: total wall time is one sleep, not four.
//!
//! ```text
//! cargo run --example sleepers -- 1
//! ```

use anyhow::{Context, Result};
use spindle::Instance;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let seconds = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<u64>().context("usage: sleepers [seconds]")?,
        None => 1,
    };

    let instance = Instance::builder()
        .address("loopback://sleepers")
        .rpc_handler_pool_size(1)
        .build()?;

    let started = Instant::now();
    let tasks = (0..4)
        .map(|n| {
            let handle = instance.handle();
            instance.spawn(async move {
                println!("task {n}: sleeping {seconds}s");
                let res = handle.sleep(Duration::from_secs(seconds)).await;
                println!("task {n}: awake after {:?}", started.elapsed());
                res
            })
        })
        .collect::<Vec<_>>();

    for joined in instance.block_on(futures::future::join_all(tasks)) {
        joined??;
    }

    println!(
        "done in {:?}, {} progress iterations",
        started.elapsed(),
        instance.num_progress_calls()
    );
    instance.finalize()?;
    Ok(())
}
