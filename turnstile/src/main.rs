use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use turnstile::{ConfigSnapshot, Mediator, MediatorOptions};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Initial stall timeout in milliseconds
    #[arg(long, default_value_t = turnstile_common::DEFAULT_STALL_TIMEOUT_MS)]
    stall_timeout_ms: u32,

    /// Initial continuation timeout in milliseconds
    #[arg(long, default_value_t = turnstile_common::DEFAULT_CONTINUE_TIMEOUT_MS)]
    continue_timeout_ms: u32,

    /// Deny instead of allow when a stall times out
    #[arg(long)]
    default_deny: bool,

    /// Bytes of queued audit events allowed per shard before drops
    #[arg(long, default_value_t = 1 << 20)]
    queue_high_water: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let mediator = Arc::new(Mediator::new(MediatorOptions {
        queue_high_water: args.queue_high_water,
        initial: ConfigSnapshot {
            stall_timeout_ms: args.stall_timeout_ms,
            continue_timeout_ms: args.continue_timeout_ms,
            deny_on_timeout: args.default_deny,
            ..Default::default()
        },
    }));

    let _conn = turnstile::server::serve(mediator).await?;
    println!("turnstiled ready, waiting for an agent");

    signal::ctrl_c().await?;
    println!("Exiting...");

    Ok(())
}
