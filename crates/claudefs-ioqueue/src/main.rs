#![warn(missing_docs)]

//! ClaudeFS I/O queue simulator
//!
//! Usage: `cfs-ioqueue [io-properties.json]`

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use claudefs_ioqueue::{
    global_registry, register_one_priority_class, IoBackend, IoBuffer, IoFuture, IoGroup,
    IoProperties, IoQueue, IoQueueServices, IoRequest, MetricsRegistry, MockIoBackend, ShardId,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SHARDS_PER_DISK: u32 = 2;
const REQUESTS_PER_CLASS: u64 = 256;
const BLOCK_SIZE: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let props = match std::env::args().nth(1) {
        Some(path) => IoProperties::from_file(&path)
            .with_context(|| format!("loading io properties from {}", path))?,
        None => IoProperties::default(),
    };
    info!("ClaudeFS I/O queue simulator starting with {} disk(s)", props.disks.len());

    let default_class = register_one_priority_class("default", 1000)?;
    let compaction_class = register_one_priority_class("compaction", 100)?;
    let metrics = MetricsRegistry::new();

    let mut queues = Vec::new();
    for (devid, disk) in props.disks.iter().enumerate() {
        let group = Arc::new(IoGroup::new(disk.group_config()));
        let backend: Arc<dyn IoBackend> = Arc::new(MockIoBackend::new());
        for shard in 0..SHARDS_PER_DISK {
            let services = IoQueueServices::new(
                global_registry(),
                Arc::new(metrics.clone()),
                Arc::clone(&backend),
            );
            let config = disk.queue_config(devid as u64, ShardId(shard));
            let queue = IoQueue::new(Arc::clone(&group), config, services);
            queues.push((ShardId(shard), queue, Arc::clone(&backend)));
        }
    }

    let pollers: Vec<_> = queues
        .iter()
        .map(|(_, queue, _)| queue.spawn_poller(Duration::from_micros(100)))
        .collect();

    let start = Instant::now();
    let mut pending: Vec<IoFuture> = Vec::new();
    for (shard, queue, _) in &queues {
        for i in 0..REQUESTS_PER_CLASS {
            let offset = i * BLOCK_SIZE as u64;
            pending.push(queue.queue_request(
                *shard,
                default_class,
                BLOCK_SIZE,
                IoRequest::read(offset, IoBuffer::zeroed(BLOCK_SIZE)),
            ));
            pending.push(queue.queue_request(
                *shard,
                compaction_class,
                BLOCK_SIZE,
                IoRequest::write(offset, IoBuffer::zeroed(BLOCK_SIZE)),
            ));
        }
    }

    let total = pending.len();
    let mut bytes = 0;
    for fut in pending {
        bytes += fut.await?;
    }
    drop(pollers);
    info!(
        "Completed {} requests ({} bytes) in {:?}",
        total,
        bytes,
        start.elapsed()
    );

    for (_, queue, backend) in &queues {
        info!(
            "dev {} {}: {}",
            queue.dev_id(),
            queue.mountpoint(),
            serde_json::to_string(&queue.stats())?
        );
        for stats in queue.class_stats() {
            info!("  class {}", serde_json::to_string(&stats)?);
        }
        info!("  backend {}", serde_json::to_string(&backend.stats())?);
    }

    print!("{}", metrics.render_prometheus());
    Ok(())
}
