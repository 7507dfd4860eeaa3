//! Per-shard accounting record of one priority class within one queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IoQueueError, IoQueueResult};
use crate::fair_queue::PriorityClassPtr;
use crate::io_queue::ShardId;
use crate::metrics::{MetricDefinition, MetricGroups, MetricsSink};
use crate::priority_class::PriorityClassId;

/// Live counters read by the metrics sink.
#[derive(Debug)]
pub struct ClassCounters {
    bytes: AtomicU64,
    ops: AtomicU64,
    nr_queued: AtomicU64,
    queue_time_ns: AtomicU64,
}

impl ClassCounters {
    fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            ops: AtomicU64::new(0),
            nr_queued: AtomicU64::new(0),
            queue_time_ns: AtomicU64::new(Duration::from_secs(1).as_nanos() as u64),
        }
    }

    /// Cumulative bytes dispatched.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Cumulative requests dispatched.
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    /// Requests waiting for admission.
    pub fn nr_queued(&self) -> u64 {
        self.nr_queued.load(Ordering::Relaxed)
    }

    /// Wait time of the most recently dispatched request.
    pub fn queue_time(&self) -> Duration {
        Duration::from_nanos(self.queue_time_ns.load(Ordering::Relaxed))
    }
}

/// Snapshot of a class record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityClassStats {
    /// Shard that submits through this record.
    pub owner: ShardId,
    /// Registry id of the class.
    pub class: PriorityClassId,
    /// Current display name.
    pub name: String,
    /// Cumulative bytes dispatched.
    pub bytes: u64,
    /// Cumulative requests dispatched.
    pub ops: u64,
    /// Requests waiting for admission.
    pub queued: u64,
    /// Wait time of the last dispatched request.
    pub last_wait: Duration,
    /// Current shares.
    pub shares: u32,
}

/// Accounting state for one `(owner shard, class)` pair of a queue.
pub struct PriorityClassData {
    ptr: PriorityClassPtr,
    class: PriorityClassId,
    owner: ShardId,
    ioshard: ShardId,
    counters: Arc<ClassCounters>,
    name: Mutex<String>,
    metric_groups: Mutex<Option<MetricGroups>>,
}

impl PriorityClassData {
    pub(crate) fn new(
        name: &str,
        mountpoint: &str,
        ptr: PriorityClassPtr,
        class: PriorityClassId,
        owner: ShardId,
        ioshard: ShardId,
        sink: &dyn MetricsSink,
    ) -> IoQueueResult<Self> {
        let data = Self {
            ptr,
            class,
            owner,
            ioshard,
            counters: Arc::new(ClassCounters::new()),
            name: Mutex::new(name.to_string()),
            metric_groups: Mutex::new(None),
        };
        data.register_stats(name, mountpoint, sink)?;
        Ok(data)
    }

    /// Fair-queue handle of this class.
    pub fn ptr(&self) -> &PriorityClassPtr {
        &self.ptr
    }

    /// Live counters.
    pub fn counters(&self) -> &ClassCounters {
        &self.counters
    }

    /// Current display name.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Re-registers metrics under `new_name`.
    ///
    /// The class may already carry metrics under that name when it is renamed
    /// to the same target twice; that double registration is ignored.
    pub fn rename(&self, new_name: &str, mountpoint: &str, sink: &dyn MetricsSink) -> IoQueueResult<()> {
        match self.register_stats(new_name, mountpoint, sink) {
            Ok(()) => Ok(()),
            Err(IoQueueError::DuplicateMetricRegistration { name, .. }) => {
                warn!(
                    "Ignoring double registration of {} while renaming class {} on shard {}",
                    name, self.class, self.owner
                );
                *self.name.lock() = new_name.to_string();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn register_stats(&self, name: &str, mountpoint: &str, sink: &dyn MetricsSink) -> IoQueueResult<()> {
        let labels = vec![
            ("ioshard".to_string(), self.ioshard.to_string()),
            ("shard".to_string(), self.owner.to_string()),
            ("mountpoint".to_string(), mountpoint.to_string()),
            ("class".to_string(), name.to_string()),
        ];

        let bytes = Arc::clone(&self.counters);
        let ops = Arc::clone(&self.counters);
        let queued = Arc::clone(&self.counters);
        let delay = Arc::clone(&self.counters);
        let shares = Arc::clone(&self.ptr);

        // queue_length counts only this class; the queue-wide depth is
        // IoQueue::queued_requests
        let new_metrics = sink.add_group(
            "io_queue",
            vec![
                MetricDefinition::counter(
                    "total_bytes",
                    "Total bytes passed in the queue",
                    labels.clone(),
                    move || bytes.bytes(),
                ),
                MetricDefinition::counter(
                    "total_operations",
                    "Total operations passed in the queue",
                    labels.clone(),
                    move || ops.ops(),
                ),
                MetricDefinition::gauge(
                    "queue_length",
                    "Number of requests in the queue",
                    labels.clone(),
                    move || queued.nr_queued() as f64,
                ),
                MetricDefinition::gauge(
                    "delay",
                    "total delay time in the queue",
                    labels.clone(),
                    move || delay.queue_time().as_secs_f64(),
                ),
                MetricDefinition::gauge(
                    "shares",
                    "current amount of shares",
                    labels,
                    move || shares.shares() as f64,
                ),
            ],
        )?;

        debug!(
            "Registered io_queue metrics: class={}, name={}, shard={}, mountpoint={}",
            self.class, name, self.owner, mountpoint
        );
        *self.metric_groups.lock() = Some(new_metrics);
        *self.name.lock() = name.to_string();
        Ok(())
    }

    pub(crate) fn on_queued(&self) {
        self.counters.nr_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_dispatched(&self, len: usize, waited: Duration) {
        let c = &self.counters;
        c.nr_queued.fetch_sub(1, Ordering::Relaxed);
        c.ops.fetch_add(1, Ordering::Relaxed);
        c.bytes.fetch_add(len as u64, Ordering::Relaxed);
        c.queue_time_ns
            .store(waited.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    /// Snapshot of the record.
    pub fn stats(&self) -> PriorityClassStats {
        PriorityClassStats {
            owner: self.owner,
            class: self.class,
            name: self.name(),
            bytes: self.counters.bytes(),
            ops: self.counters.ops(),
            queued: self.counters.nr_queued(),
            last_wait: self.counters.queue_time(),
            shares: self.ptr.shares(),
        }
    }
}
