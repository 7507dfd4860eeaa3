//! Per-device fair-share I/O queue.
//!
//! An [`IoQueue`] costs each request as a ticket, files it under the
//! accounting record of its `(owner shard, priority class)` pair and queues it
//! on a [`FairQueue`]. When the queue is polled, admitted requests are handed
//! to the [`IoBackend`]; their completions release the tickets again.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::backend::IoBackend;
use crate::class_data::{PriorityClassData, PriorityClassStats};
use crate::completion::{IoCompletion, IoFuture};
use crate::error::{IoQueueError, IoQueueResult};
use crate::fair_queue::{DispatchFn, FairQueue, FairQueueConfig, WeightedFairQueue};
use crate::io_group::IoGroup;
use crate::metrics::MetricsSink;
use crate::priority_class::{PriorityClassId, PriorityClassRegistry};
use crate::request::{IoRequest, IoRequestIdGen};
use crate::ticket::{FairQueueTicket, TicketCostModel, READ_REQUEST_BASE_COUNT, REQUEST_TICKET_SIZE_SHIFT};

/// Sequential execution context that submits requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration of one I/O queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoQueueConfig {
    /// Device identifier, used in traces.
    pub devid: u64,
    /// Shard that owns the queue.
    pub coordinator: ShardId,
    /// Mount point label for metrics.
    pub mountpoint: String,
    /// Device time of one read request, in microseconds.
    pub disk_us_per_request: f64,
    /// Device time of one read byte, in microseconds.
    pub disk_us_per_byte: f64,
    /// Ticket weight of a write request.
    pub disk_req_write_to_read_multiplier: u32,
    /// Per-byte ticket size multiplier of a write.
    pub disk_bytes_write_to_read_multiplier: u32,
}

impl Default for IoQueueConfig {
    fn default() -> Self {
        Self {
            devid: 0,
            coordinator: ShardId(0),
            mountpoint: "undefined".to_string(),
            disk_us_per_request: 0.0,
            disk_us_per_byte: 0.0,
            disk_req_write_to_read_multiplier: READ_REQUEST_BASE_COUNT,
            disk_bytes_write_to_read_multiplier: READ_REQUEST_BASE_COUNT,
        }
    }
}

/// Queue-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoQueueStats {
    /// Requests waiting for admission.
    pub queued_requests: u64,
    /// Requests admitted and not yet finished.
    pub requests_executing: u64,
    /// Requests admitted since creation.
    pub requests_dispatched: u64,
    /// Tickets released since creation.
    pub requests_finished: u64,
    /// Number of class records.
    pub priority_classes: usize,
}

/// Collaborators an I/O queue works with.
#[derive(Clone)]
pub struct IoQueueServices {
    /// Registry the class ids come from.
    pub registry: Arc<PriorityClassRegistry>,
    /// Destination of per-class metrics.
    pub metrics: Arc<dyn MetricsSink>,
    /// Executes admitted requests.
    pub backend: Arc<dyn IoBackend>,
}

impl IoQueueServices {
    /// Bundles the collaborators.
    pub fn new(
        registry: Arc<PriorityClassRegistry>,
        metrics: Arc<dyn MetricsSink>,
        backend: Arc<dyn IoBackend>,
    ) -> Self {
        Self {
            registry,
            metrics,
            backend,
        }
    }
}

pub(crate) struct IoQueueShared {
    config: IoQueueConfig,
    group: Arc<IoGroup>,
    services: IoQueueServices,
    cost_model: TicketCostModel,
    fq: Mutex<Box<dyn FairQueue>>,
    classes: DashMap<(ShardId, PriorityClassId), Arc<PriorityClassData>>,
    id_gen: IoRequestIdGen,
    queued_requests: AtomicU64,
    requests_executing: AtomicU64,
    requests_dispatched: AtomicU64,
    requests_finished: AtomicU64,
}

impl IoQueueShared {
    pub(crate) fn dev_id(&self) -> u64 {
        self.config.devid
    }

    pub(crate) fn notify_requests_finished(&self, ticket: FairQueueTicket) {
        self.requests_executing.fetch_sub(1, Ordering::Relaxed);
        self.requests_finished.fetch_add(1, Ordering::Relaxed);
        self.fq.lock().notify_requests_finished(ticket);
    }

    /// Returns the record for `(owner, pc)`, creating it on first use. The
    /// record must be created on behalf of the shard that will use it.
    fn find_or_create_class(
        &self,
        pc: PriorityClassId,
        owner: ShardId,
    ) -> IoQueueResult<Arc<PriorityClassData>> {
        if let Some(data) = self.classes.get(&(owner, pc)) {
            return Ok(Arc::clone(data.value()));
        }

        let entry = self
            .services
            .registry
            .get(pc)
            .ok_or(IoQueueError::UnknownPriorityClass { id: pc.id() })?;

        let data = self.classes.entry((owner, pc)).or_try_insert_with(|| {
            let ptr = self.fq.lock().register_priority_class(entry.shares);
            PriorityClassData::new(
                &entry.name,
                &self.config.mountpoint,
                Arc::clone(&ptr),
                pc,
                owner,
                self.config.coordinator,
                self.services.metrics.as_ref(),
            )
            .map(Arc::new)
            .inspect_err(|_| self.fq.lock().unregister_priority_class(&ptr))
        })?;

        Ok(Arc::clone(data.value()))
    }

    fn queue_request(
        self: &Arc<Self>,
        owner: ShardId,
        pc: PriorityClassId,
        len: usize,
        req: IoRequest,
    ) -> IoQueueResult<IoFuture> {
        let start = Instant::now();
        let pclass = self.find_or_create_class(pc, owner)?;
        let ticket = self.cost_model.ticket_for(req.op, len)?;

        let id = self.id_gen.next_id();
        let (mut completion, fut) = IoCompletion::new(Arc::clone(self), id, ticket);
        trace!(
            "dev {} : req {} queue  len {} ticket {}",
            self.config.devid,
            id,
            len,
            ticket
        );

        let queue = Arc::clone(self);
        let record = Arc::clone(&pclass);
        let dispatch: DispatchFn = Box::new(move || {
            // the group reserved the ticket before this runs
            completion.mark_admitted();
            queue.queued_requests.fetch_sub(1, Ordering::Relaxed);
            queue.requests_executing.fetch_add(1, Ordering::Relaxed);
            queue.requests_dispatched.fetch_add(1, Ordering::Relaxed);
            record.on_dispatched(len, start.elapsed());
            trace!("dev {} : req {} submit", queue.config.devid, id);
            queue.services.backend.submit_io(completion, req);
        });

        pclass.on_queued();
        self.queued_requests.fetch_add(1, Ordering::Relaxed);
        self.fq.lock().queue(pclass.ptr(), ticket, dispatch);
        Ok(fut)
    }

    fn poll(&self) -> usize {
        // run outside the lock: backends may complete inline, which re-enters the fair queue
        let ready = self.fq.lock().dispatch_requests();
        let dispatched = ready.len();

        // every admitted closure must run, or its reserved ticket is never released
        let mut first_panic = None;
        for func in ready {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(func)) {
                warn!("dev {} : dispatch panicked, continuing with remaining requests", self.config.devid);
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        dispatched
    }
}

/// Per-device fair-share I/O queue.
///
/// Dropping the queue unregisters all of its classes from the fair queue.
/// It must not be dropped while requests are in flight; requests still
/// waiting for admission at that point resolve with
/// [`IoQueueError::RequestAbandoned`].
pub struct IoQueue {
    shared: Arc<IoQueueShared>,
}

impl IoQueue {
    /// Creates a queue on `group` using a [`WeightedFairQueue`].
    pub fn new(group: Arc<IoGroup>, config: IoQueueConfig, services: IoQueueServices) -> Self {
        let fq = WeightedFairQueue::new(
            Arc::clone(group.fair_group()),
            Self::make_fair_queue_config(&config),
        );
        Self::with_fair_queue(group, config, services, Box::new(fq))
    }

    /// Creates a queue around an existing fair queue, which should draw on
    /// `group`'s capacity.
    pub fn with_fair_queue(
        group: Arc<IoGroup>,
        config: IoQueueConfig,
        services: IoQueueServices,
        fq: Box<dyn FairQueue>,
    ) -> Self {
        debug!(
            "Created io queue, multipliers {}:{}",
            config.disk_req_write_to_read_multiplier, config.disk_bytes_write_to_read_multiplier
        );
        let cost_model = TicketCostModel::new(
            config.disk_req_write_to_read_multiplier,
            config.disk_bytes_write_to_read_multiplier,
        );
        Self {
            shared: Arc::new(IoQueueShared {
                config,
                group,
                services,
                cost_model,
                fq: Mutex::new(fq),
                classes: DashMap::new(),
                id_gen: IoRequestIdGen::new(),
                queued_requests: AtomicU64::new(0),
                requests_executing: AtomicU64::new(0),
                requests_dispatched: AtomicU64::new(0),
                requests_finished: AtomicU64::new(0),
            }),
        }
    }

    /// Derives fair-queue pacing so fairness is measured in device time.
    pub fn make_fair_queue_config(config: &IoQueueConfig) -> FairQueueConfig {
        let base = READ_REQUEST_BASE_COUNT as f64;
        FairQueueConfig {
            ticket_weight_pace: config.disk_us_per_request / base,
            ticket_size_pace: config.disk_us_per_byte * (1u64 << REQUEST_TICKET_SIZE_SHIFT) as f64
                / base,
        }
    }

    /// Queues `req` of `len` bytes for `owner` under class `pc`.
    ///
    /// The future resolves once the request has been admitted and the
    /// backend has finished it. Requests that cannot be costed fail through
    /// the future without touching any counter.
    pub fn queue_request(
        &self,
        owner: ShardId,
        pc: PriorityClassId,
        len: usize,
        req: IoRequest,
    ) -> IoFuture {
        match self.shared.queue_request(owner, pc, len, req) {
            Ok(fut) => fut,
            Err(e) => {
                debug!("dev {} : request rejected: {}", self.shared.config.devid, e);
                IoFuture::failed(e)
            }
        }
    }

    /// Sets the shares of `pc` as seen by `owner`'s record.
    pub fn update_shares_for_class(
        &self,
        owner: ShardId,
        pc: PriorityClassId,
        shares: u32,
    ) -> IoQueueResult<()> {
        let pclass = self.shared.find_or_create_class(pc, owner)?;
        pclass.ptr().update_shares(shares);
        debug!(
            "dev {} : class {} on shard {} now has {} shares",
            self.shared.config.devid, pc, owner, shares
        );
        Ok(())
    }

    /// Applies a new display name to every shard's record of `pc`.
    pub fn rename_priority_class(&self, pc: PriorityClassId, new_name: &str) -> IoQueueResult<()> {
        let mut records: Vec<(ShardId, Arc<PriorityClassData>)> = self
            .shared
            .classes
            .iter()
            .filter(|e| e.key().1 == pc)
            .map(|e| (e.key().0, Arc::clone(e.value())))
            .collect();
        records.sort_by_key(|(owner, _)| *owner);

        for (_, record) in records {
            record.rename(
                new_name,
                &self.shared.config.mountpoint,
                self.shared.services.metrics.as_ref(),
            )?;
        }
        Ok(())
    }

    /// Dispatches every request the fair queue admits now. Returns how many
    /// were handed to the backend.
    pub fn poll_io_queue(&self) -> usize {
        self.shared.poll()
    }

    /// Polls the queue every `period` on the current tokio runtime.
    pub fn spawn_poller(&self, period: Duration) -> IoQueuePoller {
        let weak = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.poll();
            }
        });
        IoQueuePoller { handle }
    }

    /// Device identifier.
    pub fn dev_id(&self) -> u64 {
        self.shared.config.devid
    }

    /// Mount point label.
    pub fn mountpoint(&self) -> &str {
        &self.shared.config.mountpoint
    }

    /// Queue configuration.
    pub fn config(&self) -> &IoQueueConfig {
        &self.shared.config
    }

    /// The resource group this queue draws on.
    pub fn group(&self) -> &Arc<IoGroup> {
        &self.shared.group
    }

    /// Requests waiting for admission.
    pub fn queued_requests(&self) -> u64 {
        self.shared.queued_requests.load(Ordering::Relaxed)
    }

    /// Requests admitted and not yet finished.
    pub fn requests_currently_executing(&self) -> u64 {
        self.shared.requests_executing.load(Ordering::Relaxed)
    }

    /// Queue-wide counters.
    pub fn stats(&self) -> IoQueueStats {
        let s = &self.shared;
        IoQueueStats {
            queued_requests: s.queued_requests.load(Ordering::Relaxed),
            requests_executing: s.requests_executing.load(Ordering::Relaxed),
            requests_dispatched: s.requests_dispatched.load(Ordering::Relaxed),
            requests_finished: s.requests_finished.load(Ordering::Relaxed),
            priority_classes: s.classes.len(),
        }
    }

    /// Snapshots of every class record, ordered by owner then class.
    pub fn class_stats(&self) -> Vec<PriorityClassStats> {
        let mut stats: Vec<PriorityClassStats> =
            self.shared.classes.iter().map(|e| e.value().stats()).collect();
        stats.sort_by_key(|s| (s.owner, s.class));
        stats
    }
}

impl Drop for IoQueue {
    fn drop(&mut self) {
        let ptrs: Vec<_> = self
            .shared
            .classes
            .iter()
            .map(|e| Arc::clone(e.value().ptr()))
            .collect();
        {
            let mut fq = self.shared.fq.lock();
            for ptr in &ptrs {
                fq.unregister_priority_class(ptr);
            }
        }
        self.shared.classes.clear();
        debug!(
            "Destroyed io queue for dev {}, {} classes unregistered",
            self.shared.config.devid,
            ptrs.len()
        );
    }
}

/// Background task polling an [`IoQueue`].
///
/// Polling stops when the poller is dropped or the queue goes away.
#[derive(Debug)]
pub struct IoQueuePoller {
    handle: JoinHandle<()>,
}

impl Drop for IoQueuePoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeferredIoBackend, MockIoBackend};
    use crate::io_group::IoGroupConfig;
    use crate::metrics::{MetricValue, MetricsRegistry};
    use crate::request::IoBuffer;

    struct Harness<B: IoBackend + 'static> {
        registry: Arc<PriorityClassRegistry>,
        metrics: MetricsRegistry,
        backend: Arc<B>,
        queue: IoQueue,
    }

    fn harness_with<B: IoBackend + 'static>(backend: B, group: IoGroupConfig) -> Harness<B> {
        let registry = Arc::new(PriorityClassRegistry::new());
        let metrics = MetricsRegistry::new();
        let backend = Arc::new(backend);
        let services = IoQueueServices::new(
            Arc::clone(&registry),
            Arc::new(metrics.clone()),
            Arc::clone(&backend) as Arc<dyn IoBackend>,
        );
        let config = IoQueueConfig {
            devid: 8,
            mountpoint: "/data".to_string(),
            ..Default::default()
        };
        let queue = IoQueue::new(Arc::new(IoGroup::new(group)), config, services);
        Harness {
            registry,
            metrics,
            backend,
            queue,
        }
    }

    fn deferred() -> Harness<DeferredIoBackend> {
        harness_with(
            DeferredIoBackend::new(),
            IoGroupConfig::from_request_limits(64, 1 << 24),
        )
    }

    fn read(len: usize) -> IoRequest {
        IoRequest::read(0, IoBuffer::zeroed(len))
    }

    #[test]
    fn test_make_fair_queue_config() {
        let config = IoQueueConfig {
            disk_us_per_request: 256.0,
            disk_us_per_byte: 0.5,
            ..Default::default()
        };
        let fq = IoQueue::make_fair_queue_config(&config);
        assert!((fq.ticket_weight_pace - 2.0).abs() < 1e-9);
        assert!((fq.ticket_size_pace - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_config_defaults() {
        let config = IoQueueConfig::default();
        assert_eq!(config.mountpoint, "undefined");
        assert_eq!(config.disk_req_write_to_read_multiplier, READ_REQUEST_BASE_COUNT);
        assert_eq!(config.disk_bytes_write_to_read_multiplier, READ_REQUEST_BASE_COUNT);
    }

    #[tokio::test]
    async fn test_read_completes_through_mock_backend() {
        let h = harness_with(MockIoBackend::new(), IoGroupConfig::default());
        let pc = h.registry.register("default", 100).unwrap();

        let fut = h.queue.queue_request(ShardId(0), pc, 4096, read(4096));
        assert_eq!(h.queue.poll_io_queue(), 1);
        assert_eq!(fut.await.unwrap(), 4096);

        let stats = h.queue.class_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].ops, 1);
        assert_eq!(stats[0].bytes, 4096);
        assert_eq!(stats[0].queued, 0);
        assert_eq!(h.queue.stats().requests_finished, 1);
        assert_eq!(h.backend.stats().reads_completed, 1);
    }

    #[tokio::test]
    async fn test_requests_wait_until_polled() {
        let h = deferred();
        let pc = h.registry.register("default", 100).unwrap();

        let a = h.queue.queue_request(ShardId(1), pc, 4096, read(4096));
        let b = h.queue.queue_request(ShardId(1), pc, 512, read(512));
        assert_eq!(h.queue.queued_requests(), 2);
        assert_eq!(h.queue.class_stats()[0].queued, 2);
        assert_eq!(h.backend.pending_count(), 0);

        assert_eq!(h.queue.poll_io_queue(), 2);
        assert_eq!(h.queue.queued_requests(), 0);
        assert_eq!(h.queue.requests_currently_executing(), 2);
        assert_eq!(h.backend.pending_count(), 2);

        assert_eq!(h.backend.complete_all(), 2);
        assert_eq!(a.await.unwrap(), 4096);
        assert_eq!(b.await.unwrap(), 512);

        let stats = h.queue.stats();
        assert_eq!(stats.requests_executing, 0);
        assert_eq!(stats.requests_dispatched, 2);
        assert_eq!(stats.requests_finished, 2);
        assert_eq!(h.queue.class_stats()[0].bytes, 4608);
    }

    #[tokio::test]
    async fn test_unrecognized_request_fails_without_side_effects() {
        let h = deferred();
        let pc = h.registry.register("default", 100).unwrap();

        let err = h
            .queue
            .queue_request(ShardId(0), pc, 0, IoRequest::flush())
            .await
            .unwrap_err();
        assert!(matches!(err, IoQueueError::UnrecognizedRequestKind { .. }));

        assert_eq!(h.queue.poll_io_queue(), 0);
        let stats = h.queue.stats();
        assert_eq!(stats.queued_requests, 0);
        assert_eq!(stats.requests_dispatched, 0);
        assert!(h.queue.class_stats().iter().all(|s| s.queued == 0 && s.ops == 0));
        assert!(!h.queue.group().fair_group().executing().is_non_zero());
    }

    #[tokio::test]
    async fn test_unknown_class_fails() {
        let h = deferred();
        let other = PriorityClassRegistry::new();
        other.register("a", 1).unwrap();
        let foreign = other.register("b", 1).unwrap();

        let err = h
            .queue
            .queue_request(ShardId(0), foreign, 512, read(512))
            .await
            .unwrap_err();
        assert!(matches!(err, IoQueueError::UnknownPriorityClass { id: 1 }));
        assert_eq!(h.queue.stats().priority_classes, 0);
    }

    #[tokio::test]
    async fn test_backend_failure_releases_ticket() {
        let h = deferred();
        let pc = h.registry.register("default", 100).unwrap();

        let fut = h.queue.queue_request(ShardId(0), pc, 4096, read(4096));
        h.queue.poll_io_queue();
        assert!(h.queue.group().fair_group().executing().is_non_zero());

        assert!(h.backend.fail_next("media error"));
        let err = fut.await.unwrap_err();
        assert!(matches!(err, IoQueueError::BackendFailure { device: 8, ref reason } if reason == "media error"));
        assert_eq!(h.queue.requests_currently_executing(), 0);
        assert!(!h.queue.group().fair_group().executing().is_non_zero());
        assert_eq!(h.queue.class_stats()[0].ops, 1);
    }

    #[tokio::test]
    async fn test_group_capacity_bounds_admission() {
        let h = harness_with(
            DeferredIoBackend::new(),
            IoGroupConfig::from_request_limits(1, 1 << 20),
        );
        let pc = h.registry.register("default", 100).unwrap();

        let futs: Vec<_> = (0..3)
            .map(|_| h.queue.queue_request(ShardId(0), pc, 4096, read(4096)))
            .collect();
        assert_eq!(h.queue.poll_io_queue(), 1);
        assert_eq!(h.queue.poll_io_queue(), 0);

        for expected_pending in [2u64, 1, 0] {
            assert_eq!(h.queue.queued_requests(), expected_pending);
            assert!(h.backend.complete_next());
            h.queue.poll_io_queue();
        }
        for fut in futs {
            assert_eq!(fut.await.unwrap(), 4096);
        }
    }

    #[test]
    fn test_one_record_per_shard_and_class() {
        let h = deferred();
        let a = h.registry.register("a", 100).unwrap();
        let b = h.registry.register("b", 100).unwrap();

        let _f1 = h.queue.queue_request(ShardId(0), a, 512, read(512));
        let _f2 = h.queue.queue_request(ShardId(0), a, 512, read(512));
        let _f3 = h.queue.queue_request(ShardId(1), a, 512, read(512));
        let _f4 = h.queue.queue_request(ShardId(1), b, 512, read(512));

        let stats = h.queue.class_stats();
        assert_eq!(stats.len(), 3);
        assert_eq!((stats[0].owner, stats[0].class, stats[0].queued), (ShardId(0), a, 2));
        assert_eq!((stats[1].owner, stats[1].class), (ShardId(1), a));
        assert_eq!((stats[2].owner, stats[2].class), (ShardId(1), b));
    }

    #[test]
    fn test_update_shares_creates_record() {
        let h = deferred();
        let pc = h.registry.register("default", 100).unwrap();

        h.queue.update_shares_for_class(ShardId(2), pc, 750).unwrap();
        let stats = h.queue.class_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].shares, 750);
        assert_eq!(
            h.metrics.value(
                "io_queue_shares",
                &[("ioshard", "0"), ("shard", "2"), ("mountpoint", "/data"), ("class", "default")]
            ),
            Some(MetricValue::Gauge(750.0))
        );
        // registry keeps the registration-time value
        assert_eq!(h.registry.get(pc).unwrap().shares, 100);
    }

    #[test]
    fn test_rename_applies_to_every_shard() {
        let h = deferred();
        let pc = h.registry.register("default", 100).unwrap();
        h.queue.update_shares_for_class(ShardId(0), pc, 100).unwrap();
        h.queue.update_shares_for_class(ShardId(1), pc, 100).unwrap();

        assert!(h.registry.rename(pc, "interactive").unwrap());
        h.queue.rename_priority_class(pc, "interactive").unwrap();
        h.queue.rename_priority_class(pc, "interactive").unwrap();

        assert!(h.queue.class_stats().iter().all(|s| s.name == "interactive"));
        assert_eq!(h.metrics.len(), 10);
        let text = h.metrics.render_prometheus();
        assert!(!text.contains("class=\"default\""));
    }

    #[test]
    fn test_records_created_after_rename_use_new_name() {
        let h = deferred();
        let pc = h.registry.register("default", 100).unwrap();
        h.registry.rename(pc, "renamed").unwrap();
        h.queue.update_shares_for_class(ShardId(0), pc, 100).unwrap();
        assert_eq!(h.queue.class_stats()[0].name, "renamed");
    }

    #[tokio::test]
    async fn test_drop_abandons_unadmitted_requests() {
        let h = deferred();
        let pc = h.registry.register("default", 100).unwrap();
        let fut = h.queue.queue_request(ShardId(0), pc, 512, read(512));
        assert_eq!(h.metrics.len(), 5);

        let Harness { metrics, queue, .. } = h;
        drop(queue);

        assert!(matches!(fut.await, Err(IoQueueError::RequestAbandoned)));
        assert!(metrics.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_completion_releases_ticket() {
        let h = deferred();
        let pc = h.registry.register("default", 100).unwrap();
        let fut = h.queue.queue_request(ShardId(0), pc, 512, read(512));
        h.queue.poll_io_queue();

        let (completion, _request) = h.backend.take_next().unwrap();
        drop(completion);

        assert!(matches!(fut.await, Err(IoQueueError::RequestAbandoned)));
        assert_eq!(h.queue.stats().requests_finished, 1);
        assert!(!h.queue.group().fair_group().executing().is_non_zero());
    }

    #[tokio::test]
    async fn test_poller_drives_dispatch() {
        let h = harness_with(MockIoBackend::new(), IoGroupConfig::from_request_limits(2, 1 << 20));
        let pc = h.registry.register("default", 100).unwrap();
        let _poller = h.queue.spawn_poller(Duration::from_millis(1));

        let futs: Vec<_> = (0..8u64)
            .map(|i| {
                let buf = IoBuffer::from_vec(vec![i as u8; 512]);
                h.queue.queue_request(ShardId(0), pc, 512, IoRequest::write(i * 512, buf))
            })
            .collect();
        for fut in futs {
            assert_eq!(fut.await.unwrap(), 512);
        }
        assert_eq!(h.backend.stats().writes_completed, 8);
        assert_eq!(h.backend.contents(7 * 512, 1), vec![7]);
    }

    #[tokio::test]
    async fn test_dropped_future_still_releases() {
        let h = deferred();
        let pc = h.registry.register("default", 100).unwrap();
        drop(h.queue.queue_request(ShardId(0), pc, 512, read(512)));
        h.queue.poll_io_queue();
        assert!(h.backend.complete_next());
        let stats = h.queue.stats();
        assert_eq!(stats.requests_dispatched, stats.requests_finished);
    }

    struct PanicOnceBackend {
        inner: MockIoBackend,
        armed: std::sync::atomic::AtomicBool,
    }

    impl IoBackend for PanicOnceBackend {
        fn submit_io(&self, completion: IoCompletion, request: IoRequest) {
            if self.armed.swap(false, Ordering::SeqCst) {
                panic!("backend submission failed");
            }
            self.inner.submit_io(completion, request);
        }

        fn stats(&self) -> crate::backend::IoStats {
            self.inner.stats()
        }
    }

    #[tokio::test]
    async fn test_panicking_submit_does_not_strand_admitted_tickets() {
        let h = harness_with(
            PanicOnceBackend {
                inner: MockIoBackend::new(),
                armed: std::sync::atomic::AtomicBool::new(true),
            },
            IoGroupConfig::from_request_limits(2, 1 << 20),
        );
        let pc = h.registry.register("default", 100).unwrap();
        let a = h.queue.queue_request(ShardId(0), pc, 512, read(512));
        let b = h.queue.queue_request(ShardId(0), pc, 512, read(512));

        let polled = std::panic::catch_unwind(AssertUnwindSafe(|| h.queue.poll_io_queue()));
        assert!(polled.is_err());

        assert!(matches!(a.await, Err(IoQueueError::RequestAbandoned)));
        assert_eq!(b.await.unwrap(), 512);

        let stats = h.queue.stats();
        assert_eq!(stats.queued_requests, 0);
        assert_eq!(stats.requests_executing, 0);
        assert_eq!(stats.requests_dispatched, 2);
        assert_eq!(stats.requests_finished, 2);
        assert!(!h.queue.group().fair_group().executing().is_non_zero());
    }
}
