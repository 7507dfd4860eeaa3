//! Fair-share admission primitive.
//!
//! [`FairQueue`] is the capability the I/O queue consumes: register classes,
//! queue costed work, dispatch what may proceed, and release tickets when the
//! work finishes. [`WeightedFairQueue`] is the in-tree implementation. Several
//! fair queues can draw on one [`FairGroup`], which bounds how much work is
//! executing across all of them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::ticket::FairQueueTicket;

/// Work to run once its ticket is admitted.
pub type DispatchFn = Box<dyn FnOnce() + Send + 'static>;

/// A class registered with a fair queue.
#[derive(Debug)]
pub struct FairPriorityClass {
    id: usize,
    shares: AtomicU32,
}

impl FairPriorityClass {
    fn new(id: usize, shares: u32) -> Self {
        Self {
            id,
            shares: AtomicU32::new(shares.max(1)),
        }
    }

    /// Identifier within the owning fair queue.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Current shares.
    pub fn shares(&self) -> u32 {
        self.shares.load(Ordering::Relaxed)
    }

    /// Changes the shares. Zero is clamped to one.
    pub fn update_shares(&self, shares: u32) {
        self.shares.store(shares.max(1), Ordering::Relaxed);
    }
}

/// Shared handle to a fair-queue class.
pub type PriorityClassPtr = Arc<FairPriorityClass>;

/// Capacity of a [`FairGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairGroupConfig {
    /// Maximum executing weight.
    pub max_req_count: u32,
    /// Maximum executing size, in shifted units.
    pub max_bytes_count: u64,
}

/// Capacity pool shared by the fair queues of one device.
#[derive(Debug)]
pub struct FairGroup {
    capacity: FairQueueTicket,
    executing: Mutex<FairQueueTicket>,
}

impl FairGroup {
    /// Creates a group with the given capacity.
    pub fn new(config: FairGroupConfig) -> Self {
        Self {
            capacity: FairQueueTicket::new(config.max_req_count, config.max_bytes_count),
            executing: Mutex::new(FairQueueTicket::default()),
        }
    }

    /// Total capacity.
    pub fn maximum_capacity(&self) -> FairQueueTicket {
        self.capacity
    }

    /// Capacity currently held by executing work.
    pub fn executing(&self) -> FairQueueTicket {
        *self.executing.lock()
    }

    /// Reserves `ticket` if it fits. An idle group admits any ticket so that
    /// a request larger than the whole capacity cannot stall forever.
    pub fn try_grab(&self, ticket: FairQueueTicket) -> bool {
        let mut executing = self.executing.lock();
        let next = *executing + ticket;
        if !executing.is_non_zero() || next.fits_within(self.capacity) {
            *executing = next;
            true
        } else {
            false
        }
    }

    /// Returns `ticket` to the pool.
    pub fn release(&self, ticket: FairQueueTicket) {
        *self.executing.lock() -= ticket;
    }
}

/// Pacing of a fair queue, in device microseconds per ticket unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FairQueueConfig {
    /// Microseconds per unit of ticket weight.
    pub ticket_weight_pace: f64,
    /// Microseconds per unit of ticket size.
    pub ticket_size_pace: f64,
}

/// Fair-share admission capability consumed by the I/O queue.
pub trait FairQueue: Send {
    /// Creates a class with `shares`.
    fn register_priority_class(&mut self, shares: u32) -> PriorityClassPtr;

    /// Removes a class. Work still queued for it is dropped.
    fn unregister_priority_class(&mut self, pc: &PriorityClassPtr);

    /// Queues `func` under `pc`, costed at `ticket`.
    fn queue(&mut self, pc: &PriorityClassPtr, ticket: FairQueueTicket, func: DispatchFn);

    /// Releases a ticket previously admitted by [`FairQueue::dispatch_requests`].
    fn notify_requests_finished(&mut self, ticket: FairQueueTicket);

    /// Admits as much queued work as policy and capacity allow and returns it
    /// in admission order. The caller runs each closure.
    fn dispatch_requests(&mut self) -> Vec<DispatchFn>;

    /// Number of queued, not yet admitted requests.
    fn waiters(&self) -> usize;

    /// Number of admitted, not yet finished requests.
    fn requests_currently_executing(&self) -> usize;
}

struct ClassQueue {
    pc: PriorityClassPtr,
    accumulated: f64,
    queue: VecDeque<(FairQueueTicket, DispatchFn)>,
}

/// Virtual-time weighted fair queue.
///
/// Each class accumulates the cost of what it dispatched divided by its
/// shares; the backlogged class with the least accumulated cost goes next.
pub struct WeightedFairQueue {
    group: Arc<FairGroup>,
    config: FairQueueConfig,
    classes: HashMap<usize, ClassQueue>,
    next_class_id: usize,
    requests_queued: usize,
    requests_executing: usize,
    last_accumulated: f64,
}

impl WeightedFairQueue {
    /// Creates a fair queue drawing on `group`.
    pub fn new(group: Arc<FairGroup>, config: FairQueueConfig) -> Self {
        debug!(
            "Creating WeightedFairQueue: weight_pace={}, size_pace={}, capacity={}",
            config.ticket_weight_pace,
            config.ticket_size_pace,
            group.maximum_capacity()
        );
        Self {
            group,
            config,
            classes: HashMap::new(),
            next_class_id: 0,
            requests_queued: 0,
            requests_executing: 0,
            last_accumulated: 0.0,
        }
    }

    /// Cost of a ticket before share scaling.
    fn ticket_cost(&self, ticket: FairQueueTicket) -> f64 {
        let paced = ticket.weight() as f64 * self.config.ticket_weight_pace
            + ticket.size() as f64 * self.config.ticket_size_pace;
        if paced > 0.0 {
            paced
        } else {
            ticket.normalize(self.group.maximum_capacity())
        }
    }

    fn pick_class(&self) -> Option<usize> {
        self.classes
            .iter()
            .filter(|(_, c)| !c.queue.is_empty())
            .min_by(|(ia, a), (ib, b)| {
                a.accumulated
                    .total_cmp(&b.accumulated)
                    .then_with(|| ia.cmp(ib))
            })
            .map(|(id, _)| *id)
    }
}

impl FairQueue for WeightedFairQueue {
    fn register_priority_class(&mut self, shares: u32) -> PriorityClassPtr {
        let id = self.next_class_id;
        self.next_class_id += 1;
        let pc = Arc::new(FairPriorityClass::new(id, shares));
        self.classes.insert(
            id,
            ClassQueue {
                pc: Arc::clone(&pc),
                accumulated: self.last_accumulated,
                queue: VecDeque::new(),
            },
        );
        pc
    }

    fn unregister_priority_class(&mut self, pc: &PriorityClassPtr) {
        if let Some(class) = self.classes.remove(&pc.id()) {
            self.requests_queued -= class.queue.len();
        }
    }

    fn queue(&mut self, pc: &PriorityClassPtr, ticket: FairQueueTicket, func: DispatchFn) {
        let floor = self.last_accumulated;
        let Some(class) = self.classes.get_mut(&pc.id()) else {
            debug!("Dropping request queued on unregistered class {}", pc.id());
            return;
        };
        if class.queue.is_empty() {
            // an idle class must not bank credit while it had nothing to send
            class.accumulated = class.accumulated.max(floor);
        }
        class.queue.push_back((ticket, func));
        self.requests_queued += 1;
    }

    fn notify_requests_finished(&mut self, ticket: FairQueueTicket) {
        self.group.release(ticket);
        self.requests_executing = self.requests_executing.saturating_sub(1);
    }

    fn dispatch_requests(&mut self) -> Vec<DispatchFn> {
        let mut ready = Vec::new();

        while let Some(id) = self.pick_class() {
            let Some(ticket) = self.classes[&id].queue.front().map(|(t, _)| *t) else {
                break;
            };
            if !self.group.try_grab(ticket) {
                break;
            }
            let cost = self.ticket_cost(ticket);
            let Some(class) = self.classes.get_mut(&id) else {
                break;
            };
            let Some((_, func)) = class.queue.pop_front() else {
                break;
            };
            class.accumulated += cost / class.pc.shares() as f64;
            self.last_accumulated = class.accumulated;
            self.requests_queued -= 1;
            self.requests_executing += 1;
            trace!("Dispatched ticket {} from class {}", ticket, id);
            ready.push(func);
        }

        ready
    }

    fn waiters(&self) -> usize {
        self.requests_queued
    }

    fn requests_currently_executing(&self) -> usize {
        self.requests_executing
    }
}
