#![warn(missing_docs)]

//! ClaudeFS I/O queue subsystem: per-device fair-share queueing, priority classes, ticket admission
//!
//! Every device gets one [`IoGroup`] describing how much work it can have in
//! flight. Each shard addressing the device owns an [`IoQueue`] on that group.
//! Requests are costed as tickets, accounted per `(shard, priority class)` and
//! admitted in proportion to the shares of their class. Priority classes are
//! named in a process-wide [`PriorityClassRegistry`].

pub mod backend;
pub mod class_data;
pub mod completion;
pub mod config;
pub mod error;
pub mod fair_queue;
pub mod io_group;
pub mod io_queue;
pub mod metrics;
pub mod priority_class;
pub mod request;
pub mod ticket;

pub use backend::{DeferredIoBackend, FileIoBackend, IoBackend, IoStats, MockIoBackend};
pub use class_data::{ClassCounters, PriorityClassData, PriorityClassStats};
pub use completion::{IoCompletion, IoFuture};
pub use config::{DiskProperties, IoProperties};
pub use error::{IoQueueError, IoQueueResult};
pub use fair_queue::{FairGroup, FairGroupConfig, FairQueue, FairQueueConfig, WeightedFairQueue};
pub use io_group::{IoGroup, IoGroupConfig};
pub use io_queue::{IoQueue, IoQueueConfig, IoQueuePoller, IoQueueServices, IoQueueStats, ShardId};
pub use metrics::{Metric, MetricDefinition, MetricGroups, MetricValue, MetricsRegistry, MetricsSink};
pub use priority_class::{
    global_registry, register_one_priority_class, rename_one_priority_class, PriorityClassId,
    PriorityClassRegistry, RegistryEntry, MAX_PRIORITY_CLASSES,
};
pub use request::{IoBuffer, IoOpType, IoRequest, IoRequestId};
pub use ticket::{FairQueueTicket, TicketCostModel, READ_REQUEST_BASE_COUNT, REQUEST_TICKET_SIZE_SHIFT};
