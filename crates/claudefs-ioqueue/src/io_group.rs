//! Resource group: the capacity shared by all queues of one device.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fair_queue::{FairGroup, FairGroupConfig};
use crate::ticket::{READ_REQUEST_BASE_COUNT, REQUEST_TICKET_SIZE_SHIFT};

/// Capacity of a device, in ticket units.
///
/// `max_req_count` is in ticket weight, where one read weighs
/// [`READ_REQUEST_BASE_COUNT`]. `max_bytes_count` is in raw bytes times the
/// same base; it is shifted down once when the group is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoGroupConfig {
    /// Maximum executing ticket weight.
    pub max_req_count: u32,
    /// Maximum executing byte cost, unshifted.
    pub max_bytes_count: u64,
}

impl IoGroupConfig {
    /// Capacity for at most `max_requests` concurrent reads totalling `max_bytes`.
    pub fn from_request_limits(max_requests: u32, max_bytes: u64) -> Self {
        Self {
            max_req_count: max_requests.saturating_mul(READ_REQUEST_BASE_COUNT),
            max_bytes_count: max_bytes.saturating_mul(READ_REQUEST_BASE_COUNT as u64),
        }
    }
}

impl Default for IoGroupConfig {
    fn default() -> Self {
        Self {
            max_req_count: u32::MAX,
            max_bytes_count: u64::MAX,
        }
    }
}

/// Capacity shared by every queue addressing the same device.
#[derive(Debug)]
pub struct IoGroup {
    config: IoGroupConfig,
    fair_group: Arc<FairGroup>,
}

impl IoGroup {
    /// Creates a group.
    pub fn new(config: IoGroupConfig) -> Self {
        debug!(
            "Created io group, limits {}:{}",
            config.max_req_count, config.max_bytes_count
        );
        Self {
            fair_group: Arc::new(FairGroup::new(Self::make_fair_group_config(&config))),
            config,
        }
    }

    /// Derives the fair group capacity from the raw config.
    pub fn make_fair_group_config(config: &IoGroupConfig) -> FairGroupConfig {
        FairGroupConfig {
            max_req_count: config.max_req_count,
            max_bytes_count: config.max_bytes_count >> REQUEST_TICKET_SIZE_SHIFT,
        }
    }

    /// The capacity pool handed to fair queues.
    pub fn fair_group(&self) -> &Arc<FairGroup> {
        &self.fair_group
    }

    /// The config the group was built with.
    pub fn config(&self) -> &IoGroupConfig {
        &self.config
    }
}
