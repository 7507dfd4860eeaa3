//! Ticket cost model.
//!
//! A ticket is the normalized `(weight, size)` cost of one request. Reads
//! are the unit of account: a read weighs [`READ_REQUEST_BASE_COUNT`] and
//! costs that many units per byte. Writes are scaled by the device's
//! write-to-read multipliers. Sizes are shifted down by
//! [`REQUEST_TICKET_SIZE_SHIFT`], the same shift applied to group capacity,
//! so ticket sizes and capacity stay in the same units.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::error::{IoQueueError, IoQueueResult};
use crate::request::IoOpType;

/// Weight of a single read request.
pub const READ_REQUEST_BASE_COUNT: u32 = 128;

/// Right shift applied to byte costs and byte capacities.
pub const REQUEST_TICKET_SIZE_SHIFT: u32 = 9;

/// Resource cost of one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FairQueueTicket {
    weight: u32,
    size: u64,
}

impl FairQueueTicket {
    /// Creates a ticket.
    pub const fn new(weight: u32, size: u64) -> Self {
        Self { weight, size }
    }

    /// Request-count component.
    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Byte component, already shifted.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns true if either component is non-zero.
    #[inline]
    pub fn is_non_zero(&self) -> bool {
        self.weight > 0 || self.size > 0
    }

    /// Returns true if both components are within `limit`.
    #[inline]
    pub fn fits_within(&self, limit: FairQueueTicket) -> bool {
        self.weight <= limit.weight && self.size <= limit.size
    }

    /// Sum of both components, each relative to the matching component of `axis`.
    pub fn normalize(&self, axis: FairQueueTicket) -> f64 {
        let weight = if axis.weight == 0 {
            0.0
        } else {
            self.weight as f64 / axis.weight as f64
        };
        let size = if axis.size == 0 {
            0.0
        } else {
            self.size as f64 / axis.size as f64
        };
        weight + size
    }
}

impl Add for FairQueueTicket {
    type Output = FairQueueTicket;

    fn add(self, rhs: FairQueueTicket) -> FairQueueTicket {
        FairQueueTicket::new(
            self.weight.saturating_add(rhs.weight),
            self.size.saturating_add(rhs.size),
        )
    }
}

impl AddAssign for FairQueueTicket {
    fn add_assign(&mut self, rhs: FairQueueTicket) {
        *self = *self + rhs;
    }
}

impl Sub for FairQueueTicket {
    type Output = FairQueueTicket;

    fn sub(self, rhs: FairQueueTicket) -> FairQueueTicket {
        FairQueueTicket::new(
            self.weight.saturating_sub(rhs.weight),
            self.size.saturating_sub(rhs.size),
        )
    }
}

impl SubAssign for FairQueueTicket {
    fn sub_assign(&mut self, rhs: FairQueueTicket) {
        *self = *self - rhs;
    }
}

impl fmt::Display for FairQueueTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.weight, self.size)
    }
}

/// Turns `(operation, length)` into a ticket for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketCostModel {
    req_write_to_read_multiplier: u32,
    bytes_write_to_read_multiplier: u32,
    size_shift: u32,
}

impl TicketCostModel {
    /// Cost model with the given write multipliers and the standard shift.
    pub fn new(req_write_to_read_multiplier: u32, bytes_write_to_read_multiplier: u32) -> Self {
        Self {
            req_write_to_read_multiplier,
            bytes_write_to_read_multiplier,
            size_shift: REQUEST_TICKET_SIZE_SHIFT,
        }
    }

    /// Overrides the size shift. Groups always use [`REQUEST_TICKET_SIZE_SHIFT`].
    #[cfg(test)]
    pub(crate) fn with_size_shift(mut self, shift: u32) -> Self {
        self.size_shift = shift;
        self
    }

    /// Computes the ticket for a request of `len` bytes.
    pub fn ticket_for(&self, op: IoOpType, len: usize) -> IoQueueResult<FairQueueTicket> {
        let len = len as u64;
        let (weight, size) = if op.is_write() {
            (
                self.req_write_to_read_multiplier,
                (self.bytes_write_to_read_multiplier as u64).saturating_mul(len),
            )
        } else if op.is_read() {
            (
                READ_REQUEST_BASE_COUNT,
                (READ_REQUEST_BASE_COUNT as u64).saturating_mul(len),
            )
        } else {
            return Err(IoQueueError::UnrecognizedRequestKind { op });
        };
        Ok(FairQueueTicket::new(weight, size >> self.size_shift))
    }
}

impl Default for TicketCostModel {
    fn default() -> Self {
        Self::new(READ_REQUEST_BASE_COUNT, READ_REQUEST_BASE_COUNT)
    }
}
