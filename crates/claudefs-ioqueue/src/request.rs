//! I/O request descriptions handed to the queue and the backend.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// Identifier of a request passing through an I/O queue, used in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IoRequestId(pub u64);

impl fmt::Display for IoRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Atomic counter for generating unique I/O request IDs.
#[derive(Debug)]
pub struct IoRequestIdGen {
    next: AtomicU64,
}

impl IoRequestIdGen {
    /// Create a new ID generator starting from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Generate the next unique request ID.
    pub fn next_id(&self) -> IoRequestId {
        IoRequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IoRequestIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Type of I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoOpType {
    /// Read into a single buffer
    Read,
    /// Read into several buffers
    ReadV,
    /// Write from a single buffer
    Write,
    /// Write from several buffers
    WriteV,
    /// Flush/sync data to persistent storage
    Flush,
    /// Discard/trim a byte range
    Discard,
}

impl IoOpType {
    /// Returns true for read and vectored read.
    #[inline]
    pub fn is_read(&self) -> bool {
        matches!(self, IoOpType::Read | IoOpType::ReadV)
    }

    /// Returns true for write and vectored write.
    #[inline]
    pub fn is_write(&self) -> bool {
        matches!(self, IoOpType::Write | IoOpType::WriteV)
    }

    /// Short lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            IoOpType::Read => "read",
            IoOpType::ReadV => "readv",
            IoOpType::Write => "write",
            IoOpType::WriteV => "writev",
            IoOpType::Flush => "flush",
            IoOpType::Discard => "discard",
        }
    }
}

impl fmt::Display for IoOpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A data buffer shared between the caller and the backend.
///
/// The caller keeps a clone to observe read data once the request's
/// future resolves.
#[derive(Debug, Clone, Default)]
pub struct IoBuffer(Arc<Mutex<Vec<u8>>>);

impl IoBuffer {
    /// Creates a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    /// Wraps existing data.
    pub fn from_vec(data: Vec<u8>) -> Self {
        IoBuffer(Arc::new(Mutex::new(data)))
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the current contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Locks the buffer for in-place access.
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock()
    }
}

/// Describes an I/O operation to be queued.
#[derive(Debug, Clone)]
pub struct IoRequest {
    /// Type of operation
    pub op: IoOpType,
    /// Byte offset on the device or file
    pub offset: u64,
    /// Data buffers for read/write operations
    pub buffers: Vec<IoBuffer>,
}

impl IoRequest {
    /// Read into `buf` at `offset`.
    pub fn read(offset: u64, buf: IoBuffer) -> Self {
        Self::with_buffers(IoOpType::Read, offset, vec![buf])
    }

    /// Vectored read at `offset`.
    pub fn readv(offset: u64, bufs: Vec<IoBuffer>) -> Self {
        Self::with_buffers(IoOpType::ReadV, offset, bufs)
    }

    /// Write `buf` at `offset`.
    pub fn write(offset: u64, buf: IoBuffer) -> Self {
        Self::with_buffers(IoOpType::Write, offset, vec![buf])
    }

    /// Vectored write at `offset`.
    pub fn writev(offset: u64, bufs: Vec<IoBuffer>) -> Self {
        Self::with_buffers(IoOpType::WriteV, offset, bufs)
    }

    /// Flush all written data.
    pub fn flush() -> Self {
        Self::with_buffers(IoOpType::Flush, 0, Vec::new())
    }

    fn with_buffers(op: IoOpType, offset: u64, buffers: Vec<IoBuffer>) -> Self {
        Self {
            op,
            offset,
            buffers,
        }
    }

    /// Total length of the data buffers.
    pub fn data_len(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }
}
