//! Storage backends that execute admitted requests.
//!
//! The queue hands each admitted request to an [`IoBackend`] together with
//! its [`IoCompletion`]. The backend owns the completion from then on and
//! must call exactly one of `complete` or `fail` on it.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::completion::IoCompletion;
use crate::error::{IoQueueError, IoQueueResult};
use crate::request::{IoOpType, IoRequest};

/// I/O backend statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoStats {
    /// Total read operations completed
    pub reads_completed: u64,
    /// Total write operations completed
    pub writes_completed: u64,
    /// Total bytes read
    pub bytes_read: u64,
    /// Total bytes written
    pub bytes_written: u64,
    /// Total errors encountered
    pub errors: u64,
}

impl IoStats {
    fn record(&mut self, op: IoOpType, result: &std::io::Result<usize>) {
        match result {
            Ok(n) if op.is_read() => {
                self.reads_completed += 1;
                self.bytes_read += *n as u64;
            }
            Ok(n) if op.is_write() => {
                self.writes_completed += 1;
                self.bytes_written += *n as u64;
            }
            Ok(_) => {}
            Err(_) => self.errors += 1,
        }
    }
}

/// Executes admitted requests.
pub trait IoBackend: Send + Sync {
    /// Takes ownership of `completion` and eventually completes or fails it
    /// exactly once.
    fn submit_io(&self, completion: IoCompletion, request: IoRequest);

    /// Get current I/O statistics.
    fn stats(&self) -> IoStats;
}

fn finish(completion: IoCompletion, result: std::io::Result<usize>) {
    match result {
        Ok(n) => completion.complete(n),
        Err(e) => {
            let device = completion.dev_id();
            completion.fail(IoQueueError::BackendFailure {
                device,
                reason: e.to_string(),
            });
        }
    }
}

fn unsupported(op: IoOpType) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("{} is not executed by this backend", op),
    )
}

fn out_of_range(offset: u64) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("offset {} is beyond the addressable range", offset),
    )
}

fn end_of(offset: usize, len: usize) -> std::io::Result<usize> {
    offset.checked_add(len).ok_or_else(|| out_of_range(offset as u64))
}

/// In-memory device that completes requests inline.
pub struct MockIoBackend {
    device: Mutex<Vec<u8>>,
    failing: Mutex<Option<String>>,
    stats: Mutex<IoStats>,
}

impl MockIoBackend {
    /// Create a new mock backend with an empty device.
    pub fn new() -> Self {
        Self {
            device: Mutex::new(Vec::new()),
            failing: Mutex::new(None),
            stats: Mutex::new(IoStats::default()),
        }
    }

    /// Fails every subsequent request with `reason`, or stops failing with `None`.
    pub fn set_failing(&self, reason: Option<&str>) {
        *self.failing.lock() = reason.map(str::to_string);
    }

    /// Copies `len` bytes of device contents at `offset`.
    pub fn contents(&self, offset: u64, len: usize) -> Vec<u8> {
        let device = self.device.lock();
        let start = (offset as usize).min(device.len());
        let end = (offset as usize + len).min(device.len());
        let mut out = device[start..end].to_vec();
        out.resize(len, 0);
        out
    }

    fn execute(&self, request: &IoRequest) -> std::io::Result<usize> {
        if let Some(reason) = self.failing.lock().as_ref() {
            return Err(std::io::Error::other(reason.clone()));
        }

        let mut device = self.device.lock();
        let mut offset = usize::try_from(request.offset).map_err(|_| out_of_range(request.offset))?;
        let mut total = 0;
        match request.op {
            op if op.is_write() => {
                for buf in &request.buffers {
                    let data = buf.lock();
                    let end = end_of(offset, data.len())?;
                    if device.len() < end {
                        device.resize(end, 0);
                    }
                    device[offset..end].copy_from_slice(&data);
                    offset = end;
                    total += data.len();
                }
            }
            op if op.is_read() => {
                for buf in &request.buffers {
                    let mut data = buf.lock();
                    let end = end_of(offset, data.len())?;
                    let available = device.len().saturating_sub(offset).min(data.len());
                    if available > 0 {
                        data[..available].copy_from_slice(&device[offset..offset + available]);
                    }
                    data[available..].fill(0);
                    offset = end;
                    total += data.len();
                }
            }
            op => return Err(unsupported(op)),
        }
        Ok(total)
    }
}

impl Default for MockIoBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IoBackend for MockIoBackend {
    fn submit_io(&self, completion: IoCompletion, request: IoRequest) {
        debug!(
            "Mock {}: offset={}, len={}, req={}",
            request.op,
            request.offset,
            request.data_len(),
            completion.id()
        );
        let result = self.execute(&request);
        self.stats.lock().record(request.op, &result);
        finish(completion, result);
    }

    fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }
}

/// Backend that parks submitted requests until the owner resolves them.
#[derive(Default)]
pub struct DeferredIoBackend {
    pending: Mutex<VecDeque<(IoCompletion, IoRequest)>>,
    stats: Mutex<IoStats>,
}

impl DeferredIoBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of submitted, unresolved requests.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Removes the oldest parked request.
    pub fn take_next(&self) -> Option<(IoCompletion, IoRequest)> {
        self.pending.lock().pop_front()
    }

    /// Completes the oldest parked request with its full data length.
    pub fn complete_next(&self) -> bool {
        let Some((completion, request)) = self.take_next() else {
            return false;
        };
        let result = Ok(request.data_len());
        self.stats.lock().record(request.op, &result);
        finish(completion, result);
        true
    }

    /// Fails the oldest parked request with `reason`.
    pub fn fail_next(&self, reason: &str) -> bool {
        let Some((completion, request)) = self.take_next() else {
            return false;
        };
        let result = Err(std::io::Error::other(reason.to_string()));
        self.stats.lock().record(request.op, &result);
        finish(completion, result);
        true
    }

    /// Completes every parked request. Returns how many were completed.
    pub fn complete_all(&self) -> usize {
        let mut n = 0;
        while self.complete_next() {
            n += 1;
        }
        n
    }
}

impl IoBackend for DeferredIoBackend {
    fn submit_io(&self, completion: IoCompletion, request: IoRequest) {
        self.pending.lock().push_back((completion, request));
    }

    fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }
}

/// File-backed backend running positional I/O on the tokio blocking pool.
pub struct FileIoBackend {
    file: Arc<File>,
    runtime: tokio::runtime::Handle,
    stats: Arc<Mutex<IoStats>>,
}

impl FileIoBackend {
    /// Wraps an open file, running I/O on `runtime`.
    pub fn new(file: File, runtime: tokio::runtime::Handle) -> Self {
        Self {
            file: Arc::new(file),
            runtime,
            stats: Arc::new(Mutex::new(IoStats::default())),
        }
    }

    /// Opens (creating if needed) `path` for read/write on the current runtime.
    pub fn open(path: impl AsRef<Path>) -> IoQueueResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| IoQueueError::Config {
            reason: format!("FileIoBackend needs a tokio runtime: {}", e),
        })?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file, runtime))
    }

    fn execute(file: &File, request: &IoRequest) -> std::io::Result<usize> {
        let mut offset = request.offset;
        let mut total = 0;
        match request.op {
            op if op.is_write() => {
                for buf in &request.buffers {
                    let data = buf.lock();
                    file.write_all_at(&data, offset)?;
                    offset += data.len() as u64;
                    total += data.len();
                }
            }
            op if op.is_read() => {
                for buf in &request.buffers {
                    let mut data = buf.lock();
                    let n = read_full_at(file, &mut data, offset)?;
                    total += n;
                    if n < data.len() {
                        break;
                    }
                    offset += n as u64;
                }
            }
            op => return Err(unsupported(op)),
        }
        Ok(total)
    }
}

/// Reads until `buf` is full or end of file.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

impl IoBackend for FileIoBackend {
    fn submit_io(&self, completion: IoCompletion, request: IoRequest) {
        let file = Arc::clone(&self.file);
        let stats = Arc::clone(&self.stats);
        self.runtime.spawn_blocking(move || {
            let result = Self::execute(&file, &request);
            stats.lock().record(request.op, &result);
            finish(completion, result);
        });
    }

    fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }
}
