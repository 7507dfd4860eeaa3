//! Disk properties configuration

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoQueueError, IoQueueResult};
use crate::io_group::IoGroupConfig;
use crate::io_queue::{IoQueueConfig, ShardId};
use crate::ticket::READ_REQUEST_BASE_COUNT;

fn default_latency_goal_ms() -> f64 {
    0.75
}

/// Measured capabilities of one disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskProperties {
    /// Mount point, used as the metrics label.
    pub mountpoint: String,
    /// Sustained read requests per second.
    pub read_iops: u64,
    /// Sustained read bytes per second.
    pub read_bandwidth: u64,
    /// Sustained write requests per second.
    pub write_iops: u64,
    /// Sustained write bytes per second.
    pub write_bandwidth: u64,
    /// Target time a request may spend on the device.
    #[serde(default = "default_latency_goal_ms")]
    pub latency_goal_ms: f64,
}

impl DiskProperties {
    /// A disk with symmetric read and write rates.
    pub fn new(mountpoint: &str, read_iops: u64, read_bandwidth: u64) -> Self {
        Self {
            mountpoint: mountpoint.to_string(),
            read_iops,
            read_bandwidth,
            write_iops: read_iops,
            write_bandwidth: read_bandwidth,
            latency_goal_ms: default_latency_goal_ms(),
        }
    }

    /// Checks the rates are positive.
    pub fn validate(&self) -> IoQueueResult<()> {
        if self.mountpoint.is_empty() {
            return Err(IoQueueError::Config {
                reason: "disk mountpoint cannot be empty".to_string(),
            });
        }

        let rates = [
            ("read_iops", self.read_iops),
            ("read_bandwidth", self.read_bandwidth),
            ("write_iops", self.write_iops),
            ("write_bandwidth", self.write_bandwidth),
        ];
        for (field, value) in rates {
            if value == 0 {
                return Err(IoQueueError::Config {
                    reason: format!("{} of {} must be positive", field, self.mountpoint),
                });
            }
        }

        if !(self.latency_goal_ms.is_finite() && self.latency_goal_ms > 0.0) {
            return Err(IoQueueError::Config {
                reason: format!("latency_goal_ms of {} must be positive", self.mountpoint),
            });
        }
        Ok(())
    }

    fn latency_goal_secs(&self) -> f64 {
        self.latency_goal_ms / 1000.0
    }

    /// Capacity of the disk: what it completes within the latency goal,
    /// never less than one read.
    pub fn group_config(&self) -> IoGroupConfig {
        let base = READ_REQUEST_BASE_COUNT as f64;
        let reqs = (base * self.read_iops as f64 * self.latency_goal_secs())
            .max(base)
            .min(u32::MAX as f64);
        let bytes = (base * self.read_bandwidth as f64 * self.latency_goal_secs()).min(u64::MAX as f64);
        IoGroupConfig {
            max_req_count: reqs as u32,
            max_bytes_count: bytes as u64,
        }
    }

    /// Queue config for the shard `coordinator` serving device `devid`.
    pub fn queue_config(&self, devid: u64, coordinator: ShardId) -> IoQueueConfig {
        let base = READ_REQUEST_BASE_COUNT as f64;
        let req_mult = base * self.read_iops as f64 / self.write_iops as f64;
        let bytes_mult = base * self.read_bandwidth as f64 / self.write_bandwidth as f64;
        IoQueueConfig {
            devid,
            coordinator,
            mountpoint: self.mountpoint.clone(),
            disk_us_per_request: 1e6 / self.read_iops as f64,
            disk_us_per_byte: 1e6 / self.read_bandwidth as f64,
            disk_req_write_to_read_multiplier: (req_mult as u32).max(1),
            disk_bytes_write_to_read_multiplier: (bytes_mult as u32).max(1),
        }
    }
}

/// I/O properties of every disk the process drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoProperties {
    /// One entry per disk.
    pub disks: Vec<DiskProperties>,
}

impl IoProperties {
    /// Parses and validates JSON.
    pub fn from_json_str(json: &str) -> IoQueueResult<Self> {
        let props: Self = serde_json::from_str(json).map_err(|e| IoQueueError::Config {
            reason: format!("invalid io properties: {}", e),
        })?;
        props.validate()?;
        Ok(props)
    }

    /// Reads and validates a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> IoQueueResult<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| IoQueueError::Config {
            reason: format!("cannot read {}: {}", path.as_ref().display(), e),
        })?;
        Self::from_json_str(&json)
    }

    /// Requires at least one disk and unique mountpoints.
    pub fn validate(&self) -> IoQueueResult<()> {
        if self.disks.is_empty() {
            return Err(IoQueueError::Config {
                reason: "at least one disk must be configured".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for disk in &self.disks {
            disk.validate()?;
            if !seen.insert(disk.mountpoint.as_str()) {
                return Err(IoQueueError::Config {
                    reason: format!("duplicate mountpoint {}", disk.mountpoint),
                });
            }
        }
        Ok(())
    }
}

impl Default for IoProperties {
    fn default() -> Self {
        Self {
            disks: vec![DiskProperties {
                mountpoint: "/var/lib/claudefs".to_string(),
                read_iops: 100_000,
                read_bandwidth: 1 << 30,
                write_iops: 50_000,
                write_bandwidth: 512 << 20,
                latency_goal_ms: default_latency_goal_ms(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        IoProperties::default().validate().unwrap();
    }

    #[test]
    fn test_parse_applies_latency_default() {
        let props = IoProperties::from_json_str(
            r#"{"disks":[{"mountpoint":"/data","read_iops":1000,"read_bandwidth":1048576,
                "write_iops":500,"write_bandwidth":524288}]}"#,
        )
        .unwrap();
        assert_eq!(props.disks.len(), 1);
        assert_eq!(props.disks[0].latency_goal_ms, 0.75);
    }

    #[test]
    fn test_group_config_derivation() {
        let disk = DiskProperties {
            latency_goal_ms: 1.0,
            ..DiskProperties::new("/data", 10_000, 100_000_000)
        };
        let group = disk.group_config();
        assert_eq!(group.max_req_count, 128 * 10);
        assert_eq!(group.max_bytes_count, 128 * 100_000);
    }

    #[test]
    fn test_group_config_admits_at_least_one_read() {
        let disk = DiskProperties::new("/slow", 100, 1_000_000);
        assert_eq!(disk.group_config().max_req_count, READ_REQUEST_BASE_COUNT);
    }

    #[test]
    fn test_queue_config_derivation() {
        let disk = DiskProperties {
            write_iops: 500,
            write_bandwidth: 250_000,
            ..DiskProperties::new("/data", 1000, 1_000_000)
        };
        let cfg = disk.queue_config(3, ShardId(1));
        assert_eq!(cfg.devid, 3);
        assert_eq!(cfg.coordinator, ShardId(1));
        assert_eq!(cfg.mountpoint, "/data");
        assert_eq!(cfg.disk_req_write_to_read_multiplier, 256);
        assert_eq!(cfg.disk_bytes_write_to_read_multiplier, 512);
        assert!((cfg.disk_us_per_request - 1000.0).abs() < 1e-9);
        assert!((cfg.disk_us_per_byte - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let empty = IoProperties { disks: vec![] };
        assert!(matches!(empty.validate(), Err(IoQueueError::Config { .. })));

        let zero = IoProperties {
            disks: vec![DiskProperties::new("/data", 0, 1)],
        };
        assert!(matches!(zero.validate(), Err(IoQueueError::Config { .. })));

        let dup = IoProperties {
            disks: vec![DiskProperties::new("/data", 1, 1), DiskProperties::new("/data", 1, 1)],
        };
        assert!(matches!(dup.validate(), Err(IoQueueError::Config { .. })));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = IoProperties::from_json_str("{\"disks\": 3}").unwrap_err();
        assert!(matches!(err, IoQueueError::Config { .. }));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::to_string(&IoProperties::default()).unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let props = IoProperties::from_file(file.path()).unwrap();
        assert_eq!(props, IoProperties::default());

        let missing = IoProperties::from_file(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(IoQueueError::Config { .. })));
    }
}
