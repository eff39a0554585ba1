//! # Pool and Worker Configuration
//!
//! Settings are read from the process environment once, when the pool is
//! first built. Every reader goes through `from_lookup`, which takes any
//! key-to-value function, so the parsing rules can be exercised without
//! mutating the real environment.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Opt-in flag for one worker per device.
pub const ENV_MULTI_DEVICE: &str = "ISOBENCH_MULTI_DEVICE";
/// Ordered allow-list of device ordinals.
pub const ENV_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
/// Overrides device detection.
pub const ENV_DEVICE_COUNT: &str = "ISOBENCH_DEVICE_COUNT";
/// Path of the worker executable.
pub const ENV_WORKER_BIN: &str = "ISOBENCH_WORKER_BIN";
pub const ENV_POLL_INTERVAL_MS: &str = "ISOBENCH_POLL_INTERVAL_MS";
pub const ENV_HANDSHAKE_TIMEOUT_SECS: &str = "ISOBENCH_HANDSHAKE_TIMEOUT_SECS";

/// File name of the worker binary built alongside the driver.
pub const WORKER_BIN_NAME: &str = "isobench-worker";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("device list {list:?} is not usable with {count} device(s): {reason}")]
    DeviceList {
        list: String,
        count: usize,
        reason: String,
    },
}

/// How a single worker process is launched and supervised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: BTreeMap<String, String>,
    /// Slice length of each bounded wait on the response channel.
    pub poll_interval: Duration,
    pub handshake_timeout: Duration,
    /// How long `join` waits after Stop before killing the child.
    pub shutdown_grace: Duration,
}

impl WorkerConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: BTreeMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Pool-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolConfig {
    pub worker: WorkerConfig,
    pub multi_device: bool,
    /// Raw `CUDA_VISIBLE_DEVICES` value, if set.
    pub visible_devices: Option<String>,
    /// Number of physically present devices.
    pub device_count: usize,
}

impl PoolConfig {
    /// Single device-less worker running `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            worker: WorkerConfig::new(program),
            multi_device: false,
            visible_devices: None,
            device_count: 0,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let program = match lookup(ENV_WORKER_BIN) {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => default_worker_program(),
        };

        let mut worker = WorkerConfig::new(program);
        if let Some(ms) = parse_u64(&lookup, ENV_POLL_INTERVAL_MS)? {
            if ms == 0 {
                return Err(invalid(ENV_POLL_INTERVAL_MS, "0", "must be positive"));
            }
            worker.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, ENV_HANDSHAKE_TIMEOUT_SECS)? {
            worker.handshake_timeout = Duration::from_secs(secs);
        }

        let multi_device = match lookup(ENV_MULTI_DEVICE) {
            Some(value) => parse_flag(ENV_MULTI_DEVICE, &value)?,
            None => false,
        };

        let device_count = match parse_u64(&lookup, ENV_DEVICE_COUNT)? {
            Some(count) => count as usize,
            None => detect_device_count(),
        };

        let config = Self {
            worker,
            multi_device,
            visible_devices: lookup(ENV_VISIBLE_DEVICES),
            device_count,
        };
        debug!("[CONFIG] {:?}", config);
        Ok(config)
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_multi_device(mut self, device_count: usize) -> Self {
        self.multi_device = true;
        self.device_count = device_count;
        self
    }

    pub fn with_visible_devices(mut self, list: impl Into<String>) -> Self {
        self.visible_devices = Some(list.into());
        self
    }

    /// The device each worker is pinned to. `None` means the worker inherits
    /// the parent's device visibility.
    ///
    /// Without multi-device benchmarking there is exactly one device-less
    /// worker. Otherwise the allow-list is used verbatim when set, or every
    /// present device when not.
    pub fn target_devices(&self) -> Result<Vec<Option<u32>>, ConfigError> {
        if !self.multi_device {
            return Ok(vec![None]);
        }

        let devices: Vec<u32> = match self.visible_devices.as_deref() {
            Some(list) if !list.trim().is_empty() => {
                parse_device_list(list, self.device_count)?
            }
            _ => (0..self.device_count as u32).collect(),
        };

        if devices.is_empty() {
            warn!("[CONFIG] No devices detected, falling back to a single worker");
            return Ok(vec![None]);
        }
        Ok(devices.into_iter().map(Some).collect())
    }
}

/// Parse an ordered allow-list like `"2,0"`. Every ordinal must name a
/// present device and appear at most once.
pub fn parse_device_list(list: &str, count: usize) -> Result<Vec<u32>, ConfigError> {
    let fail = |reason: String| ConfigError::DeviceList {
        list: list.to_string(),
        count,
        reason,
    };

    let mut devices = Vec::new();
    for item in list.split(',') {
        let item = item.trim();
        let ordinal: u32 = item
            .parse()
            .map_err(|_| fail(format!("{:?} is not a device ordinal", item)))?;
        if ordinal as usize >= count {
            return Err(fail(format!("device {} is not present", ordinal)));
        }
        if devices.contains(&ordinal) {
            return Err(fail(format!("device {} listed twice", ordinal)));
        }
        devices.push(ordinal);
    }
    Ok(devices)
}

/// Count `/dev/nvidiaN` device nodes.
pub fn detect_device_count() -> usize {
    let entries = match fs::read_dir("/dev") {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name: OsString = entry.file_name();
            name.to_str()
                .and_then(|name| name.strip_prefix("nvidia"))
                .map_or(false, |rest| {
                    !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
                })
        })
        .count()
}

/// `isobench-worker` next to the running executable, or on `PATH`.
pub fn default_worker_program() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| {
            // Test binaries live one level below the real binaries.
            let dir = exe.parent()?;
            [dir.to_path_buf(), dir.parent()?.to_path_buf()]
                .into_iter()
                .map(|dir| dir.join(WORKER_BIN_NAME))
                .find(|candidate| candidate.is_file())
        })
        .unwrap_or_else(|| PathBuf::from(WORKER_BIN_NAME))
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_u64<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: std::num::ParseIntError| invalid(var, &value, e.to_string())),
        None => Ok(None),
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value, "expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PoolConfig::from_lookup(lookup(&[
            (ENV_WORKER_BIN, "/opt/isobench-worker"),
            (ENV_DEVICE_COUNT, "4"),
        ]))
        .unwrap();
        assert_eq!(config.worker.program, PathBuf::from("/opt/isobench-worker"));
        assert_eq!(config.worker.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.worker.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert!(!config.multi_device);
        assert_eq!(config.target_devices().unwrap(), vec![None]);
    }

    #[test]
    fn test_multi_device_uses_every_device() {
        let config = PoolConfig::from_lookup(lookup(&[
            (ENV_MULTI_DEVICE, "1"),
            (ENV_DEVICE_COUNT, "3"),
            (ENV_POLL_INTERVAL_MS, "50"),
        ]))
        .unwrap();
        assert_eq!(config.worker.poll_interval, Duration::from_millis(50));
        assert_eq!(
            config.target_devices().unwrap(),
            vec![Some(0), Some(1), Some(2)]
        );
    }

    #[test]
    fn test_allow_list_is_verbatim() {
        let config = PoolConfig::new("w")
            .with_multi_device(4)
            .with_visible_devices("3, 1");
        assert_eq!(config.target_devices().unwrap(), vec![Some(3), Some(1)]);
    }

    #[test]
    fn test_allow_list_validation() {
        assert!(matches!(
            parse_device_list("0,4", 4),
            Err(ConfigError::DeviceList { .. })
        ));
        assert!(matches!(
            parse_device_list("1,1", 4),
            Err(ConfigError::DeviceList { .. })
        ));
        assert!(matches!(
            parse_device_list("GPU-abc", 4),
            Err(ConfigError::DeviceList { .. })
        ));
    }

    #[test]
    fn test_no_devices_falls_back_to_single_worker() {
        let config = PoolConfig::new("w").with_multi_device(0);
        assert_eq!(config.target_devices().unwrap(), vec![None]);
    }

    #[test]
    fn test_invalid_values() {
        let bad_flag = PoolConfig::from_lookup(lookup(&[(ENV_MULTI_DEVICE, "maybe")]));
        assert!(matches!(
            bad_flag,
            Err(ConfigError::InvalidValue { var: ENV_MULTI_DEVICE, .. })
        ));

        let zero_poll = PoolConfig::from_lookup(lookup(&[(ENV_POLL_INTERVAL_MS, "0")]));
        assert!(zero_poll.is_err());

        let bad_count = PoolConfig::from_lookup(lookup(&[(ENV_DEVICE_COUNT, "-1")]));
        assert!(bad_count.is_err());
    }

    #[test]
    fn test_worker_config_builder() {
        let worker = WorkerConfig::new("bin")
            .with_arg("--verbose")
            .with_env("A", "1")
            .with_poll_interval(Duration::from_millis(10));
        assert_eq!(worker.args, vec!["--verbose".to_string()]);
        assert_eq!(worker.envs.get("A").map(String::as_str), Some("1"));
        assert_eq!(worker.poll_interval, Duration::from_millis(10));
        assert_eq!(worker.shutdown_grace, DEFAULT_SHUTDOWN_GRACE);
    }
}
