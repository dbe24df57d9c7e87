use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::Deserialize;

use crate::constants;
use crate::error::NetcfgError;

/// A deadline loop: keep trying for `max_duration_ms`, sleeping with
/// jittered exponential backoff capped at `cap_ms` between tries.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_duration_ms: u64,
    pub cap_ms: u64,
}

impl RetryPolicy {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub debug: bool,
    pub imds_endpoints: Vec<String>,
    pub imds_connect_timeout_ms: u64,
    pub imds_request_timeout_ms: u64,
    pub imds_max_attempts: u32,
    pub imds_token_ttl_secs: u64,
    pub rule_base: u32,
    pub metric_base: u32,
    pub unit_dir: PathBuf,
    pub default_unit: PathBuf,
    pub lock_dir: PathBuf,
    pub reload_flag: PathBuf,
    pub converge: RetryPolicy,
    pub token: RetryPolicy,
    pub registration: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            imds_endpoints: vec![
                constants::IMDS_ENDPOINT_V4.into(),
                constants::IMDS_ENDPOINT_V6.into(),
            ],
            imds_connect_timeout_ms: 150,
            imds_request_timeout_ms: 5000,
            imds_max_attempts: constants::IMDS_MAX_ATTEMPTS,
            imds_token_ttl_secs: constants::IMDS_TOKEN_TTL_SECS,
            rule_base: constants::RULE_BASE,
            metric_base: constants::METRIC_BASE,
            unit_dir: constants::DIR_UNIT.into(),
            default_unit: constants::FILE_DEFAULT_UNIT.into(),
            lock_dir: constants::DIR_LOCK.into(),
            reload_flag: constants::FILE_RELOAD_FLAG.into(),
            converge: RetryPolicy {
                max_duration_ms: 30_000,
                cap_ms: 1000,
            },
            token: RetryPolicy {
                max_duration_ms: 30_000,
                cap_ms: 500,
            },
            registration: RetryPolicy {
                max_duration_ms: 30_000,
                cap_ms: 100,
            },
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let data = fs::read_to_string(p).map_err(|e| anyhow!("unable to read {:?}: {}", p, e))?;
        let config: Self =
            serde_json::from_str(&data).map_err(|e| anyhow!("unable to parse {:?}: {}", p, e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let paths = [
            (&self.unit_dir, "unit_dir"),
            (&self.default_unit, "default_unit"),
            (&self.lock_dir, "lock_dir"),
            (&self.reload_flag, "reload_flag"),
        ];
        for (path, name) in paths {
            if path.as_os_str().is_empty() {
                return Err(NetcfgError::InvalidArgument(name).into());
            }
        }
        // Every device number must map to an id and metric that fit.
        if self.rule_base.checked_add(constants::MAX_DEVICE_NUMBER).is_none() {
            return Err(NetcfgError::InvalidArgument("rule_base").into());
        }
        if self
            .metric_base
            .checked_add(10 * constants::MAX_DEVICE_NUMBER)
            .is_none()
        {
            return Err(NetcfgError::InvalidArgument("metric_base").into());
        }
        if self.imds_endpoints.is_empty() {
            return Err(NetcfgError::InvalidArgument("imds_endpoints").into());
        }
        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.imds_token_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.imds_connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.imds_request_timeout_ms)
    }
}
