//! Daemon options: an optional TOML file with command line flags layered on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::constants::*;
use crate::decider::{Policy, Thresholds};
use crate::error::{Error, Result};
use crate::load::LoadSource;

/// `[dsp-load]` / `[cpu-load]` tables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdsFile {
    pub upper: Option<f32>,
    pub lower: Option<f32>,
}

/// `[owner]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OwnerFile {
    pub user: Option<String>,
    pub group: Option<String>,
}

/// Contents of the configuration file; every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    pub poll_interval_ms: Option<u64>,
    pub step_khz: Option<u32>,
    pub threads_per_unit: Option<usize>,
    pub sensor: Option<LoadSource>,
    pub reconnect: Option<bool>,
    pub client_name: Option<String>,
    #[serde(default)]
    pub dsp_load: ThresholdsFile,
    #[serde(default)]
    pub cpu_load: ThresholdsFile,
    #[serde(default)]
    pub owner: OwnerFile,
}

impl FileConfig {
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|source| Error::ConfigSyntax {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads `path`; a missing default file is an empty config, a missing explicit one
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content, &path),
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            Err(source) => Err(Error::ConfigFile { path, source }),
        }
    }
}

/// Values given on the command line; they win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub poll_interval_ms: Option<u64>,
    pub step_khz: Option<u32>,
    pub threads_per_unit: Option<usize>,
    pub sensor: Option<LoadSource>,
    pub reconnect: bool,
    pub client_name: Option<String>,
    pub dsp_upper: Option<f32>,
    pub dsp_lower: Option<f32>,
    pub cpu_upper: Option<f32>,
    pub cpu_lower: Option<f32>,
    pub owner_user: Option<String>,
    pub owner_group: Option<String>,
}

/// Validated options.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub poll_interval: Duration,
    /// Explicit table step in kHz; forces a synthesized table.
    pub step_khz: Option<u32>,
    pub threads_per_unit: Option<usize>,
    pub sensor: LoadSource,
    pub reconnect: bool,
    pub client_name: String,
    pub dsp: Thresholds,
    pub cpu: Thresholds,
    pub owner_user: Option<String>,
    pub owner_group: Option<String>,
}

impl Config {
    pub fn resolve(file: FileConfig, cli: Overrides) -> Result<Self> {
        let poll_ms = cli
            .poll_interval_ms
            .or(file.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_MS);
        if poll_ms == 0 {
            return Err(Error::Config("poll interval must be positive".into()));
        }

        let step_khz = cli.step_khz.or(file.step_khz);
        if step_khz == Some(0) {
            return Err(Error::Config("step must be positive".into()));
        }

        let threads_per_unit = cli.threads_per_unit.or(file.threads_per_unit);
        if threads_per_unit == Some(0) {
            return Err(Error::Config("invalid number of threads per unit".into()));
        }

        let dsp = Thresholds::new(
            "DSP usage",
            cli.dsp_lower
                .or(file.dsp_load.lower)
                .unwrap_or(DEFAULT_DSP_LOWER),
            cli.dsp_upper
                .or(file.dsp_load.upper)
                .unwrap_or(DEFAULT_DSP_UPPER),
        )?;
        let cpu = Thresholds::new(
            "CPU usage",
            cli.cpu_lower
                .or(file.cpu_load.lower)
                .unwrap_or(DEFAULT_CPU_LOWER),
            cli.cpu_upper
                .or(file.cpu_load.upper)
                .unwrap_or(DEFAULT_CPU_UPPER),
        )?;

        Ok(Self {
            poll_interval: Duration::from_millis(poll_ms),
            step_khz,
            threads_per_unit,
            sensor: cli.sensor.or(file.sensor).unwrap_or_default(),
            reconnect: cli.reconnect || file.reconnect.unwrap_or(false),
            client_name: cli
                .client_name
                .or(file.client_name)
                .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string()),
            dsp,
            cpu,
            owner_user: cli.owner_user.or(file.owner.user),
            owner_group: cli.owner_group.or(file.owner.group),
        })
    }

    /// Thresholds taking part in decisions for the selected sensor.
    pub fn policy(&self) -> Policy {
        Policy {
            dsp: self.sensor.uses_dsp().then_some(self.dsp),
            cpu: self.sensor.uses_cpu().then_some(self.cpu),
        }
    }
}
