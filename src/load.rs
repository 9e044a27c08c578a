use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use serde::Deserialize;

use crate::audio_link::{AudioEngine, AudioLink};
use crate::error::{Error, Result};
use crate::unit::ScalableUnit;

/// One reading for one logical CPU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    /// Audio engine DSP load, percent.
    pub dsp_load: Option<f32>,
    /// Kernel CPU utilization, `0.0..=1.0`.
    pub cpu_utilization: Option<f32>,
    pub timestamp: Instant,
}

impl LoadSample {
    pub fn cpu_percent(&self) -> Option<f32> {
        self.cpu_utilization.map(|u| u * 100.0)
    }

    pub fn is_empty(&self) -> bool {
        self.dsp_load.is_none() && self.cpu_utilization.is_none()
    }
}

/// Which probes feed the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LoadSource {
    /// Audio engine DSP load only.
    #[default]
    Dsp,
    /// Kernel CPU utilization only.
    Cpu,
    /// Both, raising on either and lowering only on both.
    Both,
}

impl LoadSource {
    pub fn uses_dsp(self) -> bool {
        matches!(self, LoadSource::Dsp | LoadSource::Both)
    }

    pub fn uses_cpu(self) -> bool {
        matches!(self, LoadSource::Cpu | LoadSource::Both)
    }
}

/// Per-CPU counters from a `cpuN` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuStatSnapshot {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
}

impl CpuStatSnapshot {
    /// Parses the fields after the `cpuN` label.
    pub fn parse(fields: &str) -> Option<Self> {
        let mut nums = fields.split_whitespace().map(|s| s.parse::<u64>());
        let mut next = || nums.next().and_then(|n| n.ok());
        Some(Self {
            user: next()?,
            nice: next()?,
            system: next()?,
            idle: next()?,
            // older kernels stop after idle
            iowait: next().unwrap_or(0),
            irq: next().unwrap_or(0),
            softirq: next().unwrap_or(0),
        })
    }

    fn idle_time(&self) -> u64 {
        self.idle + self.iowait
    }

    fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq
    }

    /// Busy fraction since `prev`, `None` if no time was accounted in between.
    pub fn utilization_since(&self, prev: &CpuStatSnapshot) -> Option<f32> {
        let total = self.total().saturating_sub(prev.total());
        if total == 0 {
            return None;
        }
        let idle = self.idle_time().saturating_sub(prev.idle_time()).min(total);
        Some(1.0 - idle as f32 / total as f32)
    }
}

/// Parses every per-CPU line of a `/proc/stat` dump.
pub fn parse_proc_stat(content: &str) -> HashMap<usize, CpuStatSnapshot> {
    content
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("cpu")?;
            let (id, fields) = rest.split_once(char::is_whitespace)?;
            let id = id.parse().ok()?;
            Some((id, CpuStatSnapshot::parse(fields)?))
        })
        .collect()
}

/// Differences consecutive `/proc/stat` reads per logical CPU.
pub struct CpuStatSampler {
    path: PathBuf,
    previous: HashMap<usize, CpuStatSnapshot>,
}

impl CpuStatSampler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            previous: HashMap::new(),
        }
    }

    /// Utilization of every CPU seen in both this and the previous read.
    pub fn sample(&mut self) -> Result<HashMap<usize, f32>> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| Error::CpuStat {
            path: self.path.clone(),
            source,
        })?;
        let current = parse_proc_stat(&content);
        let utilization = current
            .iter()
            .filter_map(|(cpu, now)| {
                let prev = self.previous.get(cpu)?;
                Some((*cpu, now.utilization_since(prev)?))
            })
            .collect();
        self.previous = current;
        Ok(utilization)
    }
}

impl Default for CpuStatSampler {
    fn default() -> Self {
        Self::new(crate::constants::PROC_STAT)
    }
}

/// Produces one [`LoadSample`] per logical CPU each tick.
pub struct LoadSensor<E: AudioEngine> {
    link: Option<AudioLink<E>>,
    stat: Option<CpuStatSampler>,
}

impl<E: AudioEngine> LoadSensor<E> {
    pub fn new(link: Option<AudioLink<E>>, stat: Option<CpuStatSampler>) -> Self {
        Self { link, stat }
    }

    pub fn link(&self) -> Option<&AudioLink<E>> {
        self.link.as_ref()
    }

    /// Samples per unit, one entry per thread in unit order. Missing readings stay `None`
    /// inside the samples; they never turn into errors.
    pub fn poll(&mut self, units: &[ScalableUnit]) -> Vec<Vec<LoadSample>> {
        let timestamp = Instant::now();
        let dsp_load = self.link.as_mut().and_then(|link| link.poll_load());
        let utilization = match self.stat.as_mut().map(CpuStatSampler::sample) {
            Some(Ok(utilization)) => utilization,
            Some(Err(e)) => {
                log::warn!("{e}");
                HashMap::new()
            }
            None => HashMap::new(),
        };
        if let Some(load) = dsp_load {
            log::debug!("dsp load: {load:.3}");
        }

        units
            .iter()
            .map(|unit| {
                unit.cpu_ids()
                    .map(|cpu| LoadSample {
                        dsp_load,
                        cpu_utilization: utilization.get(&cpu).copied(),
                        timestamp,
                    })
                    .collect()
            })
            .collect()
    }

    pub fn close(&mut self) {
        if let Some(link) = self.link.as_mut() {
            link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_A: &str = "cpu  10 0 10 80 0 0 0 0 0 0\n\
        cpu0 10 0 10 80 0 0 0 0 0 0\n\
        cpu1 5 0 5 90 0 0 0 0 0 0\n\
        intr 12345\n";
    const STAT_B: &str = "cpu  10 0 10 80 0 0 0 0 0 0\n\
        cpu0 40 0 30 120 10 0 0 0 0 0\n\
        cpu1 5 0 5 190 0 0 0 0 0 0\n\
        intr 12399\n";

    #[test]
    fn test_parse_proc_stat_skips_aggregate() {
        let stats = parse_proc_stat(STAT_A);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[&1].idle, 90);
        assert_eq!(stats[&0].user, 10);
    }

    #[test]
    fn test_parse_short_line() {
        let s = CpuStatSnapshot::parse("1 2 3 4").unwrap();
        assert_eq!(s.idle, 4);
        assert_eq!(s.softirq, 0);
        assert!(CpuStatSnapshot::parse("1 2 x").is_none());
    }

    #[test]
    fn test_utilization_delta() {
        let a = parse_proc_stat(STAT_A);
        let b = parse_proc_stat(STAT_B);
        // cpu0: total +100, idle+iowait +50
        assert_eq!(b[&0].utilization_since(&a[&0]), Some(0.5));
        // cpu1: only idle advanced
        assert_eq!(b[&1].utilization_since(&a[&1]), Some(0.0));
        assert_eq!(a[&0].utilization_since(&a[&0]), None);
    }

    #[test]
    fn test_first_snapshot_yields_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat");
        std::fs::write(&path, STAT_A).unwrap();

        let mut sampler = CpuStatSampler::new(&path);
        assert!(sampler.sample().unwrap().is_empty());

        std::fs::write(&path, STAT_B).unwrap();
        let utilization = sampler.sample().unwrap();
        assert_eq!(utilization.get(&0), Some(&0.5));
        assert_eq!(utilization.get(&1), Some(&0.0));
    }

    #[test]
    fn test_missing_proc_stat_is_sensor_error() {
        let mut sampler = CpuStatSampler::new("/nonexistent/stat");
        let err = sampler.sample().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::RecoverableSensor);
    }

    #[test]
    fn test_source_flags() {
        assert!(LoadSource::Dsp.uses_dsp() && !LoadSource::Dsp.uses_cpu());
        assert!(!LoadSource::Cpu.uses_dsp() && LoadSource::Cpu.uses_cpu());
        assert!(LoadSource::Both.uses_dsp() && LoadSource::Both.uses_cpu());
    }
}
