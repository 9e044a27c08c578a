use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::constants::SYSFS_CPU_ROOT;
use crate::error::{Error, Result};

/// The per-CPU cpufreq attributes below `/sys/devices/system/cpu`.
#[derive(Debug, Clone)]
pub struct CpufreqTree {
    root: PathBuf,
}

impl CpufreqTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn attr_path(&self, cpu: usize, attr: &str) -> PathBuf {
        self.root.join(format!("cpu{cpu}/cpufreq/{attr}"))
    }

    /// Number of `cpuN` entries, i.e. the configured logical CPUs.
    pub fn count_cpus(&self) -> Result<usize> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| Error::sysfs(&self.root, e))?;
        let count = entries
            .flatten()
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.strip_prefix("cpu")
                    .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            })
            .count();
        if count == 0 {
            return Err(Error::NoCpus(self.root.clone()));
        }
        Ok(count)
    }

    /// Reads an attribute, `None` if it does not exist.
    pub fn read_optional(&self, cpu: usize, attr: &str) -> Result<Option<String>> {
        let path = self.attr_path(cpu, attr);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::sysfs(path, e)),
        }
    }

    pub fn read(&self, cpu: usize, attr: &str) -> Result<String> {
        let path = self.attr_path(cpu, attr);
        std::fs::read_to_string(&path).map_err(|e| Error::sysfs(path, e))
    }

    pub fn read_u32(&self, cpu: usize, attr: &str) -> Result<u32> {
        let content = self.read(cpu, attr)?;
        content.trim().parse().map_err(|_| Error::Parse {
            path: self.attr_path(cpu, attr),
            content,
        })
    }

    /// Switches `cpu` to the userspace governor and verifies the kernel accepted it.
    pub fn ensure_userspace_governor(&self, cpu: usize) -> Result<()> {
        let path = self.attr_path(cpu, "scaling_governor");
        let current = self.read(cpu, "scaling_governor")?;
        if current.starts_with(crate::constants::MANUAL_GOVERNOR) {
            return Ok(());
        }
        log::debug!("cpu{cpu}: switching governor {} -> userspace", current.trim());

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::sysfs(&path, e))?;
        file.write_all(format!("{}\n", crate::constants::MANUAL_GOVERNOR).as_bytes())
            .map_err(|e| Error::sysfs(&path, e))?;

        let mut readback = String::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_string(&mut readback))
            .map_err(|e| Error::sysfs(&path, e))?;
        if !readback.starts_with(crate::constants::MANUAL_GOVERNOR) {
            return Err(Error::Governor {
                cpu,
                current: readback.trim().to_string(),
            });
        }
        Ok(())
    }

    pub fn open_setspeed(&self, cpu: usize) -> Result<File> {
        let path = self.attr_path(cpu, "scaling_setspeed");
        OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| Error::sysfs(path, e))
    }
}

impl Default for CpufreqTree {
    fn default() -> Self {
        Self::new(SYSFS_CPU_ROOT)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_count_cpus_ignores_other_entries() {
        let dir = tempfile::tempdir().unwrap();
        add_cpu(dir.path(), 0, &FakeCpu::default());
        add_cpu(dir.path(), 1, &FakeCpu::default());
        std::fs::create_dir_all(dir.path().join("cpufreq")).unwrap();
        std::fs::create_dir_all(dir.path().join("cpuidle")).unwrap();
        std::fs::write(dir.path().join("online"), "0-1\n").unwrap();

        let tree = CpufreqTree::new(dir.path());
        assert_eq!(tree.count_cpus().unwrap(), 2);
    }

    #[test]
    fn test_count_cpus_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tree = CpufreqTree::new(dir.path());
        assert!(matches!(tree.count_cpus(), Err(Error::NoCpus(_))));
    }

    #[test]
    fn test_read_u32_and_optional() {
        let dir = tempfile::tempdir().unwrap();
        add_cpu(
            dir.path(),
            0,
            &FakeCpu {
                available: None,
                ..Default::default()
            },
        );
        let tree = CpufreqTree::new(dir.path());
        assert_eq!(tree.read_u32(0, "cpuinfo_max_freq").unwrap(), 2_000_000);
        assert!(
            tree.read_optional(0, "scaling_available_frequencies")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_governor_switch() {
        let dir = tempfile::tempdir().unwrap();
        add_cpu(
            dir.path(),
            0,
            &FakeCpu {
                governor: "ondemand\n",
                ..Default::default()
            },
        );
        let tree = CpufreqTree::new(dir.path());
        tree.ensure_userspace_governor(0).unwrap();
        assert!(tree.read(0, "scaling_governor").unwrap().starts_with("userspace"));
    }
}
