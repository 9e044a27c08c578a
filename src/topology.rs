//! Grouping of logical CPUs into scalable units.

use crate::sysfs::CpufreqTree;

/// A way of finding out how many logical CPUs share one clock domain.
pub trait ThreadsProbe {
    fn name(&self) -> &'static str;
    /// `None` when the probe has no answer on this machine.
    fn probe(&self, ncpus: usize) -> Option<usize>;
}

/// User-supplied unit size.
pub struct Override(pub Option<usize>);

impl ThreadsProbe for Override {
    fn name(&self) -> &'static str {
        "override"
    }

    fn probe(&self, ncpus: usize) -> Option<usize> {
        let threads = self.0?;
        if threads > ncpus {
            log::warn!("bogus number of threads per unit ({threads}), assuming 1");
            return Some(1);
        }
        Some(threads)
    }
}

/// Counts the CPUs listed in `cpu0/cpufreq/affected_cpus`.
pub struct AffectedCpus<'a>(pub &'a CpufreqTree);

impl ThreadsProbe for AffectedCpus<'_> {
    fn name(&self) -> &'static str {
        "affected_cpus"
    }

    fn probe(&self, _ncpus: usize) -> Option<usize> {
        let content = self.0.read_optional(0, "affected_cpus").ok()??;
        let cpus: Vec<usize> = content
            .split_whitespace()
            .map_while(|t| t.parse().ok())
            .collect();
        match cpus.first() {
            None => None,
            Some(0) => Some(cpus.len()),
            Some(_) => {
                log::warn!("cpu0 scaling doesn't affect cpu0? assuming 1 thread per unit");
                Some(1)
            }
        }
    }
}

/// Hyper-threading sibling count from CPUID leaf 1.
pub struct Cpuid;

impl ThreadsProbe for Cpuid {
    fn name(&self) -> &'static str {
        "cpuid"
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn probe(&self, _ncpus: usize) -> Option<usize> {
        #[cfg(target_arch = "x86")]
        use std::arch::x86::__cpuid;
        #[cfg(target_arch = "x86_64")]
        use std::arch::x86_64::__cpuid;

        // SAFETY: leaf 1 is available on every CPU that can run this binary.
        let leaf = unsafe { __cpuid(1) };
        if leaf.edx & (1 << 28) == 0 {
            return None;
        }
        let logical = ((leaf.ebx >> 16) & 0xff) as usize;
        Some(logical.max(1))
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    fn probe(&self, _ncpus: usize) -> Option<usize> {
        None
    }
}

/// Logical-to-unit mapping, uniform across the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    ncpus: usize,
    threads_per_unit: usize,
}

impl Topology {
    /// Runs `probes` in order; the first answer wins, falling back to 1.
    pub fn detect(ncpus: usize, probes: &[&dyn ThreadsProbe]) -> Self {
        let threads = if ncpus <= 1 {
            1
        } else {
            probes
                .iter()
                .find_map(|p| {
                    let answer = p.probe(ncpus)?;
                    log::debug!("{}: {answer} thread(s) per unit", p.name());
                    Some(answer)
                })
                .unwrap_or(1)
        };
        Self::new(ncpus, threads)
    }

    /// Forces one thread per unit when `ncpus` is not a multiple of `threads_per_unit`.
    pub fn new(ncpus: usize, threads_per_unit: usize) -> Self {
        let ncpus = ncpus.max(1);
        let threads_per_unit = if threads_per_unit == 0 || ncpus % threads_per_unit != 0 {
            log::warn!(
                "ncpus ({ncpus}) is not a multiple of threads per unit ({threads_per_unit}), \
                assuming 1"
            );
            1
        } else {
            threads_per_unit
        };
        Self {
            ncpus,
            threads_per_unit,
        }
    }

    pub fn threads_per_unit(&self) -> usize {
        self.threads_per_unit
    }

    pub fn unit_count(&self) -> usize {
        self.ncpus / self.threads_per_unit
    }

    pub fn cpus_of(&self, unit: usize) -> std::ops::Range<usize> {
        let base = unit * self.threads_per_unit;
        base..base + self.threads_per_unit
    }

    pub fn representative(&self, unit: usize) -> usize {
        unit * self.threads_per_unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::testing::{FakeCpu, add_cpu};

    struct Fixed(Option<usize>);

    impl ThreadsProbe for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn probe(&self, _ncpus: usize) -> Option<usize> {
            self.0
        }
    }

    #[test]
    fn test_partition() {
        let t = Topology::new(8, 2);
        assert_eq!(t.unit_count(), 4);
        assert_eq!(t.cpus_of(1), 2..4);
        assert_eq!(t.representative(3), 6);
    }

    #[test]
    fn test_indivisible_forces_one() {
        let t = Topology::new(6, 4);
        assert_eq!(t.threads_per_unit(), 1);
        assert_eq!(t.unit_count(), 6);
    }

    #[test]
    fn test_probe_chain_order() {
        let t = Topology::detect(8, &[&Fixed(None), &Fixed(Some(4)), &Fixed(Some(2))]);
        assert_eq!(t.threads_per_unit(), 4);

        let t = Topology::detect(8, &[&Fixed(None), &Fixed(None)]);
        assert_eq!(t.threads_per_unit(), 1);
    }

    #[test]
    fn test_single_cpu_skips_probes() {
        let t = Topology::detect(1, &[&Fixed(Some(2))]);
        assert_eq!(t.threads_per_unit(), 1);
    }

    #[test]
    fn test_override_larger_than_ncpus() {
        assert_eq!(Override(Some(16)).probe(4), Some(1));
        assert_eq!(Override(Some(2)).probe(4), Some(2));
        assert_eq!(Override(None).probe(4), None);
    }

    #[test]
    fn test_affected_cpus_probe() {
        let dir = tempfile::tempdir().unwrap();
        add_cpu(
            dir.path(),
            0,
            &FakeCpu {
                affected: Some("0 1\n"),
                ..Default::default()
            },
        );
        let tree = CpufreqTree::new(dir.path());
        assert_eq!(AffectedCpus(&tree).probe(4), Some(2));

        std::fs::write(tree.attr_path(0, "affected_cpus"), "2 3\n").unwrap();
        assert_eq!(AffectedCpus(&tree).probe(4), Some(1));

        std::fs::remove_file(tree.attr_path(0, "affected_cpus")).unwrap();
        assert_eq!(AffectedCpus(&tree).probe(4), None);
    }
}
