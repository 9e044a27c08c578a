use std::fs::File;
use std::io::{Result as IoResult, Seek, SeekFrom, Write};

use crate::error::{Error, Result};
use crate::freq_table::{FrequencyTable, reports_mhz};
use crate::sysfs::CpufreqTree;
use crate::topology::Topology;

/// Destination of speed writes for one logical CPU.
pub trait SpeedSink {
    /// Writes `buf` once, returning the number of bytes accepted.
    fn write_speed(&mut self, buf: &[u8]) -> IoResult<usize>;
}

impl SpeedSink for File {
    fn write_speed(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.seek(SeekFrom::Start(0))?;
        let written = self.write(buf)?;
        self.flush()?;
        Ok(written)
    }
}

pub struct LogicalCpu {
    pub id: usize,
    pub(crate) sink: Box<dyn SpeedSink>,
}

impl LogicalCpu {
    pub fn new(id: usize, sink: Box<dyn SpeedSink>) -> Self {
        Self { id, sink }
    }
}

/// Logical CPUs that change speed together.
pub struct ScalableUnit {
    pub id: usize,
    pub(crate) cpus: Vec<LogicalCpu>,
    pub(crate) table: FrequencyTable,
    pub(crate) index: usize,
    /// Driver expects MHz on writes.
    pub(crate) in_mhz: bool,
}

impl ScalableUnit {
    /// Starts at the fastest speed; `cpus` must not be empty.
    pub fn new(id: usize, cpus: Vec<LogicalCpu>, table: FrequencyTable, in_mhz: bool) -> Self {
        Self {
            id,
            cpus,
            table,
            index: 0,
            in_mhz,
        }
    }

    pub fn representative(&self) -> usize {
        self.cpus[0].id
    }

    pub fn cpu_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().map(|c| c.id)
    }

    pub fn table(&self) -> &FrequencyTable {
        &self.table
    }

    pub fn current_index(&self) -> usize {
        self.index
    }

    pub fn current_speed(&self) -> u32 {
        self.table.speed(self.index)
    }

    pub fn is_at_min(&self) -> bool {
        self.index == self.table.last_index()
    }
}

impl std::fmt::Debug for ScalableUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalableUnit")
            .field("id", &self.id)
            .field("cpus", &self.cpu_ids().collect::<Vec<_>>())
            .field("table", &self.table.speeds())
            .field("index", &self.index)
            .finish()
    }
}

/// Builds the frequency table of the unit led by `cpu`.
pub fn read_table(
    tree: &CpufreqTree,
    cpu: usize,
    step: Option<u32>,
) -> Result<(FrequencyTable, bool)> {
    let max = tree.read_u32(cpu, "cpuinfo_max_freq")?;
    let min = tree.read_u32(cpu, "cpuinfo_min_freq")?;
    let in_mhz = reports_mhz(max);

    let available = match step {
        Some(_) => None,
        None => tree.read_optional(cpu, "scaling_available_frequencies")?,
    };
    let table = match available.as_deref().and_then(FrequencyTable::parse_available) {
        Some(table) => table,
        None => {
            let step = step.unwrap_or(crate::constants::DEFAULT_STEP_KHZ);
            // the step is given in kHz, the legacy driver counts in MHz
            let step = if in_mhz { step.div_ceil(1000) } else { step };
            FrequencyTable::synthesize(min, max, step).ok_or(Error::EmptyTable { cpu })?
        }
    };
    let table = if in_mhz { table.scaled(1000) } else { table };
    Ok((table, in_mhz))
}

/// Discovers every scalable unit, switching all CPUs to the userspace governor.
pub fn discover_units(
    tree: &CpufreqTree,
    topology: &Topology,
    step: Option<u32>,
) -> Result<Vec<ScalableUnit>> {
    log::info!(
        "Found {} scalable unit{}: -- {} 'CPU{}' per scalable unit",
        topology.unit_count(),
        if topology.unit_count() > 1 { "s" } else { "" },
        topology.threads_per_unit(),
        if topology.threads_per_unit() > 1 { "s" } else { "" },
    );

    let mut units = Vec::with_capacity(topology.unit_count());
    for id in 0..topology.unit_count() {
        let representative = topology.representative(id);
        let (table, in_mhz) = read_table(tree, representative, step)?;

        let mut cpus = Vec::with_capacity(topology.threads_per_unit());
        for cpu in topology.cpus_of(id) {
            tree.ensure_userspace_governor(cpu)?;
            cpus.push(LogicalCpu::new(cpu, Box::new(tree.open_setspeed(cpu)?)));
        }

        log::info!(
            "  cpu{representative}: {}MHz - {}MHz ({} steps)",
            table.min() / 1000,
            table.max() / 1000,
            table.len()
        );
        for (i, speed) in table.speeds().iter().enumerate() {
            log::debug!("     step{} : {}MHz", i + 1, speed / 1000);
        }
        units.push(ScalableUnit::new(id, cpus, table, in_mhz));
    }
    Ok(units)
}
