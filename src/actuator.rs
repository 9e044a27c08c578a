use crate::decider::Decision;
use crate::error::{Error, Result};
use crate::unit::{LogicalCpu, ScalableUnit};

/// Writes unit speeds to `scaling_setspeed`.
#[derive(Debug, Default)]
pub struct Actuator {
    changes: u64,
}

impl Actuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful speed changes so far.
    pub fn changes(&self) -> u64 {
        self.changes
    }

    /// Applies `decision` on behalf of `cpu`. Only the unit's representative acts; the
    /// others are no-ops. Returns whether a write happened.
    ///
    /// On a failed or short write the index rolls back to its previous value.
    pub fn apply_decision(
        &mut self,
        unit: &mut ScalableUnit,
        cpu: usize,
        decision: Decision,
    ) -> Result<bool> {
        if decision == Decision::Same || cpu != unit.representative() {
            return Ok(false);
        }
        let index = match decision {
            Decision::Raise => 0,
            Decision::Lower => (unit.index + 1).min(unit.table.last_index()),
            Decision::Same => unit.index,
        };
        self.force(unit, index)?;
        Ok(true)
    }

    /// Forces every unit to its highest speed, logging failures.
    pub fn restore_max(&mut self, units: &mut [ScalableUnit]) {
        for unit in units {
            if let Err(e) = self.force(unit, 0) {
                log::warn!("{e}");
            }
        }
    }

    /// Writes the speed at `index` to every CPU of the unit, even if unchanged.
    ///
    /// If a CPU rejects the write, the ones that already took the new speed get the
    /// previous one back so the whole unit stays at the tracked index.
    pub fn force(&mut self, unit: &mut ScalableUnit, index: usize) -> Result<()> {
        let previous = unit.index;
        unit.index = index.min(unit.table.last_index());
        let line = speed_line(unit);
        log::debug!("unit {}: setting speed to {}", unit.id, unit.current_speed());

        match write_cpus(&mut unit.cpus, &line) {
            Ok(()) => {
                if unit.index != previous {
                    self.changes += 1;
                }
                Ok(())
            }
            Err((accepted, e)) => {
                unit.index = previous;
                let line = speed_line(unit);
                if let Err((_, restore)) = write_cpus(&mut unit.cpus[..accepted], &line) {
                    log::error!("unit {}: cannot restore previous speed: {restore}", unit.id);
                }
                Err(e)
            }
        }
    }
}

fn speed_line(unit: &ScalableUnit) -> String {
    let speed = unit.current_speed();
    let value = if unit.in_mhz { speed / 1000 } else { speed };
    format!("{value}\n")
}

/// Writes `line` to each CPU in order, stopping at the first failure. The error carries
/// the number of CPUs that accepted the line.
fn write_cpus(cpus: &mut [LogicalCpu], line: &str) -> std::result::Result<(), (usize, Error)> {
    for (accepted, cpu) in cpus.iter_mut().enumerate() {
        let written = cpu
            .sink
            .write_speed(line.as_bytes())
            .map_err(|source| (accepted, Error::Write { cpu: cpu.id, source }))?;
        if written != line.len() {
            return Err((
                accepted,
                Error::ShortWrite {
                    cpu: cpu.id,
                    written,
                    expected: line.len(),
                },
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::freq_table::FrequencyTable;
    use crate::unit::{LogicalCpu, ScalableUnit, SpeedSink};
    use std::io::{Error as IoError, Result as IoResult};
    use std::sync::{Arc, Mutex};

    /// How the next write to a fake sink behaves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Outcome {
        Full,
        Short,
        Fail,
    }

    #[derive(Clone, Default)]
    pub struct FakeSink {
        pub written: Arc<Mutex<Vec<String>>>,
        pub script: Arc<Mutex<Vec<Outcome>>>,
    }

    impl FakeSink {
        pub fn next(&self, outcome: Outcome) {
            self.script.lock().unwrap().push(outcome);
        }

        pub fn lines(&self) -> Vec<String> {
            self.written.lock().unwrap().clone()
        }
    }

    impl SpeedSink for FakeSink {
        fn write_speed(&mut self, buf: &[u8]) -> IoResult<usize> {
            let outcome = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() { Outcome::Full } else { script.remove(0) }
            };
            match outcome {
                Outcome::Full => {
                    self.written
                        .lock()
                        .unwrap()
                        .push(String::from_utf8_lossy(buf).into_owned());
                    Ok(buf.len())
                }
                Outcome::Short => Ok(buf.len() / 2),
                Outcome::Fail => Err(IoError::from_raw_os_error(libc::EINVAL)),
            }
        }
    }

    /// A unit over `cpus` with one fake sink per CPU.
    pub fn fake_unit(id: usize, cpus: &[usize], speeds: &[u32]) -> (ScalableUnit, Vec<FakeSink>) {
        let sinks: Vec<FakeSink> = cpus.iter().map(|_| FakeSink::default()).collect();
        let logical = cpus
            .iter()
            .zip(&sinks)
            .map(|(&cpu, sink)| LogicalCpu::new(cpu, Box::new(sink.clone())))
            .collect();
        let table = FrequencyTable::new(speeds.to_vec()).unwrap();
        (ScalableUnit::new(id, logical, table, false), sinks)
    }
}
