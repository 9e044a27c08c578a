//! Bang-bang hysteresis between a lower and an upper load threshold.

use crate::error::{Error, Result};
use crate::load::LoadSample;

/// Ordered by severity: `Lower < Same < Raise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Decision {
    Lower,
    Same,
    Raise,
}

/// Percentages in `[0, 100]`, `lower <= upper`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub lower: f32,
    pub upper: f32,
}

impl Thresholds {
    pub fn new(name: &str, lower: f32, upper: f32) -> Result<Self> {
        for (which, value) in [("lower", lower), ("upper", upper)] {
            if !(0.0..=100.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{name} {which} limit must be between 0 and 100"
                )));
            }
        }
        if lower > upper {
            return Err(Error::Config(format!(
                "{name} lower limit ({lower}%) is higher than the upper limit ({upper}%)"
            )));
        }
        Ok(Self { lower, upper })
    }
}

/// Which metrics take part in the decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    pub dsp: Option<Thresholds>,
    pub cpu: Option<Thresholds>,
}

impl Policy {
    /// Raise when any present metric is above its upper limit.
    fn hot(&self, sample: &LoadSample) -> bool {
        let dsp_hot = self
            .dsp
            .zip(sample.dsp_load)
            .is_some_and(|(t, load)| load > t.upper);
        let cpu_hot = self
            .cpu
            .zip(sample.cpu_percent())
            .is_some_and(|(t, load)| load > t.upper);
        dsp_hot || cpu_hot
    }

    /// Lower only when every enabled metric is present and below its lower limit.
    fn cold(&self, sample: &LoadSample) -> bool {
        if self.dsp.is_none() && self.cpu.is_none() {
            return false;
        }
        let dsp_cold = self
            .dsp
            .is_none_or(|t| sample.dsp_load.is_some_and(|load| load < t.lower));
        let cpu_cold = self
            .cpu
            .is_none_or(|t| sample.cpu_percent().is_some_and(|load| load < t.lower));
        dsp_cold && cpu_cold
    }
}

/// Decision for one thread given its unit's current position in a table of `table_len`.
pub fn decide(index: usize, table_len: usize, sample: &LoadSample, policy: &Policy) -> Decision {
    let at_max = index == 0;
    let at_min = index + 1 >= table_len;
    if policy.hot(sample) {
        if at_max { Decision::Same } else { Decision::Raise }
    } else if policy.cold(sample) && !at_min {
        Decision::Lower
    } else {
        Decision::Same
    }
}

/// Most severe of the per-thread decisions; a unit raises if any thread wants to.
pub fn decide_unit(
    index: usize,
    table_len: usize,
    threads: &[LoadSample],
    policy: &Policy,
) -> Decision {
    threads
        .iter()
        .map(|sample| decide(index, table_len, sample, policy))
        .max()
        .unwrap_or(Decision::Same)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const DSP: Policy = Policy {
        dsp: Some(Thresholds {
            lower: 10.0,
            upper: 50.0,
        }),
        cpu: None,
    };

    const BOTH: Policy = Policy {
        dsp: Some(Thresholds {
            lower: 10.0,
            upper: 50.0,
        }),
        cpu: Some(Thresholds {
            lower: 40.0,
            upper: 80.0,
        }),
    };

    fn sample(dsp: Option<f32>, cpu: Option<f32>) -> LoadSample {
        LoadSample {
            dsp_load: dsp,
            cpu_utilization: cpu,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_low_load_at_max_lowers() {
        assert_eq!(decide(0, 3, &sample(Some(5.0), None), &DSP), Decision::Lower);
    }

    #[test]
    fn test_high_load_at_min_raises() {
        assert_eq!(decide(2, 3, &sample(Some(90.0), None), &DSP), Decision::Raise);
    }

    #[test]
    fn test_bounds_are_same() {
        assert_eq!(decide(0, 3, &sample(Some(90.0), None), &DSP), Decision::Same);
        assert_eq!(decide(2, 3, &sample(Some(5.0), None), &DSP), Decision::Same);
        assert_eq!(decide(0, 1, &sample(Some(5.0), None), &DSP), Decision::Same);
    }

    #[test]
    fn test_between_thresholds_is_same() {
        assert_eq!(decide(1, 3, &sample(Some(30.0), None), &DSP), Decision::Same);
        assert_eq!(decide(1, 3, &sample(Some(50.0), None), &DSP), Decision::Same);
        assert_eq!(decide(1, 3, &sample(Some(10.0), None), &DSP), Decision::Same);
    }

    #[test]
    fn test_missing_sample_is_same() {
        assert_eq!(decide(1, 3, &sample(None, None), &DSP), Decision::Same);
        assert_eq!(decide(1, 3, &sample(None, None), &BOTH), Decision::Same);
    }

    #[test]
    fn test_combined_raises_if_dsp_hot_and_cpu_idle() {
        let s = sample(Some(70.0), Some(0.05));
        assert_eq!(decide(1, 3, &s, &BOTH), Decision::Raise);
    }

    #[test]
    fn test_combined_raises_if_cpu_hot() {
        let s = sample(Some(5.0), Some(0.95));
        assert_eq!(decide(1, 3, &s, &BOTH), Decision::Raise);
    }

    #[test]
    fn test_combined_lowers_only_if_both_cold() {
        assert_eq!(
            decide(0, 3, &sample(Some(5.0), Some(0.1)), &BOTH),
            Decision::Lower
        );
        assert_eq!(
            decide(0, 3, &sample(Some(5.0), Some(0.6)), &BOTH),
            Decision::Same
        );
        assert_eq!(
            decide(0, 3, &sample(Some(20.0), Some(0.1)), &BOTH),
            Decision::Same
        );
        // no cpu delta yet
        assert_eq!(decide(0, 3, &sample(Some(5.0), None), &BOTH), Decision::Same);
    }

    #[test]
    fn test_unit_takes_most_severe() {
        let cpu_only = Policy {
            dsp: None,
            cpu: BOTH.cpu,
        };
        let threads = [
            sample(None, Some(0.1)),
            sample(None, Some(0.9)),
            sample(None, Some(0.5)),
        ];
        assert_eq!(decide_unit(1, 3, &threads, &cpu_only), Decision::Raise);

        let threads = [sample(None, Some(0.1)), sample(None, Some(0.5))];
        assert_eq!(decide_unit(1, 3, &threads, &cpu_only), Decision::Same);

        let threads = [sample(None, Some(0.1)), sample(None, Some(0.2))];
        assert_eq!(decide_unit(1, 3, &threads, &cpu_only), Decision::Lower);
    }

    #[test]
    fn test_severity_order() {
        assert!(Decision::Raise > Decision::Same);
        assert!(Decision::Same > Decision::Lower);
    }

    #[test]
    fn test_threshold_validation() {
        assert!(Thresholds::new("dsp", 10.0, 50.0).is_ok());
        assert!(Thresholds::new("dsp", 50.0, 50.0).is_ok());
        assert!(matches!(
            Thresholds::new("dsp", 60.0, 50.0),
            Err(Error::Config(_))
        ));
        assert!(Thresholds::new("cpu", -1.0, 50.0).is_err());
        assert!(Thresholds::new("cpu", 10.0, 101.0).is_err());
    }
}
