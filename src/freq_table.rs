use crate::constants::{LEGACY_MHZ_THRESHOLD, MAX_TABLE_ENTRIES};

/// Selectable speeds of one scalable unit in kHz, strictly descending and never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrequencyTable {
    speeds: Vec<u32>,
}

#[allow(clippy::len_without_is_empty)]
impl FrequencyTable {
    /// Sorts descending and drops duplicates and zeros. `None` when nothing is left.
    pub fn new(mut speeds: Vec<u32>) -> Option<Self> {
        speeds.retain(|&s| s > 0);
        speeds.sort_unstable_by(|a, b| b.cmp(a));
        speeds.dedup();
        (!speeds.is_empty()).then_some(Self { speeds })
    }

    /// Steps down from `max` to `min`; the last step is rounded up to `min`.
    pub fn synthesize(min: u32, max: u32, step: u32) -> Option<Self> {
        let (min, max) = (min.min(max), min.max(max));
        let span = max - min;
        let step = step.min(span);
        if step == 0 {
            return Self::new(vec![max]);
        }
        let size = span / step + 1 + u32::from(span % step != 0);
        let speeds = (0..size)
            .map(|i| max.saturating_sub(i.saturating_mul(step)).max(min))
            .collect();
        Self::new(speeds)
    }

    /// Parses `scaling_available_frequencies`. Stops at the first token that is not a
    /// positive number.
    pub fn parse_available(content: &str) -> Option<Self> {
        let speeds = content
            .split_whitespace()
            .map_while(|token| token.parse::<u32>().ok().filter(|&s| s > 0))
            .take(MAX_TABLE_ENTRIES)
            .collect();
        Self::new(speeds)
    }

    /// Rescales a table read from a driver that reports MHz.
    pub fn scaled(self, factor: u32) -> Self {
        Self {
            speeds: self
                .speeds
                .into_iter()
                .map(|s| s.saturating_mul(factor))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.speeds.len()
    }

    pub fn last_index(&self) -> usize {
        self.speeds.len() - 1
    }

    pub fn max(&self) -> u32 {
        self.speeds[0]
    }

    pub fn min(&self) -> u32 {
        self.speeds[self.last_index()]
    }

    /// Speed at `index`, clamped to the slowest entry.
    pub fn speed(&self, index: usize) -> u32 {
        self.speeds[index.min(self.last_index())]
    }

    pub fn speeds(&self) -> &[u32] {
        &self.speeds
    }
}

/// Drivers reporting at most 10,000 for their max speed use MHz instead of kHz.
pub fn reports_mhz(max_speed: u32) -> bool {
    max_speed <= LEGACY_MHZ_THRESHOLD
}
