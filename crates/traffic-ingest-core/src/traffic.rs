use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::TrafficMap;

/// Upper bound (exclusive) for generated per-minute load.
pub const DEFAULT_MAX_LOAD_BYTES: u32 = 100_000_000;

/// Assigns one load value to every timestamp it is given.
pub trait TrafficGenerator {
    fn assign(&mut self, timestamps: &[OffsetDateTime]) -> TrafficMap;

    fn max_load_bytes(&self) -> u32;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneratorConfig {
    pub max_load_bytes: u32,
    pub seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self { max_load_bytes: DEFAULT_MAX_LOAD_BYTES, seed: None }
    }
}

/// Independent, uniformly distributed loads in `[0, max_load_bytes)`.
#[derive(Debug, Clone)]
pub struct UniformTrafficGenerator {
    rng: StdRng,
    max_load_bytes: u32,
}

impl UniformTrafficGenerator {
    #[must_use]
    pub fn new(config: &GeneratorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng, max_load_bytes: config.max_load_bytes }
    }
}

impl TrafficGenerator for UniformTrafficGenerator {
    fn assign(&mut self, timestamps: &[OffsetDateTime]) -> TrafficMap {
        timestamps
            .iter()
            .map(|minute| {
                let load = if self.max_load_bytes == 0 {
                    0
                } else {
                    self.rng.gen_range(0..self.max_load_bytes)
                };
                (*minute, load)
            })
            .collect()
    }

    fn max_load_bytes(&self) -> u32 {
        self.max_load_bytes
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::macros::datetime;
    use time::Duration;

    use super::*;

    fn minutes(count: i64) -> Vec<OffsetDateTime> {
        (0..count).map(|index| datetime!(2024-01-01 0:00 UTC) + Duration::minutes(index)).collect()
    }

    #[test]
    fn same_seed_produces_same_traffic() {
        let config = GeneratorConfig { seed: Some(99), ..Default::default() };
        let timestamps = minutes(30);

        let a = UniformTrafficGenerator::new(&config).assign(&timestamps);
        let b = UniformTrafficGenerator::new(&config).assign(&timestamps);

        assert_eq!(a, b);
    }

    #[test]
    fn zero_bound_yields_zero_load() {
        let config = GeneratorConfig { max_load_bytes: 0, seed: Some(3) };
        let traffic = UniformTrafficGenerator::new(&config).assign(&minutes(5));
        assert_eq!(traffic.len(), 5);
        assert!(traffic.values().all(|load| *load == 0));
    }

    #[test]
    fn empty_grid_yields_empty_map() {
        let traffic = UniformTrafficGenerator::new(&GeneratorConfig::default()).assign(&[]);
        assert!(traffic.is_empty());
    }

    proptest! {
        #[test]
        fn property_one_bounded_value_per_timestamp(
            seed in any::<u64>(),
            count in 0_i64..500,
            max_load_bytes in 1_u32..=u32::MAX,
        ) {
            let timestamps = minutes(count);
            let mut generator =
                UniformTrafficGenerator::new(&GeneratorConfig { max_load_bytes, seed: Some(seed) });
            let traffic = generator.assign(&timestamps);

            prop_assert_eq!(traffic.len(), timestamps.len());
            prop_assert!(timestamps.iter().all(|minute| traffic.contains_key(minute)));
            prop_assert!(traffic.values().all(|load| *load < max_load_bytes));
        }
    }
}
