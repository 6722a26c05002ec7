use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::{Entity, IngestError, NaturalKey};

/// Largest number of entities one draw may request.
pub const MAX_ENTITY_COUNT: usize = 100_000;

const FIRST_NAMES: &[&str] = &[
    "Aaron", "Abigail", "Adrian", "Alice", "Amelia", "Andrew", "Anna", "Arthur", "Beatrice",
    "Benjamin", "Caleb", "Charlotte", "Daniel", "Diana", "Edward", "Eleanor", "Felix", "Grace",
    "Henry", "Isabel", "Jacob", "Julia", "Leo", "Lucy", "Martin", "Nora", "Oliver", "Rachel",
    "Samuel", "Victoria",
];

const LAST_NAMES: &[&str] = &[
    "Anderson", "Baker", "Carter", "Clark", "Collins", "Davis", "Evans", "Fisher", "Foster",
    "Garcia", "Hughes", "Jenkins", "Johnson", "Kelly", "Lewis", "Martinez", "Mitchell", "Morgan",
    "Nelson", "Parker", "Perry", "Reed", "Roberts", "Russell", "Sanders", "Turner", "Walker",
    "Ward", "Wilson", "Young",
];

const CITIES: &[&str] = &[
    "Aberdeen", "Ashland", "Bedford", "Bristol", "Camden", "Clinton", "Dover", "Fairview",
    "Franklin", "Georgetown", "Greenville", "Kingston", "Lexington", "Madison", "Milford",
    "Newport", "Oxford", "Salem", "Springfield", "Winchester",
];

const STREETS: &[&str] = &[
    "Acacia Avenue", "Bay Street", "Cedar Lane", "Church Road", "Elm Street", "Field Way",
    "Hill Road", "King Street", "Lake Drive", "Main Street", "Maple Avenue", "Mill Lane",
    "Oak Street", "Park Avenue", "Pine Road", "River Road", "School Lane", "Station Road",
    "Union Street", "Willow Way",
];

/// Supplies synthetic subscriber identities.
pub trait IdentitySource {
    fn next_identity(&mut self) -> NaturalKey;
}

/// Draws identities from built-in vocabularies with a seedable RNG.
#[derive(Debug, Clone)]
pub struct SeededIdentitySource {
    rng: StdRng,
}

impl SeededIdentitySource {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    #[must_use]
    pub fn from_entropy() -> Self {
        Self { rng: StdRng::from_entropy() }
    }

    fn pick(&mut self, values: &[&'static str]) -> &'static str {
        values.choose(&mut self.rng).copied().unwrap_or_default()
    }
}

impl IdentitySource for SeededIdentitySource {
    fn next_identity(&mut self) -> NaturalKey {
        let first_name = self.pick(FIRST_NAMES);
        let last_name = self.pick(LAST_NAMES);
        let city = self.pick(CITIES);
        let house = self.rng.gen_range(1..=9_999_u32);
        let street = self.pick(STREETS);
        NaturalKey::new(first_name, last_name, city, format!("{house} {street}"))
    }
}

/// Draw `count` entities that are pairwise distinct by natural key, in draw
/// order.
///
/// # Errors
/// Returns [`IngestError::Validation`] when `count` exceeds
/// [`MAX_ENTITY_COUNT`], or when the source keeps repeating itself and `count`
/// distinct identities cannot be collected within the attempt budget.
pub fn draw_distinct<I>(source: &mut I, count: usize) -> Result<Vec<Entity>, IngestError>
where
    I: IdentitySource + ?Sized,
{
    check_entity_count(count)?;

    let max_attempts = count * 16 + 64;
    let mut seen = HashSet::with_capacity(count);
    let mut entities = Vec::with_capacity(count);

    for _ in 0..max_attempts {
        if entities.len() == count {
            break;
        }
        let entity = Entity::new(source.next_identity());
        if seen.insert(entity.clone()) {
            entities.push(entity);
        }
    }

    if entities.len() < count {
        return Err(IngestError::Validation(format!(
            "identity source produced only {} distinct entities out of {count} requested",
            entities.len()
        )));
    }
    Ok(entities)
}

pub(crate) fn check_entity_count(count: usize) -> Result<(), IngestError> {
    if count > MAX_ENTITY_COUNT {
        return Err(IngestError::Validation(format!(
            "entity count {count} exceeds the limit of {MAX_ENTITY_COUNT}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Repeating;

    impl IdentitySource for Repeating {
        fn next_identity(&mut self) -> NaturalKey {
            NaturalKey::new("Same", "Person", "Salem", "1 Main Street")
        }
    }

    #[test]
    fn seeded_source_is_reproducible() {
        let mut a = SeededIdentitySource::new(2024);
        let mut b = SeededIdentitySource::new(2024);
        for _ in 0..10 {
            assert_eq!(a.next_identity(), b.next_identity());
        }
    }

    #[test]
    fn generated_identities_are_complete() {
        let mut source = SeededIdentitySource::new(5);
        for _ in 0..50 {
            assert!(source.next_identity().validate().is_ok());
        }
    }

    #[test]
    fn draw_distinct_returns_unique_natural_keys() -> anyhow::Result<()> {
        let mut source = SeededIdentitySource::new(11);
        let entities = draw_distinct(&mut source, 200)?;

        assert_eq!(entities.len(), 200);
        let unique = entities.iter().collect::<HashSet<_>>();
        assert_eq!(unique.len(), 200);
        Ok(())
    }

    #[test]
    fn draw_distinct_gives_up_on_repeating_source() {
        let result = draw_distinct(&mut Repeating, 2);
        assert!(matches!(result, Err(IngestError::Validation(_))));
    }

    #[test]
    fn draw_distinct_rejects_oversized_count_without_allocating() {
        let mut source = SeededIdentitySource::new(1);
        for count in [MAX_ENTITY_COUNT + 1, usize::MAX / 2, usize::MAX] {
            let result = draw_distinct(&mut source, count);
            let rejected = matches!(
                &result,
                Err(IngestError::Validation(message)) if message.contains("exceeds")
            );
            assert!(rejected, "count {count} gave {result:?}");
        }
    }

    #[test]
    fn draw_zero_is_empty() -> anyhow::Result<()> {
        assert!(draw_distinct(&mut Repeating, 0)?.is_empty());
        Ok(())
    }
}
