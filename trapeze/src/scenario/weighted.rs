use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use trapeze_core::ConfigError;

/// Items picked at random in proportion to their weight.
#[derive(Clone, Debug)]
pub struct WeightedSet<T> {
    items: Vec<T>,
    weights: Vec<u32>,
    index: WeightedIndex<u32>,
}

impl<T> WeightedSet<T> {
    /// `name_of` is only used for error messages.
    pub fn new(
        kind: &'static str,
        owner: &str,
        entries: Vec<(u32, T)>,
        name_of: impl Fn(&T) -> String,
    ) -> Result<Self, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::Empty {
                kind,
                name: owner.to_string(),
            });
        }

        if let Some((_, item)) = entries.iter().find(|(weight, _)| *weight == 0) {
            return Err(ConfigError::ZeroWeight {
                kind,
                name: name_of(item),
            });
        }

        let overflow = || ConfigError::WeightOverflow {
            kind,
            name: owner.to_string(),
        };
        entries
            .iter()
            .try_fold(0u32, |sum, (weight, _)| sum.checked_add(*weight))
            .ok_or_else(overflow)?;

        let (weights, items): (Vec<u32>, Vec<T>) = entries.into_iter().unzip();
        let index = WeightedIndex::new(&weights).map_err(|_| overflow())?;

        Ok(Self {
            items,
            weights,
            index,
        })
    }

    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> &T {
        &self.items[self.index.sample(rng)]
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.weights.iter().copied().zip(self.items.iter())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
