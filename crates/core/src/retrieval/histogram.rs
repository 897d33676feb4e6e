use std::collections::btree_map::{self, BTreeMap};

/// Sparse word → count multiset.
///
/// `total` always equals the sum of the bins and no bin ever holds 0.
/// `id` is the dense position assigned by a collection (0 when detached)
/// and `weighted_sum` caches the normalization constant for its scoring
/// rules.
#[derive(Clone, Debug, Default)]
pub struct Histogram {
    bins: BTreeMap<u32, u32>,
    total: u64,
    id: u32,
    weighted_sum: f64,
}

impl PartialEq for Histogram {
    /// Content equality; collection bookkeeping is ignored.
    fn eq(&self, other: &Self) -> bool {
        self.bins == other.bins
    }
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_counts<I: IntoIterator<Item = (u32, u32)>>(counts: I) -> Self {
        let mut h = Self::new();
        for (word, count) in counts {
            h.add(word, count as i64);
        }
        h
    }

    /// One occurrence per listed word.
    pub fn from_words<I: IntoIterator<Item = u32>>(words: I) -> Self {
        words.into_iter().collect()
    }

    /// Adds `amount` to the bin of `word`, removing the bin when it reaches 0.
    ///
    /// A decrement larger than the bin clamps at 0; the returned value is
    /// the signed change actually applied.
    pub fn add(&mut self, word: u32, amount: i64) -> i64 {
        if amount == 0 {
            return 0;
        }
        let applied = match self.bins.entry(word) {
            btree_map::Entry::Occupied(mut e) => {
                let old = *e.get() as i64;
                let new = (old + amount).clamp(0, u32::MAX as i64);
                if new == 0 {
                    e.remove();
                } else {
                    *e.get_mut() = new as u32;
                }
                new - old
            }
            btree_map::Entry::Vacant(e) => {
                if amount < 0 {
                    0
                } else {
                    let new = amount.min(u32::MAX as i64);
                    e.insert(new as u32);
                    new
                }
            }
        };
        self.total = (self.total as i64 + applied) as u64;
        applied
    }

    /// Count for `word`, 0 when absent.
    pub fn get(&self, word: u32) -> u32 {
        self.bins.get(&word).copied().unwrap_or(0)
    }

    pub fn contains(&self, word: u32) -> bool {
        self.bins.contains_key(&word)
    }

    /// Number of distinct words.
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Bins in ascending word order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.bins.iter().map(|(w, c)| (*w, *c))
    }

    pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
        self.bins.keys().copied()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn clear(&mut self) {
        self.bins.clear();
        self.total = 0;
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn weighted_sum(&self) -> f64 {
        self.weighted_sum
    }

    pub(crate) fn set_weighted_sum(&mut self, weighted_sum: f64) {
        self.weighted_sum = weighted_sum;
    }

    /// Folds every bin of `other` into this histogram.
    pub fn absorb(&mut self, other: &Histogram) {
        for (word, count) in other.iter() {
            self.add(word, count as i64);
        }
    }
}

impl FromIterator<u32> for Histogram {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut h = Histogram::new();
        for word in iter {
            h.add(word, 1);
        }
        h
    }
}
