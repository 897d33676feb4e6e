use std::collections::{BTreeMap, BTreeSet, HashMap};

use float_ord::FloatOrd;

use crate::retrieval::cluster_collection::ClusterKey;

type Entry = (FloatOrd<f64>, ClusterKey, ClusterKey);

/// Pairwise similarities ordered by score, for agglomerative reduction.
///
/// Pairs are stored with the lower key first. A reverse index from each
/// cluster to its partners lets a cluster's entries be erased using the
/// exact scores they were inserted with.
#[derive(Default)]
pub struct DistanceMatrix {
    entries: BTreeSet<Entry>,
    scores: HashMap<(ClusterKey, ClusterKey), f64>,
    partners: BTreeMap<ClusterKey, BTreeSet<ClusterKey>>,
}

fn ordered(a: ClusterKey, b: ClusterKey) -> (ClusterKey, ClusterKey) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl DistanceMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records the similarity of `a` and `b`, replacing any previous score.
    pub fn insert(&mut self, a: ClusterKey, b: ClusterKey, score: f64) {
        debug_assert_ne!(a, b);
        let pair = ordered(a, b);
        if let Some(old) = self.scores.insert(pair, score) {
            self.entries.remove(&(FloatOrd(old), pair.0, pair.1));
        }
        self.entries.insert((FloatOrd(score), pair.0, pair.1));
        self.partners.entry(pair.0).or_default().insert(pair.1);
        self.partners.entry(pair.1).or_default().insert(pair.0);
    }

    pub fn score(&self, a: ClusterKey, b: ClusterKey) -> Option<f64> {
        self.scores.get(&ordered(a, b)).copied()
    }

    /// Highest-scoring pair; among equal scores the highest keys.
    pub fn best(&self) -> Option<(f64, ClusterKey, ClusterKey)> {
        self.entries.last().map(|(s, a, b)| (s.0, *a, *b))
    }

    /// Erases every pair involving `key`.
    pub fn remove_cluster(&mut self, key: ClusterKey) {
        let Some(partners) = self.partners.remove(&key) else {
            return;
        };
        for other in partners {
            let pair = ordered(key, other);
            if let Some(score) = self.scores.remove(&pair) {
                self.entries.remove(&(FloatOrd(score), pair.0, pair.1));
            }
            if let Some(set) = self.partners.get_mut(&other) {
                set.remove(&key);
                if set.is_empty() {
                    self.partners.remove(&other);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.scores.clear();
        self.partners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::cluster_collection::ClusterCollection;
    use crate::retrieval::histogram::Histogram;

    fn keys(n: usize) -> Vec<ClusterKey> {
        let mut c = ClusterCollection::default();
        (0..n).map(|_| c.add_cluster(Histogram::new())).collect()
    }

    #[test]
    fn test_best_is_highest_score() {
        let k = keys(3);
        let mut m = DistanceMatrix::new();
        m.insert(k[0], k[1], 0.5);
        m.insert(k[2], k[0], 0.9);
        m.insert(k[1], k[2], 0.1);
        assert_eq!(m.best(), Some((0.9, k[0], k[2])));
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn test_remove_cluster_erases_all_its_pairs() {
        let k = keys(4);
        let mut m = DistanceMatrix::new();
        m.insert(k[0], k[1], 0.1 + 0.2);
        m.insert(k[0], k[2], 1.0 / 3.0);
        m.insert(k[1], k[3], 0.7);
        m.remove_cluster(k[0]);
        assert_eq!(m.len(), 1);
        assert_eq!(m.best(), Some((0.7, k[1], k[3])));
        assert_eq!(m.score(k[0], k[1]), None);
        m.remove_cluster(k[3]);
        assert!(m.is_empty());
    }

    #[test]
    fn test_reinsert_replaces_score() {
        let k = keys(2);
        let mut m = DistanceMatrix::new();
        m.insert(k[0], k[1], 0.2);
        m.insert(k[1], k[0], 0.6);
        assert_eq!(m.len(), 1);
        assert_eq!(m.score(k[0], k[1]), Some(0.6));
    }

    #[test]
    fn test_ties_break_on_keys() {
        let k = keys(3);
        let mut m = DistanceMatrix::new();
        m.insert(k[0], k[1], 0.5);
        m.insert(k[1], k[2], 0.5);
        assert_eq!(m.best(), Some((0.5, k[1], k[2])));
    }
}
