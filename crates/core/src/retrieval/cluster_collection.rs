//! Indexed set of word histograms with policy-weighted similarity scoring.
//!
//! Clusters are addressed two ways. A [`ClusterKey`] is a stable handle that
//! is never reused. The dense `id` (1..=N, stored on the histogram) follows
//! insertion order and is renumbered after every removal or merge.
//!
//! The inverted index maps each word to the clusters holding it, with their
//! counts, and always mirrors the histograms exactly. Every structural
//! mutation bumps `version` so queries can detect that their running scores
//! are stale.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::retrieval::histogram::Histogram;
use crate::retrieval::query_rules::QueryRules;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterKey(u64);

impl ClusterKey {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Contribution of one shared word to a cluster's score.
///
/// `query` and `cluster` are the raw counts on each side, `weighted_sum`
/// the cluster's normalization constant and `idf` the word's weight.
pub(crate) fn term_score(
    rules: QueryRules,
    query: u32,
    cluster: u32,
    weighted_sum: f64,
    idf: f64,
) -> f64 {
    if query == 0 || cluster == 0 {
        return 0.0;
    }
    let (q, c) = if rules.bin_freq() {
        (1.0, 1.0)
    } else {
        (query as f64, cluster as f64)
    };
    let mut combined = if rules.min_freq() { q.min(c) } else { q * c };
    if rules.normalized() {
        if weighted_sum <= 0.0 {
            return 0.0;
        }
        combined /= weighted_sum;
    }
    if rules.idf() {
        combined * idf
    } else {
        combined
    }
}

pub struct ClusterCollection {
    clusters: BTreeMap<ClusterKey, Histogram>,
    index: BTreeMap<u32, BTreeMap<ClusterKey, u32>>,
    by_id: Vec<ClusterKey>,
    best_clusters: BTreeMap<u32, ClusterKey>,
    next_key: u64,
    rules: QueryRules,
    weights_valid: bool,
    version: u64,
    instance: u64,
}

impl Default for ClusterCollection {
    fn default() -> Self {
        Self::new(QueryRules::NORMALIZED_FREQ)
    }
}

impl ClusterCollection {
    pub fn new(rules: QueryRules) -> Self {
        Self {
            clusters: BTreeMap::new(),
            index: BTreeMap::new(),
            by_id: Vec::new(),
            best_clusters: BTreeMap::new(),
            next_key: 1,
            rules,
            weights_valid: true,
            version: 0,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Process-unique identity, used with `version` to bind queries.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn rules(&self) -> QueryRules {
        self.rules
    }

    pub fn get(&self, key: ClusterKey) -> Option<&Histogram> {
        self.clusters.get(&key)
    }

    pub fn contains(&self, key: ClusterKey) -> bool {
        self.clusters.contains_key(&key)
    }

    /// Key of the cluster with dense id `id`.
    pub fn key_for_id(&self, id: u32) -> Option<ClusterKey> {
        let index = (id as usize).checked_sub(1)?;
        self.by_id.get(index).copied()
    }

    pub fn get_by_id(&self, id: u32) -> Option<&Histogram> {
        self.key_for_id(id).and_then(|k| self.clusters.get(&k))
    }

    /// Clusters in dense id order.
    pub fn iter(&self) -> impl Iterator<Item = (ClusterKey, &Histogram)> + '_ {
        self.by_id.iter().filter_map(|k| self.clusters.get(k).map(|h| (*k, h)))
    }

    pub fn keys(&self) -> impl Iterator<Item = ClusterKey> + '_ {
        self.by_id.iter().copied()
    }

    /// Clusters holding `word`, with their counts.
    pub fn index_entries(&self, word: u32) -> Option<&BTreeMap<ClusterKey, u32>> {
        self.index.get(&word)
    }

    pub fn clusters_containing(&self, word: u32) -> usize {
        self.index.get(&word).map_or(0, BTreeMap::len)
    }

    /// `ln(N / n_w)`; 1 with fewer than two clusters, 0 for unknown words.
    pub fn idf(&self, word: u32) -> f64 {
        let containing = self.clusters_containing(word);
        if containing == 0 {
            return 0.0;
        }
        let n = self.clusters.len();
        if n < 2 {
            return 1.0;
        }
        (n as f64 / containing as f64).ln()
    }

    pub fn add_cluster(&mut self, mut histogram: Histogram) -> ClusterKey {
        let key = ClusterKey(self.next_key);
        self.next_key += 1;
        for (word, count) in histogram.iter() {
            self.index.entry(word).or_default().insert(key, count);
        }
        self.by_id.push(key);
        histogram.set_id(self.by_id.len() as u32);
        histogram.set_weighted_sum(histogram.total() as f64);
        self.clusters.insert(key, histogram);
        self.structure_changed(key);
        key
    }

    pub fn remove_cluster(&mut self, key: ClusterKey) -> Option<Histogram> {
        let histogram = self.clusters.remove(&key)?;
        self.unindex(key, &histogram);
        self.renumber();
        if self.rules.needs_weighted_sum() {
            self.weights_valid = false;
        }
        self.version += 1;
        Some(histogram)
    }

    /// Folds `b` into `a` and removes `b`.
    ///
    /// # Panics
    ///
    /// If `a == b` or either key is absent.
    pub fn merge_clusters(&mut self, a: ClusterKey, b: ClusterKey) {
        assert_ne!(a, b, "cannot merge a cluster with itself");
        assert!(self.clusters.contains_key(&a), "merge target {a} is missing");
        let absorbed = self
            .clusters
            .remove(&b)
            .unwrap_or_else(|| panic!("merged cluster {b} is missing"));
        self.unindex(b, &absorbed);
        if let Some(target) = self.clusters.get_mut(&a) {
            target.absorb(&absorbed);
            for (word, count) in target.iter() {
                self.index.entry(word).or_default().insert(a, count);
            }
        }
        self.renumber();
        self.structure_changed(a);
        log::debug!("Merged cluster {b} into {a}");
    }

    /// Adds `amount` to `word` in cluster `key`, keeping the index in step.
    ///
    /// Returns `false` if the cluster does not exist.
    pub fn update_cluster(&mut self, key: ClusterKey, word: u32, amount: i64) -> bool {
        let Some(histogram) = self.clusters.get_mut(&key) else {
            return false;
        };
        if amount == 0 {
            return true;
        }
        histogram.add(word, amount);
        let count = histogram.get(word);
        if count == 0 {
            if let Some(entries) = self.index.get_mut(&word) {
                entries.remove(&key);
                if entries.is_empty() {
                    self.index.remove(&word);
                }
            }
        } else {
            self.index.entry(word).or_default().insert(key, count);
        }
        self.structure_changed(key);
        true
    }

    pub fn clear(&mut self) {
        self.clusters.clear();
        self.index.clear();
        self.by_id.clear();
        self.best_clusters.clear();
        self.weights_valid = true;
        self.version += 1;
    }

    /// Switches scoring rules and refreshes every cluster's normalization.
    pub fn set_query_rules(&mut self, rules: QueryRules) {
        if rules == self.rules && self.weights_valid {
            return;
        }
        if rules != self.rules {
            self.rules = rules;
            self.version += 1;
        }
        self.weights_valid = false;
        self.ensure_weights();
    }

    /// Recomputes weighted sums if a mutation left them stale.
    pub fn ensure_weights(&mut self) {
        if self.weights_valid {
            return;
        }
        let rules = self.rules;
        let sums: Vec<(ClusterKey, f64)> = self
            .clusters
            .iter()
            .map(|(k, h)| (*k, self.weighted_sum_of(rules, h)))
            .collect();
        for (key, sum) in sums {
            if let Some(h) = self.clusters.get_mut(&key) {
                h.set_weighted_sum(sum);
            }
        }
        self.weights_valid = true;
    }

    fn weighted_sum_of(&self, rules: QueryRules, histogram: &Histogram) -> f64 {
        if !rules.needs_weighted_sum() {
            return histogram.total() as f64;
        }
        histogram
            .iter()
            .map(|(word, count)| {
                let c = if rules.bin_freq() { 1.0 } else { count as f64 };
                if rules.idf() {
                    c * self.idf(word)
                } else {
                    c
                }
            })
            .sum()
    }

    /// Scores of every cluster sharing a word with `query`, skipping `exclude`.
    pub fn get_scores(
        &mut self,
        query: &Histogram,
        exclude: Option<ClusterKey>,
    ) -> BTreeMap<ClusterKey, f64> {
        self.ensure_weights();
        let rules = self.rules;
        let mut scores: BTreeMap<ClusterKey, f64> = BTreeMap::new();
        for (word, q) in query.iter() {
            let Some(entries) = self.index.get(&word) else {
                continue;
            };
            let idf = if rules.idf() { self.idf(word) } else { 1.0 };
            for (&key, &c) in entries {
                if Some(key) == exclude {
                    continue;
                }
                let weighted_sum = self.clusters.get(&key).map_or(0.0, Histogram::weighted_sum);
                *scores.entry(key).or_insert(0.0) += term_score(rules, q, c, weighted_sum, idf);
            }
        }
        if rules.divides_by_query_total() && query.total() > 0 {
            let total = query.total() as f64;
            for score in scores.values_mut() {
                *score /= total;
            }
        }
        scores
    }

    /// Scores of a member cluster against every other cluster.
    pub fn scores_for(&mut self, key: ClusterKey) -> BTreeMap<ClusterKey, f64> {
        let Some(query) = self.clusters.get(&key).cloned() else {
            return BTreeMap::new();
        };
        self.get_scores(&query, Some(key))
    }

    /// Highest scoring cluster for `query`, the lowest key winning ties.
    pub fn get_best_cluster(&mut self, query: &Histogram) -> Option<(ClusterKey, f64)> {
        let mut best: Option<(ClusterKey, f64)> = None;
        for (key, score) in self.get_scores(query, None) {
            match best {
                Some((_, s)) if score <= s => {}
                _ => best = Some((key, score)),
            }
        }
        best
    }

    /// Caches, per word, the cluster with the highest raw count.
    pub fn compute_best_clusters(&mut self) {
        self.best_clusters = self
            .index
            .iter()
            .filter_map(|(word, entries)| {
                let mut best: Option<(ClusterKey, u32)> = None;
                for (&key, &count) in entries {
                    match best {
                        Some((_, c)) if count <= c => {}
                        _ => best = Some((key, count)),
                    }
                }
                best.map(|(key, _)| (*word, key))
            })
            .collect();
    }

    /// Dense id of the cached best cluster for `word`, or 0.
    pub fn best_cluster(&self, word: u32) -> u32 {
        self.best_clusters
            .get(&word)
            .and_then(|k| self.clusters.get(k))
            .map_or(0, Histogram::id)
    }

    /// Verifies the index, ids and totals against the histograms.
    pub fn check_consistency(&self) -> Result<(), String> {
        for (key, histogram) in &self.clusters {
            let sum: u64 = histogram.iter().map(|(_, c)| c as u64).sum();
            if sum != histogram.total() {
                return Err(format!(
                    "cluster {key}: total {} != bin sum {sum}",
                    histogram.total()
                ));
            }
            for (word, count) in histogram.iter() {
                if count == 0 {
                    return Err(format!("cluster {key}: zero bin for word {word}"));
                }
                let indexed = self.index.get(&word).and_then(|e| e.get(key));
                if indexed != Some(&count) {
                    return Err(format!(
                        "cluster {key}: word {word} count {count}, index has {indexed:?}"
                    ));
                }
            }
            let id = histogram.id();
            if self.key_for_id(id) != Some(*key) {
                return Err(format!("cluster {key}: id {id} does not map back"));
            }
        }
        for (word, entries) in &self.index {
            if entries.is_empty() {
                return Err(format!("word {word}: empty index entry"));
            }
            for (key, count) in entries {
                match self.clusters.get(key) {
                    Some(h) if h.get(*word) == *count => {}
                    _ => {
                        return Err(format!(
                            "word {word}: stale index entry for cluster {key}"
                        ))
                    }
                }
            }
        }
        if self.by_id.len() != self.clusters.len() {
            return Err(format!(
                "{} ids for {} clusters",
                self.by_id.len(),
                self.clusters.len()
            ));
        }
        Ok(())
    }

    fn unindex(&mut self, key: ClusterKey, histogram: &Histogram) {
        for word in histogram.words() {
            if let Some(entries) = self.index.get_mut(&word) {
                entries.remove(&key);
                if entries.is_empty() {
                    self.index.remove(&word);
                }
            }
        }
    }

    fn renumber(&mut self) {
        self.by_id.retain(|k| self.clusters.contains_key(k));
        for (position, key) in self.by_id.iter().enumerate() {
            if let Some(h) = self.clusters.get_mut(key) {
                h.set_id(position as u32 + 1);
            }
        }
    }

    fn structure_changed(&mut self, touched: ClusterKey) {
        if self.rules.needs_weighted_sum() {
            self.weights_valid = false;
        } else if let Some(h) = self.clusters.get_mut(&touched) {
            h.set_weighted_sum(h.total() as f64);
        }
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn collection(rules: QueryRules, clusters: &[&[(u32, u32)]]) -> (ClusterCollection, Vec<ClusterKey>) {
        let mut c = ClusterCollection::new(rules);
        let keys = clusters
            .iter()
            .map(|bins| c.add_cluster(Histogram::from_counts(bins.iter().copied())))
            .collect();
        (c, keys)
    }

    #[test]
    fn test_normalized_score_of_two_clusters() {
        let (mut c, keys) = collection(
            QueryRules::NORMALIZED_FREQ,
            &[&[(1, 3), (2, 1)], &[(1, 1), (2, 3)]],
        );
        let scores = c.scores_for(keys[0]);
        assert_eq!(scores.len(), 1);
        assert_relative_eq!(scores[&keys[1]], 0.375);
    }

    #[test]
    fn test_freq_score_is_dot_product() {
        let (mut c, keys) = collection(QueryRules::FREQ, &[&[(1, 2), (5, 1)], &[(1, 3), (5, 4)]]);
        let scores = c.get_scores(&Histogram::from_counts([(1, 2), (5, 1)]), None);
        assert_relative_eq!(scores[&keys[0]], 5.0);
        assert_relative_eq!(scores[&keys[1]], 10.0);
    }

    #[test]
    fn test_min_and_bin_rules() {
        let (mut c, keys) = collection(QueryRules::MIN_FREQ, &[&[(1, 2), (2, 5)]]);
        let q = Histogram::from_counts([(1, 4), (2, 1)]);
        assert_relative_eq!(c.get_scores(&q, None)[&keys[0]], 3.0);

        c.set_query_rules(QueryRules::BIN_FREQ);
        assert_relative_eq!(c.get_scores(&q, None)[&keys[0]], 2.0);
    }

    #[rstest]
    #[case::normalized(QueryRules::NORMALIZED_FREQ, 0.5)]
    #[case::normalized_min(QueryRules::NORMALIZED_FREQ | QueryRules::MIN_FREQ, 0.75)]
    #[case::normalized_bin(QueryRules::NORMALIZED_FREQ | QueryRules::BIN_FREQ, 1.0)]
    fn test_normalization_divides_combined_term(#[case] rules: QueryRules, #[case] expected: f64) {
        let (mut c, keys) = collection(rules, &[&[(1, 3), (2, 1)]]);
        let q = Histogram::from_counts([(1, 2), (2, 2)]);
        assert_relative_eq!(c.get_scores(&q, None)[&keys[0]], expected);
    }

    #[test]
    fn test_idf_values() {
        let (mut c, _) = collection(QueryRules::IDF, &[&[(1, 1)], &[(1, 1), (2, 1)], &[(3, 1)]]);
        assert_relative_eq!(c.idf(1), (3.0f64 / 2.0).ln());
        assert_relative_eq!(c.idf(2), 3.0f64.ln());
        assert_eq!(c.idf(99), 0.0);

        let single = collection(QueryRules::IDF, &[&[(1, 1)]]).0;
        assert_eq!(single.idf(1), 1.0);
        c.clear();
        assert_eq!(c.idf(1), 0.0);
    }

    #[test]
    fn test_idf_weighted_sum_is_recomputed_lazily() {
        let (mut c, keys) = collection(QueryRules::IDF_NORMALIZED, &[&[(1, 2)], &[(2, 1)]]);
        c.ensure_weights();
        let before = c.get(keys[0]).unwrap().weighted_sum();
        assert_relative_eq!(before, 2.0 * 2.0f64.ln());

        c.add_cluster(Histogram::from_counts([(1, 1)]));
        c.ensure_weights();
        let after = c.get(keys[0]).unwrap().weighted_sum();
        assert_relative_eq!(after, 2.0 * (3.0f64 / 2.0).ln());
    }

    #[test]
    fn test_ids_stay_dense_after_removal() {
        let (mut c, keys) = collection(QueryRules::FREQ, &[&[(1, 1)], &[(2, 1)], &[(3, 1)]]);
        c.remove_cluster(keys[1]).unwrap();
        assert_eq!(c.get(keys[0]).unwrap().id(), 1);
        assert_eq!(c.get(keys[2]).unwrap().id(), 2);
        assert_eq!(c.key_for_id(2), Some(keys[2]));
        assert_eq!(c.key_for_id(3), None);
        assert_eq!(c.key_for_id(0), None);
        assert!(c.index_entries(2).is_none());
        c.check_consistency().unwrap();
    }

    #[test]
    fn test_keys_are_never_reused() {
        let (mut c, keys) = collection(QueryRules::FREQ, &[&[(1, 1)]]);
        c.remove_cluster(keys[0]);
        let fresh = c.add_cluster(Histogram::from_words([1]));
        assert_ne!(fresh, keys[0]);
        assert!(c.get(keys[0]).is_none());
    }

    #[test]
    fn test_merge_sums_bins_and_drops_absorbed() {
        let (mut c, keys) = collection(
            QueryRules::NORMALIZED_FREQ,
            &[&[(1, 2), (2, 1)], &[(2, 4), (7, 1)], &[(7, 3)]],
        );
        let a_before = c.get(keys[0]).unwrap().clone();
        let b_before = c.get(keys[1]).unwrap().clone();
        c.merge_clusters(keys[0], keys[1]);

        let merged = c.get(keys[0]).unwrap();
        for word in [1, 2, 7] {
            assert_eq!(merged.get(word), a_before.get(word) + b_before.get(word));
        }
        assert!(c.get(keys[1]).is_none());
        assert!(c.index_entries(7).unwrap().get(&keys[1]).is_none());
        assert!(c.keys().all(|k| k != keys[1]));
        assert_eq!(c.len(), 2);
        c.check_consistency().unwrap();
    }

    #[test]
    #[should_panic(expected = "cannot merge a cluster with itself")]
    fn test_self_merge_panics() {
        let (mut c, keys) = collection(QueryRules::FREQ, &[&[(1, 1)]]);
        c.merge_clusters(keys[0], keys[0]);
    }

    #[test]
    fn test_update_cluster_keeps_index_exact() {
        let (mut c, keys) = collection(QueryRules::FREQ, &[&[(1, 1)], &[(1, 2)]]);
        assert!(c.update_cluster(keys[0], 4, 3));
        assert_eq!(c.index_entries(4).unwrap()[&keys[0]], 3);
        assert!(c.update_cluster(keys[0], 1, -1));
        assert_eq!(c.clusters_containing(1), 1);
        assert!(c.update_cluster(keys[0], 4, -10));
        assert!(c.index_entries(4).is_none());
        assert!(!c.update_cluster(ClusterKey(999), 1, 1));
        c.check_consistency().unwrap();
    }

    #[rstest]
    #[case::add(0)]
    #[case::remove(1)]
    #[case::merge(2)]
    #[case::update(3)]
    #[case::clear(4)]
    fn test_structural_mutations_bump_version(#[case] op: usize) {
        let (mut c, keys) = collection(QueryRules::FREQ, &[&[(1, 1)], &[(2, 1)]]);
        let before = c.version();
        match op {
            0 => {
                c.add_cluster(Histogram::new());
            }
            1 => {
                c.remove_cluster(keys[0]);
            }
            2 => c.merge_clusters(keys[0], keys[1]),
            3 => {
                c.update_cluster(keys[0], 9, 1);
            }
            _ => c.clear(),
        }
        assert!(c.version() > before);
    }

    #[test]
    fn test_changing_rules_bumps_version_only_when_different() {
        let mut c = ClusterCollection::new(QueryRules::FREQ);
        let v = c.version();
        c.set_query_rules(QueryRules::FREQ);
        assert_eq!(c.version(), v);
        c.set_query_rules(QueryRules::IDF);
        assert_eq!(c.version(), v + 1);
    }

    #[test]
    fn test_best_cluster_prefers_highest_count_then_first() {
        let (mut c, _) = collection(
            QueryRules::FREQ,
            &[&[(1, 2), (2, 1)], &[(1, 5)], &[(2, 1), (3, 1)]],
        );
        c.compute_best_clusters();
        assert_eq!(c.best_cluster(1), 2);
        assert_eq!(c.best_cluster(2), 1);
        assert_eq!(c.best_cluster(3), 3);
        assert_eq!(c.best_cluster(42), 0);
    }

    #[test]
    fn test_get_best_cluster() {
        let (mut c, keys) = collection(QueryRules::FREQ, &[&[(1, 1)], &[(1, 3)], &[(2, 9)]]);
        let best = c.get_best_cluster(&Histogram::from_words([1]));
        assert_eq!(best, Some((keys[1], 3.0)));
        assert_eq!(c.get_best_cluster(&Histogram::from_words([5])), None);
    }

    #[test]
    fn test_random_mutations_keep_index_consistent() {
        let mut c = ClusterCollection::new(QueryRules::IDF_NORMALIZED);
        let mut keys = Vec::new();
        for step in 0..200u32 {
            match step % 5 {
                0 | 1 => keys.push(c.add_cluster(Histogram::from_words(
                    (0..step % 7 + 1).map(|i| (i * step) % 11),
                ))),
                2 if keys.len() > 2 => {
                    let b = keys.remove(step as usize % keys.len());
                    let a = keys[0];
                    c.merge_clusters(a, b);
                }
                3 if !keys.is_empty() => {
                    let k = keys[step as usize % keys.len()];
                    c.update_cluster(k, step % 11, if step % 2 == 0 { 2 } else { -1 });
                }
                4 if keys.len() > 3 => {
                    let k = keys.remove(0);
                    c.remove_cluster(k);
                }
                _ => {}
            }
            c.check_consistency().unwrap();
        }
    }
}
