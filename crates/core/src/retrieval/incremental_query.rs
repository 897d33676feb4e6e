//! Live query histogram with running scores against a [`ClusterCollection`].
//!
//! Each single-word edit updates the scores of the clusters holding that
//! word by the difference between the word's new and old contribution, so
//! the running scores always equal what [`ClusterCollection::get_scores`]
//! would compute from scratch for the current query.
//!
//! A query is not tied to one collection by a borrow. It remembers the
//! collection's instance and version at its last sync and replays its
//! whole histogram whenever either differs.

use std::collections::BTreeMap;

use crate::retrieval::cluster_collection::{term_score, ClusterCollection, ClusterKey};
use crate::retrieval::histogram::Histogram;
use crate::retrieval::query_rules::QueryRules;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueryResult {
    pub key: ClusterKey,
    /// Dense id of the cluster at the time the results were sorted.
    pub id: u32,
    pub score: f64,
}

#[derive(Clone, Debug, Default)]
pub struct IncrementalQuery {
    query: Histogram,
    scores: BTreeMap<ClusterKey, f64>,
    shared_words: BTreeMap<ClusterKey, u32>,
    binding: Option<(u64, u64)>,
    results: Vec<QueryResult>,
    replays: usize,
}

impl IncrementalQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(&self) -> &Histogram {
        &self.query
    }

    /// Running scores before read-time normalization.
    pub fn raw_scores(&self) -> &BTreeMap<ClusterKey, f64> {
        &self.scores
    }

    /// Results of the last sort.
    pub fn results(&self) -> &[QueryResult] {
        &self.results
    }

    /// Number of full replays so far.
    pub fn replays(&self) -> usize {
        self.replays
    }

    pub fn is_synced_with(&self, db: &ClusterCollection) -> bool {
        self.binding == Some((db.instance(), db.version()))
    }

    /// Empties the query histogram and its scores.
    pub fn clear(&mut self) {
        self.query.clear();
        self.scores.clear();
        self.shared_words.clear();
        self.results.clear();
    }

    /// Clears the query and switches the collection's scoring rules.
    pub fn set_query_rules(&mut self, db: &mut ClusterCollection, rules: QueryRules) {
        self.clear();
        db.set_query_rules(rules);
        self.binding = Some((db.instance(), db.version()));
    }

    /// Adds `amount` (possibly negative) occurrences of `word` to the query.
    pub fn modify(&mut self, db: &mut ClusterCollection, word: u32, amount: i64) {
        self.sync(db);
        self.apply(db, word, amount);
    }

    /// Brings the query to `target`, editing only the words that differ.
    ///
    /// Falls back to a full replay when the collection changed since the
    /// last sync, or when the number of differing words reaches the
    /// number of distinct words in `target`.
    pub fn set(&mut self, db: &mut ClusterCollection, target: &Histogram) {
        if !self.is_synced_with(db) {
            self.replay_from(db, target);
            return;
        }

        let mut edits: Vec<(u32, i64)> = Vec::new();
        for (word, count) in target.iter() {
            let delta = count as i64 - self.query.get(word) as i64;
            if delta != 0 {
                edits.push((word, delta));
            }
        }
        for (word, count) in self.query.iter() {
            if !target.contains(word) {
                edits.push((word, -(count as i64)));
            }
        }

        let modifs = edits.len();
        if modifs > 0 && modifs >= target.len() {
            self.replay_from(db, target);
            return;
        }
        for (word, delta) in edits {
            self.apply(db, word, delta);
        }
    }

    /// Top `max_results` clusters by descending score.
    pub fn sort_results(&mut self, db: &mut ClusterCollection, max_results: usize) -> &[QueryResult] {
        self.sync(db);
        self.results = self.collect_results(db);
        self.results.truncate(max_results);
        &self.results
    }

    /// Every cluster scoring strictly above `ratio` times the best score.
    pub fn sort_results_min_ratio(&mut self, db: &mut ClusterCollection, ratio: f64) -> &[QueryResult] {
        self.sync(db);
        let mut results = self.collect_results(db);
        if let Some(best) = results.first().map(|r| r.score) {
            let floor = best * ratio;
            results.retain(|r| r.score > floor);
        }
        self.results = results;
        &self.results
    }

    pub fn get_best(&mut self, db: &mut ClusterCollection) -> Option<QueryResult> {
        self.sort_results(db, 1).first().copied()
    }

    /// Normalized scores, keyed like [`ClusterCollection::get_scores`].
    pub fn scores(&mut self, db: &mut ClusterCollection) -> BTreeMap<ClusterKey, f64> {
        self.sync(db);
        let divisor = self.divisor(db.rules());
        self.scores.iter().map(|(k, s)| (*k, s / divisor)).collect()
    }

    fn divisor(&self, rules: QueryRules) -> f64 {
        if rules.divides_by_query_total() && self.query.total() > 0 {
            self.query.total() as f64
        } else {
            1.0
        }
    }

    fn collect_results(&self, db: &ClusterCollection) -> Vec<QueryResult> {
        let divisor = self.divisor(db.rules());
        let mut results: Vec<QueryResult> = self
            .scores
            .iter()
            .filter_map(|(key, score)| {
                db.get(*key).map(|h| QueryResult {
                    key: *key,
                    id: h.id(),
                    score: score / divisor,
                })
            })
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.key.cmp(&b.key)));
        results
    }

    fn sync(&mut self, db: &mut ClusterCollection) {
        if !self.is_synced_with(db) {
            let current = std::mem::take(&mut self.query);
            self.replay_from(db, &current);
        }
    }

    fn replay_from(&mut self, db: &mut ClusterCollection, target: &Histogram) {
        self.clear();
        db.ensure_weights();
        self.binding = Some((db.instance(), db.version()));
        self.replays += 1;
        for (word, count) in target.iter() {
            self.apply(db, word, count as i64);
        }
    }

    fn apply(&mut self, db: &mut ClusterCollection, word: u32, amount: i64) {
        let old = self.query.get(word);
        if self.query.add(word, amount) == 0 {
            return;
        }
        let new = self.query.get(word);
        self.results.clear();

        db.ensure_weights();
        let db: &ClusterCollection = db;
        let Some(entries) = db.index_entries(word) else {
            return;
        };
        let rules = db.rules();
        let idf = if rules.idf() { db.idf(word) } else { 1.0 };
        for (&key, &count) in entries {
            let weighted_sum = db.get(key).map_or(0.0, Histogram::weighted_sum);
            let delta = term_score(rules, new, count, weighted_sum, idf)
                - term_score(rules, old, count, weighted_sum, idf);
            if old == 0 {
                *self.shared_words.entry(key).or_insert(0) += 1;
                *self.scores.entry(key).or_insert(0.0) += delta;
            } else if new == 0 {
                let shared = self.shared_words.entry(key).or_insert(1);
                *shared -= 1;
                if *shared == 0 {
                    self.shared_words.remove(&key);
                    self.scores.remove(&key);
                } else {
                    *self.scores.entry(key).or_insert(0.0) += delta;
                }
            } else {
                *self.scores.entry(key).or_insert(0.0) += delta;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn database(rules: QueryRules) -> ClusterCollection {
        let mut db = ClusterCollection::new(rules);
        db.add_cluster(Histogram::from_counts([(1, 3), (2, 1)]));
        db.add_cluster(Histogram::from_counts([(1, 1), (2, 3), (4, 2)]));
        db.add_cluster(Histogram::from_counts([(3, 5)]));
        db.add_cluster(Histogram::from_counts([(2, 1), (3, 1), (4, 1), (5, 7)]));
        db
    }

    fn assert_matches_batch(query: &mut IncrementalQuery, db: &mut ClusterCollection) {
        let incremental = query.scores(db);
        let snapshot = query.query().clone();
        let batch = db.get_scores(&snapshot, None);
        assert_eq!(
            incremental.keys().collect::<Vec<_>>(),
            batch.keys().collect::<Vec<_>>()
        );
        for (key, score) in &batch {
            assert_relative_eq!(incremental[key], *score, epsilon = 1e-9, max_relative = 1e-9);
        }
    }

    #[rstest]
    #[case::freq(QueryRules::FREQ)]
    #[case::normalized(QueryRules::NORMALIZED_FREQ)]
    #[case::idf(QueryRules::IDF)]
    #[case::idf_normalized(QueryRules::IDF_NORMALIZED)]
    #[case::min(QueryRules::MIN_FREQ)]
    #[case::bin(QueryRules::BIN_FREQ)]
    #[case::normalized_min(QueryRules::NORMALIZED_FREQ | QueryRules::MIN_FREQ)]
    #[case::normalized_bin_idf(QueryRules::NORMALIZED_FREQ | QueryRules::BIN_FREQ | QueryRules::IDF)]
    fn test_incremental_equals_batch(#[case] rules: QueryRules) {
        let mut db = database(rules);
        let mut q = IncrementalQuery::new();
        let edits: [(u32, i64); 9] = [
            (1, 2),
            (2, 1),
            (9, 4),
            (4, 3),
            (1, -1),
            (3, 2),
            (4, -3),
            (2, -5),
            (5, 1),
        ];
        for (word, amount) in edits {
            q.modify(&mut db, word, amount);
            assert_matches_batch(&mut q, &mut db);
        }
    }

    #[test]
    fn test_every_flag_combination_matches_batch() {
        for rules in QueryRules::all_combinations() {
            let mut db = database(rules);
            let mut q = IncrementalQuery::new();
            for (word, amount) in [(1, 1), (2, 2), (3, 1), (1, -1), (4, 2)] {
                q.modify(&mut db, word, amount);
            }
            assert_matches_batch(&mut q, &mut db);
        }
    }

    #[test]
    fn test_scores_drop_when_no_word_is_shared() {
        let mut db = database(QueryRules::NORMALIZED_FREQ);
        let mut q = IncrementalQuery::new();
        q.modify(&mut db, 3, 1);
        assert_eq!(q.raw_scores().len(), 2);
        q.modify(&mut db, 3, -1);
        assert!(q.raw_scores().is_empty());
        assert!(q.sort_results(&mut db, 5).is_empty());
    }

    #[test]
    fn test_unknown_word_is_a_no_op_on_scores() {
        let mut db = database(QueryRules::FREQ);
        let mut q = IncrementalQuery::new();
        q.modify(&mut db, 77, 3);
        assert!(q.raw_scores().is_empty());
        assert_eq!(q.query().get(77), 3);
    }

    #[test]
    fn test_normalized_best_result() {
        let mut db = ClusterCollection::new(QueryRules::NORMALIZED_FREQ);
        let a = db.add_cluster(Histogram::from_counts([(1, 3), (2, 1)]));
        let b = db.add_cluster(Histogram::from_counts([(1, 1), (2, 3)]));
        let mut q = IncrementalQuery::new();
        q.set(&mut db, &Histogram::from_counts([(1, 3), (2, 1)]));

        let best = q.get_best(&mut db).unwrap();
        assert_eq!(best.key, a);
        assert_eq!(best.id, 1);
        assert_relative_eq!(best.score, 0.625);
        let all = q.sort_results(&mut db, 10).to_vec();
        assert_eq!(all[1].key, b);
        assert_relative_eq!(all[1].score, 0.375);
    }

    #[test]
    fn test_min_ratio_keeps_results_close_to_best() {
        let mut db = ClusterCollection::new(QueryRules::FREQ);
        let a = db.add_cluster(Histogram::from_counts([(1, 10)]));
        let b = db.add_cluster(Histogram::from_counts([(1, 9)]));
        db.add_cluster(Histogram::from_counts([(1, 5)]));
        let mut q = IncrementalQuery::new();
        q.modify(&mut db, 1, 1);

        let keys: Vec<_> = q
            .sort_results_min_ratio(&mut db, 0.8)
            .iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec![a, b]);
    }

    #[test]
    fn test_ties_sort_by_key() {
        let mut db = ClusterCollection::new(QueryRules::FREQ);
        let a = db.add_cluster(Histogram::from_counts([(1, 2)]));
        let b = db.add_cluster(Histogram::from_counts([(1, 2)]));
        let mut q = IncrementalQuery::new();
        q.modify(&mut db, 1, 1);
        let keys: Vec<_> = q.sort_results(&mut db, 2).iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![a, b]);
    }

    #[test]
    fn test_set_applies_minimal_edits_when_in_sync() {
        let mut db = database(QueryRules::IDF_NORMALIZED);
        let mut q = IncrementalQuery::new();
        q.set(&mut db, &Histogram::from_counts([(1, 2), (2, 1), (3, 1), (4, 1)]));
        let replays = q.replays();

        q.set(&mut db, &Histogram::from_counts([(1, 2), (2, 1), (3, 1), (5, 1)]));
        assert_eq!(q.replays(), replays);
        assert_eq!(q.query(), &Histogram::from_counts([(1, 2), (2, 1), (3, 1), (5, 1)]));
        assert_matches_batch(&mut q, &mut db);
    }

    #[test]
    fn test_set_replays_when_most_words_change() {
        let mut db = database(QueryRules::NORMALIZED_FREQ);
        let mut q = IncrementalQuery::new();
        q.set(&mut db, &Histogram::from_counts([(1, 1), (2, 1)]));
        let replays = q.replays();
        q.set(&mut db, &Histogram::from_counts([(3, 1), (4, 1)]));
        assert_eq!(q.replays(), replays + 1);
        assert_matches_batch(&mut q, &mut db);
    }

    #[test]
    fn test_collection_change_triggers_resync() {
        let mut db = database(QueryRules::NORMALIZED_FREQ);
        let mut q = IncrementalQuery::new();
        q.set(&mut db, &Histogram::from_counts([(1, 1), (3, 2)]));
        let fresh = db.add_cluster(Histogram::from_counts([(3, 1)]));
        assert!(!q.is_synced_with(&db));

        let keys: Vec<_> = q.sort_results(&mut db, 10).iter().map(|r| r.key).collect();
        assert!(keys.contains(&fresh));
        assert!(q.is_synced_with(&db));
        assert_matches_batch(&mut q, &mut db);
    }

    #[test]
    fn test_query_moves_between_collections() {
        let mut first = database(QueryRules::FREQ);
        let mut second = ClusterCollection::new(QueryRules::FREQ);
        let only = second.add_cluster(Histogram::from_counts([(1, 1)]));
        let mut q = IncrementalQuery::new();
        q.modify(&mut first, 1, 1);
        let best = q.get_best(&mut second).unwrap();
        assert_eq!(best.key, only);
    }

    #[test]
    fn test_set_query_rules_clears_query() {
        let mut db = database(QueryRules::FREQ);
        let mut q = IncrementalQuery::new();
        q.modify(&mut db, 1, 1);
        q.set_query_rules(&mut db, QueryRules::IDF);
        assert!(q.query().is_empty());
        assert_eq!(db.rules(), QueryRules::IDF);
        assert!(q.is_synced_with(&db));
    }
}
