use std::sync::atomic::{AtomicBool, Ordering};

use crate::retrieval::cluster_collection::ClusterCollection;
use crate::retrieval::distance_matrix::DistanceMatrix;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReductionSummary {
    pub initial: usize,
    pub merges: usize,
    pub remaining: usize,
    pub cancelled: bool,
}

impl ClusterCollection {
    /// Greedily merges the most similar pair until no pair scores above
    /// `threshold`.
    pub fn reduce(&mut self, threshold: f64) -> ReductionSummary {
        self.reduce_with_cancel(threshold, &AtomicBool::new(false))
    }

    /// Like [`reduce`](Self::reduce), stopping early once `cancel` is set.
    /// The flag is checked before each merge.
    pub fn reduce_with_cancel(&mut self, threshold: f64, cancel: &AtomicBool) -> ReductionSummary {
        let initial = self.len();
        let mut matrix = DistanceMatrix::new();

        let keys: Vec<_> = self.keys().collect();
        for &a in &keys {
            for (b, score) in self.scores_for(a) {
                if a < b && score > threshold {
                    matrix.insert(a, b, score);
                }
            }
        }
        log::debug!(
            "Reduction starts with {initial} clusters and {} candidate pairs",
            matrix.len()
        );

        let mut merges = 0;
        let mut cancelled = false;
        while let Some((score, a, b)) = matrix.best() {
            if score < threshold {
                break;
            }
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }
            matrix.remove_cluster(a);
            matrix.remove_cluster(b);
            self.merge_clusters(a, b);
            merges += 1;
            log::debug!("Merged {b} into {a} at similarity {score:.4}");

            for (other, s) in self.scores_for(a) {
                if s > threshold {
                    matrix.insert(a, other, s);
                }
            }
        }

        let summary = ReductionSummary {
            initial,
            merges,
            remaining: self.len(),
            cancelled,
        };
        log::info!(
            "Reduced {} clusters to {} with {} merges{}",
            summary.initial,
            summary.remaining,
            summary.merges,
            if cancelled { " (cancelled)" } else { "" }
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::cluster_collection::ClusterKey;
    use crate::retrieval::histogram::Histogram;
    use crate::retrieval::query_rules::QueryRules;

    fn three_clusters() -> (ClusterCollection, Vec<ClusterKey>) {
        let mut c = ClusterCollection::new(QueryRules::NORMALIZED_FREQ);
        let keys = vec![
            c.add_cluster(Histogram::from_counts([(1, 1)])),
            c.add_cluster(Histogram::from_counts([(1, 1), (2, 1)])),
            c.add_cluster(Histogram::from_counts([(2, 1), (3, 9)])),
        ];
        (c, keys)
    }

    #[test]
    fn test_reduce_merges_only_similar_pair() {
        let (mut c, keys) = three_clusters();
        let summary = c.reduce(0.3);

        assert_eq!(
            summary,
            ReductionSummary {
                initial: 3,
                merges: 1,
                remaining: 2,
                cancelled: false
            }
        );
        let merged = c.get(keys[0]).unwrap();
        assert_eq!(merged, &Histogram::from_counts([(1, 2), (2, 1)]));
        assert!(c.get(keys[1]).is_none());
        assert!(c.get(keys[2]).is_some());
        assert_eq!(c.get(keys[2]).unwrap().id(), 2);
        c.check_consistency().unwrap();
    }

    #[test]
    fn test_high_threshold_merges_nothing() {
        let (mut c, _) = three_clusters();
        let summary = c.reduce(0.9);
        assert_eq!(summary.merges, 0);
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn test_low_threshold_chains_merges() {
        let (mut c, keys) = three_clusters();
        let summary = c.reduce(0.0);
        assert_eq!(summary.remaining, 1);
        assert_eq!(c.get(keys[0]).unwrap().total(), 13);
    }

    #[test]
    fn test_cancel_stops_before_first_merge() {
        let (mut c, _) = three_clusters();
        let summary = c.reduce_with_cancel(0.3, &AtomicBool::new(true));
        assert!(summary.cancelled);
        assert_eq!(summary.merges, 0);
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn test_reduce_bumps_version_and_keeps_ids_dense() {
        let mut c = ClusterCollection::new(QueryRules::NORMALIZED_FREQ);
        for i in 0..6u32 {
            c.add_cluster(Histogram::from_counts([(i / 2, 3), (100 + i, 1)]));
        }
        let v = c.version();
        let summary = c.reduce(0.5);
        assert_eq!(summary.merges, 3);
        assert!(c.version() > v);
        let ids: Vec<u32> = c.iter().map(|(_, h)| h.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
