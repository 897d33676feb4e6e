use std::collections::BTreeMap;

use thiserror::Error;

use crate::retrieval::cluster_collection::ClusterCollection;
use crate::retrieval::histogram::Histogram;
use crate::shared::constants::CLUSTERS_TABLE;
use crate::storage::domain::table_store::{StoreError, TableStore, Value};

#[derive(Error, Debug)]
pub enum ClusterTableError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("table {} is missing", CLUSTERS_TABLE)]
    MissingTable,
    #[error("malformed cluster row {0}")]
    MalformedRow(i64),
    #[error("cluster {cluster} has a non-positive count for word {word}")]
    BadCount { cluster: u32, word: u32 },
}

const COLUMNS: [&str; 2] = ["cid_val", "cnt"];

fn pack(cluster: u32, word: u32) -> i64 {
    ((cluster as u64) << 32 | word as u64) as i64
}

fn unpack(key: i64) -> (u32, u32) {
    let key = key as u64;
    ((key >> 32) as u32, key as u32)
}

/// Rewrites the cluster table with one row per `(cluster, word)` bin.
pub fn save_cluster_table(
    clusters: &ClusterCollection,
    store: &mut dyn TableStore,
) -> Result<usize, ClusterTableError> {
    store.begin()?;
    match write_rows(clusters, store) {
        Ok(rows) => {
            store.commit()?;
            log::info!("Saved {} clusters ({rows} bins) to table store", clusters.len());
            Ok(rows)
        }
        Err(e) => {
            store.rollback()?;
            Err(e)
        }
    }
}

fn write_rows(
    clusters: &ClusterCollection,
    store: &mut dyn TableStore,
) -> Result<usize, ClusterTableError> {
    store.ensure_table(CLUSTERS_TABLE, &COLUMNS)?;
    store.clear_table(CLUSTERS_TABLE)?;
    let mut rows = 0;
    for (_, histogram) in clusters.iter() {
        for (word, count) in histogram.iter() {
            store.insert(
                CLUSTERS_TABLE,
                vec![Value::Integer(pack(histogram.id(), word)), count.into()],
            )?;
            rows += 1;
        }
    }
    Ok(rows)
}

/// Appends the clusters stored in `store` to `clusters`, in index order.
pub fn load_cluster_table(
    clusters: &mut ClusterCollection,
    store: &dyn TableStore,
) -> Result<usize, ClusterTableError> {
    if !store.has_table(CLUSTERS_TABLE) {
        return Err(ClusterTableError::MissingTable);
    }
    let mut parsed: BTreeMap<u32, Histogram> = BTreeMap::new();
    for (rowid, row) in store.rows(CLUSTERS_TABLE)? {
        let key = row
            .first()
            .and_then(Value::as_integer)
            .ok_or(ClusterTableError::MalformedRow(rowid))?;
        let count = row
            .get(1)
            .and_then(Value::as_integer)
            .ok_or(ClusterTableError::MalformedRow(rowid))?;
        let (cluster, word) = unpack(key);
        if cluster == 0 {
            continue;
        }
        if count <= 0 {
            return Err(ClusterTableError::BadCount { cluster, word });
        }
        parsed.entry(cluster).or_default().add(word, count);
    }

    let loaded = parsed.len();
    for (_, histogram) in parsed {
        clusters.add_cluster(histogram);
    }
    log::info!("Loaded {loaded} clusters from table store");
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::query_rules::QueryRules;
    use crate::storage::infrastructure::memory_table_store::MemoryTableStore;

    fn sample() -> ClusterCollection {
        let mut c = ClusterCollection::new(QueryRules::NORMALIZED_FREQ);
        c.add_cluster(Histogram::from_counts([(1, 3), (2, 1)]));
        c.add_cluster(Histogram::from_counts([(1, 1), (2, 3)]));
        c.add_cluster(Histogram::from_counts([(u32::MAX - 1, 2)]));
        c
    }

    #[test]
    fn test_key_packing() {
        assert_eq!(pack(1, 5), (1i64 << 32) | 5);
        assert_eq!(unpack(pack(7, u32::MAX - 1)), (7, u32::MAX - 1));
    }

    #[test]
    fn test_round_trip() {
        let original = sample();
        let mut store = MemoryTableStore::new();
        assert_eq!(save_cluster_table(&original, &mut store).unwrap(), 5);

        let mut loaded = ClusterCollection::new(QueryRules::NORMALIZED_FREQ);
        assert_eq!(load_cluster_table(&mut loaded, &store).unwrap(), 3);
        let a: Vec<_> = original.iter().map(|(_, h)| h.clone()).collect();
        let b: Vec<_> = loaded.iter().map(|(_, h)| h.clone()).collect();
        assert_eq!(a, b);
        let key = loaded.key_for_id(1).unwrap();
        let other = loaded.key_for_id(2).unwrap();
        approx::assert_relative_eq!(loaded.scores_for(key)[&other], 0.375);
    }

    #[test]
    fn test_save_replaces_previous_rows() {
        let mut store = MemoryTableStore::new();
        save_cluster_table(&sample(), &mut store).unwrap();
        let mut small = ClusterCollection::default();
        small.add_cluster(Histogram::from_words([4]));
        save_cluster_table(&small, &mut store).unwrap();
        assert_eq!(store.row_count(CLUSTERS_TABLE).unwrap(), 1);
    }

    #[test]
    fn test_missing_table_fails() {
        let store = MemoryTableStore::new();
        let mut c = ClusterCollection::default();
        assert!(matches!(
            load_cluster_table(&mut c, &store),
            Err(ClusterTableError::MissingTable)
        ));
    }

    #[test]
    fn test_index_zero_is_skipped_and_bad_counts_fail() {
        let mut store = MemoryTableStore::new();
        store.ensure_table(CLUSTERS_TABLE, &COLUMNS).unwrap();
        store.insert(CLUSTERS_TABLE, vec![pack(0, 3).into(), 1i64.into()]).unwrap();
        store.insert(CLUSTERS_TABLE, vec![pack(2, 3).into(), 2i64.into()]).unwrap();
        let mut c = ClusterCollection::default();
        assert_eq!(load_cluster_table(&mut c, &store).unwrap(), 1);

        store.insert(CLUSTERS_TABLE, vec![pack(2, 4).into(), 0i64.into()]).unwrap();
        let mut d = ClusterCollection::default();
        assert!(matches!(
            load_cluster_table(&mut d, &store),
            Err(ClusterTableError::BadCount { cluster: 2, word: 4 })
        ));
        assert!(d.is_empty());
    }
}
