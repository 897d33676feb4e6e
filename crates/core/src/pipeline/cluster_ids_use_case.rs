use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::quantization::kmeans_tree::QuantizationTree;
use crate::quantization::tree_file::load_tree;
use crate::quantization::tree_tables::load_tree_tables;
use crate::retrieval::cluster_collection::ClusterCollection;
use crate::retrieval::cluster_file::{load_clusters, save_clusters};
use crate::retrieval::cluster_tables::{load_cluster_table, save_cluster_table};
use crate::retrieval::histogram::Histogram;
use crate::retrieval::query_rules::QueryRules;
use crate::retrieval::reduction::ReductionSummary;
use crate::shared::constants::{
    DEFAULT_DESCRIPTOR_SIZE, DEFAULT_NB_BRANCHES, DEFAULT_REDUCE_THRESHOLD, DEFAULT_STORE_FILE,
};
use crate::shared::descriptor_file::{DescriptorFileError, DescriptorReader};
use crate::storage::infrastructure::json_table_store::JsonTableStore;

#[derive(Clone, Debug, PartialEq)]
pub struct ClusterIdsOptions {
    /// Descriptor files; a negative pointer starts a new cluster.
    pub descriptors: Vec<PathBuf>,
    pub cluster_files: Vec<PathBuf>,
    /// Table stores to read cluster tables from.
    pub cluster_stores: Vec<PathBuf>,
    /// Binary tree file. Without it the tree is read from `db`.
    pub tree: Option<PathBuf>,
    pub db: PathBuf,
    /// Merge threshold; negative values skip the reduction.
    pub threshold: f64,
    /// Binary cluster file to write. Without it clusters go to `db`.
    pub output: Option<PathBuf>,
    pub nb_branches: usize,
    pub descriptor_size: usize,
}

impl Default for ClusterIdsOptions {
    fn default() -> Self {
        Self {
            descriptors: Vec::new(),
            cluster_files: Vec::new(),
            cluster_stores: Vec::new(),
            tree: None,
            db: PathBuf::from(DEFAULT_STORE_FILE),
            threshold: DEFAULT_REDUCE_THRESHOLD,
            output: None,
            nb_branches: DEFAULT_NB_BRANCHES,
            descriptor_size: DEFAULT_DESCRIPTOR_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClusterIdsReport {
    pub loaded: usize,
    pub reduction: Option<ReductionSummary>,
    pub saved: usize,
}

/// Appends one cluster per run of descriptors to `clusters`. Each
/// descriptor contributes its visual word; a record with a negative
/// pointer closes the current cluster. Returns the number of clusters added.
///
/// Nothing is added unless the whole file reads cleanly.
pub fn clusters_from_descriptors<R: Read>(
    clusters: &mut ClusterCollection,
    reader: DescriptorReader<R>,
    tree: &QuantizationTree,
) -> Result<usize, DescriptorFileError> {
    let mut runs = Vec::new();
    let mut current = Histogram::new();
    for record in reader {
        let record = record?;
        if record.starts_cluster() && current.total() > 0 {
            runs.push(std::mem::take(&mut current));
        }
        current.add(tree.get_id(&record.descriptor), 1);
    }
    if current.total() > 0 {
        runs.push(current);
    }
    let added = runs.len();
    for histogram in runs {
        clusters.add_cluster(histogram);
    }
    Ok(added)
}

/// Collects clusters from descriptor files, cluster files and cluster
/// tables, merges similar ones and saves the result.
pub struct ClusterIdsUseCase {
    options: ClusterIdsOptions,
    cancelled: Arc<AtomicBool>,
}

impl ClusterIdsUseCase {
    pub fn new(options: ClusterIdsOptions) -> Self {
        Self {
            options,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the reduction before its next merge.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn load_tree(&self) -> Result<QuantizationTree, Box<dyn std::error::Error>> {
        let o = &self.options;
        let tree = match &o.tree {
            Some(path) => load_tree(path, o.nb_branches, o.descriptor_size)?,
            None => {
                let store = JsonTableStore::open(&o.db)?;
                load_tree_tables(&store, o.nb_branches, o.descriptor_size)?
            }
        };
        Ok(tree)
    }

    /// Loads every source. Unreadable sources are reported and skipped.
    fn load_sources(&self, clusters: &mut ClusterCollection) -> Result<(), Box<dyn std::error::Error>> {
        let o = &self.options;
        if !o.descriptors.is_empty() {
            let tree = self.load_tree()?;
            for path in &o.descriptors {
                let loaded = DescriptorReader::open(path, o.descriptor_size)
                    .and_then(|reader| clusters_from_descriptors(clusters, reader, &tree));
                report_source(path, loaded.map_err(Into::into));
            }
        }
        for path in &o.cluster_files {
            report_source(path, load_clusters(clusters, path).map_err(Into::into));
        }
        for path in &o.cluster_stores {
            let loaded: Result<usize, Box<dyn std::error::Error>> = match JsonTableStore::open(path) {
                Ok(store) => load_cluster_table(clusters, &store).map_err(Into::into),
                Err(e) => Err(e.into()),
            };
            report_source(path, loaded);
        }
        Ok(())
    }

    pub fn execute(&self) -> Result<ClusterIdsReport, Box<dyn std::error::Error>> {
        let o = &self.options;
        let mut clusters = ClusterCollection::new(QueryRules::NORMALIZED_FREQ);
        self.load_sources(&mut clusters)?;

        let loaded = clusters.len();
        if loaded == 0 {
            return Err("Nothing loaded".into());
        }
        log::info!("{loaded} clusters loaded");

        let reduction = (o.threshold >= 0.0).then(|| {
            let summary = clusters.reduce_with_cancel(o.threshold, &self.cancelled);
            log::info!(
                "Reduced {} clusters to {} with {} merges",
                summary.initial,
                summary.remaining,
                summary.merges
            );
            summary
        });

        match &o.output {
            Some(path) => {
                save_clusters(&clusters, path)?;
            }
            None => {
                let mut store = JsonTableStore::open(&o.db)?;
                save_cluster_table(&clusters, &mut store)?;
            }
        }
        Ok(ClusterIdsReport {
            loaded,
            reduction,
            saved: clusters.len(),
        })
    }
}

fn report_source(path: &Path, loaded: Result<usize, Box<dyn std::error::Error>>) {
    match loaded {
        Ok(n) => log::info!("{}: loaded {n} clusters", path.display()),
        Err(e) => log::warn!("{}: loading failed: {e}", path.display()),
    }
}
