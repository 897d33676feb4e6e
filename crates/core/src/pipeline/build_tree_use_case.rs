use std::path::PathBuf;

use crate::quantization::kmeans_tree::QuantizationTree;
use crate::quantization::tree_builder::{build_tree_from_file, TreeBuildParams};
use crate::quantization::tree_file::{load_tree, save_tree};
use crate::quantization::tree_tables::save_tree_tables;
use crate::storage::infrastructure::json_table_store::JsonTableStore;

/// Where the tree comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum TreeSource {
    /// Train a new tree on a descriptor file.
    Descriptors(PathBuf),
    /// Load an existing binary tree file.
    Convert(PathBuf),
}

/// Where the tree goes.
#[derive(Clone, Debug, PartialEq)]
pub enum TreeTarget {
    File(PathBuf),
    /// Tree tables of the table store at this path.
    Store(PathBuf),
}

/// Trains or converts a quantization tree and saves it.
pub struct BuildTreeUseCase {
    params: TreeBuildParams,
    descriptor_size: usize,
}

impl BuildTreeUseCase {
    pub fn new(params: TreeBuildParams, descriptor_size: usize) -> Self {
        Self {
            params,
            descriptor_size,
        }
    }

    pub fn execute(
        &self,
        source: &TreeSource,
        target: &TreeTarget,
    ) -> Result<QuantizationTree, Box<dyn std::error::Error>> {
        let tree = match source {
            TreeSource::Descriptors(path) => {
                build_tree_from_file(path, self.descriptor_size, &self.params)?
            }
            TreeSource::Convert(path) => {
                load_tree(path, self.params.nb_branches, self.descriptor_size)?
            }
        };

        match target {
            TreeTarget::File(path) => {
                save_tree(&tree, path)?;
                log::info!("Saved {} leaves to {}", tree.leaf_count(), path.display());
            }
            TreeTarget::Store(path) => {
                let mut store = JsonTableStore::open(path)?;
                save_tree_tables(&tree, &mut store)?;
                log::info!("Saved {} leaves to store {}", tree.leaf_count(), path.display());
            }
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::tree_tables::load_tree_tables;
    use crate::shared::descriptor_file::{save_descriptor_file, DescriptorRecord};
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;
    use std::path::Path;

    const D: usize = 4;

    /// Three well separated blobs of 40 descriptors each.
    fn write_blobs(path: &Path) {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let records: Vec<DescriptorRecord> = (0..120)
            .map(|i| {
                let centre = (i % 3) as f32 * 100.0;
                let d = (0..D).map(|_| centre + rng.gen_range(-1.0..1.0)).collect();
                DescriptorRecord::new(i as i64, d)
            })
            .collect();
        save_descriptor_file(path, D, &records).unwrap();
    }

    fn params() -> TreeBuildParams {
        TreeBuildParams {
            nb_branches: 3,
            max_level: 1,
            min_elem: 5,
            ..TreeBuildParams::default()
        }
    }

    #[test]
    fn test_build_and_save_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let descriptors = dir.path().join("descriptors.dat");
        let out = dir.path().join("tree.bin");
        write_blobs(&descriptors);

        let tree = BuildTreeUseCase::new(params(), D)
            .execute(&TreeSource::Descriptors(descriptors), &TreeTarget::File(out.clone()))
            .unwrap();
        assert_eq!(tree.leaf_count(), 3);

        let loaded = load_tree(&out, 3, D).unwrap();
        assert_eq!(loaded.leaf_count(), 3);
        for centre in [0.0, 100.0, 200.0] {
            let probe = vec![centre; D];
            assert_eq!(loaded.get_id(&probe), tree.get_id(&probe));
        }
    }

    #[test]
    fn test_convert_file_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let descriptors = dir.path().join("descriptors.dat");
        let file = dir.path().join("tree.bin");
        let db = dir.path().join("visual.json");
        write_blobs(&descriptors);

        let use_case = BuildTreeUseCase::new(params(), D);
        let built = use_case
            .execute(&TreeSource::Descriptors(descriptors), &TreeTarget::File(file.clone()))
            .unwrap();
        use_case
            .execute(&TreeSource::Convert(file), &TreeTarget::Store(db.clone()))
            .unwrap();

        let store = JsonTableStore::open(&db).unwrap();
        let loaded = load_tree_tables(&store, 3, D).unwrap();
        assert_eq!(loaded.leaf_count(), built.leaf_count());
        assert_eq!(loaded.get_id(&[200.0; D]), built.get_id(&[200.0; D]));
    }

    #[test]
    fn test_missing_descriptor_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = BuildTreeUseCase::new(params(), D).execute(
            &TreeSource::Descriptors(dir.path().join("absent.dat")),
            &TreeTarget::File(dir.path().join("tree.bin")),
        );
        assert!(result.is_err());
        assert!(!dir.path().join("tree.bin").exists());
    }
}
