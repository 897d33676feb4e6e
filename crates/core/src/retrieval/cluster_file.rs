//! Plain binary cluster file: for each cluster a `0xFFFFFFFF` sentinel
//! followed by `(word, count)` pairs, all little-endian `u32`.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::retrieval::cluster_collection::ClusterCollection;
use crate::retrieval::histogram::Histogram;
use crate::shared::constants::CLUSTER_SENTINEL;

#[derive(Error, Debug)]
pub enum ClusterFileError {
    #[error("failed to open cluster file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cluster file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("cluster data does not start with a sentinel")]
    MissingSentinel,
    #[error("cluster {cluster} has a zero count for word {word}")]
    ZeroCount { cluster: usize, word: u32 },
    #[error("cluster {cluster} is empty")]
    EmptyCluster { cluster: usize },
    #[error("cluster data ends inside a record")]
    Truncated,
}

pub fn write_clusters<W: Write>(
    clusters: &ClusterCollection,
    writer: &mut W,
) -> Result<usize, ClusterFileError> {
    let mut written = 0;
    for (key, histogram) in clusters.iter() {
        if histogram.is_empty() {
            log::warn!("Skipping empty cluster {key} on save");
            continue;
        }
        writer.write_all(&CLUSTER_SENTINEL.to_le_bytes())?;
        for (word, count) in histogram.iter() {
            writer.write_all(&word.to_le_bytes())?;
            writer.write_all(&count.to_le_bytes())?;
        }
        written += 1;
    }
    Ok(written)
}

pub fn save_clusters(clusters: &ClusterCollection, path: &Path) -> Result<usize, ClusterFileError> {
    let file = File::create(path).map_err(|source| ClusterFileError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    let written = write_clusters(clusters, &mut writer)?;
    writer.flush()?;
    log::info!("Saved {written} clusters to {}", path.display());
    Ok(written)
}

/// Parses every cluster in `reader` and appends them to `clusters`.
///
/// Nothing is added unless the whole stream parses.
pub fn read_clusters<R: Read>(
    clusters: &mut ClusterCollection,
    reader: &mut R,
) -> Result<usize, ClusterFileError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    if bytes.len() % 4 != 0 {
        return Err(ClusterFileError::Truncated);
    }
    let mut words = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));

    let mut parsed: Vec<Histogram> = Vec::new();
    let mut current: Option<Histogram> = None;
    while let Some(value) = words.next() {
        if value == CLUSTER_SENTINEL {
            if let Some(done) = current.take() {
                if done.is_empty() {
                    return Err(ClusterFileError::EmptyCluster {
                        cluster: parsed.len(),
                    });
                }
                parsed.push(done);
            }
            current = Some(Histogram::new());
            continue;
        }
        let histogram = current.as_mut().ok_or(ClusterFileError::MissingSentinel)?;
        let count = words.next().ok_or(ClusterFileError::Truncated)?;
        if count == 0 {
            return Err(ClusterFileError::ZeroCount {
                cluster: parsed.len(),
                word: value,
            });
        }
        histogram.add(value, count as i64);
    }
    if let Some(done) = current {
        if done.is_empty() {
            return Err(ClusterFileError::EmptyCluster {
                cluster: parsed.len(),
            });
        }
        parsed.push(done);
    }

    let loaded = parsed.len();
    for histogram in parsed {
        clusters.add_cluster(histogram);
    }
    Ok(loaded)
}

pub fn load_clusters(clusters: &mut ClusterCollection, path: &Path) -> Result<usize, ClusterFileError> {
    let file = File::open(path).map_err(|source| ClusterFileError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let loaded = read_clusters(clusters, &mut BufReader::new(file))?;
    log::info!("Loaded {loaded} clusters from {}", path.display());
    Ok(loaded)
}
