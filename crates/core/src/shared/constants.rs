/// First byte of every node record in a binary tree file.
pub const TREE_NODE_CHECK: u8 = 0xAB;

/// Marks the start of a new cluster in a binary cluster file.
pub const CLUSTER_SENTINEL: u32 = 0xFFFF_FFFF;

pub const DEFAULT_NB_BRANCHES: usize = 4;
pub const DEFAULT_DESCRIPTOR_SIZE: usize = 256;
pub const DEFAULT_MAX_LEVEL: usize = 8;
pub const DEFAULT_MIN_ELEM: usize = 1000;
pub const KMEANS_ITERATIONS: usize = 32;

/// Thread budget for parallel subtree splitting.
pub const MAX_BUILD_THREADS: usize = 8;
/// Threads reserved each time a split forks its children.
pub const BUILD_THREAD_STEP: usize = 3;

/// Similarity above which `cluster-ids` merges two clusters.
pub const DEFAULT_REDUCE_THRESHOLD: f64 = 0.7;

/// Results within this ratio of the best one name a track's cluster.
pub const TRACK_QUERY_RATIO: f64 = 0.98;
/// Track results within this ratio feed object correspondences.
pub const CORRESPONDENCE_RATIO: f64 = 0.7;

pub const DEFAULT_BUCKET_BITS: u32 = 4;
pub const DEFAULT_MAX_MOTION: f32 = 32.0;
pub const DEFAULT_HISTORY_DEPTH: usize = 100;

pub const CLUSTERS_TABLE: &str = "clusters";
pub const TREE_NODES_TABLE: &str = "tree_nodes";
pub const TREE_STRUCTURE_TABLE: &str = "tree_structure";
pub const IMAGES_TABLE: &str = "images";
pub const OBJECTS_TABLE: &str = "objects";
pub const KEYPOINTS_TABLE: &str = "keypoints";
pub const ANNOTATIONS_TABLE: &str = "annotations";

pub const DEFAULT_DESCRIPTOR_FILE: &str = "descriptors.dat";
pub const DEFAULT_STORE_FILE: &str = "visual.json";
