use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};

use vistrack_core::pipeline::build_tree_use_case::{BuildTreeUseCase, TreeSource, TreeTarget};
use vistrack_core::pipeline::cluster_ids_use_case::{ClusterIdsOptions, ClusterIdsUseCase};
use vistrack_core::quantization::tree_builder::TreeBuildParams;
use vistrack_core::shared::constants::{
    DEFAULT_DESCRIPTOR_FILE, DEFAULT_DESCRIPTOR_SIZE, DEFAULT_MAX_LEVEL, DEFAULT_MIN_ELEM,
    DEFAULT_NB_BRANCHES, DEFAULT_REDUCE_THRESHOLD, DEFAULT_STORE_FILE,
};

/// Vocabulary tree and visual word cluster tools.
#[derive(Parser, Debug)]
#[command(name = "vistrack")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a quantization tree on descriptors, or convert a tree file.
    BuildTree(BuildTreeArgs),
    /// Turn descriptors and cluster sources into merged visual word clusters.
    ClusterIds(ClusterIdsArgs),
}

#[derive(Args, Debug)]
struct BuildTreeArgs {
    /// Descriptor file to train on.
    #[arg(long, default_value = DEFAULT_DESCRIPTOR_FILE)]
    descriptors: PathBuf,

    /// Write the tree to this binary file instead of the store.
    #[arg(long)]
    tree: Option<PathBuf>,

    /// Load this binary tree instead of training one.
    #[arg(long)]
    convert: Option<PathBuf>,

    /// Table store receiving the tree tables.
    #[arg(long, default_value = DEFAULT_STORE_FILE)]
    db: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MAX_LEVEL)]
    max_level: usize,

    /// Nodes with at most this many descriptors become leaves.
    #[arg(long, default_value_t = DEFAULT_MIN_ELEM)]
    min_elem: usize,

    /// Read at most this many descriptors (0 = all).
    #[arg(long, default_value_t = 0)]
    limit: usize,

    #[arg(long, default_value_t = DEFAULT_NB_BRANCHES)]
    branches: usize,

    #[arg(long, default_value_t = DEFAULT_DESCRIPTOR_SIZE)]
    descriptor_size: usize,
}

#[derive(Args, Debug)]
struct ClusterIdsArgs {
    /// Descriptor file; a negative pointer starts a new cluster (repeatable).
    #[arg(long)]
    descriptors: Vec<PathBuf>,

    /// Binary cluster file (repeatable).
    #[arg(long)]
    clusters: Vec<PathBuf>,

    /// Table store holding a clusters table (repeatable).
    #[arg(long)]
    cluster_db: Vec<PathBuf>,

    /// Binary tree file. Without it the tree is read from --db.
    #[arg(long)]
    tree: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_STORE_FILE)]
    db: PathBuf,

    /// Merge threshold (negative = convert only).
    #[arg(long, default_value_t = DEFAULT_REDUCE_THRESHOLD, allow_negative_numbers = true)]
    threshold: f64,

    /// Write clusters to this binary file instead of --db.
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_NB_BRANCHES)]
    branches: usize,

    #[arg(long, default_value_t = DEFAULT_DESCRIPTOR_SIZE)]
    descriptor_size: usize,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(-1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {
        Command::BuildTree(args) => run_build_tree(args),
        Command::ClusterIds(args) => run_cluster_ids(args),
    }
}

fn run_build_tree(args: BuildTreeArgs) -> Result<(), Box<dyn std::error::Error>> {
    validate_tree_shape(args.branches, args.descriptor_size)?;
    let (use_case, source, target) = build_tree_plan(args);
    let tree = use_case.execute(&source, &target)?;
    log::info!("Tree has {} leaves, depth {}", tree.leaf_count(), tree.depth());
    Ok(())
}

fn build_tree_plan(args: BuildTreeArgs) -> (BuildTreeUseCase, TreeSource, TreeTarget) {
    let params = TreeBuildParams {
        nb_branches: args.branches,
        max_level: args.max_level,
        min_elem: args.min_elem,
        limit: (args.limit > 0).then_some(args.limit),
        ..TreeBuildParams::default()
    };
    let source = match args.convert {
        Some(path) => TreeSource::Convert(path),
        None => TreeSource::Descriptors(args.descriptors),
    };
    let target = match args.tree {
        Some(path) => TreeTarget::File(path),
        None => TreeTarget::Store(args.db),
    };
    (BuildTreeUseCase::new(params, args.descriptor_size), source, target)
}

fn run_cluster_ids(args: ClusterIdsArgs) -> Result<(), Box<dyn std::error::Error>> {
    validate_tree_shape(args.branches, args.descriptor_size)?;
    if args.threshold > 1.0 {
        return Err(format!("Threshold must be at most 1.0, got {}", args.threshold).into());
    }
    let report = ClusterIdsUseCase::new(cluster_ids_options(args)).execute()?;
    log::info!("Saved {} of {} clusters", report.saved, report.loaded);
    Ok(())
}

fn cluster_ids_options(args: ClusterIdsArgs) -> ClusterIdsOptions {
    ClusterIdsOptions {
        descriptors: args.descriptors,
        cluster_files: args.clusters,
        cluster_stores: args.cluster_db,
        tree: args.tree,
        db: args.db,
        threshold: args.threshold,
        output: args.output,
        nb_branches: args.branches,
        descriptor_size: args.descriptor_size,
    }
}

fn validate_tree_shape(branches: usize, descriptor_size: usize) -> Result<(), Box<dyn std::error::Error>> {
    if branches < 2 {
        return Err(format!("Branches must be at least 2, got {branches}").into());
    }
    if descriptor_size == 0 {
        return Err("Descriptor size must be positive".into());
    }
    Ok(())
}
