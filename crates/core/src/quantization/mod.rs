pub mod kmeans_tree;
pub mod tree_builder;
pub mod tree_file;
pub mod tree_tables;
