pub mod cluster_collection;
pub mod cluster_file;
pub mod cluster_tables;
pub mod distance_matrix;
pub mod histogram;
pub mod incremental_query;
pub mod query_rules;
pub mod reduction;
pub mod visual_database;
