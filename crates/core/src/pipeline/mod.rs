pub mod build_tree_use_case;
pub mod cluster_ids_use_case;
pub mod infrastructure;
pub mod pipeline_logger;
pub mod tracking_executor;
