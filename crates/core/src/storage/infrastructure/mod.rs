pub mod json_table_store;
pub mod memory_table_store;
