pub mod bucket_grid;
pub mod track_store;
