pub mod sequential_tracking_executor;
pub mod threaded_tracking_executor;
