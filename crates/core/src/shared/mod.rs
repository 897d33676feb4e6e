pub mod constants;
pub mod descriptor_file;
pub mod frame;
pub mod settings;
