pub mod file_lock;
pub mod file_system;
