pub mod buffer_pool;
pub mod skip_list;
