pub mod checkpoint;
pub mod summary;
