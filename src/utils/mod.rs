pub mod id;
pub mod rollback;
pub mod tracing;
