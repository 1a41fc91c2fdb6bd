mod base;

pub use base::{ExecutionEvent, ExecutionId};
