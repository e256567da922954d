pub mod lock;
pub mod service;
pub mod types;

pub use lock::KeyedLocks;
pub use service::{MergeService, SquashRequest};
pub use types::{GitOperationResult, MergeState};
