pub mod manager;
pub mod types;

pub use manager::AdHocRunManager;
pub use types::*;
