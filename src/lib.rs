pub mod app;
pub mod cli;
pub mod domains;
pub mod errors;
pub mod infrastructure;
pub mod shared;

pub use app::App;
pub use errors::{CoreError, CoreResult};
