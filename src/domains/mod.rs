pub mod environments;
pub mod git;
pub mod merge;
pub mod runs;
pub mod sessions;
pub mod settings;
