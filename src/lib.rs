pub mod builds;
pub mod config;
pub mod errors;
