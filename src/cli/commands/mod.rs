//! CLI command implementations

pub mod clean;
pub mod config;
pub mod fetch;
pub mod reclaim;
pub mod status;

pub use clean::execute as clean;
pub use config::execute as config;
pub use fetch::execute as fetch;
pub use reclaim::execute as reclaim;
pub use status::execute as status;
