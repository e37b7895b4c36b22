pub mod agent;
pub mod cleanup;
pub mod utils;

pub use agent::SetupRequest;
pub use cleanup::run_cleanup;
