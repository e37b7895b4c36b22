// Agent module for CertHub job processing
//
// The agent authenticates with the CertHub API, polls for certificate install
// jobs, imports delivered PFX bundles into the per-user store, and removes
// agent-installed certificates once their retention lapses.

pub mod api;
pub mod cleanup;
mod daemon;
mod installer;
mod jobs;
mod report;
mod scheduler;
pub mod session;
mod state;

pub use api::AgentApi;
pub use cleanup::{CleanupMode, CleanupResult, report_cleanup};
pub use daemon::{AgentController, AgentServices};
pub use session::AuthSession;
