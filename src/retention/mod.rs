// Retention registry
//
// Tracks every certificate the agent installed together with the retention
// policy it arrived with. The registry is sealed at rest and tolerates the
// flat thumbprint list written by older agents.

mod entry;
mod store;

pub use entry::{InstalledThumbprintEntry, RetentionMode, canonical_thumbprint};
pub use store::{RetentionStore, Upserted};
