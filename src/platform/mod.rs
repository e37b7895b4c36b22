// Platform integration: file helpers, the certificate store and the OS task scheduler

pub mod common;
pub mod tasks;
pub mod trust_store;
