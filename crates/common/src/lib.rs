//! Shared identifiers for the saga orchestration workspace.

mod types;

pub use types::InstanceId;
