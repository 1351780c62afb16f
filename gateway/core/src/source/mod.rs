//! Source registry: identities, the differencer and per-source runtime state.

pub mod context;
pub mod diff;
pub mod identity;

pub use context::SourceRuntimeContext;
pub use diff::{diff, identities, Diff};
pub use identity::{hash, is_newer_time_id, mint_time_id, source_id, SourceIdentity};
