//! cartcheck common library
//!
//! Shared data model and the durable pieces of a verification run: the
//! result ledger, the worklist builder, the backoff policy and the subject
//! source loader.

pub mod backoff;
pub mod config;
pub mod csv;
pub mod error;
pub mod ledger;
pub mod subjects;
pub mod types;
pub mod worklist;

// Re-export commonly used types
pub use backoff::BackoffPolicy;
pub use config::RunConfig;
pub use error::{Error, Result};
pub use ledger::{CompactionStats, Ledger, Tally};
pub use types::*;

/// cartcheck version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
