//! cinder-state: run ledger persistence for cinder
//!
//! Every pipeline run is recorded as an append-only stream of events plus a
//! terminal summary. The ledger is what `cinder runs show` and the gate audit
//! read back.
//!
//! ## Key Components
//!
//! - `RunLedger`: backend-agnostic async trait
//! - `MemoryRunLedger`: in-memory fake for tests
//! - `FsRunLedger`: one JSON document per run under a directory
//! - `ContentDigest`: SHA-256 identity for run specs and artifacts

mod error;
pub mod fakes;
pub mod fs_ledger;
pub mod storage_traits;

pub use error::StorageError;
pub use fakes::MemoryRunLedger;
pub use fs_ledger::FsRunLedger;
pub use storage_traits::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary,
    StorageResult,
};
