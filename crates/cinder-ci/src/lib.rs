//! cinder CI - fail-fast build/test/coverage pipeline
//!
//! Provides a pipeline runner that:
//! - Gates runs on a single branch and the push / pull_request events
//! - Provisions a single-use environment and checks out the commit
//! - Executes the fixed stage sequence, halting at the first fatal failure
//! - Uploads the coverage report and records every transition in a ledger

pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod gate;
pub mod pipeline;
pub mod plan;
pub mod runner;
pub mod secret;
pub mod spec;
pub mod stage;
pub mod telemetry;
pub mod trigger;
pub mod upload;

// Re-export key types
pub use config::CinderConfig;
pub use environment::{Environment, EnvironmentSpec, Workspace};
pub use error::{CiError, Result};
pub use events::StageEvent;
pub use gate::{CiGate, GateVerdict};
pub use pipeline::{CiPipeline, PipelineOutcome, PipelineResult};
pub use plan::StagePlan;
pub use runner::{Artifact, CiRunner, StageResult};
pub use secret::Secret;
pub use spec::RunSpec;
pub use stage::{BuiltinStage, FailureKind, FailurePolicy, StageAction, StageConfig};
pub use telemetry::init_tracing;
pub use trigger::{TriggerEvent, TriggerFilter, TriggerKind};
pub use upload::{CodecovUploader, CoverageUploader, UploadError, UploadReceipt, UploadRequest};
