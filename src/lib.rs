//! A concurrent pipeline-stage engine.
//!
//! Each stage runs a fixed pool of OS worker threads over user-supplied
//! hooks (fetch, process, throw) and exposes a lifecycle state machine:
//! setup, start, pause/resume, maintenance, shutdown, cancel, wait and
//! destroy. Stages find each other by name through a process-wide registry
//! and are chained into a [`Pipeline`].
//!
//! # Features
//!
//! - One worker loop variant per stage, picked from the hooks it implements
//! - Stop-the-world pause and single-shot maintenance functions
//! - Graceful or immediate shutdown with per-cycle exit accounting
//! - Bounded input queues on crossbeam's ArrayQueue with schedule policies
//! - Per-stage metrics: hook calls, events dealt, latency percentiles
//!
//! # Example
//!
//! ```ignore
//! use pipeline_stage::{PipelineStage, ShutdownGrace, StageBuilder};
//!
//! let config = StageBuilder::new("parser").workers(4).build()?;
//! let stage = PipelineStage::create(config, ParserHooks::new())?;
//! stage.setup()?;
//! stage.start()?;
//!
//! stage.submit(&mut batch, 0)?;
//! stage.pause(None)?;
//! stage.resume()?;
//!
//! stage.shutdown(ShutdownGrace::Gracefully)?;
//! stage.wait(None)?;
//! stage.destroy()?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub(crate) mod gate;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod schedule;
pub mod stage;
pub mod state;
pub(crate) mod worker;

// Re-exports for convenience
pub use config::{StageBuilder, StageConfig};
pub use engine::{ExitCounts, PipelineStage, PostStartHook, StageControl};
pub use error::{PipelineError, Result};
pub use gate::MaintenanceFn;
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use pipeline::Pipeline;
pub use queue::{EventQueue, OverflowPolicy};
pub use registry::StageId;
pub use schedule::{QueueSet, SchedulePolicy};
pub use stage::{Stage, WorkerLoop};
pub use state::{ShutdownGrace, StageState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
