//! Drives the lifecycle of an ordered chain of stages.
//!
//! Stages are kept upstream first. Setup and start run downstream first so
//! that every stage's consumer is ready before it can throw; shutdown, pause
//! and destroy run upstream first so producers stop before their consumers.

use crate::engine::StageControl;
use crate::error::{PipelineError, Result};
use crate::registry;
use crate::state::{ShutdownGrace, StageState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// An ordered chain of registered stages
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn StageControl>>,
}

impl Pipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pipeline from registered stage names, upstream first
    pub fn from_names<I, N>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        let mut pipeline = Self::new();
        for name in names {
            pipeline.stages.push(registry::find_control(name.as_ref())?);
        }
        Ok(pipeline)
    }

    /// Append a stage downstream of the current last one
    pub fn add_stage(mut self, stage: Arc<dyn StageControl>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage at `index`, counted from upstream
    pub fn stage(&self, index: usize) -> Option<&Arc<dyn StageControl>> {
        self.stages.get(index)
    }

    fn ensure_stages(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidArgs("pipeline has no stages".into()));
        }
        Ok(())
    }

    /// Set up every stage still in `Initialized`, downstream first
    pub fn setup_all(&self) -> Result<()> {
        self.ensure_stages()?;
        for stage in self.stages.iter().rev() {
            if stage.state() == StageState::Initialized {
                stage.setup()?;
            }
        }
        Ok(())
    }

    /// Start every stage, downstream first.
    ///
    /// If one fails, the stages already started are canceled and waited
    /// for before the error is returned.
    pub fn start_all(&self) -> Result<()> {
        self.ensure_stages()?;
        let mut started: Vec<&Arc<dyn StageControl>> = Vec::with_capacity(self.stages.len());
        for stage in self.stages.iter().rev() {
            if let Err(e) = stage.start() {
                warn!(stage = %stage.name(), error = %e, "start failed, rolling back pipeline");
                for done in started.iter().rev() {
                    let _ = done.cancel();
                    let _ = done.wait(None);
                }
                return Err(e);
            }
            started.push(stage);
        }
        info!(stages = self.stages.len(), "pipeline started");
        Ok(())
    }

    /// Pause every stage, upstream first
    pub fn pause_all(&self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_stages()?;
        for stage in &self.stages {
            stage.pause(timeout)?;
        }
        Ok(())
    }

    /// Resume every stage, downstream first
    pub fn resume_all(&self) -> Result<()> {
        self.ensure_stages()?;
        for stage in self.stages.iter().rev() {
            stage.resume()?;
        }
        Ok(())
    }

    /// Shut every running stage down, upstream first
    pub fn shutdown_all(&self, grace: ShutdownGrace) -> Result<()> {
        self.ensure_stages()?;
        for stage in &self.stages {
            if stage.state().is_running() {
                stage.shutdown(grace)?;
            }
        }
        Ok(())
    }

    /// Wait for every running stage, upstream first.
    ///
    /// `timeout` applies to each stage separately. The first error is
    /// returned after all stages have been waited for.
    pub fn wait_all(&self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_stages()?;
        let mut first_err = None;
        for stage in &self.stages {
            if let Err(e) = stage.wait(timeout) {
                warn!(stage = %stage.name(), error = %e, "wait failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Destroy every stage, upstream first. Keeps going past failures.
    pub fn destroy_all(self) -> Result<()> {
        self.ensure_stages()?;
        let mut first_err = None;
        for stage in &self.stages {
            if let Err(e) = stage.destroy() {
                warn!(stage = %stage.name(), error = %e, "destroy failed");
                first_err.get_or_insert(e);
            }
        }
        info!(stages = self.stages.len(), "pipeline destroyed");
        first_err.map_or(Ok(()), Err)
    }

    /// Name and state of every stage, upstream first
    pub fn states(&self) -> Vec<(String, StageState)> {
        self.stages
            .iter()
            .map(|s| (s.name().to_string(), s.state()))
            .collect()
    }

    /// Get a summary of all metrics
    pub fn metrics_summary(&self) -> String {
        let mut summary = String::from("Pipeline Metrics Summary:\n");
        for stage in &self.stages {
            let snapshot = stage.metrics().snapshot();
            summary.push_str(&format!("  {}: {}\n", stage.name(), snapshot.format()));
        }
        summary
    }
}
