use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StageState {
    Initialized = 0,
    Setup = 1,
    Started = 2,
    Paused = 3,
    MaintenanceRequested = 4,
    Canceled = 5,
    Shutdown = 6,
    Finalized = 7,
    Destroying = 8,
}

impl StageState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => StageState::Initialized,
            1 => StageState::Setup,
            2 => StageState::Started,
            3 => StageState::Paused,
            4 => StageState::MaintenanceRequested,
            5 => StageState::Canceled,
            6 => StageState::Shutdown,
            7 => StageState::Finalized,
            _ => StageState::Destroying,
        }
    }

    /// Workers are alive in this state
    pub fn is_running(self) -> bool {
        matches!(
            self,
            StageState::Started | StageState::Paused | StageState::MaintenanceRequested
        )
    }

    /// All workers have been joined and the run cycle is over
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            StageState::Canceled | StageState::Shutdown | StageState::Finalized
        )
    }

    /// `start` is legal from this state
    pub fn can_start(self) -> bool {
        matches!(
            self,
            StageState::Initialized
                | StageState::Setup
                | StageState::Finalized
                | StageState::Shutdown
                | StageState::Canceled
        )
    }
}

/// How urgently a stage should stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownGrace {
    /// Force every worker off its loop now
    RightNow,
    /// Let workers finish in-flight work and stop at their next checkpoint
    Gracefully,
}

/// Stage state readable without the stage lock.
///
/// Only written while the stage's main lock is held.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: StageState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> StageState {
        StageState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: StageState) {
        self.0.store(state as u8, Ordering::Release);
    }
}
