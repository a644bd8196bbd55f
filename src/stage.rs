use crate::error::Result;
use crate::state::ShutdownGrace;

/// Behavior hooks of a pipeline stage.
///
/// The implementing type carries whatever state the stage shares across
/// its workers (input queues, the resolved downstream stage, counters).
/// Every hook runs with `&self`, possibly on several worker threads at
/// once; cross-worker mutation needs its own synchronization unless it
/// happens inside a maintenance function.
///
/// Hooks must never call `pause` or `schedule_maintenance` on their own
/// stage: no worker would be left to reach the barrier.
///
/// # Optional hooks need their flag
///
/// The worker loop is chosen from [`Stage::HAS_FETCH`] and
/// [`Stage::HAS_THROW`], not from which methods are overridden. An
/// overridden `fetch` or `throw` whose flag is left `false` is never
/// called:
///
/// ```ignore
/// impl Stage for Parser {
///     type Event = Line;
///     const HAS_FETCH: bool = true; // without this, `fetch` below is dead
///
///     fn fetch(&self, worker: usize, buf: &mut Vec<Line>, max: usize) -> Result<usize> {
///         self.input.fetch_hinted(worker, buf, max)
///     }
///     // ...
/// }
/// ```
pub trait Stage: Send + Sync + Sized + 'static {
    /// Event type carried in the per-worker batch buffer
    type Event: Send + 'static;

    /// Must be `true` for [`Stage::fetch`] to run at all
    const HAS_FETCH: bool = false;

    /// Must be `true` for [`Stage::throw`] to run at all
    const HAS_THROW: bool = false;

    /// Take events submitted to this stage, draining the accepted ones from `events`.
    ///
    /// Returns how many were accepted.
    fn schedule(&self, events: &mut Vec<Self::Event>, hint: usize) -> Result<usize>;

    /// Process a batch on worker `worker`.
    ///
    /// With a fetch hook `events` holds what was fetched; without one it is
    /// empty and the hook may fill it. Returns how many events were dealt;
    /// only the first that many are thrown. An error ends this worker's loop.
    fn process(&self, worker: usize, events: &mut Vec<Self::Event>) -> Result<usize>;

    /// Fill `buf` with up to `max` events. `Ok(0)` means no work yet; an
    /// error ends this worker's loop.
    ///
    /// Only called when [`Stage::HAS_FETCH`] is `true`. Overriding this
    /// method without setting the flag has no effect.
    fn fetch(&self, _worker: usize, _buf: &mut Vec<Self::Event>, _max: usize) -> Result<usize> {
        Ok(0)
    }

    /// Pass dealt events downstream. An error ends this worker's loop.
    ///
    /// Only called when [`Stage::HAS_THROW`] is `true`. Overriding this
    /// method without setting the flag has no effect.
    fn throw(&self, _worker: usize, events: &mut Vec<Self::Event>) -> Result<usize> {
        Ok(events.len())
    }

    /// Runs once on the Initialized -> Setup transition
    fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Wakes workers blocked inside `fetch` so they can notice a pause
    fn pre_pause(&self) {}

    /// Runs once per run cycle after all workers have exited, right after `finalize`
    fn on_shutdown(&self, _grace: ShutdownGrace) -> Result<()> {
        Ok(())
    }

    /// Runs once per run cycle after all workers have exited
    fn finalize(&self, _canceled: bool) {}

    /// Releases hook-owned resources when the stage is destroyed
    fn freeup(&self) {}
}

/// Worker loop variant, picked once from the hooks a stage implements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLoop {
    FetchMainThrow,
    FetchMain,
    MainThrow,
    MainOnly,
}

impl WorkerLoop {
    /// Select the loop for a hook type
    pub fn for_stage<S: Stage>() -> Self {
        match (S::HAS_FETCH, S::HAS_THROW) {
            (true, true) => WorkerLoop::FetchMainThrow,
            (true, false) => WorkerLoop::FetchMain,
            (false, true) => WorkerLoop::MainThrow,
            (false, false) => WorkerLoop::MainOnly,
        }
    }
}
