//! The stage engine: lifecycle state machine, worker management and the
//! per-stage API surface.
//!
//! Lock order is main (`control`) -> finalize (`exits`) -> gate. Workers
//! never take the main lock; an exiting worker takes the gate lock and then,
//! separately, the finalize lock. Callers of `pause` and
//! `schedule_maintenance` hold the main lock for the whole request, so
//! control operations on one stage are serialized.

use crate::config::StageConfig;
use crate::error::{PipelineError, Result};
use crate::gate::{PauseGate, REWAKE_INTERVAL};
use crate::metrics::StageMetrics;
use crate::queue::deadline;
use crate::registry::{self, StageId};
use crate::stage::{Stage, WorkerLoop};
use crate::state::{ShutdownGrace, StageState, StateCell};
use crate::worker::{affinity, Worker, WorkerSlot};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Runs in the caller's thread right after `start` has spawned every worker
pub type PostStartHook<S> = Arc<dyn Fn(&S) -> Result<()> + Send + Sync>;

/// How the workers of the last run cycle ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitCounts {
    pub shutdown: usize,
    pub canceled: usize,
}

impl ExitCounts {
    pub fn total(&self) -> usize {
        self.shutdown + self.canceled
    }
}

struct Control {
    handles: Vec<JoinHandle<()>>,
    grace: ShutdownGrace,
    cycle_open: bool,
    freed: bool,
}

/// A pipeline stage: `S` supplies the behavior, the engine runs N workers over it
pub struct PipelineStage<S: Stage> {
    id: StageId,
    name: String,
    n_workers: usize,
    max_batch: usize,
    strategy: WorkerLoop,
    self_ref: Weak<Self>,
    pub(crate) hooks: S,
    state: StateCell,
    control: Mutex<Control>,
    post_start: Mutex<Option<PostStartHook<S>>>,
    exits: Mutex<ExitCounts>,
    exited: Condvar,
    pub(crate) gate: PauseGate<S>,
    pub(crate) do_loop: AtomicBool,
    pub(crate) cancel: AtomicBool,
    pub(crate) graceful: AtomicBool,
    pub(crate) workers: Vec<WorkerSlot<S::Event>>,
    pub(crate) metrics: StageMetrics,
}

impl<S: Stage> PipelineStage<S> {
    /// Create and register a stage.
    ///
    /// Fails with `InvalidArgs` on an empty name, zero sizes or a zero-sized
    /// event type, and with `AlreadyExists` if the name is taken.
    pub fn create(config: StageConfig, hooks: S) -> Result<Arc<Self>> {
        config.validate()?;
        if std::mem::size_of::<S::Event>() == 0 {
            return Err(PipelineError::InvalidArgs("event type has zero size".into()));
        }

        let stage = Arc::new_cyclic(|self_ref| Self {
            id: StageId::next(),
            name: config.name.clone(),
            n_workers: config.workers,
            max_batch: config.max_batch,
            strategy: WorkerLoop::for_stage::<S>(),
            self_ref: self_ref.clone(),
            hooks,
            state: StateCell::new(StageState::Initialized),
            control: Mutex::new(Control {
                handles: Vec::new(),
                grace: ShutdownGrace::Gracefully,
                cycle_open: false,
                freed: false,
            }),
            post_start: Mutex::new(None),
            exits: Mutex::new(ExitCounts::default()),
            exited: Condvar::new(),
            gate: PauseGate::new(),
            do_loop: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            graceful: AtomicBool::new(false),
            workers: (0..config.workers)
                .map(|_| WorkerSlot::new(config.max_batch))
                .collect(),
            metrics: StageMetrics::new(),
        });

        registry::register(Arc::clone(&stage))?;
        info!(
            stage = %stage.name,
            id = %stage.id,
            workers = stage.n_workers,
            max_batch = stage.max_batch,
            worker_loop = ?stage.strategy,
            "stage created"
        );
        Ok(stage)
    }

    fn ensure_registered(&self) -> Result<()> {
        if registry::contains(self.id) {
            Ok(())
        } else {
            Err(PipelineError::InvalidObject)
        }
    }

    /// Run the setup hook once (Initialized -> Setup)
    pub fn setup(&self) -> Result<()> {
        self.ensure_registered()?;
        let _control = self.control.lock();
        let state = self.state.get();
        if state != StageState::Initialized {
            return Err(PipelineError::transition(state, "setup"));
        }
        self.hooks.setup()?;
        self.state.set(StageState::Setup);
        info!(stage = %self.name, "stage set up");
        Ok(())
    }

    /// Install a hook run right after `start` spawns the workers
    pub fn set_post_start_hook<F>(&self, hook: F) -> Result<()>
    where
        F: Fn(&S) -> Result<()> + Send + Sync + 'static,
    {
        self.ensure_registered()?;
        let _control = self.control.lock();
        let state = self.state.get();
        if state.is_running() || state == StageState::Destroying {
            return Err(PipelineError::transition(state, "set the post-start hook of"));
        }
        *self.post_start.lock() = Some(Arc::new(hook));
        Ok(())
    }

    /// Spawn the workers.
    ///
    /// If any worker fails to spawn, the ones already running are cancelled
    /// and joined, the exit counters are rolled back and the stage is left
    /// in `Finalized`.
    pub fn start(&self) -> Result<()> {
        self.ensure_registered()?;
        let this = self.self_ref.upgrade().ok_or(PipelineError::InvalidObject)?;
        let mut control = self.control.lock();
        let state = self.state.get();
        if !state.can_start() {
            return Err(PipelineError::transition(state, "start"));
        }

        self.arm_cycle();
        control.grace = ShutdownGrace::Gracefully;

        let mut handles = Vec::with_capacity(self.n_workers);
        for index in 0..self.n_workers {
            match self.spawn_worker(&this, index) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(stage = %self.name, worker = index, error = %e, "failed to spawn worker");
                    self.roll_back_start(handles);
                    return Err(PipelineError::Os(e));
                }
            }
        }

        control.handles = handles;
        control.cycle_open = true;
        self.state.set(StageState::Started);
        info!(stage = %self.name, workers = self.n_workers, "stage started");

        let post_start = self.post_start.lock().clone();
        drop(control);
        if let Some(hook) = post_start {
            hook(&self.hooks)?;
        }
        Ok(())
    }

    fn arm_cycle(&self) {
        self.cancel.store(false, Ordering::Release);
        self.graceful.store(false, Ordering::Release);
        self.do_loop.store(true, Ordering::Release);
        *self.exits.lock() = ExitCounts::default();
        self.gate.reset(self.n_workers);
    }

    fn spawn_worker(&self, this: &Arc<Self>, index: usize) -> std::io::Result<JoinHandle<()>> {
        let worker = Worker::new(Arc::clone(this), index);
        thread::Builder::new()
            .name(format!("{}-{}", self.name, index))
            .spawn(move || worker.run())
    }

    // Caller holds the main lock. `spawned` are the workers started so far
    // in this cycle, in index order.
    fn roll_back_start(&self, spawned: Vec<JoinHandle<()>>) {
        self.force_stop();
        // Workers that never spawned will not leave the barrier themselves.
        for _ in spawned.len()..self.n_workers {
            self.gate.leave(&self.hooks);
        }
        for handle in spawned {
            let _ = handle.join();
        }
        *self.exits.lock() = ExitCounts::default();
        self.state.set(StageState::Finalized);
        warn!(stage = %self.name, "start rolled back");
    }

    // A stop request is out; pause and maintenance can no longer gather the workers.
    fn is_stopping(&self) -> bool {
        self.cancel.load(Ordering::Acquire) || self.graceful.load(Ordering::Acquire)
    }

    /// Park every worker at a safe point.
    ///
    /// Idempotent on a paused stage. On timeout the request is withdrawn and
    /// the stage keeps running. Returns `NotOperational` once the stage has
    /// been canceled or told to shut down. Must not be called from the
    /// stage's own hooks.
    pub fn pause(&self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_registered()?;
        let _control = self.control.lock();
        match self.state.get() {
            StageState::Paused => return Ok(()),
            StageState::Started => {}
            state => return Err(PipelineError::transition(state, "pause")),
        }
        if self.is_stopping() {
            return Err(PipelineError::NotOperational);
        }
        self.gate.request_pause(timeout, || self.hooks.pre_pause())?;
        self.state.set(StageState::Paused);
        info!(stage = %self.name, "stage paused");
        Ok(())
    }

    /// Release parked workers. Idempotent on a started stage.
    pub fn resume(&self) -> Result<()> {
        self.ensure_registered()?;
        let _control = self.control.lock();
        match self.state.get() {
            StageState::Started => Ok(()),
            StageState::Paused => {
                self.gate.release();
                self.state.set(StageState::Started);
                info!(stage = %self.name, "stage resumed");
                Ok(())
            }
            state => Err(PipelineError::transition(state, "resume")),
        }
    }

    /// Run `job` exactly once on one worker while all the others are parked,
    /// then let every worker continue.
    ///
    /// Blocks until the job has run and returns its result. Must not be
    /// called from the stage's own hooks.
    pub fn schedule_maintenance<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&S) -> Result<()> + Send + 'static,
    {
        self.ensure_registered()?;
        let _control = self.control.lock();
        let state = self.state.get();
        if state != StageState::Started {
            return Err(PipelineError::transition(state, "schedule maintenance on"));
        }
        if self.is_stopping() {
            return Err(PipelineError::NotOperational);
        }
        self.state.set(StageState::MaintenanceRequested);
        let result = self
            .gate
            .request_maintenance(Box::new(job), || self.hooks.pre_pause());
        self.state.set(StageState::Started);
        result
    }

    /// Stop the stage. `RightNow` cancels; `Gracefully` lets each worker
    /// finish its current iteration and stop at the next checkpoint.
    pub fn shutdown(&self, grace: ShutdownGrace) -> Result<()> {
        self.ensure_registered()?;
        let mut control = self.control.lock();
        let state = self.state.get();
        if state.is_stopped() {
            return Ok(());
        }
        if !state.is_running() {
            return Err(PipelineError::transition(state, "shut down"));
        }
        match grace {
            ShutdownGrace::RightNow => {
                control.grace = ShutdownGrace::RightNow;
                self.force_stop();
                info!(stage = %self.name, "stage canceled by shutdown");
            }
            ShutdownGrace::Gracefully => {
                control.grace = ShutdownGrace::Gracefully;
                self.graceful.store(true, Ordering::Release);
                if state == StageState::Paused {
                    self.gate.release();
                    self.state.set(StageState::Started);
                }
                self.hooks.pre_pause();
                info!(stage = %self.name, "stage shutting down gracefully");
            }
        }
        Ok(())
    }

    /// Force every worker off its loop
    pub fn cancel(&self) -> Result<()> {
        self.ensure_registered()?;
        let mut control = self.control.lock();
        let state = self.state.get();
        if state.is_stopped() {
            return Ok(());
        }
        if !state.is_running() {
            return Err(PipelineError::transition(state, "cancel"));
        }
        control.grace = ShutdownGrace::RightNow;
        self.force_stop();
        info!(stage = %self.name, "stage canceled");
        Ok(())
    }

    // Caller holds the main lock.
    fn force_stop(&self) {
        self.cancel.store(true, Ordering::Release);
        self.do_loop.store(false, Ordering::Release);
        self.gate.cancel();
        if matches!(
            self.state.get(),
            StageState::Paused | StageState::MaintenanceRequested
        ) {
            self.state.set(StageState::Started);
        }
        self.hooks.pre_pause();
    }

    /// Wait for every worker to exit, then record the final state and run
    /// the finalize and shutdown hooks once.
    ///
    /// Ends in `Canceled` if any worker exited through cancellation,
    /// otherwise in `Shutdown`.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_registered()?;
        let state = self.state.get();
        if state.is_stopped() {
            return Ok(());
        }
        if !state.is_running() {
            return Err(PipelineError::transition(state, "wait for"));
        }
        self.wait_for_exits(timeout)?;
        self.finish_cycle()
    }

    fn wait_for_exits(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = deadline(timeout);
        let mut exits = self.exits.lock();
        while exits.total() < self.n_workers {
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Err(PipelineError::TimedOut);
            }
            let slice = now + REWAKE_INTERVAL;
            let until = deadline.map_or(slice, |deadline| deadline.min(slice));
            if self.exited.wait_until(&mut exits, until).timed_out()
                && exits.total() < self.n_workers
                && self.is_stopping()
            {
                // Workers may have entered a blocking fetch after the stop request.
                MutexGuard::unlocked(&mut exits, || self.hooks.pre_pause());
            }
        }
        Ok(())
    }

    fn finish_cycle(&self) -> Result<()> {
        let mut control = self.control.lock();
        if !control.cycle_open {
            return Ok(());
        }

        let mut panicked = None;
        for (index, handle) in control.handles.drain(..).enumerate() {
            if handle.join().is_err() {
                panicked = Some(index);
            }
        }

        let exits = *self.exits.lock();
        if exits.total() != self.n_workers {
            error!(
                stage = %self.name,
                shutdown = exits.shutdown,
                canceled = exits.canceled,
                workers = self.n_workers,
                "worker exit count does not match worker count"
            );
            std::process::abort();
        }

        let canceled = exits.canceled > 0;
        if self.state.get() != StageState::Destroying {
            self.state.set(if canceled {
                StageState::Canceled
            } else {
                StageState::Shutdown
            });
        }
        control.cycle_open = false;
        info!(
            stage = %self.name,
            shutdown = exits.shutdown,
            canceled = exits.canceled,
            "stage workers joined"
        );

        self.hooks.finalize(canceled);
        let grace = if canceled {
            ShutdownGrace::RightNow
        } else {
            control.grace
        };
        if let Err(e) = self.hooks.on_shutdown(grace) {
            warn!(stage = %self.name, error = %e, "shutdown hook failed");
            return Err(e);
        }
        match panicked {
            Some(index) => Err(PipelineError::ThreadPanicked(index)),
            None => Ok(()),
        }
    }

    /// Cancel if still running, join the workers, run the finalize and
    /// freeup hooks and unregister the stage.
    ///
    /// A second call returns `InvalidObject`.
    pub fn destroy(&self) -> Result<()> {
        self.ensure_registered()?;
        let running = {
            let _control = self.control.lock();
            let state = self.state.get();
            if state == StageState::Destroying {
                registry::unregister(self.id);
                return Ok(());
            }
            if state.is_running() {
                self.force_stop();
            }
            state.is_running()
        };

        if running {
            self.wait_for_exits(None)?;
        }
        {
            let _control = self.control.lock();
            self.state.set(StageState::Destroying);
        }
        if let Err(e) = self.finish_cycle() {
            warn!(stage = %self.name, error = %e, "error while tearing down workers");
        }

        let mut control = self.control.lock();
        if !control.freed {
            control.freed = true;
            self.hooks.freeup();
        }
        *self.post_start.lock() = None;
        drop(control);

        registry::unregister(self.id);
        info!(stage = %self.name, "stage destroyed");
        Ok(())
    }

    /// Clean up after a caller that unwound out of `pause` or
    /// `schedule_maintenance` (for example from a panicking `pre_pause`).
    ///
    /// Withdraws the orphaned request so workers stop arriving at the
    /// barrier. A completed pause is left alone.
    pub fn cancel_janitor(&self) -> Result<()> {
        self.ensure_registered()?;
        let _control = self.control.lock();
        let state = self.state.get();
        if state == StageState::Paused {
            return Ok(());
        }
        if self.gate.withdraw_stale() {
            warn!(stage = %self.name, "withdrew orphaned pause/maintenance request");
        }
        if state == StageState::MaintenanceRequested {
            self.state.set(StageState::Started);
        }
        Ok(())
    }

    /// Pin worker `index` to `cpu`; a negative cpu clears the pinning.
    ///
    /// Applies immediately to a running worker and at thread start otherwise.
    pub fn set_worker_cpu_affinity(&self, index: usize, cpu: isize) -> Result<()> {
        self.ensure_registered()?;
        let slot = self
            .workers
            .get(index)
            .ok_or_else(|| PipelineError::InvalidArgs(format!("no worker {index}")))?;
        let control = self.control.lock();
        let cpu = usize::try_from(cpu).ok();
        if let Some(handle) = control.handles.get(index) {
            affinity::pin_handle(handle, cpu)?;
        }
        *slot.cpu.lock() = cpu;
        Ok(())
    }

    /// Hand events to the stage's schedule hook.
    ///
    /// Accepted events are drained from `events`; returns how many.
    pub fn submit(&self, events: &mut Vec<S::Event>, hint: usize) -> Result<usize> {
        self.ensure_registered()?;
        if events.is_empty() {
            return Err(PipelineError::InvalidArgs("empty event batch".into()));
        }
        self.hooks.schedule(events, hint)
    }

    pub(crate) fn report_exit(&self, canceled: bool) {
        let mut exits = self.exits.lock();
        if canceled {
            exits.canceled += 1;
        } else {
            exits.shutdown += 1;
        }
        self.exited.notify_all();
    }

    /// Stage name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry identity
    pub fn id(&self) -> StageId {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> StageState {
        self.state.get()
    }

    pub fn worker_count(&self) -> usize {
        self.n_workers
    }

    /// Size of one event in bytes
    pub fn event_size(&self) -> usize {
        std::mem::size_of::<S::Event>()
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    pub fn worker_loop(&self) -> WorkerLoop {
        self.strategy
    }

    /// The behavior hooks, i.e. the stage's own shared state
    pub fn hooks(&self) -> &S {
        &self.hooks
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Exit counters of the current or last run cycle
    pub fn exit_counts(&self) -> ExitCounts {
        *self.exits.lock()
    }

    /// Take the error that ended worker `index`, if a hook ended it
    pub fn take_worker_exit_reason(&self, index: usize) -> Option<PipelineError> {
        self.workers.get(index)?.exit_reason.lock().take()
    }

    /// Run `f` on worker `index`'s event buffer.
    ///
    /// While the stage runs this waits for the worker's current iteration.
    pub fn with_worker_buffer<R>(&self, index: usize, f: impl FnOnce(&mut Vec<S::Event>) -> R) -> Result<R> {
        let slot = self
            .workers
            .get(index)
            .ok_or_else(|| PipelineError::InvalidArgs(format!("no worker {index}")))?;
        let mut buffer = slot.buffer.lock();
        Ok(f(&mut buffer))
    }

    /// Replace worker `index`'s event buffer, returning the old one
    pub fn replace_worker_buffer(&self, index: usize, buffer: Vec<S::Event>) -> Result<Vec<S::Event>> {
        self.with_worker_buffer(index, |current| std::mem::replace(current, buffer))
    }
}

/// Type-erased lifecycle surface of a stage
pub trait StageControl: Send + Sync {
    fn name(&self) -> &str;
    fn id(&self) -> StageId;
    fn state(&self) -> StageState;
    fn worker_count(&self) -> usize;
    fn metrics(&self) -> &StageMetrics;
    fn setup(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn pause(&self, timeout: Option<Duration>) -> Result<()>;
    fn resume(&self) -> Result<()>;
    fn shutdown(&self, grace: ShutdownGrace) -> Result<()>;
    fn cancel(&self) -> Result<()>;
    fn wait(&self, timeout: Option<Duration>) -> Result<()>;
    fn destroy(&self) -> Result<()>;
}

impl<S: Stage> StageControl for PipelineStage<S> {
    fn name(&self) -> &str {
        PipelineStage::name(self)
    }

    fn id(&self) -> StageId {
        PipelineStage::id(self)
    }

    fn state(&self) -> StageState {
        PipelineStage::state(self)
    }

    fn worker_count(&self) -> usize {
        PipelineStage::worker_count(self)
    }

    fn metrics(&self) -> &StageMetrics {
        PipelineStage::metrics(self)
    }

    fn setup(&self) -> Result<()> {
        PipelineStage::setup(self)
    }

    fn start(&self) -> Result<()> {
        PipelineStage::start(self)
    }

    fn pause(&self, timeout: Option<Duration>) -> Result<()> {
        PipelineStage::pause(self, timeout)
    }

    fn resume(&self) -> Result<()> {
        PipelineStage::resume(self)
    }

    fn shutdown(&self, grace: ShutdownGrace) -> Result<()> {
        PipelineStage::shutdown(self, grace)
    }

    fn cancel(&self) -> Result<()> {
        PipelineStage::cancel(self)
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        PipelineStage::wait(self, timeout)
    }

    fn destroy(&self) -> Result<()> {
        PipelineStage::destroy(self)
    }
}
