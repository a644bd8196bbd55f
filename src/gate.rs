//! Stop-the-world gate used by pause and maintenance.
//!
//! The gate embeds a cyclic barrier sized to the number of live workers.
//! A requester raises a [`GateRequest`]; each worker notices it at the top
//! of its loop and arrives at the barrier. The last arriver completes the
//! round: for a pause it marks the stage parked and wakes the requester,
//! for maintenance it runs the function while every other worker is
//! parked, then releases everyone. Arrival and request checks share one
//! lock, so a request withdrawn on timeout can never strand a worker in a
//! round that will not complete.
//!
//! A worker that exits shrinks the barrier. If that completes a round the
//! exiting worker acts as the last arriver.

use crate::error::{PipelineError, Result};
use crate::queue::deadline;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// A single-shot function run by exactly one worker while the others are parked
pub type MaintenanceFn<T> = Box<dyn FnOnce(&T) -> Result<()> + Send>;

/// How often a waiting requester repeats its wake call while workers are still out
pub(crate) const REWAKE_INTERVAL: Duration = Duration::from_millis(10);

enum GateRequest<T> {
    Pause,
    Maintenance(Option<MaintenanceFn<T>>),
}

struct GateState<T> {
    request: Option<GateRequest<T>>,
    live: usize,
    arrived: usize,
    round: u64,
    parked: bool,
    leader_busy: bool,
    outcome: Option<Result<()>>,
    canceled: bool,
}

/// What a worker should do after passing a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Checkpoint {
    Continue,
    Canceled,
}

pub(crate) struct PauseGate<T> {
    state: Mutex<GateState<T>>,
    requested: AtomicBool,
    done: Condvar,
    resume: Condvar,
}

impl<T> PauseGate<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                request: None,
                live: 0,
                arrived: 0,
                round: 0,
                parked: false,
                leader_busy: false,
                outcome: None,
                canceled: false,
            }),
            requested: AtomicBool::new(false),
            done: Condvar::new(),
            resume: Condvar::new(),
        }
    }

    /// Re-arm the gate for a run cycle of `live` workers
    pub(crate) fn reset(&self, live: usize) {
        let mut st = self.state.lock();
        st.request = None;
        st.live = live;
        st.arrived = 0;
        st.parked = false;
        st.leader_busy = false;
        st.outcome = None;
        st.canceled = false;
        self.requested.store(false, Ordering::Release);
    }

    /// Cheap per-iteration check
    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn is_parked(&self) -> bool {
        self.state.lock().parked
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.state.lock().live
    }

    /// Arrive at the barrier if a request is pending and block until released
    pub(crate) fn checkpoint(&self, target: &T) -> Checkpoint {
        let mut st = self.state.lock();
        if st.canceled {
            return Checkpoint::Canceled;
        }
        if st.request.is_none() {
            return Checkpoint::Continue;
        }
        st.arrived += 1;
        let round = st.round;
        if st.arrived == st.live {
            self.complete_round(&mut st, target);
        }
        while st.round == round && !st.canceled {
            self.resume.wait(&mut st);
        }
        if st.canceled {
            Checkpoint::Canceled
        } else {
            Checkpoint::Continue
        }
    }

    /// Remove an exiting worker from the barrier
    pub(crate) fn leave(&self, target: &T) {
        let mut st = self.state.lock();
        st.live = st.live.saturating_sub(1);
        if st.live == 0 {
            self.done.notify_all();
            return;
        }
        if st.request.is_none() || st.leader_busy || st.parked || st.canceled {
            return;
        }
        if st.arrived == st.live {
            self.complete_round(&mut st, target);
        }
    }

    fn complete_round(&self, st: &mut MutexGuard<'_, GateState<T>>, target: &T) {
        if matches!(st.request, Some(GateRequest::Pause)) {
            st.parked = true;
            self.done.notify_all();
            return;
        }
        let job = match st.request.as_mut() {
            Some(GateRequest::Maintenance(job)) => job.take(),
            _ => None,
        };
        let Some(job) = job else { return };

        st.leader_busy = true;
        let outcome = MutexGuard::unlocked(st, || {
            panic::catch_unwind(AssertUnwindSafe(|| job(target))).unwrap_or_else(|_| {
                warn!("maintenance function panicked");
                Err(PipelineError::Other("maintenance function panicked".into()))
            })
        });
        st.leader_busy = false;
        st.outcome = Some(outcome);
        self.release_locked(st);
    }

    fn release_locked(&self, st: &mut GateState<T>) {
        st.request = None;
        st.parked = false;
        st.arrived = 0;
        st.round = st.round.wrapping_add(1);
        self.requested.store(false, Ordering::Release);
        self.done.notify_all();
        self.resume.notify_all();
    }

    fn begin(&self, st: &mut GateState<T>, request: GateRequest<T>) -> Result<()> {
        if st.live == 0 || st.canceled {
            return Err(PipelineError::NotOperational);
        }
        if st.request.is_some() {
            return Err(PipelineError::Other(
                "a pause or maintenance request is already pending".into(),
            ));
        }
        st.request = Some(request);
        st.parked = false;
        st.outcome = None;
        self.requested.store(true, Ordering::Release);
        Ok(())
    }

    /// Block until every live worker is parked.
    ///
    /// `wake` runs once up front and again every [`REWAKE_INTERVAL`] while
    /// workers are still out, so a worker that entered a blocking fetch
    /// just after the first call is still kicked loose. On timeout the
    /// request is withdrawn and any early arrivals resume.
    pub(crate) fn request_pause(&self, timeout: Option<Duration>, wake: impl Fn()) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.parked && matches!(st.request, Some(GateRequest::Pause)) {
                return Ok(());
            }
            self.begin(&mut st, GateRequest::Pause)?;
        }
        wake();

        let deadline = deadline(timeout);
        let mut st = self.state.lock();
        loop {
            if st.parked {
                return Ok(());
            }
            if st.live == 0 || st.canceled {
                self.release_locked(&mut st);
                return Err(PipelineError::NotOperational);
            }
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                self.release_locked(&mut st);
                return Err(PipelineError::TimedOut);
            }
            let slice = now + REWAKE_INTERVAL;
            let until = deadline.map_or(slice, |deadline| deadline.min(slice));
            if self.done.wait_until(&mut st, until).timed_out() && !st.parked {
                MutexGuard::unlocked(&mut st, &wake);
            }
        }
    }

    /// Hand `job` to the last worker to arrive and block until it has run.
    ///
    /// `wake` is repeated like in [`PauseGate::request_pause`] until the
    /// round completes.
    pub(crate) fn request_maintenance(&self, job: MaintenanceFn<T>, wake: impl Fn()) -> Result<()> {
        {
            let mut st = self.state.lock();
            self.begin(&mut st, GateRequest::Maintenance(Some(job)))?;
        }
        wake();

        let mut st = self.state.lock();
        loop {
            if let Some(outcome) = st.outcome.take() {
                return outcome;
            }
            if st.canceled || (st.live == 0 && !st.leader_busy) {
                self.release_locked(&mut st);
                return Err(PipelineError::NotOperational);
            }
            if self.done.wait_for(&mut st, REWAKE_INTERVAL).timed_out()
                && st.request.is_some()
                && !st.leader_busy
            {
                MutexGuard::unlocked(&mut st, &wake);
            }
        }
    }

    /// Release parked workers
    pub(crate) fn release(&self) {
        let mut st = self.state.lock();
        self.release_locked(&mut st);
    }

    /// Withdraw a request nobody is waiting for any more. Returns whether one was pending.
    pub(crate) fn withdraw_stale(&self) -> bool {
        let mut st = self.state.lock();
        st.outcome = None;
        if st.request.is_none() || st.leader_busy {
            return false;
        }
        self.release_locked(&mut st);
        true
    }

    /// Release everyone and make later checkpoints report cancellation
    pub(crate) fn cancel(&self) {
        let mut st = self.state.lock();
        st.canceled = true;
        st.request = None;
        st.parked = false;
        st.arrived = 0;
        st.round = st.round.wrapping_add(1);
        self.requested.store(true, Ordering::Release);
        self.done.notify_all();
        self.resume.notify_all();
    }
}
