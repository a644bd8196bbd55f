//! Schedule and fetch policies over a set of per-stage input queues.
//!
//! A stage's `schedule` hook usually forwards to [`QueueSet::schedule`] and
//! its `fetch` hook to one of the `fetch_*` helpers. Producers (upstream
//! throw hooks) may call `schedule` concurrently.

use crate::config::StageConfig;
use crate::error::{PipelineError, Result};
use crate::queue::{deadline, EventQueue, OverflowPolicy};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How a submitted batch is spread over the input queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Everything goes to queue 0
    Single,
    /// The caller's hint picks the queue (`hint % queue_count`)
    Hinted,
    /// Each batch goes whole to the next queue in rotation
    RoundRobin,
    /// Each batch is sliced evenly over all queues; the remainder joins the first slice
    RoundRobinSplit,
}

/// A fixed set of bounded input queues shared by a stage's workers
#[derive(Debug)]
pub struct QueueSet<E: Send> {
    queues: Vec<EventQueue<E>>,
    cursor: AtomicUsize,
    fetch_cursor: AtomicUsize,
    put_timeout: Option<Duration>,
    fetch_timeout: Option<Duration>,
    signal: Mutex<Ready>,
    ready: Condvar,
}

#[derive(Debug, Default)]
struct Ready {
    generation: u64,
    // Left by `wakeup_all` for a round-robin fetcher that was not yet asleep.
    pending_wakeup: bool,
}

impl<E: Send> QueueSet<E> {
    /// Create `n_queues` queues of `capacity` events each
    pub fn new(
        n_queues: usize,
        capacity: usize,
        policy: OverflowPolicy,
        fetch_timeout: Option<Duration>,
    ) -> Result<Self> {
        if n_queues == 0 || capacity == 0 {
            return Err(PipelineError::InvalidArgs(
                "queue set needs at least one queue of non-zero capacity".into(),
            ));
        }
        Ok(Self {
            queues: (0..n_queues)
                .map(|_| EventQueue::new(capacity, policy))
                .collect::<Result<Vec<_>>>()?,
            cursor: AtomicUsize::new(0),
            fetch_cursor: AtomicUsize::new(0),
            put_timeout: Some(Duration::ZERO),
            fetch_timeout,
            signal: Mutex::new(Ready::default()),
            ready: Condvar::new(),
        })
    }

    /// Create `n_queues` blocking queues sized and timed from a stage config
    pub fn from_config(config: &StageConfig, n_queues: usize) -> Result<Self> {
        Self::new(
            n_queues,
            config.queue_capacity,
            OverflowPolicy::Block,
            Some(config.fetch_timeout()),
        )
    }

    /// How long a producer may block on a full queue (default: not at all)
    pub fn with_put_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.put_timeout = timeout;
        self
    }

    /// Number of queues
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Access one queue
    pub fn queue(&self, index: usize) -> Option<&EventQueue<E>> {
        self.queues.get(index)
    }

    /// Events queued across all queues
    pub fn total_len(&self) -> usize {
        self.queues.iter().map(EventQueue::len).sum()
    }

    /// Distribute `events` according to `policy`.
    ///
    /// Accepted events are removed from `events`; whatever no queue had
    /// room for stays behind. Returns the number accepted.
    pub fn schedule(&self, policy: SchedulePolicy, events: &mut Vec<E>, hint: usize) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let n = self.queues.len();
        let accepted = match policy {
            SchedulePolicy::Single => self.queues[0].put_batch(events, self.put_timeout)?,
            SchedulePolicy::Hinted => self.queues[hint % n].put_batch(events, self.put_timeout)?,
            SchedulePolicy::RoundRobin => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
                let mut accepted = self.queues[start].put_batch(events, self.put_timeout)?;
                if !events.is_empty() {
                    accepted += self.spill(events, start + 1)?;
                }
                accepted
            }
            SchedulePolicy::RoundRobinSplit => {
                let count = events.len();
                let base = count / n;
                let first = base + count % n;
                let mut rest = std::mem::take(events);
                let mut accepted = 0;
                for (index, queue) in self.queues.iter().enumerate() {
                    let take = if index == 0 { first } else { base };
                    if take == 0 {
                        continue;
                    }
                    let mut slice: Vec<E> = rest.drain(..take).collect();
                    accepted += queue.put_batch(&mut slice, self.put_timeout)?;
                    events.append(&mut slice);
                }
                if !events.is_empty() {
                    accepted += self.spill(events, 0)?;
                }
                accepted
            }
        };
        if accepted > 0 {
            self.notify();
        }
        Ok(accepted)
    }

    // One non-blocking pass over every queue starting at `start`.
    fn spill(&self, events: &mut Vec<E>, start: usize) -> Result<usize> {
        let n = self.queues.len();
        let mut accepted = 0;
        for offset in 0..n {
            if events.is_empty() {
                break;
            }
            accepted += self.queues[(start + offset) % n].put_batch(events, Some(Duration::ZERO))?;
        }
        Ok(accepted)
    }

    fn notify(&self) {
        let mut ready = self.signal.lock();
        ready.generation = ready.generation.wrapping_add(1);
        self.ready.notify_all();
    }

    /// Blocking read from queue 0. Returns 0 when nothing arrived in time.
    pub fn fetch_single(&self, buf: &mut Vec<E>, max: usize) -> Result<usize> {
        no_work_is_zero(self.queues[0].get_batch(buf, max, self.fetch_timeout))
    }

    /// Blocking read from the queue owned by `worker`
    pub fn fetch_hinted(&self, worker: usize, buf: &mut Vec<E>, max: usize) -> Result<usize> {
        let n = self.queues.len();
        no_work_is_zero(self.queues[worker % n].get_batch(buf, max, self.fetch_timeout))
    }

    /// Poll every queue once; if all are empty, sleep until a producer
    /// signals or the fetch timeout passes, then poll again.
    ///
    /// Returns 0 at once if [`QueueSet::wakeup_all`] ran since the last
    /// fetcher went to sleep.
    pub fn fetch_round_robin(&self, buf: &mut Vec<E>, max: usize) -> Result<usize> {
        let n = self.poll_all(buf, max);
        if n > 0 {
            return Ok(n);
        }

        let deadline = deadline(self.fetch_timeout);
        let mut ready = self.signal.lock();
        let seen = ready.generation;
        // Producers bump the generation under this lock after their put,
        // so a recheck here cannot miss one.
        let n = self.poll_all(buf, max);
        if n > 0 {
            return Ok(n);
        }
        if ready.pending_wakeup {
            ready.pending_wakeup = false;
            return Ok(0);
        }
        while ready.generation == seen {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut ready, deadline).timed_out() {
                        break;
                    }
                }
                None => self.ready.wait(&mut ready),
            }
        }
        drop(ready);
        Ok(self.poll_all(buf, max))
    }

    fn poll_all(&self, buf: &mut Vec<E>, max: usize) -> usize {
        let n = self.queues.len();
        let start = self.fetch_cursor.fetch_add(1, Ordering::Relaxed) % n;
        let mut got = 0;
        for offset in 0..n {
            if got >= max {
                break;
            }
            got += self.queues[(start + offset) % n].try_get_batch(buf, max - got);
        }
        got
    }

    /// Wake every fetcher blocked on any queue of this set.
    ///
    /// A fetcher that is about to block but not yet asleep returns 0 on its
    /// next empty read instead. Meant for a stage's `pre_pause` hook.
    pub fn wakeup_all(&self) {
        for queue in &self.queues {
            queue.wakeup();
        }
        let mut ready = self.signal.lock();
        ready.generation = ready.generation.wrapping_add(1);
        ready.pending_wakeup = true;
        self.ready.notify_all();
    }
}

fn no_work_is_zero(result: Result<usize>) -> Result<usize> {
    match result {
        Err(PipelineError::TimedOut) | Err(PipelineError::WakeupRequested) => Ok(0),
        other => other,
    }
}
