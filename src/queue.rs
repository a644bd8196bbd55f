use crate::error::{PipelineError, Result};
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Determines how a full queue treats new events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Block the producer until space is available or its timeout expires
    Block,
    /// Drop the oldest queued event to make space
    DropOldest,
}

#[derive(Debug, Default)]
struct Signal {
    wakeups: u64,
    // Set by `wakeup`, consumed by the next reader that finds the queue empty.
    pending_wakeup: bool,
}

/// A bounded blocking event queue on top of crossbeam's ArrayQueue.
///
/// Pushes and pops are lock-free; the mutex is only taken to sleep or to
/// wake sleepers.
#[derive(Debug)]
pub struct EventQueue<E: Send> {
    queue: ArrayQueue<E>,
    policy: OverflowPolicy,
    signal: Mutex<Signal>,
    not_empty: Condvar,
    not_full: Condvar,
    dropped_count: AtomicU64,
    block_count: AtomicU64,
}

pub(crate) fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

impl<E: Send> EventQueue<E> {
    /// Create a queue with the given capacity and overflow policy.
    ///
    /// A zero capacity is `InvalidArgs`.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::InvalidArgs("queue capacity must be > 0".into()));
        }
        Ok(Self {
            queue: ArrayQueue::new(capacity),
            policy,
            signal: Mutex::new(Signal::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            dropped_count: AtomicU64::new(0),
            block_count: AtomicU64::new(0),
        })
    }

    /// Put a single event
    pub fn put(&self, event: E, timeout: Option<Duration>) -> Result<()> {
        let mut batch = vec![event];
        match self.put_batch(&mut batch, timeout)? {
            0 => Err(PipelineError::TimedOut),
            _ => Ok(()),
        }
    }

    /// Move as many events as possible from the front of `events` into the queue.
    ///
    /// Returns the number accepted. Events that did not fit before the
    /// timeout stay in `events`, in order.
    pub fn put_batch(&self, events: &mut Vec<E>, timeout: Option<Duration>) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let deadline = deadline(timeout);
        let mut pending = std::mem::take(events).into_iter();
        let mut accepted = 0;

        while let Some(event) = pending.next() {
            match self.queue.push(event) {
                Ok(()) => accepted += 1,
                Err(event) => match self.policy {
                    OverflowPolicy::DropOldest => {
                        self.dropped_count.fetch_add(1, Ordering::Relaxed);
                        let _ = self.queue.force_push(event);
                        accepted += 1;
                    }
                    OverflowPolicy::Block => {
                        self.block_count.fetch_add(1, Ordering::Relaxed);
                        match self.push_blocking(event, deadline) {
                            Ok(()) => accepted += 1,
                            Err(event) => {
                                events.push(event);
                                events.extend(pending);
                                break;
                            }
                        }
                    }
                },
            }
        }

        if accepted > 0 {
            let _guard = self.signal.lock();
            self.not_empty.notify_all();
        }
        Ok(accepted)
    }

    fn push_blocking(&self, mut event: E, deadline: Option<Instant>) -> std::result::Result<(), E> {
        loop {
            let mut signal = self.signal.lock();
            match self.queue.push(event) {
                Ok(()) => return Ok(()),
                Err(e) => event = e,
            }
            // Wake readers before sleeping on a full queue.
            self.not_empty.notify_all();
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || self.not_full.wait_until(&mut signal, deadline).timed_out()
                    {
                        drop(signal);
                        return self.queue.push(event);
                    }
                }
                None => self.not_full.wait(&mut signal),
            }
        }
    }

    /// Move up to `max` events into `buf`, blocking while the queue is empty.
    ///
    /// Returns `TimedOut` when nothing arrived before the timeout and
    /// `WakeupRequested` when [`EventQueue::wakeup`] interrupted the wait.
    /// A wakeup issued while no reader was blocked is kept and makes the
    /// next empty read return `WakeupRequested` at once.
    pub fn get_batch(&self, buf: &mut Vec<E>, max: usize, timeout: Option<Duration>) -> Result<usize> {
        let deadline = deadline(timeout);
        let mut signal = self.signal.lock();
        let wakeups = signal.wakeups;
        loop {
            let n = self.drain_into(buf, max);
            if n > 0 {
                self.not_full.notify_all();
                return Ok(n);
            }
            if signal.wakeups != wakeups {
                return Err(PipelineError::WakeupRequested);
            }
            if signal.pending_wakeup {
                signal.pending_wakeup = false;
                return Err(PipelineError::WakeupRequested);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(PipelineError::TimedOut);
                    }
                    self.not_empty.wait_until(&mut signal, deadline);
                }
                None => self.not_empty.wait(&mut signal),
            }
        }
    }

    /// Move up to `max` events into `buf` without blocking
    pub fn try_get_batch(&self, buf: &mut Vec<E>, max: usize) -> usize {
        let n = self.drain_into(buf, max);
        if n > 0 {
            let _guard = self.signal.lock();
            self.not_full.notify_all();
        }
        n
    }

    fn drain_into(&self, buf: &mut Vec<E>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.queue.pop() {
                Some(event) => {
                    buf.push(event);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Wake every reader blocked in [`EventQueue::get_batch`].
    ///
    /// If nobody is blocked yet, the next reader to find the queue empty
    /// returns at once instead.
    pub fn wakeup(&self) {
        let mut signal = self.signal.lock();
        signal.wakeups = signal.wakeups.wrapping_add(1);
        signal.pending_wakeup = true;
        self.not_empty.notify_all();
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Maximum number of queued events
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Utilization as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        let percent = (self.len() as u64).saturating_mul(100) / self.capacity() as u64;
        percent.min(100) as u32
    }

    /// Number of events dropped by [`OverflowPolicy::DropOldest`]
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Number of times a producer found the queue full under [`OverflowPolicy::Block`]
    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_put_get_fifo() {
        let queue = EventQueue::new(10, OverflowPolicy::Block).unwrap();
        let mut events = vec![1, 2, 3];
        assert_eq!(queue.put_batch(&mut events, None).unwrap(), 3);
        assert!(events.is_empty());

        let mut buf = Vec::new();
        assert_eq!(queue.get_batch(&mut buf, 2, None).unwrap(), 2);
        assert_eq!(buf, vec![1, 2]);
        assert_eq!(queue.try_get_batch(&mut buf, 8), 1);
        assert_eq!(buf, vec![1, 2, 3]);
    }

    #[test]
    fn test_poll_on_empty_times_out() {
        let queue: EventQueue<u32> = EventQueue::new(4, OverflowPolicy::Block).unwrap();
        let mut buf = Vec::new();
        assert!(matches!(
            queue.get_batch(&mut buf, 4, Some(Duration::ZERO)),
            Err(PipelineError::TimedOut)
        ));
    }

    #[test]
    fn test_full_queue_keeps_leftovers() {
        let queue = EventQueue::new(2, OverflowPolicy::Block).unwrap();
        let mut events = vec![1, 2, 3, 4];
        let accepted = queue
            .put_batch(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(accepted, 2);
        assert_eq!(events, vec![3, 4]);
        assert!(queue.block_count() >= 1);
    }

    #[test]
    fn test_drop_oldest() {
        let queue = EventQueue::new(3, OverflowPolicy::DropOldest).unwrap();
        let mut events = vec![1, 2, 3, 4];
        assert_eq!(queue.put_batch(&mut events, None).unwrap(), 4);
        assert_eq!(queue.dropped_count(), 1);

        let mut buf = Vec::new();
        queue.try_get_batch(&mut buf, 3);
        assert_eq!(buf, vec![2, 3, 4]);
    }

    #[test]
    fn test_wakeup_interrupts_reader() {
        let queue: Arc<EventQueue<u32>> = Arc::new(EventQueue::new(4, OverflowPolicy::Block).unwrap());
        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut buf = Vec::new();
                queue.get_batch(&mut buf, 4, None)
            })
        };
        thread::sleep(Duration::from_millis(50));
        queue.wakeup();
        let result = reader.join().unwrap();
        assert!(matches!(result, Err(PipelineError::WakeupRequested)));
    }

    #[test]
    fn test_blocked_reader_gets_late_event() {
        let queue: Arc<EventQueue<u32>> = Arc::new(EventQueue::new(4, OverflowPolicy::Block).unwrap());
        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut buf = Vec::new();
                queue.get_batch(&mut buf, 4, Some(Duration::from_secs(5))).map(|_| buf)
            })
        };
        thread::sleep(Duration::from_millis(20));
        queue.put(7, None).unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), vec![7]);
    }

    #[test]
    fn test_wakeup_before_read_is_kept() {
        let queue: EventQueue<u32> = EventQueue::new(4, OverflowPolicy::Block).unwrap();
        queue.wakeup();

        let mut buf = Vec::new();
        assert!(matches!(
            queue.get_batch(&mut buf, 4, None),
            Err(PipelineError::WakeupRequested)
        ));
        // Consumed by the first read.
        assert!(matches!(
            queue.get_batch(&mut buf, 4, Some(Duration::from_millis(20))),
            Err(PipelineError::TimedOut)
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            EventQueue::<u32>::new(0, OverflowPolicy::Block),
            Err(PipelineError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_utilization() {
        let queue = EventQueue::new(10, OverflowPolicy::Block).unwrap();
        let mut events: Vec<u8> = (0..5).collect();
        queue.put_batch(&mut events, None).unwrap();
        assert_eq!(queue.utilization(), 50);
        assert_eq!(queue.capacity(), 10);

        let mut rest: Vec<u8> = (5..10).collect();
        queue.put_batch(&mut rest, None).unwrap();
        assert_eq!(queue.utilization(), 100);
    }
}
