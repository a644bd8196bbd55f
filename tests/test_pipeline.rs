use pipeline_stage::{
    registry, ExitCounts, OverflowPolicy, Pipeline, PipelineError, PipelineStage, QueueSet,
    Result as StageResult, SchedulePolicy, ShutdownGrace, Stage, StageBuilder, StageConfig,
    StageState,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn config(name: &str, workers: usize) -> StageConfig {
    StageBuilder::new(name).workers(workers).max_batch(8).build().expect("config")
}

/// Produces one unit per fetch until stopped and counts every hook call per worker
struct Recorder {
    stop: AtomicBool,
    fetches: Vec<AtomicUsize>,
    mains: Vec<AtomicUsize>,
    throws: Vec<AtomicUsize>,
    in_hook: AtomicUsize,
    in_maintenance: AtomicBool,
    overlaps: AtomicUsize,
    panic_on_pre_pause: AtomicBool,
    shutdowns: AtomicUsize,
    finalizes: AtomicUsize,
    freeups: AtomicUsize,
}

impl Recorder {
    fn new(workers: usize) -> Self {
        let counters = || (0..workers).map(|_| AtomicUsize::new(0)).collect();
        Self {
            stop: AtomicBool::new(false),
            fetches: counters(),
            mains: counters(),
            throws: counters(),
            in_hook: AtomicUsize::new(0),
            in_maintenance: AtomicBool::new(false),
            overlaps: AtomicUsize::new(0),
            panic_on_pre_pause: AtomicBool::new(false),
            shutdowns: AtomicUsize::new(0),
            finalizes: AtomicUsize::new(0),
            freeups: AtomicUsize::new(0),
        }
    }

    fn total_calls(&self) -> usize {
        [&self.fetches, &self.mains, &self.throws]
            .iter()
            .flat_map(|c| c.iter())
            .map(|c| c.load(Ordering::SeqCst))
            .sum()
    }

    fn enter(&self) {
        self.in_hook.fetch_add(1, Ordering::SeqCst);
        if self.in_maintenance.load(Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave(&self) {
        if self.in_maintenance.load(Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.in_hook.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Stage for Recorder {
    type Event = u64;
    const HAS_FETCH: bool = true;
    const HAS_THROW: bool = true;

    fn schedule(&self, events: &mut Vec<u64>, _hint: usize) -> StageResult<usize> {
        let n = events.len();
        events.clear();
        Ok(n)
    }

    fn fetch(&self, worker: usize, buf: &mut Vec<u64>, _max: usize) -> StageResult<usize> {
        self.enter();
        self.fetches[worker].fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1));
        let n = if self.stop.load(Ordering::SeqCst) {
            0
        } else {
            buf.push(worker as u64);
            1
        };
        self.leave();
        Ok(n)
    }

    fn process(&self, worker: usize, events: &mut Vec<u64>) -> StageResult<usize> {
        self.enter();
        self.mains[worker].fetch_add(1, Ordering::SeqCst);
        self.leave();
        Ok(events.len())
    }

    fn throw(&self, worker: usize, events: &mut Vec<u64>) -> StageResult<usize> {
        self.enter();
        self.throws[worker].fetch_add(1, Ordering::SeqCst);
        self.leave();
        Ok(events.len())
    }

    fn pre_pause(&self) {
        if self.panic_on_pre_pause.load(Ordering::SeqCst) {
            panic!("pre_pause failure");
        }
    }

    fn on_shutdown(&self, _grace: ShutdownGrace) -> StageResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finalize(&self, _canceled: bool) {
        self.finalizes.fetch_add(1, Ordering::SeqCst);
    }

    fn freeup(&self) {
        self.freeups.fetch_add(1, Ordering::SeqCst);
    }
}

fn recorder(name: &str, workers: usize) -> Arc<PipelineStage<Recorder>> {
    PipelineStage::create(config(name, workers), Recorder::new(workers)).expect("create")
}

#[test]
fn test_end_to_end_lifecycle() {
    init_tracing();
    let stage = recorder("it-e2e", 2);
    stage.setup().unwrap();
    stage.start().unwrap();

    let h = stage.hooks();
    assert!(eventually(Duration::from_secs(5), || {
        (0..2).all(|w| {
            h.fetches[w].load(Ordering::SeqCst) >= 1
                && h.mains[w].load(Ordering::SeqCst) >= 1
                && h.throws[w].load(Ordering::SeqCst) >= 1
        })
    }));

    stage.pause(None).unwrap();
    assert_eq!(stage.state(), StageState::Paused);
    let frozen = h.total_calls();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(h.total_calls(), frozen);

    stage.resume().unwrap();
    assert!(eventually(Duration::from_secs(5), || h.total_calls() > frozen));

    stage.shutdown(ShutdownGrace::Gracefully).unwrap();
    h.stop.store(true, Ordering::SeqCst);
    stage.wait(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(stage.state(), StageState::Shutdown);
    assert_eq!(stage.exit_counts(), ExitCounts { shutdown: 2, canceled: 0 });
    assert_eq!(h.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(h.finalizes.load(Ordering::SeqCst), 1);

    stage.destroy().unwrap();
    assert_eq!(h.freeups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_right_now_shutdown_counts_cancels() {
    init_tracing();
    for n in 1..=4 {
        let stage = recorder(&format!("it-right-now-{n}"), n);
        stage.start().unwrap();
        stage.shutdown(ShutdownGrace::RightNow).unwrap();
        stage.wait(None).unwrap();
        assert_eq!(stage.state(), StageState::Canceled);
        assert_eq!(stage.exit_counts(), ExitCounts { shutdown: 0, canceled: n });
        stage.destroy().unwrap();
    }
}

#[test]
fn test_pause_and_resume_are_idempotent() {
    init_tracing();
    let stage = recorder("it-idempotent", 3);
    stage.start().unwrap();
    stage.resume().unwrap();
    assert_eq!(stage.state(), StageState::Started);

    stage.pause(Some(Duration::from_secs(5))).unwrap();
    let started = Instant::now();
    stage.pause(Some(Duration::from_secs(5))).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(stage.state(), StageState::Paused);

    stage.resume().unwrap();
    stage.resume().unwrap();
    assert_eq!(stage.state(), StageState::Started);
    stage.destroy().unwrap();
}

#[test]
fn test_maintenance_runs_once_and_excludes_workers() {
    init_tracing();
    let stage = recorder("it-maintenance", 4);
    stage.start().unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let runs = Arc::clone(&runs);
        stage
            .schedule_maintenance(move |recorder: &Recorder| {
                recorder.in_maintenance.store(true, Ordering::SeqCst);
                assert_eq!(recorder.in_hook.load(Ordering::SeqCst), 0);
                thread::sleep(Duration::from_millis(10));
                assert_eq!(recorder.in_hook.load(Ordering::SeqCst), 0);
                recorder.in_maintenance.store(false, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(stage.state(), StageState::Started);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 5);
    assert_eq!(stage.hooks().overlaps.load(Ordering::SeqCst), 0);

    let result = stage.schedule_maintenance(|_: &Recorder| Err(PipelineError::Other("rejected".into())));
    assert!(matches!(result, Err(PipelineError::Other(_))));

    // Workers resume on their own after maintenance.
    let calls = stage.hooks().total_calls();
    assert!(eventually(Duration::from_secs(5), || stage.hooks().total_calls() > calls));
    stage.destroy().unwrap();
}

#[test]
fn test_maintenance_requires_started() {
    init_tracing();
    let stage = recorder("it-maintenance-state", 1);
    let result = stage.schedule_maintenance(|_: &Recorder| Ok(()));
    assert!(matches!(result, Err(PipelineError::InvalidStateTransition { .. })));
    stage.start().unwrap();
    stage.pause(None).unwrap();
    let result = stage.schedule_maintenance(|_: &Recorder| Ok(()));
    assert!(matches!(result, Err(PipelineError::InvalidStateTransition { .. })));
    stage.destroy().unwrap();
}

#[test]
fn test_graceful_shutdown_while_paused() {
    init_tracing();
    let stage = recorder("it-graceful-paused", 3);
    stage.start().unwrap();
    stage.pause(None).unwrap();
    stage.shutdown(ShutdownGrace::Gracefully).unwrap();
    stage.wait(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(stage.state(), StageState::Shutdown);
    assert_eq!(stage.exit_counts().shutdown, 3);
    stage.destroy().unwrap();
}

#[test]
fn test_shutdown_before_start_is_rejected() {
    init_tracing();
    let stage = recorder("it-shutdown-early", 1);
    assert!(matches!(
        stage.shutdown(ShutdownGrace::Gracefully),
        Err(PipelineError::InvalidStateTransition { .. })
    ));
    assert!(matches!(stage.cancel(), Err(PipelineError::InvalidStateTransition { .. })));
    assert!(matches!(
        stage.wait(Some(Duration::ZERO)),
        Err(PipelineError::InvalidStateTransition { .. })
    ));
    stage.destroy().unwrap();
}

#[test]
fn test_destroy_without_start_and_twice() {
    init_tracing();
    let stage = recorder("it-destroy-twice", 2);
    stage.destroy().unwrap();
    assert_eq!(stage.hooks().freeups.load(Ordering::SeqCst), 1);
    assert_eq!(stage.hooks().finalizes.load(Ordering::SeqCst), 0);
    assert!(matches!(stage.destroy(), Err(PipelineError::InvalidObject)));
    assert_eq!(stage.hooks().freeups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_duplicate_name_and_use_after_destroy() {
    init_tracing();
    let stage = recorder("it-duplicate", 1);
    let again = PipelineStage::create(config("it-duplicate", 1), Recorder::new(1));
    assert!(matches!(again, Err(PipelineError::AlreadyExists(_))));

    let found = registry::find::<Recorder>("it-duplicate").unwrap();
    assert_eq!(found.id(), stage.id());
    assert_eq!(found.worker_count(), 1);

    stage.destroy().unwrap();
    assert!(matches!(stage.setup(), Err(PipelineError::InvalidObject)));
    assert!(matches!(stage.pause(None), Err(PipelineError::InvalidObject)));
    assert!(matches!(
        registry::find::<Recorder>("it-duplicate"),
        Err(PipelineError::NotFound(_))
    ));

    // The name is free again.
    let reborn = recorder("it-duplicate", 1);
    reborn.destroy().unwrap();
}

#[test]
fn test_pause_times_out_on_slow_hook() {
    init_tracing();

    struct Slow {
        slow: AtomicBool,
        calls: AtomicUsize,
    }

    impl Stage for Slow {
        type Event = u32;

        fn schedule(&self, _events: &mut Vec<u32>, _hint: usize) -> StageResult<usize> {
            Ok(0)
        }

        fn process(&self, _worker: usize, _events: &mut Vec<u32>) -> StageResult<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let nap = if self.slow.load(Ordering::SeqCst) { 300 } else { 1 };
            thread::sleep(Duration::from_millis(nap));
            Ok(0)
        }
    }

    let stage = PipelineStage::create(
        config("it-pause-timeout", 1),
        Slow {
            slow: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        },
    )
    .unwrap();
    stage.start().unwrap();
    assert!(eventually(Duration::from_secs(5), || stage.hooks().calls.load(Ordering::SeqCst) > 0));

    let result = stage.pause(Some(Duration::from_millis(20)));
    assert!(matches!(result, Err(PipelineError::TimedOut)));
    assert_eq!(stage.state(), StageState::Started);

    stage.hooks().slow.store(false, Ordering::SeqCst);
    let calls = stage.hooks().calls.load(Ordering::SeqCst);
    assert!(eventually(Duration::from_secs(5), || stage.hooks().calls.load(Ordering::SeqCst) > calls + 2));
    stage.pause(Some(Duration::from_secs(5))).unwrap();
    stage.destroy().unwrap();
}

#[test]
fn test_control_calls_after_stop_request_do_not_hang() {
    init_tracing();

    struct Sleepy {
        calls: AtomicUsize,
    }

    impl Stage for Sleepy {
        type Event = u32;

        fn schedule(&self, _events: &mut Vec<u32>, _hint: usize) -> StageResult<usize> {
            Ok(0)
        }

        fn process(&self, _worker: usize, _events: &mut Vec<u32>) -> StageResult<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
            Ok(0)
        }
    }

    let stage = PipelineStage::create(
        config("it-after-stop", 1),
        Sleepy {
            calls: AtomicUsize::new(0),
        },
    )
    .unwrap();

    // Canceled, worker still inside its hook.
    stage.start().unwrap();
    assert!(eventually(Duration::from_secs(5), || stage.hooks().calls.load(Ordering::SeqCst) > 0));
    stage.cancel().unwrap();
    let begun = Instant::now();
    assert!(matches!(stage.pause(None), Err(PipelineError::NotOperational)));
    assert!(matches!(
        stage.schedule_maintenance(|_: &Sleepy| Ok(())),
        Err(PipelineError::NotOperational)
    ));
    assert!(begun.elapsed() < Duration::from_millis(250));
    stage.wait(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(stage.state(), StageState::Canceled);

    // Same after a graceful shutdown request.
    stage.start().unwrap();
    stage.shutdown(ShutdownGrace::Gracefully).unwrap();
    assert!(matches!(stage.pause(None), Err(PipelineError::NotOperational)));
    assert!(matches!(
        stage.schedule_maintenance(|_: &Sleepy| Ok(())),
        Err(PipelineError::NotOperational)
    ));
    stage.wait(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(stage.state(), StageState::Shutdown);
    stage.destroy().unwrap();
}

/// Fetches with no timeout, so only a wakeup gets a worker out of an empty queue
struct Blocking {
    queues: QueueSet<u32>,
    seen: AtomicUsize,
}

impl Stage for Blocking {
    type Event = u32;
    const HAS_FETCH: bool = true;

    fn schedule(&self, events: &mut Vec<u32>, hint: usize) -> StageResult<usize> {
        self.queues.schedule(SchedulePolicy::Single, events, hint)
    }

    fn fetch(&self, _worker: usize, buf: &mut Vec<u32>, max: usize) -> StageResult<usize> {
        // Leaves a window between the loop's checks and the blocking read.
        thread::sleep(Duration::from_millis(20));
        self.queues.fetch_single(buf, max)
    }

    fn process(&self, _worker: usize, events: &mut Vec<u32>) -> StageResult<usize> {
        self.seen.fetch_add(events.len(), Ordering::SeqCst);
        Ok(events.len())
    }

    fn pre_pause(&self) {
        self.queues.wakeup_all();
    }
}

#[test]
fn test_untimed_fetch_follows_every_control_call() {
    init_tracing();
    let stage = PipelineStage::create(
        config("it-untimed-fetch", 2),
        Blocking {
            queues: QueueSet::new(1, 64, OverflowPolicy::Block, None).unwrap(),
            seen: AtomicUsize::new(0),
        },
    )
    .unwrap();
    stage.start().unwrap();

    let mut batch: Vec<u32> = (0..10).collect();
    assert_eq!(stage.submit(&mut batch, 0).unwrap(), 10);
    assert!(eventually(Duration::from_secs(5), || stage.hooks().seen.load(Ordering::SeqCst) == 10));

    for _ in 0..5 {
        stage.pause(Some(Duration::from_secs(5))).unwrap();
        stage.resume().unwrap();
        stage.schedule_maintenance(|_: &Blocking| Ok(())).unwrap();
    }
    stage.shutdown(ShutdownGrace::Gracefully).unwrap();
    stage.wait(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(stage.state(), StageState::Shutdown);
    assert_eq!(stage.exit_counts(), ExitCounts { shutdown: 2, canceled: 0 });

    // Destroy straight from a running cycle.
    stage.start().unwrap();
    thread::sleep(Duration::from_millis(50));
    stage.destroy().unwrap();
    assert_eq!(stage.exit_counts().canceled, 2);
}

#[test]
fn test_janitor_recovers_from_unwound_pause() {
    init_tracing();
    let stage = recorder("it-janitor", 2);
    stage.start().unwrap();

    stage.hooks().panic_on_pre_pause.store(true, Ordering::SeqCst);
    let unwound = panic::catch_unwind(AssertUnwindSafe(|| stage.pause(None)));
    assert!(unwound.is_err());
    stage.hooks().panic_on_pre_pause.store(false, Ordering::SeqCst);
    assert_eq!(stage.state(), StageState::Started);

    stage.cancel_janitor().unwrap();
    let calls = stage.hooks().total_calls();
    assert!(eventually(Duration::from_secs(5), || stage.hooks().total_calls() > calls));

    stage.pause(Some(Duration::from_secs(5))).unwrap();
    stage.resume().unwrap();
    stage.destroy().unwrap();
}

#[test]
fn test_hook_error_becomes_exit_reason() {
    init_tracing();

    struct Faulty {
        calls: AtomicUsize,
    }

    impl Stage for Faulty {
        type Event = u32;

        fn schedule(&self, _events: &mut Vec<u32>, _hint: usize) -> StageResult<usize> {
            Ok(0)
        }

        fn process(&self, _worker: usize, _events: &mut Vec<u32>) -> StageResult<usize> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 2 {
                return Err(PipelineError::Other("bad input".into()));
            }
            Ok(0)
        }
    }

    let stage = PipelineStage::create(
        config("it-hook-error", 1),
        Faulty {
            calls: AtomicUsize::new(0),
        },
    )
    .unwrap();
    stage.start().unwrap();
    stage.wait(Some(Duration::from_secs(5))).unwrap();

    assert_eq!(stage.state(), StageState::Shutdown);
    assert_eq!(stage.exit_counts(), ExitCounts { shutdown: 1, canceled: 0 });
    assert!(matches!(
        stage.take_worker_exit_reason(0),
        Some(PipelineError::Other(msg)) if msg == "bad input"
    ));
    assert!(stage.take_worker_exit_reason(0).is_none());

    // A stopped stage cannot be paused.
    assert!(matches!(stage.pause(None), Err(PipelineError::InvalidStateTransition { .. })));
    stage.destroy().unwrap();
}

#[test]
fn test_hook_panic_is_contained() {
    init_tracing();

    struct Panicky;

    impl Stage for Panicky {
        type Event = u32;

        fn schedule(&self, _events: &mut Vec<u32>, _hint: usize) -> StageResult<usize> {
            Ok(0)
        }

        fn process(&self, _worker: usize, _events: &mut Vec<u32>) -> StageResult<usize> {
            panic!("hook bug");
        }
    }

    let stage = PipelineStage::create(config("it-hook-panic", 2), Panicky).unwrap();
    stage.start().unwrap();
    stage.wait(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(stage.exit_counts().total(), 2);
    assert!(matches!(
        stage.take_worker_exit_reason(1),
        Some(PipelineError::ThreadPanicked(1))
    ));
    stage.destroy().unwrap();
}

/// Holds events in a split round-robin queue set without consuming them
struct Splitter {
    queues: QueueSet<u32>,
}

impl Stage for Splitter {
    type Event = u32;
    const HAS_FETCH: bool = true;

    fn schedule(&self, events: &mut Vec<u32>, hint: usize) -> StageResult<usize> {
        self.queues.schedule(SchedulePolicy::RoundRobinSplit, events, hint)
    }

    fn fetch(&self, _worker: usize, buf: &mut Vec<u32>, max: usize) -> StageResult<usize> {
        self.queues.fetch_round_robin(buf, max)
    }

    fn process(&self, _worker: usize, events: &mut Vec<u32>) -> StageResult<usize> {
        Ok(events.len())
    }
}

#[test]
fn test_round_robin_split_distribution() {
    init_tracing();
    let queues = QueueSet::new(4, 64, OverflowPolicy::Block, Some(Duration::from_millis(5))).unwrap();
    let stage = PipelineStage::create(config("it-split", 4), Splitter { queues }).unwrap();
    let lens = |stage: &PipelineStage<Splitter>| -> Vec<usize> {
        (0..4)
            .map(|i| stage.hooks().queues.queue(i).map_or(0, |q| q.len()))
            .collect()
    };

    let mut batch: Vec<u32> = (0..12).collect();
    assert_eq!(stage.submit(&mut batch, 0).unwrap(), 12);
    assert_eq!(lens(&stage), vec![3, 3, 3, 3]);

    let mut batch: Vec<u32> = (0..10).collect();
    assert_eq!(stage.submit(&mut batch, 0).unwrap(), 10);
    assert_eq!(lens(&stage), vec![7, 5, 5, 5]);

    // Workers drain everything once started.
    stage.start().unwrap();
    assert!(eventually(Duration::from_secs(5), || stage.hooks().queues.total_len() == 0));
    assert!(eventually(Duration::from_secs(5), || stage.metrics().events_dealt() == 22));
    stage.shutdown(ShutdownGrace::Gracefully).unwrap();
    stage.wait(Some(Duration::from_secs(5))).unwrap();
    stage.destroy().unwrap();
}

/// Collects every event it receives
struct Sink {
    queues: QueueSet<u64>,
    received: AtomicU64,
    sum: AtomicU64,
}

impl Stage for Sink {
    type Event = u64;
    const HAS_FETCH: bool = true;

    fn schedule(&self, events: &mut Vec<u64>, _hint: usize) -> StageResult<usize> {
        self.queues.schedule(SchedulePolicy::RoundRobin, events, 0)
    }

    fn fetch(&self, _worker: usize, buf: &mut Vec<u64>, max: usize) -> StageResult<usize> {
        self.queues.fetch_round_robin(buf, max)
    }

    fn process(&self, _worker: usize, events: &mut Vec<u64>) -> StageResult<usize> {
        self.received.fetch_add(events.len() as u64, Ordering::SeqCst);
        self.sum.fetch_add(events.iter().sum::<u64>(), Ordering::SeqCst);
        Ok(events.len())
    }

    fn pre_pause(&self) {
        self.queues.wakeup_all();
    }
}

/// Generates `limit` numbered events and throws them to the sink
struct Source {
    sink_name: String,
    sink: OnceLock<Arc<PipelineStage<Sink>>>,
    next: AtomicU64,
    limit: u64,
    rejected: AtomicU64,
}

impl Stage for Source {
    type Event = u64;
    const HAS_THROW: bool = true;

    fn schedule(&self, _events: &mut Vec<u64>, _hint: usize) -> StageResult<usize> {
        Ok(0)
    }

    fn setup(&self) -> StageResult<()> {
        let sink = registry::find::<Sink>(&self.sink_name)?;
        assert_eq!(sink.state(), StageState::Setup);
        let _ = self.sink.set(sink);
        Ok(())
    }

    fn process(&self, _worker: usize, events: &mut Vec<u64>) -> StageResult<usize> {
        for _ in 0..4 {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            if n >= self.limit {
                break;
            }
            events.push(n);
        }
        if events.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(events.len())
    }

    fn throw(&self, worker: usize, events: &mut Vec<u64>) -> StageResult<usize> {
        let sink = self
            .sink
            .get()
            .ok_or_else(|| PipelineError::Other("sink not resolved".into()))?;
        let accepted = sink.submit(events, worker)?;
        self.rejected.fetch_add(events.len() as u64, Ordering::SeqCst);
        Ok(accepted)
    }
}

#[test]
fn test_two_stage_pipeline() {
    init_tracing();
    let sink = PipelineStage::create(
        StageBuilder::new("it-chain-sink").workers(2).queue_capacity(4096).build().unwrap(),
        Sink {
            queues: QueueSet::new(2, 4096, OverflowPolicy::Block, Some(Duration::from_millis(5))).unwrap(),
            received: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        },
    )
    .unwrap();
    let source = PipelineStage::create(
        config("it-chain-source", 3),
        Source {
            sink_name: "it-chain-sink".into(),
            sink: OnceLock::new(),
            next: AtomicU64::new(0),
            limit: 1000,
            rejected: AtomicU64::new(0),
        },
    )
    .unwrap();

    let pipeline = Pipeline::from_names(["it-chain-source", "it-chain-sink"]).unwrap();
    pipeline.setup_all().unwrap();
    pipeline.start_all().unwrap();

    assert!(eventually(Duration::from_secs(10), || {
        sink.hooks().received.load(Ordering::SeqCst) == 1000
    }));
    assert_eq!(source.hooks().rejected.load(Ordering::SeqCst), 0);
    assert_eq!(sink.hooks().sum.load(Ordering::SeqCst), (0..1000).sum::<u64>());

    pipeline.shutdown_all(ShutdownGrace::Gracefully).unwrap();
    pipeline.wait_all(Some(Duration::from_secs(5))).unwrap();
    assert!(pipeline
        .states()
        .iter()
        .all(|(_, state)| *state == StageState::Shutdown));
    pipeline.destroy_all().unwrap();
    assert!(registry::id_of("it-chain-source").is_none());
    assert!(registry::id_of("it-chain-sink").is_none());
}
