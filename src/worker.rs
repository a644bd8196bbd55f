use crate::engine::PipelineStage;
use crate::error::{PipelineError, Result};
use crate::gate::Checkpoint;
use crate::stage::{Stage, WorkerLoop};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Per-worker state owned by the stage and shared with the worker thread
pub(crate) struct WorkerSlot<E> {
    pub(crate) buffer: Mutex<Vec<E>>,
    pub(crate) cpu: Mutex<Option<usize>>,
    pub(crate) exit_reason: Mutex<Option<PipelineError>>,
}

impl<E> WorkerSlot<E> {
    pub(crate) fn new(max_batch: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::with_capacity(max_batch)),
            cpu: Mutex::new(None),
            exit_reason: Mutex::new(None),
        }
    }
}

type Step<S> = fn(&Worker<S>, &mut Vec<<S as Stage>::Event>) -> Result<()>;

/// One worker thread of a stage
pub(crate) struct Worker<S: Stage> {
    stage: Arc<PipelineStage<S>>,
    index: usize,
}

impl<S: Stage> Worker<S> {
    pub(crate) fn new(stage: Arc<PipelineStage<S>>, index: usize) -> Self {
        Self { stage, index }
    }

    /// Thread body: run the selected loop, then report the exit
    pub(crate) fn run(self) {
        let stage = &self.stage;
        debug!(stage = %stage.name(), worker = self.index, "worker started");

        if let Some(cpu) = *stage.workers[self.index].cpu.lock() {
            if let Err(e) = affinity::pin_current(cpu) {
                warn!(stage = %stage.name(), worker = self.index, cpu, error = %e, "failed to pin worker");
            }
        }

        let step: Step<S> = match stage.worker_loop() {
            WorkerLoop::FetchMainThrow => Self::fetch_main_throw,
            WorkerLoop::FetchMain => Self::fetch_main,
            WorkerLoop::MainThrow => Self::main_throw,
            WorkerLoop::MainOnly => Self::main_only,
        };
        let reason = panic::catch_unwind(AssertUnwindSafe(|| self.run_loop(step)))
            .unwrap_or_else(|_| Some(PipelineError::ThreadPanicked(self.index)));

        stage.gate.leave(&stage.hooks);
        let canceled = stage.cancel.load(Ordering::Acquire);
        if let Some(reason) = reason {
            warn!(stage = %stage.name(), worker = self.index, error = %reason, "worker loop ended by hook");
            *stage.workers[self.index].exit_reason.lock() = Some(reason);
        }
        debug!(stage = %stage.name(), worker = self.index, canceled, "worker exiting");
        stage.report_exit(canceled);
    }

    fn run_loop(&self, step: Step<S>) -> Option<PipelineError> {
        let stage = &self.stage;
        let slot = &stage.workers[self.index];
        loop {
            if stage.cancel.load(Ordering::Acquire) || !stage.do_loop.load(Ordering::Acquire) {
                return None;
            }
            if stage.gate.is_requested() {
                if stage.gate.checkpoint(&stage.hooks) == Checkpoint::Canceled {
                    return None;
                }
                continue;
            }
            if stage.graceful.load(Ordering::Acquire) {
                return None;
            }

            let mut buf = slot.buffer.lock();
            buf.clear();
            if let Err(e) = step(self, &mut buf) {
                stage.metrics.record_hook_failure();
                return Some(e);
            }
        }
    }

    fn fetch_main_throw(&self, buf: &mut Vec<S::Event>) -> Result<()> {
        if self.fetch(buf)? == 0 {
            return Ok(());
        }
        let dealt = self.main(buf)?;
        self.throw(buf, dealt)
    }

    fn fetch_main(&self, buf: &mut Vec<S::Event>) -> Result<()> {
        if self.fetch(buf)? == 0 {
            return Ok(());
        }
        self.main(buf).map(|_| ())
    }

    fn main_throw(&self, buf: &mut Vec<S::Event>) -> Result<()> {
        let dealt = self.main(buf)?;
        self.throw(buf, dealt)
    }

    fn main_only(&self, buf: &mut Vec<S::Event>) -> Result<()> {
        self.main(buf).map(|_| ())
    }

    fn fetch(&self, buf: &mut Vec<S::Event>) -> Result<usize> {
        let stage = &self.stage;
        let n = stage.hooks.fetch(self.index, buf, stage.max_batch())?;
        stage.metrics.record_fetch(n);
        Ok(n)
    }

    fn main(&self, buf: &mut Vec<S::Event>) -> Result<usize> {
        let stage = &self.stage;
        let start = Instant::now();
        let dealt = stage.hooks.process(self.index, buf)?.min(buf.len());
        stage.metrics.record_main(dealt, start.elapsed());
        Ok(dealt)
    }

    fn throw(&self, buf: &mut Vec<S::Event>, dealt: usize) -> Result<()> {
        buf.truncate(dealt);
        if dealt == 0 {
            return Ok(());
        }
        let stage = &self.stage;
        let thrown = stage.hooks.throw(self.index, buf)?;
        stage.metrics.record_throw(thrown);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub(crate) mod affinity {
    use crate::error::{PipelineError, Result};
    use std::io;
    use std::os::unix::thread::JoinHandleExt;
    use std::thread::JoinHandle;

    fn cpu_set(cpu: Option<usize>) -> Result<libc::cpu_set_t> {
        // SAFETY: cpu_set_t is plain data; all-zero is the empty set.
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        let max = libc::CPU_SETSIZE as usize;
        match cpu {
            Some(cpu) if cpu >= max => {
                return Err(PipelineError::InvalidArgs(format!("cpu {cpu} out of range")));
            }
            Some(cpu) => unsafe { libc::CPU_SET(cpu, &mut set) },
            None => {
                // SAFETY: sysconf has no memory-safety preconditions.
                let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
                let online = if online > 0 { online as usize } else { 1 };
                for cpu in 0..online.min(max) {
                    unsafe { libc::CPU_SET(cpu, &mut set) };
                }
            }
        }
        Ok(set)
    }

    /// Pin the calling thread to `cpu`
    pub(crate) fn pin_current(cpu: usize) -> Result<()> {
        let set = cpu_set(Some(cpu))?;
        // SAFETY: pid 0 is the calling thread and `set` is a valid cpu_set_t.
        let rc = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
        if rc != 0 {
            return Err(PipelineError::Os(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Pin a running thread to `cpu`, or let it run anywhere when `cpu` is `None`
    pub(crate) fn pin_handle(handle: &JoinHandle<()>, cpu: Option<usize>) -> Result<()> {
        let set = cpu_set(cpu)?;
        // SAFETY: the handle has not been joined, so its pthread_t is valid.
        let rc = unsafe {
            libc::pthread_setaffinity_np(
                handle.as_pthread_t(),
                std::mem::size_of::<libc::cpu_set_t>(),
                &set,
            )
        };
        if rc != 0 {
            return Err(PipelineError::Os(io::Error::from_raw_os_error(rc)));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) mod affinity {
    use crate::error::{PipelineError, Result};
    use std::thread::JoinHandle;

    pub(crate) fn pin_current(_cpu: usize) -> Result<()> {
        Err(PipelineError::NotOperational)
    }

    pub(crate) fn pin_handle(_handle: &JoinHandle<()>, _cpu: Option<usize>) -> Result<()> {
        Err(PipelineError::NotOperational)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_starts_empty() {
        let slot: WorkerSlot<u32> = WorkerSlot::new(16);
        assert!(slot.buffer.lock().is_empty());
        assert!(slot.buffer.lock().capacity() >= 16);
        assert!(slot.cpu.lock().is_none());
        assert!(slot.exit_reason.lock().is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pin_out_of_range_cpu() {
        assert!(matches!(
            affinity::pin_current(usize::MAX),
            Err(PipelineError::InvalidArgs(_))
        ));
    }
}
